//! Run a command inside a container image with the host's credentials.
//!
//! A [`RunSpec`] describes the run. The [`Assembler`] turns it into an engine
//! invocation, building a derived image, forwarding the SSH agent and
//! starting the host command proxy along the way.

pub mod assembler;
pub mod config;
pub mod dockerfile;
pub mod engine;
pub mod env;
pub mod error;
pub mod host;
pub mod proxy;
pub mod retry;
pub mod spec;
pub mod ssh;
pub mod volumes;

pub use assembler::{Assembler, Assembly};
pub use error::{LopeError, LopeResult};
pub use host::{HostCommands, SystemHost};
pub use spec::RunSpec;
