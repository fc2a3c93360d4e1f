//! Error types for assembling and launching an invocation.

use thiserror::Error;

/// Result type for lope operations.
pub type LopeResult<T> = Result<T, LopeError>;

/// Errors that can occur while assembling or launching an invocation.
#[derive(Debug, Error)]
pub enum LopeError {
    /// An environment pattern is not a valid regular expression.
    #[error("invalid environment pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The image build exited unsuccessfully. Carries the captured build output.
    #[error("building image {image} failed")]
    BuildFailed { image: String, output: String },

    /// A host command could not be started.
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The command proxy could not bind its listener.
    #[error("command proxy could not listen on {addr}: {source}")]
    ProxyBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The outbound-routable host address could not be determined.
    #[error("unable to determine outbound host address: {0}")]
    HostAddress(#[source] std::io::Error),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
