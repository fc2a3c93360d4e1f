//! Host subprocess execution.
//!
//! Everything lope does to the host besides reading files goes through
//! [`HostCommands`], so the bootstrap protocols can be exercised against a
//! recording fake.

use async_trait::async_trait;
use std::io::{self, Read};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::{LopeError, LopeResult};

/// Group whose members may use the engine control socket.
pub const ENGINE_SOCKET_GROUP: &str = "docker";

/// Captured result of a finished host command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    /// Standard output and standard error, in the order they were written.
    pub combined: Vec<u8>,
}

impl CommandOutput {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.combined).to_string()
    }
}

/// Host command abstraction for testability.
#[async_trait]
pub trait HostCommands: Send + Sync {
    /// Run `argv` to completion, capturing its output.
    async fn output(&self, argv: &[String]) -> LopeResult<CommandOutput>;

    /// Start `argv` and let it run on its own. Nothing waits for it.
    fn spawn_detached(&self, argv: &[String]) -> LopeResult<()>;
}

/// Runs commands on the local machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHost;

#[async_trait]
impl HostCommands for SystemHost {
    async fn output(&self, argv: &[String]) -> LopeResult<CommandOutput> {
        let (program, args) = split_argv(argv)?;
        debug!("Running: {}", argv.join(" "));

        let mut command = Command::new(program);
        command.args(args);
        let (status, combined) = combined_output(command).await.map_err(|source| {
            LopeError::Spawn {
                command: program.to_string(),
                source,
            }
        })?;

        Ok(CommandOutput {
            success: status.success(),
            code: status.code(),
            combined,
        })
    }

    fn spawn_detached(&self, argv: &[String]) -> LopeResult<()> {
        let (program, args) = split_argv(argv)?;
        debug!("Starting: {}", argv.join(" "));

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| LopeError::Spawn {
                command: program.to_string(),
                source,
            })?;

        detach(child);
        Ok(())
    }
}

/// Run `command` to completion with stdout and stderr sharing one pipe, so
/// the captured bytes keep the order in which they were written.
pub async fn combined_output(mut command: Command) -> io::Result<(ExitStatus, Vec<u8>)> {
    let (mut reader, writer) = io::pipe()?;
    command
        .stdin(Stdio::null())
        .stdout(writer.try_clone()?)
        .stderr(writer);
    let mut child = command.spawn()?;
    // The command still holds the write ends; the reader only sees EOF once
    // they are closed.
    drop(command);

    let read = tokio::task::spawn_blocking(move || {
        let mut combined = Vec::new();
        reader.read_to_end(&mut combined).map(|_| combined)
    });
    let status = child.wait().await?;
    let combined = read.await.map_err(io::Error::other)??;
    Ok((status, combined))
}

/// Give up ownership of a running child.
///
/// The process is not killed on drop and is never waited on; it lives until it
/// exits by itself or its parent goes away.
pub fn detach(child: Child) {
    if let Some(pid) = child.id() {
        debug!("Detached process {}", pid);
    }
    drop(child);
}

fn split_argv(argv: &[String]) -> LopeResult<(&str, &[String])> {
    match argv.split_first() {
        Some((program, args)) => Ok((program.as_str(), args)),
        None => Err(LopeError::InvalidInput("empty command line".to_string())),
    }
}

/// Numeric identity the container process runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostIdentity {
    pub uid: u32,
    pub gid: u32,
}

/// Resolve the invoking user, preferring the engine socket group over the
/// primary group so the mounted socket stays usable.
///
/// Returns `None` when the platform has no numeric user identity.
pub async fn resolve_identity(host: &dyn HostCommands) -> Option<HostIdentity> {
    let (uid, primary_gid) = current_ids()?;

    let gid = match lookup_group_gid(host, ENGINE_SOCKET_GROUP).await {
        Some(gid) => gid,
        None => primary_gid,
    };

    Some(HostIdentity { uid, gid })
}

#[cfg(unix)]
fn current_ids() -> Option<(u32, u32)> {
    // SAFETY: getuid/getgid have no preconditions and cannot fail.
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    Some((uid, gid))
}

#[cfg(not(unix))]
fn current_ids() -> Option<(u32, u32)> {
    None
}

/// Look up a group id with `getent group <name>`.
async fn lookup_group_gid(host: &dyn HostCommands, group: &str) -> Option<u32> {
    let argv = ["getent".to_string(), "group".to_string(), group.to_string()];
    match host.output(&argv).await {
        Ok(output) if output.success => parse_group_gid(&output.text()),
        Ok(_) => None,
        Err(e) => {
            debug!("Group lookup for {} failed: {}", group, e);
            None
        }
    }
}

/// Parse the gid out of a `group` database line (`name:password:gid:members`).
fn parse_group_gid(line: &str) -> Option<u32> {
    line.lines().next()?.split(':').nth(2)?.trim().parse().ok()
}
