//! SSH agent forwarding through a helper container.
//!
//! Container engines have no agent-forwarding primitive, so lope starts a
//! small sshd container that shares a named volume with the target container,
//! then opens an `ssh -A` session to it. The agent socket that session creates
//! on the volume is what the target container uses as `SSH_AUTH_SOCK`.
//!
//! ```text
//! NotStarted -> KeysQueried -> VolumeCreated -> HelperLaunched
//!            -> Ready            -> TunnelBackgrounded
//!            -> DegradedTimeout  -> Skipped
//! ```

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, info, warn};

use crate::error::LopeError;
use crate::host::HostCommands;
use crate::retry::Backoff;
use crate::spec::Engine;

pub const AGENT_HELPER_IMAGE: &str = "uber/ssh-agent-forward:latest";
pub const AGENT_HELPER_NAME: &str = "lope-sshd";
/// Named volume shared by the helper and the target container.
pub const AGENT_VOLUME: &str = "lope-ssh-agent";
pub const AGENT_MOUNT: &str = "/ssh-agent";
/// Agent socket path inside both containers.
pub const AGENT_SOCKET: &str = "/ssh-agent/ssh-agent.sock";
pub const AGENT_PORT: u16 = 2244;
pub const AGENT_HOST: &str = "127.0.0.1";
pub const AGENT_ENTRYPOINT: &str = "/ssh-entrypoint.sh";
pub const AGENT_SOCKET_ENV: &str = "SSH_AUTH_SOCK";

/// Readiness polling for the helper's sshd.
pub const READY_BACKOFF: Backoff = Backoff::fixed(10, Duration::from_secs(3));

const NO_HOST_KEY_CHECKS: [&str; 6] = [
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "GlobalKnownHostsFile=/dev/null",
    "-o",
    "UserKnownHostsFile=/dev/null",
];

/// Progress of the bridge bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    NotStarted,
    KeysQueried,
    VolumeCreated,
    HelperLaunched,
    Ready,
    DegradedTimeout,
    TunnelBackgrounded,
    Skipped,
}

/// Terminal outcome of the bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentForwarding {
    /// The tunnel is up; the agent socket exists on the shared volume.
    Active,
    /// Forwarding is disabled or the helper never became ready.
    #[default]
    Skipped,
}

impl AgentForwarding {
    pub fn is_active(&self) -> bool {
        matches!(self, AgentForwarding::Active)
    }
}

/// Drives the helper container and tunnel for one run.
pub struct AgentBridge<'a> {
    host: &'a dyn HostCommands,
    engine: Engine,
    backoff: Backoff,
    history: Vec<BridgeState>,
}

impl<'a> AgentBridge<'a> {
    pub fn new(host: &'a dyn HostCommands, engine: Engine) -> Self {
        Self {
            host,
            engine,
            backoff: READY_BACKOFF,
            history: vec![BridgeState::NotStarted],
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// States visited so far, oldest first.
    pub fn history(&self) -> &[BridgeState] {
        &self.history
    }

    pub fn state(&self) -> BridgeState {
        self.history
            .last()
            .copied()
            .unwrap_or(BridgeState::NotStarted)
    }

    fn enter(&mut self, state: BridgeState) {
        debug!("SSH agent bridge: {:?}", state);
        self.history.push(state);
    }

    /// Run the bootstrap to a terminal state. Never fails; problems degrade
    /// to [`AgentForwarding::Skipped`].
    pub async fn bootstrap(&mut self) -> AgentForwarding {
        let keys = self.query_keys().await;
        self.enter(BridgeState::KeysQueried);

        self.run_logged(&volume_create_args(self.engine)).await;
        self.enter(BridgeState::VolumeCreated);

        self.run_logged(&helper_run_args(self.engine, &keys)).await;
        self.enter(BridgeState::HelperLaunched);

        let probe = probe_args();
        let probe = probe.as_slice();
        let host = self.host;
        let ready = self
            .backoff
            .retry(move |attempt| async move {
                debug!("Probing SSH agent helper (attempt {})", attempt);
                let output = host.output(probe).await?;
                if output.success {
                    Ok(())
                } else {
                    Err(LopeError::InvalidInput(format!(
                        "helper not ready: {}",
                        output.text().trim()
                    )))
                }
            })
            .await;

        if let Err(e) = ready {
            self.enter(BridgeState::DegradedTimeout);
            warn!(
                "SSH agent helper did not become ready after {} attempts ({}); continuing without agent forwarding",
                self.backoff.attempts, e
            );
            self.enter(BridgeState::Skipped);
            return AgentForwarding::Skipped;
        }
        self.enter(BridgeState::Ready);

        match self.host.spawn_detached(&tunnel_args()) {
            Ok(()) => {
                self.enter(BridgeState::TunnelBackgrounded);
                info!("SSH agent forwarded to {}", AGENT_SOCKET);
                AgentForwarding::Active
            }
            Err(e) => {
                warn!("Failed to start SSH agent tunnel: {}", e);
                self.enter(BridgeState::Skipped);
                AgentForwarding::Skipped
            }
        }
    }

    /// Public keys loaded in the local agent, base64 encoded. Whatever the
    /// agent prints is encoded, including its "no identities" message.
    async fn query_keys(&self) -> String {
        let argv = ["ssh-add".to_string(), "-L".to_string()];
        let listing = match self.host.output(&argv).await {
            Ok(output) => output.text(),
            Err(e) => {
                warn!("Unable to list SSH agent keys: {}", e);
                String::new()
            }
        };
        STANDARD.encode(listing.as_bytes())
    }

    async fn run_logged(&self, argv: &[String]) {
        match self.host.output(argv).await {
            Ok(output) if output.success => {}
            Ok(output) => warn!(
                "{} exited with {:?}: {}",
                argv.join(" "),
                output.code,
                output.text().trim()
            ),
            Err(e) => warn!("{}", e),
        }
    }
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// Create the shared volume.
pub fn volume_create_args(engine: Engine) -> Vec<String> {
    strings(&[engine.binary(), "volume", "create", "--name", AGENT_VOLUME])
}

/// Start the helper sshd, authorizing the given base64 encoded keys.
pub fn helper_run_args(engine: Engine, encoded_keys: &str) -> Vec<String> {
    vec![
        engine.binary().to_string(),
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        AGENT_HELPER_NAME.to_string(),
        "-e".to_string(),
        format!("AUTHORIZED_KEYS={}", encoded_keys),
        "-v".to_string(),
        format!("{}:{}", AGENT_VOLUME, AGENT_MOUNT),
        "-d".to_string(),
        "-p".to_string(),
        format!("{}:22", AGENT_PORT),
        AGENT_HELPER_IMAGE.to_string(),
    ]
}

/// One readiness probe: a trivial remote command over an agent-forwarding session.
pub fn probe_args() -> Vec<String> {
    let mut args = strings(&["ssh", "-A"]);
    args.extend(strings(&NO_HOST_KEY_CHECKS));
    args.extend([
        "-p".to_string(),
        AGENT_PORT.to_string(),
        format!("root@{}", AGENT_HOST),
        "ls".to_string(),
    ]);
    args
}

/// The long-lived tunnel. `-f` backgrounds ssh once authenticated and `-S none`
/// keeps it from attaching to a control master.
pub fn tunnel_args() -> Vec<String> {
    let mut args = strings(&["ssh", "-A", "-f"]);
    args.extend(strings(&NO_HOST_KEY_CHECKS));
    args.extend([
        "-p".to_string(),
        AGENT_PORT.to_string(),
        "-S".to_string(),
        "none".to_string(),
        format!("root@{}", AGENT_HOST),
        AGENT_ENTRYPOINT.to_string(),
    ]);
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_create_args() {
        assert_eq!(
            volume_create_args(Engine::Podman),
            vec!["podman", "volume", "create", "--name", "lope-ssh-agent"]
        );
    }

    #[test]
    fn test_helper_run_args() {
        let args = helper_run_args(Engine::Docker, "c3NoLXJzYQ==");
        assert_eq!(
            args.join(" "),
            "docker run --rm --name lope-sshd -e AUTHORIZED_KEYS=c3NoLXJzYQ== \
             -v lope-ssh-agent:/ssh-agent -d -p 2244:22 uber/ssh-agent-forward:latest"
        );
    }

    #[test]
    fn test_probe_args() {
        assert_eq!(
            probe_args().join(" "),
            "ssh -A -o StrictHostKeyChecking=no -o GlobalKnownHostsFile=/dev/null \
             -o UserKnownHostsFile=/dev/null -p 2244 root@127.0.0.1 ls"
        );
    }

    #[test]
    fn test_tunnel_args() {
        assert_eq!(
            tunnel_args().join(" "),
            "ssh -A -f -o StrictHostKeyChecking=no -o GlobalKnownHostsFile=/dev/null \
             -o UserKnownHostsFile=/dev/null -p 2244 -S none root@127.0.0.1 /ssh-entrypoint.sh"
        );
    }

    #[test]
    fn test_forwarding_default_is_skipped() {
        assert!(!AgentForwarding::default().is_active());
        assert!(AgentForwarding::Active.is_active());
    }
}
