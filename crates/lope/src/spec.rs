//! The run specification.
//!
//! A [`RunSpec`] is built once at startup from the command line and the
//! configuration file, and is read-only for the rest of the run. Every policy
//! is a closed enum so that contradictory flag combinations (for example
//! bind-mounting and copying the working directory at the same time) cannot
//! be represented.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::env::EnvPolicy;

/// Image tag used when the source image has to be extended.
pub const DEFAULT_TARGET_IMAGE: &str = "lope";

/// Default entrypoint; the command is passed to it with `-c`.
pub const DEFAULT_ENTRYPOINT: &str = "/bin/sh";

/// Default working directory inside the container.
pub const DEFAULT_WORK_DIR: &str = "/lope";

/// Default host path of the engine control socket.
pub const DEFAULT_ENGINE_SOCKET: &str = "/var/run/docker.sock";

/// Where the engine control socket appears inside the container.
pub const CONTAINER_ENGINE_SOCKET: &str = "/var/run/docker.sock";

/// Environment variables that are never forwarded unless overridden.
pub const DEFAULT_BLACKLIST: &[&str] = &["HOME", "SSH_AUTH_SOCK", "TMPDIR", "PATH"];

/// Credential and config paths under the home directory mounted by default.
pub const DEFAULT_MOUNT_CANDIDATES: &[&str] = &[".vault-token", ".aws/", ".kube/", ".ssh/"];

/// Container engine CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    Docker,
    Podman,
}

impl Engine {
    /// Binary name for this engine.
    pub fn binary(&self) -> &'static str {
        match self {
            Engine::Docker => "docker",
            Engine::Podman => "podman",
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.binary())
    }
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(Engine::Docker),
            "podman" => Ok(Engine::Podman),
            other => Err(format!(
                "unknown engine '{}' (expected docker or podman)",
                other
            )),
        }
    }
}

/// What happens to the host working directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkDirStrategy {
    /// Bind-mount the host directory at the container working directory.
    #[default]
    BindMount,
    /// `ADD` the host directory into a derived image.
    CopyIntoImage,
    /// Leave the host directory out of the container.
    Omit,
}

impl WorkDirStrategy {
    /// Resolve the strategy from the two command line switches.
    ///
    /// Copying wins when both are given, matching the switch semantics where
    /// `--add-mount` implies not mounting.
    pub fn from_flags(no_mount: bool, add_mount: bool) -> Self {
        if add_mount {
            WorkDirStrategy::CopyIntoImage
        } else if no_mount {
            WorkDirStrategy::Omit
        } else {
            WorkDirStrategy::BindMount
        }
    }
}

/// Which user the container process runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserPolicy {
    /// Keep the image default (normally root).
    #[default]
    Root,
    /// Run as the invoking host user so files created in mounts stay owned by them.
    HostUser,
}

/// SSH agent forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SshPolicy {
    #[default]
    Disabled,
    Forward,
}

impl SshPolicy {
    pub fn enabled(&self) -> bool {
        matches!(self, SshPolicy::Forward)
    }
}

/// Host command proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyPolicy {
    #[default]
    Disabled,
    Enabled { port: u16 },
}

/// How the container integrates with the engine that launched it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineIntegration {
    /// Host control socket to expose inside the container.
    pub socket: Option<PathBuf>,
    /// Download the engine client into the derived image.
    pub install_client: bool,
}

impl Default for EngineIntegration {
    fn default() -> Self {
        Self {
            socket: Some(PathBuf::from(DEFAULT_ENGINE_SOCKET)),
            install_client: false,
        }
    }
}

/// Everything needed to assemble a single invocation.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub source_image: String,
    pub command: Vec<String>,
    pub entrypoint: String,
    pub work_dir: String,
    /// Host directory mounted or copied into the container.
    pub host_dir: PathBuf,
    pub work_dir_strategy: WorkDirStrategy,
    pub env: EnvPolicy,
    pub user: UserPolicy,
    pub engine: Engine,
    pub engine_integration: EngineIntegration,
    pub ssh: SshPolicy,
    pub proxy: ProxyPolicy,
    /// Build-file lines appended after the base image line.
    pub instructions: Vec<String>,
    pub tty: bool,
    /// Paths relative to `home` that are mounted under `/root` when present.
    pub mount_candidates: Vec<String>,
    pub home: PathBuf,
    /// Tag used when a derived image has to be built.
    pub target_image: String,
}

impl RunSpec {
    /// Create a spec with defaults for everything but the image and command.
    pub fn new(source_image: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            source_image: source_image.into(),
            command,
            entrypoint: DEFAULT_ENTRYPOINT.to_string(),
            work_dir: DEFAULT_WORK_DIR.to_string(),
            host_dir: PathBuf::from("."),
            work_dir_strategy: WorkDirStrategy::default(),
            env: EnvPolicy::default(),
            user: UserPolicy::default(),
            engine: Engine::default(),
            engine_integration: EngineIntegration::default(),
            ssh: SshPolicy::default(),
            proxy: ProxyPolicy::default(),
            instructions: Vec::new(),
            tty: true,
            mount_candidates: DEFAULT_MOUNT_CANDIDATES
                .iter()
                .map(|p| p.to_string())
                .collect(),
            home: dirs::home_dir().unwrap_or_default(),
            target_image: DEFAULT_TARGET_IMAGE.to_string(),
        }
    }

    pub fn entrypoint(mut self, entrypoint: impl Into<String>) -> Self {
        self.entrypoint = entrypoint.into();
        self
    }

    pub fn work_dir(mut self, work_dir: impl Into<String>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn host_dir(mut self, host_dir: impl Into<PathBuf>) -> Self {
        self.host_dir = host_dir.into();
        self
    }

    pub fn work_dir_strategy(mut self, strategy: WorkDirStrategy) -> Self {
        self.work_dir_strategy = strategy;
        self
    }

    pub fn env_policy(mut self, env: EnvPolicy) -> Self {
        self.env = env;
        self
    }

    pub fn user(mut self, user: UserPolicy) -> Self {
        self.user = user;
        self
    }

    pub fn engine(mut self, engine: Engine) -> Self {
        self.engine = engine;
        self
    }

    pub fn engine_integration(mut self, integration: EngineIntegration) -> Self {
        self.engine_integration = integration;
        self
    }

    pub fn ssh(mut self, ssh: SshPolicy) -> Self {
        self.ssh = ssh;
        self
    }

    pub fn proxy(mut self, proxy: ProxyPolicy) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn instructions(mut self, instructions: Vec<String>) -> Self {
        self.instructions = instructions;
        self
    }

    pub fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    pub fn mount_candidates(mut self, candidates: Vec<String>) -> Self {
        self.mount_candidates = candidates;
        self
    }

    pub fn home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = home.into();
        self
    }

    pub fn target_image(mut self, image: impl Into<String>) -> Self {
        self.target_image = image.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_binary() {
        assert_eq!(Engine::Docker.binary(), "docker");
        assert_eq!(Engine::Podman.to_string(), "podman");
        assert_eq!("PODMAN".parse::<Engine>().unwrap(), Engine::Podman);
        assert!("containerd".parse::<Engine>().is_err());
    }

    #[test]
    fn test_work_dir_strategy_from_flags() {
        assert_eq!(
            WorkDirStrategy::from_flags(false, false),
            WorkDirStrategy::BindMount
        );
        assert_eq!(WorkDirStrategy::from_flags(true, false), WorkDirStrategy::Omit);
        assert_eq!(
            WorkDirStrategy::from_flags(false, true),
            WorkDirStrategy::CopyIntoImage
        );
        assert_eq!(
            WorkDirStrategy::from_flags(true, true),
            WorkDirStrategy::CopyIntoImage
        );
    }

    #[test]
    fn test_defaults() {
        let spec = RunSpec::new("alpine", vec!["ls".into()]);
        assert_eq!(spec.entrypoint, "/bin/sh");
        assert_eq!(spec.work_dir, "/lope");
        assert_eq!(spec.target_image, "lope");
        assert!(spec.tty);
        assert_eq!(spec.user, UserPolicy::Root);
        assert_eq!(spec.mount_candidates.len(), 4);
        assert_eq!(
            spec.engine_integration.socket,
            Some(PathBuf::from("/var/run/docker.sock"))
        );
    }
}
