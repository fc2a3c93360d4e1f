//! Optional configuration file.
//!
//! Values come from `$XDG_CONFIG_HOME/lope/config.toml` (or an explicit
//! path), layered under `LOPE__`-prefixed environment variables. Every field
//! is optional; command line flags take precedence over both layers.
//!
//! ```toml
//! engine = "podman"
//! blacklist = ["HOME", "PATH", "AWS_"]
//! paths = [".aws/", ".config/gcloud/"]
//! docker_socket = "$XDG_RUNTIME_DIR/podman/podman.sock"
//! cmd_proxy_port = 24300
//! ```

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::spec::Engine;

const APP_NAME: &str = "lope";
const ENV_PREFIX: &str = "LOPE";
const LIST_KEYS: [&str; 4] = ["blacklist", "whitelist", "paths", "instructions"];

/// Defaults read from the configuration layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LopeConfig {
    pub engine: Option<Engine>,
    pub blacklist: Option<Vec<String>>,
    pub whitelist: Option<Vec<String>>,
    /// Replaces the default home mount candidates.
    pub paths: Option<Vec<String>>,
    pub instructions: Option<Vec<String>>,
    pub entrypoint: Option<String>,
    pub work_dir: Option<String>,
    pub docker_socket: Option<String>,
    pub cmd_proxy_port: Option<u16>,
    pub target_image: Option<String>,
}

impl LopeConfig {
    /// Load from `path`, or the default location, and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => expand_path(path)?,
            None => default_config_path()?,
        };
        Self::load_from(&path, None)
    }

    /// Load from `path` with an explicit environment instead of the process one.
    pub fn load_from(path: &Path, env_source: Option<config::Map<String, String>>) -> Result<Self> {
        let mut environment = Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .source(env_source);
        for key in LIST_KEYS {
            environment = environment.with_list_parse_key(key);
        }

        let built = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(environment)
            .build()
            .with_context(|| format!("reading configuration from {}", path.display()))?;

        let mut config: LopeConfig = built
            .try_deserialize()
            .context("parsing lope configuration")?;

        if let Some(socket) = &config.docker_socket {
            config.docker_socket = Some(expand_str_path(socket)?.display().to_string());
        }

        Ok(config)
    }
}

/// `$XDG_CONFIG_HOME/lope/config.toml`, falling back to the platform config dir.
pub fn default_config_path() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME).join("config.toml"));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME).join("config.toml"));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME).join("config.toml"))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    match path.to_str() {
        Some(text) => expand_str_path(text),
        None => Ok(path.to_path_buf()),
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env_map(pairs: &[(&str, &str)]) -> config::Map<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config =
            LopeConfig::load_from(&dir.path().join("config.toml"), Some(env_map(&[]))).unwrap();
        assert_eq!(config, LopeConfig::default());
    }

    #[test]
    fn test_file_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
engine = "podman"
blacklist = ["HOME", "AWS_"]
paths = [".aws/"]
instructions = ["RUN apk add git"]
cmd_proxy_port = 24300
target_image = "my-lope"
"#,
        )
        .unwrap();

        let config = LopeConfig::load_from(&path, Some(env_map(&[]))).unwrap();
        assert_eq!(config.engine, Some(Engine::Podman));
        assert_eq!(
            config.blacklist,
            Some(vec!["HOME".to_string(), "AWS_".to_string()])
        );
        assert_eq!(config.paths, Some(vec![".aws/".to_string()]));
        assert_eq!(config.cmd_proxy_port, Some(24300));
        assert_eq!(config.target_image.as_deref(), Some("my-lope"));
        assert_eq!(config.whitelist, None);
    }

    #[test]
    fn test_environment_overrides_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "entrypoint = \"/bin/bash\"\ncmd_proxy_port = 1\n").unwrap();

        let env = env_map(&[
            ("LOPE__ENTRYPOINT", "/bin/zsh"),
            ("LOPE__WHITELIST", "APP_,CI"),
            ("LOPE_PROXY_ADDR", "http://10.0.0.1:24242"),
        ]);
        let config = LopeConfig::load_from(&path, Some(env)).unwrap();
        assert_eq!(config.entrypoint.as_deref(), Some("/bin/zsh"));
        assert_eq!(
            config.whitelist,
            Some(vec!["APP_".to_string(), "CI".to_string()])
        );
        assert_eq!(config.cmd_proxy_port, Some(1));
    }

    #[test]
    fn test_docker_socket_is_expanded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "docker_socket = \"~/podman.sock\"\n").unwrap();

        let config = LopeConfig::load_from(&path, Some(env_map(&[]))).unwrap();
        let socket = config.docker_socket.unwrap();
        assert!(!socket.starts_with('~'));
        assert!(socket.ends_with("podman.sock"));
    }
}
