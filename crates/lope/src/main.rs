use std::env;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;

use lope::config::LopeConfig;
use lope::env::{EnvPolicy, PatternSet};
use lope::spec::{
    DEFAULT_BLACKLIST, DEFAULT_ENGINE_SOCKET, DEFAULT_MOUNT_CANDIDATES, Engine, EngineIntegration,
    ProxyPolicy, SshPolicy, UserPolicy, WorkDirStrategy,
};
use lope::{Assembler, LopeError, RunSpec, SystemHost};
use lope_protocol::DEFAULT_PROXY_PORT;

fn main() {
    match try_main() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            if let Some(LopeError::BuildFailed { output, .. }) = err.downcast_ref::<LopeError>() {
                let _ = write!(io::stderr(), "{output}");
            }
            let _ = writeln!(io::stderr(), "Error: {err:?}");
            std::process::exit(1);
        }
    }
}

fn try_main() -> Result<i32> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = LopeConfig::load(cli.config.as_deref())?;
    debug!("configuration: {:?}", config);

    let spec = build_spec(&cli, &config)?;
    async_main(spec, cli.dry_run)
}

#[tokio::main]
async fn async_main(spec: RunSpec, dry_run: bool) -> Result<i32> {
    let host = SystemHost;
    let assembly = Assembler::new(&spec, &host)
        .dry_run(dry_run)
        .assemble(lope::env::capture())
        .await?;

    if dry_run {
        let mut stdout = io::stdout();
        if let Some(dockerfile) = &assembly.plan.dockerfile {
            writeln!(stdout, "# Dockerfile for {}", assembly.plan.image)?;
            writeln!(stdout, "{dockerfile}")?;
        }
        writeln!(stdout, "{}", assembly.params.join(" "))?;
        return Ok(0);
    }

    let code = lope::engine::launch(&assembly.params).await?;
    debug!("container exited with {}", code);
    Ok(code)
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run a command in a container with your credentials, SSH agent and host commands available."
)]
struct Cli {
    /// Image to run the command in
    image: String,
    /// Command to run, passed to the entrypoint with -c
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,

    /// Comma separated patterns of environment variables to never forward
    #[arg(long, value_name = "CSV")]
    blacklist: Option<String>,
    /// Comma separated patterns; when set only matching variables are forwarded.
    /// This includes LOPE_PROXY_ADDR, so list it when using --cmd-proxy
    #[arg(long, value_name = "CSV")]
    whitelist: Option<String>,
    /// Host directory to mount or copy into the container
    #[arg(long, value_name = "PATH")]
    dir: Option<PathBuf>,
    /// Entrypoint the command is passed to
    #[arg(long)]
    entrypoint: Option<String>,
    /// Extra build file instruction (repeatable)
    #[arg(long = "instruction", value_name = "LINE")]
    instructions: Vec<String>,
    /// Path under the home directory to mount into /root (repeatable, replaces the defaults)
    #[arg(long = "path", value_name = "REL")]
    paths: Vec<String>,
    /// Do not mount the host directory
    #[arg(long)]
    no_mount: bool,
    /// Copy the host directory into the image instead of mounting it
    #[arg(long, conflicts_with = "no_mount")]
    add_mount: bool,
    /// Do not mount the engine socket
    #[arg(long)]
    no_docker: bool,
    /// Host path of the engine socket
    #[arg(long, value_name = "PATH")]
    docker_socket: Option<String>,
    /// Working directory inside the container
    #[arg(long, value_name = "PATH")]
    work_dir: Option<String>,
    /// Do not allocate a pseudo terminal
    #[arg(long)]
    no_tty: bool,
    /// Install the docker client into the image
    #[arg(long)]
    add_docker: bool,
    /// Run as the invoking user instead of root
    #[arg(long)]
    no_root: bool,
    /// Forward the SSH agent into the container
    #[arg(long)]
    ssh: bool,
    /// Let the container run host commands through the command proxy
    #[arg(long)]
    cmd_proxy: bool,
    /// Port of the command proxy
    #[arg(long, value_name = "PORT")]
    cmd_proxy_port: Option<u16>,
    /// Container engine CLI
    #[arg(long)]
    engine: Option<Engine>,

    /// Override the config file path
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
    /// Print the build file and invocation without running anything
    #[arg(long)]
    dry_run: bool,
}

fn init_logging(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let level = match cli.verbose {
        0 if env::var_os("DEBUG").is_some() => "debug",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("lope={level},tower_http={level}")));

    if cli.log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(io::stderr)
                    .with_ansi(io::stderr().is_terminal())
                    .with_target(false),
            )
            .try_init()
            .ok();
    }
}

/// Split a comma separated flag value, dropping empty items.
fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn build_spec(cli: &Cli, config: &LopeConfig) -> Result<RunSpec> {
    let blacklist = match &cli.blacklist {
        Some(csv) => split_csv(csv),
        None => config
            .blacklist
            .clone()
            .unwrap_or_else(|| DEFAULT_BLACKLIST.iter().map(|k| k.to_string()).collect()),
    };
    let whitelist = match &cli.whitelist {
        Some(csv) => split_csv(csv),
        None => config.whitelist.clone().unwrap_or_default(),
    };
    let env_policy = EnvPolicy::new(PatternSet::new(&blacklist)?, PatternSet::new(&whitelist)?);

    let host_dir = match &cli.dir {
        Some(dir) => dir.clone(),
        None => env::current_dir().context("resolving the current directory")?,
    };

    let socket = if cli.no_docker {
        None
    } else {
        let path = cli
            .docker_socket
            .clone()
            .or_else(|| config.docker_socket.clone())
            .unwrap_or_else(|| DEFAULT_ENGINE_SOCKET.to_string());
        Some(PathBuf::from(path))
    };

    let instructions = if cli.instructions.is_empty() {
        config.instructions.clone().unwrap_or_default()
    } else {
        cli.instructions.clone()
    };

    let mount_candidates = if !cli.paths.is_empty() {
        cli.paths.clone()
    } else {
        config.paths.clone().unwrap_or_else(|| {
            DEFAULT_MOUNT_CANDIDATES
                .iter()
                .map(|p| p.to_string())
                .collect()
        })
    };

    let proxy = if cli.cmd_proxy {
        ProxyPolicy::Enabled {
            port: cli
                .cmd_proxy_port
                .or(config.cmd_proxy_port)
                .unwrap_or(DEFAULT_PROXY_PORT),
        }
    } else {
        ProxyPolicy::Disabled
    };

    let mut spec = RunSpec::new(cli.image.clone(), cli.command.clone())
        .host_dir(host_dir)
        .work_dir_strategy(WorkDirStrategy::from_flags(cli.no_mount, cli.add_mount))
        .env_policy(env_policy)
        .user(if cli.no_root {
            UserPolicy::HostUser
        } else {
            UserPolicy::Root
        })
        .engine(cli.engine.or(config.engine).unwrap_or_default())
        .engine_integration(EngineIntegration {
            socket,
            install_client: cli.add_docker,
        })
        .ssh(if cli.ssh {
            SshPolicy::Forward
        } else {
            SshPolicy::Disabled
        })
        .proxy(proxy)
        .instructions(instructions)
        .tty(!cli.no_tty)
        .mount_candidates(mount_candidates);

    if let Some(entrypoint) = cli.entrypoint.as_ref().or(config.entrypoint.as_ref()) {
        spec = spec.entrypoint(entrypoint.as_str());
    }
    if let Some(work_dir) = cli.work_dir.as_ref().or(config.work_dir.as_ref()) {
        spec = spec.work_dir(work_dir.as_str());
    }
    if let Some(target) = &config.target_image {
        spec = spec.target_image(target.as_str());
    }

    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_whitelist_help_mentions_proxy_address() {
        let help = Cli::command().render_long_help().to_string();
        assert!(help.contains("LOPE_PROXY_ADDR"));
    }

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("lope").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_split_csv_drops_empty_items() {
        assert_eq!(split_csv("HOME,,PATH,"), vec!["HOME", "PATH"]);
        assert!(split_csv("").is_empty());
    }

    #[test]
    fn test_command_keeps_hyphen_arguments() {
        let cli = parse(&["--ssh", "alpine", "ls", "-la"]);
        assert_eq!(cli.image, "alpine");
        assert_eq!(cli.command, vec!["ls", "-la"]);
        assert!(cli.ssh);
    }

    #[test]
    fn test_missing_command_is_rejected() {
        assert!(Cli::try_parse_from(["lope", "alpine"]).is_err());
        assert!(Cli::try_parse_from(["lope", "--no-mount", "--add-mount", "alpine", "ls"]).is_err());
    }

    #[test]
    fn test_cli_overrides_config() {
        let cli = parse(&[
            "--engine",
            "docker",
            "--whitelist",
            "APP_",
            "--no-docker",
            "--cmd-proxy",
            "alpine",
            "ls",
        ]);
        let config = LopeConfig {
            engine: Some(Engine::Podman),
            entrypoint: Some("/bin/bash".into()),
            cmd_proxy_port: Some(24300),
            ..LopeConfig::default()
        };
        let spec = build_spec(&cli, &config).unwrap();
        assert_eq!(spec.engine, Engine::Docker);
        assert_eq!(spec.entrypoint, "/bin/bash");
        assert_eq!(spec.engine_integration.socket, None);
        assert_eq!(spec.proxy, ProxyPolicy::Enabled { port: 24300 });
        assert!(!spec.env.whitelist.is_empty());
    }

    #[test]
    fn test_default_blacklist() {
        let cli = parse(&["alpine", "ls"]);
        let spec = build_spec(&cli, &LopeConfig::default()).unwrap();
        assert!(spec.env.blacklist.matches("SSH_AUTH_SOCK"));
        assert!(spec.env.whitelist.is_empty());
        assert_eq!(spec.work_dir_strategy, WorkDirStrategy::BindMount);
        assert_eq!(spec.user, UserPolicy::Root);
        assert!(spec.tty);
    }

    #[test]
    fn test_invalid_pattern_is_fatal() {
        let cli = parse(&["--blacklist", "(", "alpine", "ls"]);
        assert!(build_spec(&cli, &LopeConfig::default()).is_err());
    }
}
