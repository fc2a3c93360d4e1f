//! Invocation assembly.
//!
//! Assembly runs in two phases. The bootstrap phase performs the side effects
//! a run depends on, strictly in order: SSH agent forwarding, the image build,
//! starting the command proxy and looking up the host identity. The compile
//! phase then folds [`STAGES`] over an [`Invocation`] to produce the engine
//! parameters. Stages are plain functions of their input, so the parameter
//! order can be tested without touching the host.

use tracing::{debug, info};

use crate::dockerfile::{self, ImagePlan};
use crate::engine;
use crate::env;
use crate::error::LopeResult;
use crate::host::{self, HostCommands, HostIdentity};
use crate::proxy::{self, ProxyEndpoint};
use crate::retry::Backoff;
use crate::spec::{ProxyPolicy, RunSpec, UserPolicy};
use crate::ssh::{self, AGENT_SOCKET, AGENT_SOCKET_ENV, AgentBridge, AgentForwarding};
use crate::volumes;

/// Engine parameters and environment under construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub params: Vec<String>,
    /// Environment snapshot the env stage filters from.
    pub env: Vec<String>,
}

impl Invocation {
    pub fn new(env: Vec<String>) -> Self {
        Self {
            params: Vec::new(),
            env,
        }
    }

    fn param(mut self, param: impl Into<String>) -> Self {
        self.params.push(param.into());
        self
    }

    fn flag(self, flag: &str, value: impl Into<String>) -> Self {
        self.param(flag).param(value)
    }

    fn stage_env(mut self, entry: String) -> Self {
        self.env.push(entry);
        self
    }
}

/// Outcomes of the bootstrap phase that the stages read.
#[derive(Debug, Clone)]
pub struct Context<'a> {
    pub spec: &'a RunSpec,
    /// Image the container is started from.
    pub image: &'a str,
    pub agent: AgentForwarding,
    pub proxy: Option<&'a ProxyEndpoint>,
    pub identity: Option<HostIdentity>,
}

pub type Stage = fn(Invocation, &Context<'_>) -> Invocation;

/// Compile stages, in emission order.
pub const STAGES: &[(&str, Stage)] = &[
    ("defaults", defaults),
    ("proxy", proxy_access),
    ("volumes", volume_bindings),
    ("sanitize", sanitize_env),
    ("env", forward_env),
    ("user", user_override),
    ("run", run_command),
];

/// Fold every stage over a fresh invocation seeded with `env`.
pub fn compile(ctx: &Context<'_>, env: Vec<String>) -> Invocation {
    STAGES
        .iter()
        .fold(Invocation::new(env), |invocation, (name, stage)| {
            let before = invocation.params.len();
            let invocation = stage(invocation, ctx);
            debug!(
                "Stage {} added {} parameters",
                name,
                invocation.params.len() - before
            );
            invocation
        })
}

fn defaults(invocation: Invocation, ctx: &Context<'_>) -> Invocation {
    let spec = ctx.spec;
    let invocation = invocation
        .param(spec.engine.binary())
        .param("run")
        .param("--rm")
        .param("--interactive")
        .flag("--entrypoint", spec.entrypoint.as_str())
        .flag("--workdir", spec.work_dir.as_str())
        .flag("--net", "host");

    if spec.tty {
        invocation.param("--tty")
    } else {
        invocation
    }
}

fn proxy_access(invocation: Invocation, ctx: &Context<'_>) -> Invocation {
    match ctx.proxy {
        Some(endpoint) => invocation
            .param(endpoint.add_host_param())
            .stage_env(endpoint.env_entry()),
        None => invocation,
    }
}

fn volume_bindings(invocation: Invocation, ctx: &Context<'_>) -> Invocation {
    volumes::resolve(ctx.spec)
        .into_iter()
        .fold(invocation, |invocation, binding| invocation.flag("-v", binding))
}

fn sanitize_env(mut invocation: Invocation, _ctx: &Context<'_>) -> Invocation {
    env::sanitize(&mut invocation.env);
    invocation
}

fn forward_env(invocation: Invocation, ctx: &Context<'_>) -> Invocation {
    let forwarded: Vec<String> = env::filter(&ctx.spec.env, &invocation.env)
        .into_iter()
        .map(str::to_string)
        .collect();
    let invocation = forwarded
        .into_iter()
        .fold(invocation, |invocation, entry| invocation.flag("-e", entry));

    if ctx.agent.is_active() {
        invocation.flag("-e", format!("{}={}", AGENT_SOCKET_ENV, AGENT_SOCKET))
    } else {
        invocation
    }
}

fn user_override(invocation: Invocation, ctx: &Context<'_>) -> Invocation {
    match (ctx.spec.user, ctx.identity) {
        (UserPolicy::HostUser, Some(id)) => invocation.param(format!("--user={}:{}", id.uid, id.gid)),
        _ => invocation,
    }
}

fn run_command(invocation: Invocation, ctx: &Context<'_>) -> Invocation {
    invocation
        .param(ctx.image)
        .param("-c")
        .param(ctx.spec.command.join(" "))
}

/// Result of a complete assembly.
#[derive(Debug, Clone)]
pub struct Assembly {
    pub params: Vec<String>,
    pub plan: ImagePlan,
    pub agent: AgentForwarding,
    pub proxy: Option<ProxyEndpoint>,
}

/// Runs the bootstrap phase against a host and compiles the result.
pub struct Assembler<'a> {
    spec: &'a RunSpec,
    host: &'a dyn HostCommands,
    dry_run: bool,
    ssh_backoff: Backoff,
}

impl<'a> Assembler<'a> {
    pub fn new(spec: &'a RunSpec, host: &'a dyn HostCommands) -> Self {
        Self {
            spec,
            host,
            dry_run: false,
            ssh_backoff: ssh::READY_BACKOFF,
        }
    }

    /// Skip SSH forwarding, the image build and the proxy listener.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn ssh_backoff(mut self, backoff: Backoff) -> Self {
        self.ssh_backoff = backoff;
        self
    }

    /// Assemble the engine parameters for a run with the given host environment.
    pub async fn assemble(&self, env: Vec<String>) -> LopeResult<Assembly> {
        let spec = self.spec;

        let agent = if spec.ssh.enabled() && !self.dry_run {
            AgentBridge::new(self.host, spec.engine)
                .with_backoff(self.ssh_backoff)
                .bootstrap()
                .await
        } else {
            AgentForwarding::Skipped
        };

        let plan = dockerfile::plan(spec);
        if let Some(text) = &plan.dockerfile {
            if self.dry_run {
                debug!("Dry run: not building {}", plan.image);
            } else {
                engine::build_image(self.host, spec.engine, &plan.image, text, &spec.host_dir)
                    .await?;
            }
        }

        let proxy = match spec.proxy {
            ProxyPolicy::Enabled { port } if !self.dry_run => {
                let endpoint = proxy::start(port).await?;
                info!("Command proxy available at {}", endpoint.url());
                Some(endpoint)
            }
            _ => None,
        };

        let identity = match spec.user {
            UserPolicy::HostUser => host::resolve_identity(self.host).await,
            UserPolicy::Root => None,
        };

        let ctx = Context {
            spec,
            image: &plan.image,
            agent,
            proxy: proxy.as_ref(),
            identity,
        };
        let params = compile(&ctx, env).params;

        Ok(Assembly {
            params,
            plan,
            agent,
            proxy,
        })
    }
}
