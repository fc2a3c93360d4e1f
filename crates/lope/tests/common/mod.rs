//! Test utilities and common setup.

#![allow(dead_code)]

use std::sync::Mutex;

use async_trait::async_trait;
use lope::error::LopeResult;
use lope::host::{CommandOutput, HostCommands};
use lope::spec::{EngineIntegration, RunSpec, WorkDirStrategy};

/// A host that records every command instead of running it.
#[derive(Default)]
pub struct RecordingHost {
    /// Whether the SSH readiness probe succeeds.
    pub helper_ready: bool,
    /// Whether image builds fail.
    pub build_fails: bool,
    pub commands: Mutex<Vec<Vec<String>>>,
    pub detached: Mutex<Vec<Vec<String>>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ready() -> Self {
        Self {
            helper_ready: true,
            ..Self::default()
        }
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().unwrap().clone()
    }

    pub fn detached(&self) -> Vec<Vec<String>> {
        self.detached.lock().unwrap().clone()
    }

    /// Number of recorded commands whose program is `program`.
    pub fn count(&self, program: &str) -> usize {
        self.commands()
            .iter()
            .filter(|argv| argv.first().map(String::as_str) == Some(program))
            .count()
    }
}

fn ok(text: &str) -> CommandOutput {
    CommandOutput {
        success: true,
        code: Some(0),
        combined: text.as_bytes().to_vec(),
    }
}

fn failed(text: &str) -> CommandOutput {
    CommandOutput {
        success: false,
        code: Some(255),
        combined: text.as_bytes().to_vec(),
    }
}

#[async_trait]
impl HostCommands for RecordingHost {
    async fn output(&self, argv: &[String]) -> LopeResult<CommandOutput> {
        self.commands.lock().unwrap().push(argv.to_vec());

        let args: Vec<&str> = argv.iter().map(String::as_str).collect();
        let output = match args.as_slice() {
            ["ssh-add", "-L"] => ok("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAI test@host\n"),
            ["ssh", ..] if self.helper_ready => ok("ssh-entrypoint.sh\n"),
            ["ssh", ..] => failed("ssh: connect to host 127.0.0.1 port 2244: Connection refused\n"),
            ["getent", "group", "docker"] => ok("docker:x:998:tester\n"),
            [_, "build", ..] if self.build_fails => failed("Step 2/2 : RUN false\nerror: exit code 1\n"),
            _ => ok(""),
        };
        Ok(output)
    }

    fn spawn_detached(&self, argv: &[String]) -> LopeResult<()> {
        self.detached.lock().unwrap().push(argv.to_vec());
        Ok(())
    }
}

/// A spec that touches nothing on the host besides the given directory.
pub fn isolated_spec(host_dir: &std::path::Path) -> RunSpec {
    RunSpec::new("imageName", vec!["command".into(), "-arg".into()])
        .host_dir(host_dir)
        .home(host_dir)
        .mount_candidates(Vec::new())
        .work_dir_strategy(WorkDirStrategy::Omit)
        .engine_integration(EngineIntegration {
            socket: None,
            install_client: false,
        })
}
