//! Bind mount resolution.

use std::path::Path;

use tracing::debug;

use crate::spec::{CONTAINER_ENGINE_SOCKET, RunSpec, WorkDirStrategy};
use crate::ssh::{AGENT_MOUNT, AGENT_VOLUME};

/// Bindings for the candidates that exist under `home`, in input order.
///
/// Each existing `home/<candidate>` is mounted at `/root/<candidate>`. A
/// leading `/` does not escape `home`.
pub fn candidate_bindings(home: &Path, candidates: &[String]) -> Vec<String> {
    candidates
        .iter()
        .filter_map(|candidate| {
            let candidate = candidate.trim_start_matches('/');
            let host_path = home.join(candidate);
            if !host_path.exists() {
                debug!("Skipping missing mount candidate {}", host_path.display());
                return None;
            }
            let binding = format!("{}:/root/{}", host_path.display(), candidate);
            debug!("Adding volume {:?}", binding);
            Some(binding)
        })
        .collect()
}

/// Every volume binding for `spec`, in the order they are passed to the engine.
///
/// Home candidates come first, followed by the working directory, the engine
/// socket and the SSH agent volume.
pub fn resolve(spec: &RunSpec) -> Vec<String> {
    let mut bindings = candidate_bindings(&spec.home, &spec.mount_candidates);

    if spec.work_dir_strategy == WorkDirStrategy::BindMount {
        bindings.push(format!("{}:{}", spec.host_dir.display(), spec.work_dir));
    }

    if let Some(socket) = &spec.engine_integration.socket {
        bindings.push(format!("{}:{}", socket.display(), CONTAINER_ENGINE_SOCKET));
    }

    if spec.ssh.enabled() {
        bindings.push(format!("{}:{}", AGENT_VOLUME, AGENT_MOUNT));
    }

    bindings
}
