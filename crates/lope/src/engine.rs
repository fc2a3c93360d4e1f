//! Container engine invocations: image builds and the final launch.

use std::io::Write;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{LopeError, LopeResult};
use crate::host::HostCommands;
use crate::spec::Engine;

/// Arguments of `<engine> build -t <image> -f <dockerfile> <context>`.
pub fn build_args(engine: Engine, image: &str, dockerfile: &Path, context: &Path) -> Vec<String> {
    vec![
        engine.binary().to_string(),
        "build".to_string(),
        "-t".to_string(),
        image.to_string(),
        "-f".to_string(),
        dockerfile.display().to_string(),
        context.display().to_string(),
    ]
}

/// Build `image` from `dockerfile` using `context` as the build context.
///
/// The build file is written to a temporary file inside the context and
/// removed afterwards. A failed build carries the captured output.
pub async fn build_image(
    host: &dyn HostCommands,
    engine: Engine,
    image: &str,
    dockerfile: &str,
    context: &Path,
) -> LopeResult<()> {
    let mut file = tempfile::Builder::new()
        .prefix("Dockerfile.lope-")
        .tempfile_in(context)?;
    file.write_all(dockerfile.as_bytes())?;
    file.flush()?;

    info!("Building image {}", image);
    let output = host
        .output(&build_args(engine, image, file.path(), context))
        .await?;

    if !output.success {
        return Err(LopeError::BuildFailed {
            image: image.to_string(),
            output: output.text(),
        });
    }
    debug!("Built image {}", image);
    Ok(())
}

/// Launch the assembled invocation with the terminal attached and wait for it.
///
/// Returns the exit code; termination by a signal is reported as 1.
pub async fn launch(params: &[String]) -> LopeResult<i32> {
    let Some((program, args)) = params.split_first() else {
        return Err(LopeError::InvalidInput("empty invocation".to_string()));
    };
    debug!("Running: {}", params.join(" "));

    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|source| LopeError::Spawn {
            command: program.clone(),
            source,
        })?;

    Ok(status.code().unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_build_args() {
        let args = build_args(
            Engine::Docker,
            "lope",
            &PathBuf::from("/src/Dockerfile.lope-x"),
            &PathBuf::from("/src"),
        );
        assert_eq!(
            args.join(" "),
            "docker build -t lope -f /src/Dockerfile.lope-x /src"
        );
    }

    #[tokio::test]
    async fn test_launch_rejects_empty_invocation() {
        assert!(launch(&[]).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_propagates_exit_code() {
        let params = vec!["sh".to_string(), "-c".to_string(), "exit 7".to_string()];
        assert_eq!(launch(&params).await.unwrap(), 7);
    }
}
