//! lope-proxy - run a host command from inside a lope container.
//!
//! The command to run is the name this binary was invoked as, so installing
//! it as `/usr/local/bin/docker` makes `docker ps` inside the container run
//! `docker ps` on the host. Invoked as `lope-proxy`, the first argument is the
//! command instead.
//!
//! ```bash
//! export LOPE_PROXY_ADDR=http://localhost:24242
//! lope-proxy uname -a
//! ```

use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use lope_protocol::{PROXY_ADDR_ENV, ProxyRequest};
use tracing::debug;

const BINARY_NAME: &str = "lope-proxy";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let Ok(url) = std::env::var(PROXY_ADDR_ENV) else {
        println!("Please set the '{}' environment variable", PROXY_ADDR_ENV);
        std::process::exit(1);
    };

    let mut argv = std::env::args();
    let argv0 = argv.next().unwrap_or_default();
    let request = match forwarded_command(&argv0, argv.collect()) {
        Ok(request) => request,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(&url, &request) {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn run(url: &str, request: &ProxyRequest) -> Result<()> {
    let body = send(url, request).await?;

    let mut stdout = io::stdout();
    stdout.write_all(&body)?;
    stdout.flush()?;
    Ok(())
}

/// Post `request` to the proxy at `url` and return the response body.
async fn send(url: &str, request: &ProxyRequest) -> Result<Vec<u8>> {
    debug!("Forwarding {} {:?} to {}", request.command, request.args, url);

    let response = reqwest::Client::new()
        .post(url)
        .json(request)
        .send()
        .await
        .with_context(|| format!("sending command to {url}"))?;
    let body = response
        .bytes()
        .await
        .context("reading command proxy response")?;
    Ok(body.to_vec())
}

/// The request for an invocation with the given `argv[0]` and arguments.
fn forwarded_command(argv0: &str, mut args: Vec<String>) -> Result<ProxyRequest> {
    let name = Path::new(argv0)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    if name != BINARY_NAME {
        return Ok(ProxyRequest::new(name, args));
    }
    if args.is_empty() {
        bail!("usage: {BINARY_NAME} <command> [args...]");
    }
    let command = args.remove(0);
    Ok(ProxyRequest::new(command, args))
}
