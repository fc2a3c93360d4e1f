//! Host command proxy.
//!
//! An HTTP endpoint that runs host commands on behalf of the container. A
//! request is `POST /` with a [`ProxyRequest`] body; the response body is the
//! command's standard output followed by its standard error.
//!
//! The endpoint has no authentication. Anyone able to reach the published
//! port can run arbitrary commands as the invoking user, so it is only meant
//! for same-host or otherwise trusted networks.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use axum::{
    Router,
    body::Bytes,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use lope_protocol::{PROXY_ADDR_ENV, PROXY_HOST_ALIAS, ProxyRequest, RESPONSE_CONTENT_TYPE};
use tokio::net::TcpListener;
use tokio::process::Command;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::error::{LopeError, LopeResult};
use crate::host::combined_output;

/// Address used to find the outbound-routable interface. Nothing is sent.
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

/// Errors answered by the proxy endpoint.
#[derive(Debug, thiserror::Error)]
enum ProxyError {
    #[error("{0}")]
    BadRequest(#[from] serde_json::Error),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        // The message is returned as is so callers see the parse error.
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

/// Router serving the proxy endpoint.
pub fn router() -> Router {
    Router::new()
        .route("/", post(handle))
        .layer(TraceLayer::new_for_http())
}

async fn handle(body: Bytes) -> Result<Response, ProxyError> {
    let request = ProxyRequest::from_slice(&body)?;
    let output = execute(&request).await;

    // Raw command output under a JSON content type; clients rely on it.
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, RESPONSE_CONTENT_TYPE)],
        output,
    )
        .into_response())
}

/// Run a requested command and capture its output.
///
/// A non-zero exit is logged; the output is returned regardless. A command
/// that cannot be started yields the error text instead of output.
pub async fn execute(request: &ProxyRequest) -> Vec<u8> {
    debug!("Running: {} {}", request.command, request.args.join(" "));

    let mut command = Command::new(&request.command);
    command.args(&request.args);

    match combined_output(command).await {
        Ok((status, combined)) => {
            if !status.success() {
                warn!(
                    "Proxied command {} exited with {}: {}",
                    request.command,
                    status,
                    String::from_utf8_lossy(&combined).trim()
                );
            }
            combined
        }
        Err(e) => {
            warn!("Proxied command {} could not be started: {}", request.command, e);
            e.to_string().into_bytes()
        }
    }
}

/// Where the container reaches the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn url(&self) -> String {
        lope_protocol::proxy_url(&self.ip.to_string(), self.port)
    }

    /// Engine parameter mapping the well-known host alias to the host address.
    pub fn add_host_param(&self) -> String {
        format!("--add-host={}:{}", PROXY_HOST_ALIAS, self.ip)
    }

    /// Environment entry handing the proxy URL to the container.
    pub fn env_entry(&self) -> String {
        format!("{}={}", PROXY_ADDR_ENV, self.url())
    }
}

/// Bind the proxy on all interfaces and serve it in the background for the
/// rest of the process lifetime.
pub async fn start(port: u16) -> LopeResult<ProxyEndpoint> {
    let port = serve(port).await?;
    let ip = outbound_address()?;
    Ok(ProxyEndpoint { ip, port })
}

/// Bind `port` on all interfaces and spawn the server. Returns the bound
/// port, which differs from `port` when it is 0.
pub async fn serve(port: u16) -> LopeResult<u16> {
    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|source| LopeError::ProxyBind {
            addr: bind_addr.to_string(),
            source,
        })?;
    let port = listener.local_addr()?.port();
    info!("Starting lope command proxy on port {}", port);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router()).await {
            error!("Command proxy stopped: {}", e);
        }
    });

    Ok(port)
}

/// Local address of the interface that routes to the internet.
///
/// Connecting a UDP socket only selects a route, so no traffic is generated.
pub fn outbound_address() -> LopeResult<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(LopeError::HostAddress)?;
    socket
        .connect(ROUTE_PROBE_ADDR)
        .map_err(LopeError::HostAddress)?;
    let addr = socket.local_addr().map_err(LopeError::HostAddress)?;
    Ok(addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_params() {
        let endpoint = ProxyEndpoint {
            ip: "192.168.1.20".parse().unwrap(),
            port: 24242,
        };
        assert_eq!(endpoint.url(), "http://192.168.1.20:24242");
        assert_eq!(endpoint.add_host_param(), "--add-host=localhost:192.168.1.20");
        assert_eq!(
            endpoint.env_entry(),
            "LOPE_PROXY_ADDR=http://192.168.1.20:24242"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_captures_both_streams() {
        let request = ProxyRequest::new(
            "sh",
            vec!["-c".into(), "printf out; printf err >&2; exit 1".into()],
        );
        assert_eq!(execute(&request).await, b"outerr");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_keeps_interleaved_order() {
        let request = ProxyRequest::new(
            "sh",
            vec![
                "-c".into(),
                "printf 1 >&2; sleep 0.1; printf 2; sleep 0.1; printf 3 >&2".into(),
            ],
        );
        assert_eq!(execute(&request).await, b"123");
    }

    #[tokio::test]
    async fn test_execute_reports_spawn_failure() {
        let request = ProxyRequest::new("lope-definitely-not-a-binary", vec![]);
        let body = execute(&request).await;
        assert!(!body.is_empty());
    }

    #[test]
    fn test_outbound_address() {
        // Hosts without a default route cannot answer this.
        match outbound_address() {
            Ok(ip) => assert!(!ip.is_unspecified()),
            Err(e) => assert!(matches!(e, LopeError::HostAddress(_))),
        }
    }
}
