//! Command proxy wire protocol.
//!
//! The container talks to the host with a single request shape:
//!
//! ```text
//! POST /
//! Content-Type: application/json
//!
//! {"command": "docker", "args": ["ps", "-a"]}
//! ```
//!
//! The response body is the raw combined output of the command. It is sent
//! with `Content-Type: application/json` even though it is not JSON, so
//! clients must treat the body as opaque bytes.

use serde::{Deserialize, Serialize};

/// Environment variable carrying the proxy base URL into the container.
pub const PROXY_ADDR_ENV: &str = "LOPE_PROXY_ADDR";

/// Default listening port of the host-side proxy.
pub const DEFAULT_PROXY_PORT: u16 = 24242;

/// Hostname the container uses to reach the host-side proxy.
pub const PROXY_HOST_ALIAS: &str = "localhost";

/// Content type attached to every successful proxy response.
pub const RESPONSE_CONTENT_TYPE: &str = "application/json";

/// A host command requested by code running inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ProxyRequest {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    /// Parse a request body.
    pub fn from_slice(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }
}

/// Build the base URL published to the container.
pub fn proxy_url(host: &str, port: u16) -> String {
    format!("http://{}:{}", host, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let request = ProxyRequest::new("lope", vec!["--no-tty".into(), "alpine".into()]);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["command"], "lope");
        assert_eq!(json["args"][1], "alpine");
    }

    #[test]
    fn test_missing_args_defaults_to_empty() {
        let request = ProxyRequest::from_slice(br#"{"command":"ls"}"#).unwrap();
        assert_eq!(request.command, "ls");
        assert!(request.args.is_empty());
    }

    #[test]
    fn test_malformed_body_is_rejected() {
        assert!(ProxyRequest::from_slice(b"{not json").is_err());
        assert!(ProxyRequest::from_slice(br#"{"args":[]}"#).is_err());
    }

    #[test]
    fn test_proxy_url() {
        assert_eq!(proxy_url("10.0.0.4", 8000), "http://10.0.0.4:8000");
    }
}
