// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The `ctx.http` capability: reqwest-backed HTTP with egress
//! filtering.
//!
//! Any completed HTTP exchange returns `Ok` with the status in the
//! response envelope; block code decides what a 4xx/5xx means. Errors
//! are reserved for refused egress, timeouts, and transport failures.

use async_trait::async_trait;
use flowgraph_core::ports::HttpPort;
use flowgraph_sandbox::{CapabilityError, HttpRequest, HttpResponse};
use reqwest::Client;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;
use url::{Host, Url};

/// Egress policy for `ctx.http`.
#[derive(Debug, Clone, Default)]
pub struct EgressPolicy {
    /// Hosts admitted even when they would otherwise be refused
    /// (per-tenant overrides resolve into this set).
    pub allowed_hosts: HashSet<String>,
}

impl EgressPolicy {
    /// Policy with no overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a host that the private-range filter would refuse.
    pub fn allow_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_hosts.insert(host.into());
        self
    }

    /// Checks a URL against the policy.
    pub fn check(&self, url: &Url) -> Result<(), CapabilityError> {
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(CapabilityError::Denied {
                    message: format!("scheme '{}' is not allowed", other),
                });
            }
        }

        let host = url.host().ok_or_else(|| CapabilityError::Denied {
            message: "URL has no host".to_string(),
        })?;

        let host_str = host.to_string();
        if self.allowed_hosts.contains(&host_str) {
            return Ok(());
        }

        match host {
            Host::Ipv4(ip) => Self::check_ip(IpAddr::V4(ip))?,
            Host::Ipv6(ip) => Self::check_ip(IpAddr::V6(ip))?,
            Host::Domain(domain) => {
                let lowered = domain.to_ascii_lowercase();
                if lowered == "localhost"
                    || lowered.ends_with(".localhost")
                    || lowered == "metadata.google.internal"
                    || lowered.ends_with(".internal")
                {
                    return Err(CapabilityError::Denied {
                        message: format!("host '{}' is not allowed", domain),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_ip(ip: IpAddr) -> Result<(), CapabilityError> {
        let blocked = match ip {
            IpAddr::V4(v4) => {
                v4.is_loopback()
                    || v4.is_private()
                    || v4.is_link_local()
                    || v4.is_unspecified()
                    || v4.is_broadcast()
            }
            IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
        };
        if blocked {
            return Err(CapabilityError::Denied {
                message: format!("address {} is not allowed", ip),
            });
        }
        Ok(())
    }
}

/// Reqwest-backed [`HttpPort`].
pub struct ReqwestHttp {
    client: Client,
    policy: EgressPolicy,
    default_timeout: Duration,
}

impl ReqwestHttp {
    /// Creates the port with a default per-call timeout.
    pub fn new(policy: EgressPolicy, default_timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            policy,
            default_timeout,
        }
    }
}

#[async_trait]
impl HttpPort for ReqwestHttp {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, CapabilityError> {
        let url = Url::parse(&request.url).map_err(|e| CapabilityError::Invalid {
            message: format!("invalid URL '{}': {}", request.url, e),
        })?;
        self.policy.check(&url)?;

        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| CapabilityError::Invalid {
                message: format!("invalid HTTP method '{}'", request.method),
            })?;

        let timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        let mut builder = self.client.request(method, url).timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        debug!(method = %request.method, url = %request.url, "egress request");
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                CapabilityError::Timeout
            } else {
                CapabilityError::Provider {
                    code: "NETWORK_ERROR".to_string(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        Ok(HttpResponse {
            status: status.as_u16(),
            status_text: status
                .canonical_reason()
                .unwrap_or("Unknown")
                .to_string(),
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> EgressPolicy {
        EgressPolicy::new()
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_public_hosts_allowed() {
        assert!(policy().check(&url("https://api.github.com/repos")).is_ok());
        assert!(policy().check(&url("http://example.com")).is_ok());
    }

    #[test]
    fn test_loopback_and_private_refused() {
        assert!(policy().check(&url("http://127.0.0.1/admin")).is_err());
        assert!(policy().check(&url("http://10.0.0.8/")).is_err());
        assert!(policy().check(&url("http://192.168.1.1/")).is_err());
        assert!(policy().check(&url("http://localhost:8080/")).is_err());
        assert!(policy().check(&url("http://[::1]/")).is_err());
    }

    #[test]
    fn test_metadata_service_refused() {
        assert!(policy().check(&url("http://169.254.169.254/latest")).is_err());
        assert!(policy()
            .check(&url("http://metadata.google.internal/computeMetadata"))
            .is_err());
    }

    #[test]
    fn test_non_http_scheme_refused() {
        assert!(policy().check(&url("ftp://example.com/file")).is_err());
        assert!(policy().check(&url("file:///etc/passwd")).is_err());
    }

    #[test]
    fn test_allowlist_overrides() {
        let policy = EgressPolicy::new().allow_host("localhost");
        assert!(policy.check(&url("http://localhost:9000/hook")).is_ok());
    }

    #[tokio::test]
    async fn test_request_returns_status_without_erroring() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/missing")
            .with_status(404)
            .with_body(r#"{"message": "not found"}"#)
            .create_async()
            .await;

        let host = url(&server.url()).host().unwrap().to_string();
        let port = ReqwestHttp::new(
            EgressPolicy::new().allow_host(host),
            Duration::from_secs(5),
        );
        let response = port
            .request(HttpRequest {
                method: "GET".to_string(),
                url: format!("{}/missing", server.url()),
                headers: HashMap::new(),
                body: None,
                timeout_ms: None,
            })
            .await
            .unwrap();

        assert_eq!(response.status, 404);
        assert_eq!(response.body, json!({"message": "not found"}));
    }

    #[tokio::test]
    async fn test_json_body_posted() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/items")
            .match_header("content-type", "application/json")
            .with_status(201)
            .with_body(r#"{"id": 7}"#)
            .create_async()
            .await;

        let host = url(&server.url()).host().unwrap().to_string();
        let port = ReqwestHttp::new(
            EgressPolicy::new().allow_host(host),
            Duration::from_secs(5),
        );
        let response = port
            .request(HttpRequest {
                method: "POST".to_string(),
                url: format!("{}/items", server.url()),
                headers: HashMap::new(),
                body: Some(json!({"name": "x"})),
                timeout_ms: None,
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.status, 201);
        assert_eq!(response.body["id"], 7);
    }
}
