//! Outbound HTTP for the `Fetch` op.
//!
//! Disabled unless `[network] allow = true`.  Only `http`/`https` URLs are
//! accepted, `allowed_hosts` (when non-empty) is enforced before any
//! connection is made, and response bodies are capped at `max_body_bytes`.
//!
//! Host calls are synchronous, so the request is driven with `block_on` on the
//! tokio runtime captured when the service was built.  Callers on that runtime
//! must invoke hooks from a blocking thread (`spawn_blocking`).  Without any
//! runtime a throwaway current-thread runtime is used.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use hookbridge_protocol::Payload;
use reqwest::{Client, Method};
use serde_json::{Value, json};
use tokio::runtime::{Builder, Handle};
use tracing::{debug, warn};
use url::Url;

use crate::config::NetworkConfig;
use crate::error::{Fault, Result};

pub struct FetchService {
    client: Client,
    config: NetworkConfig,
    runtime: Option<Handle>,
}

/// A validated outbound request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub timeout: Duration,
}

impl FetchService {
    pub fn new(config: &NetworkConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("hookbridge/", env!("CARGO_PKG_VERSION")))
            // Connections must not outlive the runtime that drove them.
            .pool_max_idle_per_host(0)
            .build()?;
        Ok(Self {
            client,
            config: config.clone(),
            runtime: Handle::try_current().ok(),
        })
    }

    /// Check policy and build the request from a validated `Fetch` payload.
    pub fn prepare(&self, payload: &Payload) -> std::result::Result<FetchRequest, Fault> {
        if !self.config.allow {
            return Err(Fault::host("network access is disabled for hooks"));
        }
        let raw = payload
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| Fault::invalid("url", "is required"))?;
        let url = Url::parse(raw).map_err(|e| Fault::invalid("url", format!("invalid url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Fault::invalid("url", "only http and https are allowed"));
        }
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        if !self.config.allowed_hosts.is_empty()
            && !self
                .config
                .allowed_hosts
                .iter()
                .any(|h| h.eq_ignore_ascii_case(&host))
        {
            return Err(Fault::host(format!("host `{host}` is not in allowed_hosts")));
        }

        let method = payload
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET");
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| Fault::invalid("method", "invalid HTTP method"))?;
        let headers = payload
            .get("headers")
            .and_then(Value::as_object)
            .map(|h| {
                h.iter()
                    .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_owned())))
                    .collect()
            })
            .unwrap_or_default();
        let requested = payload.get("timeout").and_then(Value::as_u64).unwrap_or(30);
        Ok(FetchRequest {
            url,
            method,
            headers,
            body: payload.get("body").and_then(Value::as_str).map(str::to_owned),
            timeout: Duration::from_secs(requested.min(self.config.timeout_secs).max(1)),
        })
    }

    /// Perform `request`, returning `{status, headers, body}`.
    pub fn execute(&self, request: FetchRequest) -> std::result::Result<Value, Fault> {
        debug!(method = %request.method, url = %request.url, "hook fetch");
        let runtime = self.runtime.clone().or_else(|| Handle::try_current().ok());
        block_on(runtime, self.send(request))?
    }

    async fn send(&self, request: FetchRequest) -> std::result::Result<Value, Fault> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let mut response = builder.send().await.map_err(|e| {
            warn!(error = %e, "hook fetch failed");
            Fault::host(format!("fetch failed: {e}"))
        })?;
        let status = response.status().as_u16();
        let headers: serde_json::Map<String, Value> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.to_string(), Value::String(v.to_str().ok()?.to_owned()))))
            .collect();

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Fault::host(format!("fetch body failed: {e}")))?
        {
            if body.len() + chunk.len() > self.config.max_body_bytes {
                return Err(Fault::host(format!(
                    "response body exceeds {} bytes",
                    self.config.max_body_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(json!({
            "status": status,
            "headers": headers,
            "body": String::from_utf8_lossy(&body),
        }))
    }
}

fn block_on<F: Future>(runtime: Option<Handle>, fut: F) -> std::result::Result<F::Output, Fault> {
    match runtime {
        Some(handle) => Ok(handle.block_on(fut)),
        None => {
            let rt = Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| Fault::host(format!("failed to start fetch runtime: {e}")))?;
            Ok(rt.block_on(fut))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn payload(v: Value) -> Payload {
        let object = v.as_object().cloned().unwrap();
        hookbridge_protocol::validate(hookbridge_protocol::OpCode::Fetch, object).unwrap()
    }

    fn service(allow: bool, hosts: &[&str]) -> FetchService {
        FetchService::new(&NetworkConfig {
            allow,
            allowed_hosts: hosts.iter().map(|h| h.to_string()).collect(),
            ..NetworkConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn disabled_by_default() {
        let svc = service(false, &[]);
        let err = svc.prepare(&payload(json!({"url": "https://example.com"}))).unwrap_err();
        assert_eq!(err.kind, hookbridge_protocol::ErrorKind::HostError);
    }

    #[test]
    fn rejects_non_http_schemes() {
        let svc = service(true, &[]);
        let err = svc.prepare(&payload(json!({"url": "file:///etc/passwd"}))).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("url"));
        let err = svc.prepare(&payload(json!({"url": "not a url"}))).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("url"));
    }

    #[test]
    fn enforces_allowed_hosts() {
        let svc = service(true, &["api.example.com"]);
        assert!(svc.prepare(&payload(json!({"url": "https://API.example.com/x"}))).is_ok());
        let err = svc.prepare(&payload(json!({"url": "https://evil.test/"}))).unwrap_err();
        assert!(err.message.contains("evil.test"));
    }

    #[test]
    fn timeout_is_capped_by_config() {
        let svc = service(true, &[]);
        let slow = json!({"url": "http://localhost/", "timeout": 300, "method": "post"});
        let req = svc.prepare(&payload(slow)).unwrap();
        assert_eq!(req.timeout, Duration::from_secs(30));
        assert_eq!(req.method, Method::POST);
    }
}
