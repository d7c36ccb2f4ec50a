//! HTTP webhook adapter
//!
//! POSTs the payload as JSON to `base_url` + endpoint. A target may override
//! the endpoint (`{"endpoint": "/custom"}`) or supply a complete URL
//! (`{"url": "http://..."}`).

use super::{err_result, ok_result, AdapterConfigError, ProtocolAdapter};
use crate::config::HttpSection;
use crate::distributor::result::AdapterResult;
use crate::error::ErrorCode;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

pub struct HttpAdapter {
    section: RwLock<HttpSection>,
    client: reqwest::Client,
}

impl HttpAdapter {
    pub fn new(section: HttpSection) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(section.timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            section: RwLock::new(section),
            client,
        }
    }

    fn resolve_url(&self, config: &Value) -> String {
        if let Some(url) = config.get("url").and_then(Value::as_str) {
            return url.to_string();
        }
        let section = self.section.read().unwrap();
        let endpoint = config
            .get("endpoint")
            .and_then(Value::as_str)
            .unwrap_or(&section.endpoint);
        format!(
            "{}/{}",
            section.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl ProtocolAdapter for HttpAdapter {
    fn protocol(&self) -> &str {
        "http"
    }

    fn capabilities(&self) -> &[&str] {
        &["request-response", "webhooks", "headers"]
    }

    async fn send(&self, data: &Value, config: &Value) -> AdapterResult {
        let start = Utc::now();
        let url = self.resolve_url(config);
        let headers = self.section.read().unwrap().headers.clone();

        let mut request = self.client.post(&url).json(data);
        for (name, value) in &headers {
            request = request.header(name, value);
        }
        if let Some(extra) = config.get("headers").and_then(Value::as_object) {
            for (name, value) in extra {
                if let Some(v) = value.as_str() {
                    request = request.header(name, v);
                }
            }
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    debug!(%url, status = status.as_u16(), "webhook delivered");
                    ok_result(
                        self.protocol(),
                        Some(serde_json::json!({"status": status.as_u16(), "url": url})),
                        start,
                    )
                } else {
                    err_result(
                        self.protocol(),
                        format!("{url} answered {status}"),
                        ErrorCode::HttpStatus,
                        start,
                    )
                }
            }
            Err(e) if e.is_timeout() => err_result(
                self.protocol(),
                format!("request to {url} timed out"),
                ErrorCode::Timeout,
                start,
            ),
            Err(e) => err_result(
                self.protocol(),
                format!("request to {url} failed: {e}"),
                ErrorCode::ConnectionFailed,
                start,
            ),
        }
    }

    async fn configure(&self, config: &Value) -> Result<(), AdapterConfigError> {
        let section: HttpSection = serde_json::from_value(config.clone())
            .map_err(|e| AdapterConfigError::Invalid(e.to_string()))?;
        *self.section.write().unwrap() = section;
        Ok(())
    }
}
