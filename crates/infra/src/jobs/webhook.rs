//! HTTP handler for `Webhook` payloads.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::debug;

use cadence_core::HandlerError;

use super::handler::JobHandler;
use super::types::{HandlerOutput, HttpMethod, JobPayload, QueueEntry};

/// Longest response body quoted in an error message.
const MAX_ERROR_BODY: usize = 512;

/// Performs the HTTP call described by a `Webhook` payload.
///
/// 2xx responses succeed with the body as output (parsed as JSON when it is
/// JSON, otherwise kept as a string). Anything else is a `HandlerError`
/// carrying the status, which the worker turns into a retry.
#[derive(Debug, Clone)]
pub struct WebhookHandler {
    client: reqwest::Client,
}

impl Default for WebhookHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookHandler {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

#[async_trait]
impl JobHandler for WebhookHandler {
    async fn execute(&self, entry: &QueueEntry) -> Result<HandlerOutput, HandlerError> {
        let JobPayload::Webhook {
            url,
            method: http_method,
            body,
            headers,
        } = &entry.payload
        else {
            return Err(HandlerError::new(format!(
                "webhook handler cannot run {} jobs",
                entry.payload.kind_name()
            )));
        };

        let mut req = self
            .client
            .request(method(*http_method), url)
            .header("x-cadence-entry-id", entry.id.to_string())
            .header("x-cadence-tenant-id", entry.tenant_id.to_string());
        for (name, value) in headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| HandlerError::new(format!("webhook request to {url} failed: {e}")))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| HandlerError::new(format!("failed to read webhook response: {e}")).with_http_status(status.as_u16()))?;

        debug!(entry_id = %entry.id, url = %url, status = status.as_u16(), "webhook responded");

        if !status.is_success() {
            let mut excerpt = text;
            if excerpt.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !excerpt.is_char_boundary(cut) {
                    cut -= 1;
                }
                excerpt.truncate(cut);
            }
            return Err(HandlerError::new(format!("webhook returned {status}: {excerpt}"))
                .with_http_status(status.as_u16()));
        }

        let output = if text.is_empty() {
            JsonValue::Null
        } else {
            serde_json::from_str(&text).unwrap_or(JsonValue::String(text))
        };
        Ok(HandlerOutput::new(output).with_http_status(status.as_u16()))
    }
}
