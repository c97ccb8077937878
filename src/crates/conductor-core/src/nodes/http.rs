//! HTTP and OpenAPI executors.
//!
//! Both are thin: their contribution to the engine is the uniform executor
//! contract plus the safety rules (SSRF validation before any request,
//! response size caps, per-invocation timeouts). Placeholders of the form
//! `{{key}}` in URLs, headers, and bodies interpolate from the node's
//! static inputs and the blackboard.

use crate::error::{EngineError, Result};
use crate::registry::{ExecContext, ExecOutcome, NodeExecutor};
use async_trait::async_trait;
use conductor_tooling::validate_url;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

/// Cap on the response body retained as node output.
const MAX_RESPONSE_BYTES: usize = 1_000_000;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace `{{key}}` placeholders from inputs and the blackboard. Control
/// characters are stripped from substituted values.
fn interpolate(template: &str, inputs: &Map<String, Value>, board: &Map<String, Value>) -> String {
    let mut result = template.to_string();
    for (key, value) in inputs.iter().chain(board.iter()) {
        let needle = format!("{{{{{key}}}}}");
        if result.contains(&needle) {
            let clean: String = value_to_string(value)
                .chars()
                .filter(|c| !c.is_control())
                .take(10_000)
                .collect();
            result = result.replace(&needle, &clean);
        }
    }
    result
}

fn truncate_body(text: String) -> String {
    if text.len() <= MAX_RESPONSE_BYTES {
        return text;
    }
    let mut end = MAX_RESPONSE_BYTES;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n*(truncated...)*", &text[..end])
}

async fn perform_request(
    client: &reqwest::Client,
    node_name: &str,
    method: &str,
    url: &str,
    headers: &Map<String, Value>,
    body: Option<String>,
) -> Result<ExecOutcome> {
    // SSRF validation happens before any network I/O.
    let parsed =
        validate_url(url).map_err(|e| EngineError::node(node_name, e.to_string()))?;

    let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|_| EngineError::node(node_name, format!("invalid method '{method}'")))?;

    let mut request = client.request(method, parsed);
    for (key, value) in headers {
        request = request.header(key.as_str(), value_to_string(value));
    }
    if let Some(body) = body {
        request = request.body(body);
    }

    let response = request
        .send()
        .await
        .map_err(|e| EngineError::node(node_name, format!("request failed: {e}")))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| EngineError::node(node_name, format!("failed to read body: {e}")))?;
    let text = truncate_body(text);

    debug!(node = node_name, status = status.as_u16(), bytes = text.len(), "http response");

    if !status.is_success() {
        return Err(EngineError::node(
            node_name,
            format!("HTTP {}: {}", status.as_u16(), text.chars().take(200).collect::<String>()),
        ));
    }

    let data = serde_json::from_str::<Value>(&text).ok();
    Ok(ExecOutcome {
        output: text,
        data,
        ui_event: None,
    })
}

/// Universal HTTP client node.
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(DEFAULT_TIMEOUT)
                .build()
                .expect("http client"),
        }
    }
}

#[async_trait]
impl NodeExecutor for HttpExecutor {
    async fn execute(
        &self,
        inputs: &Map<String, Value>,
        ctx: ExecContext<'_>,
    ) -> Result<ExecOutcome> {
        let config = &ctx.node.provider_config;
        let board = ctx.services.blackboard.snapshot();

        let url_template = inputs
            .get("url")
            .or_else(|| config.get("url"))
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::node(&ctx.node.name, "no url configured"))?;
        let url = interpolate(url_template, inputs, &board);

        let method = inputs
            .get("method")
            .or_else(|| config.get("method"))
            .and_then(Value::as_str)
            .unwrap_or("GET");

        let headers = config
            .get("headers")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let body = inputs
            .get("body")
            .or_else(|| config.get("body"))
            .map(|b| interpolate(&value_to_string(b), inputs, &board));

        perform_request(&self.client, &ctx.node.name, method, &url, &headers, body).await
    }
}

/// Thin OpenAPI operation invoker: `base_url` + `path` with interpolated
/// path/query parameters.
pub struct OpenApiExecutor {
    client: reqwest::Client,
}

impl Default for OpenApiExecutor {
    fn default() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(DEFAULT_TIMEOUT)
                .build()
                .expect("http client"),
        }
    }
}

#[async_trait]
impl NodeExecutor for OpenApiExecutor {
    async fn execute(
        &self,
        inputs: &Map<String, Value>,
        ctx: ExecContext<'_>,
    ) -> Result<ExecOutcome> {
        let config = &ctx.node.provider_config;
        let board = ctx.services.blackboard.snapshot();

        let base_url = config
            .get("base_url")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::node(&ctx.node.name, "no base_url configured"))?;
        let path = config.get("path").and_then(Value::as_str).unwrap_or("/");
        let method = config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET");

        let mut url = format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            interpolate(path, inputs, &board).trim_start_matches('/')
        );

        if let Some(query) = config.get("query").and_then(Value::as_object) {
            let pairs: Vec<String> = query
                .iter()
                .map(|(k, v)| {
                    let value = interpolate(&value_to_string(v), inputs, &board);
                    format!("{k}={value}")
                })
                .collect();
            if !pairs.is_empty() {
                url = format!("{url}?{}", pairs.join("&"));
            }
        }

        let headers = config
            .get("headers")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let body = config
            .get("body")
            .map(|b| interpolate(&value_to_string(b), inputs, &board));

        perform_request(&self.client, &ctx.node.name, method, &url, &headers, body).await
    }
}
