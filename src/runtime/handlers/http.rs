/// HTTP request node
///
/// Params: `url` (required), `method` (default GET), `headers` (object of
/// strings), `body` (JSON). Without a `body` param, POST/PUT/PATCH send the
/// first upstream output. The response body is parsed as JSON when possible,
/// otherwise kept as text.

use crate::runtime::handler::{EnhancedHandler, NodeContext, NodeOutcome};
use crate::workflow::types::Node;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct HttpHandler;

#[async_trait]
impl EnhancedHandler for HttpHandler {
    async fn execute(&self, node: &Node, context: &NodeContext) -> Result<NodeOutcome> {
        let params = context.params();
        let url = params.required_str("url")?;
        let method = params.str("method").unwrap_or("GET").to_uppercase();

        let client = &context.helpers().http;
        let mut request = match method.as_str() {
            "GET" => client.get(url),
            "POST" => client.post(url),
            "PUT" => client.put(url),
            "DELETE" => client.delete(url),
            "PATCH" => client.patch(url),
            _ => return Err(anyhow::anyhow!("Unsupported HTTP method: {}", method)),
        };

        if let Some(headers) = params.get("headers").and_then(Value::as_object) {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(key.as_str(), value);
                }
            }
        }

        let body = params
            .get("body")
            .or_else(|| context.first_input())
            .filter(|_| matches!(method.as_str(), "POST" | "PUT" | "PATCH"));
        match body {
            Some(Value::String(text)) => {
                request = request.header("Content-Type", "text/plain").body(text.clone());
            }
            Some(data) => request = request.json(data),
            None => {}
        }

        context
            .logger()
            .debug(&format!("🌍 HTTP Request from {}: {} {}", node.id, method, url));

        let response = tokio::select! {
            response = request.send() => response.map_err(|e| anyhow::anyhow!("HTTP request failed: {}", e))?,
            _ = context.cancellation().cancelled() => {
                return Err(anyhow::anyhow!("HTTP request to {} cancelled", url));
            }
        };

        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read response body: {}", e))?;
        let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        if !status.is_success() && !params.bool("allowFailure") {
            return Err(anyhow::anyhow!(
                "{} {} returned {}: {}",
                method,
                url,
                status.as_u16(),
                data
            ));
        }

        context.logger().info(&format!(
            "✅ HTTP request completed: {} {} (status: {})",
            method, url, status
        ));

        Ok(NodeOutcome::Completed(json!({
            "status": status.as_u16(),
            "headers": headers,
            "data": data,
            "success": status.is_success(),
        })))
    }
}
