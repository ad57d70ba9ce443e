//! REST (`HTTP+JSON`) transport — client-side counterpart to
//! [`crate::server::rest`]'s `/v1/...` route table.
//!
//! Implements the same [`Transport`] trait as [`super::JsonRpcTransport`].
//! Every JSON-RPC method name is mapped to the REST verb and path the server
//! exposes for it; the raw JSON result is then wrapped back into a
//! [`JsonRpcResponse`] envelope so callers built against `Transport` (like
//! [`super::Client`]) don't need to know which wire format is underneath —
//! the same normalize-at-the-edge idea `rest.rs` applies to snake_case
//! input, applied here to the response shape instead of the field names.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::Value;

use crate::error::{A2AError, A2AResult};
use crate::types::{JsonRpcId, JsonRpcRequest, JsonRpcResponse};

use super::sse::SseStream;
use super::transport::{Transport, TransportConfig};

/// REST transport for the A2A `HTTP+JSON` binding.
///
/// # Example
///
/// ```no_run
/// use a2a_rs::client::RestTransport;
///
/// let transport = RestTransport::new("https://agent.example");
/// ```
#[derive(Debug, Clone)]
pub struct RestTransport {
    client: reqwest::Client,
    /// Base URL, e.g. `https://agent.example` — no trailing slash, no `/v1`.
    base_url: String,
}

impl RestTransport {
    /// Create a transport targeting the given agent base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_config(base_url, TransportConfig::default())
    }

    /// Create a transport with custom configuration.
    pub fn with_config(base_url: impl Into<String>, config: TransportConfig) -> Self {
        let mut default_headers = HeaderMap::new();
        for (key, value) in &config.headers {
            if let (Ok(name), Ok(val)) = (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                default_headers.insert(name, val);
            }
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(default_headers)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Create a transport with an existing `reqwest::Client`.
    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Translate a JSON-RPC method + params into the REST verb and URL the
    /// server routes it to (see `server::rest`'s route table), plus the
    /// request body to send, if any.
    fn build_call(&self, request: &JsonRpcRequest) -> A2AResult<(Method, String, Option<Value>)> {
        let params = request.params.clone().unwrap_or(Value::Null);
        let base = &self.base_url;

        match request.method.as_str() {
            "getAuthenticatedExtendedCard" => Ok((Method::GET, format!("{base}/v1/card"), None)),

            "message/send" => Ok((
                Method::POST,
                format!("{base}/v1/message:send"),
                Some(params),
            )),
            "message/stream" => Ok((
                Method::POST,
                format!("{base}/v1/message:stream"),
                Some(params),
            )),

            "tasks/get" => {
                let id = require_str(&params, "id")?;
                let mut url = format!("{base}/v1/tasks/{id}");
                if let Some(len) = params.get("historyLength").and_then(|v| v.as_i64()) {
                    url.push_str(&format!("?historyLength={len}"));
                }
                Ok((Method::GET, url, None))
            }
            "tasks/cancel" => {
                let id = require_str(&params, "id")?;
                Ok((Method::POST, format!("{base}/v1/tasks/{id}:cancel"), None))
            }
            "tasks/resubscribe" => {
                let id = require_str(&params, "id")?;
                Ok((
                    Method::POST,
                    format!("{base}/v1/tasks/{id}:subscribe"),
                    None,
                ))
            }

            "tasks/pushNotificationConfig/set" => {
                let task_id = require_str(&params, "taskId")?;
                Ok((
                    Method::POST,
                    format!("{base}/v1/tasks/{task_id}/pushNotificationConfigs"),
                    Some(params),
                ))
            }
            "tasks/pushNotificationConfig/get" => {
                let task_id = require_str(&params, "id")?;
                let config_id = require_str(&params, "pushNotificationConfigId")?;
                Ok((
                    Method::GET,
                    format!("{base}/v1/tasks/{task_id}/pushNotificationConfigs/{config_id}"),
                    None,
                ))
            }
            "tasks/pushNotificationConfig/list" => {
                let task_id = require_str(&params, "id")?;
                Ok((
                    Method::GET,
                    format!("{base}/v1/tasks/{task_id}/pushNotificationConfigs"),
                    None,
                ))
            }
            "tasks/pushNotificationConfig/delete" => {
                let task_id = require_str(&params, "id")?;
                let config_id = require_str(&params, "pushNotificationConfigId")?;
                Ok((
                    Method::DELETE,
                    format!("{base}/v1/tasks/{task_id}/pushNotificationConfigs/{config_id}"),
                    None,
                ))
            }

            other => Err(A2AError::Transport(format!(
                "REST transport has no route for method '{other}' — the REST binding only \
                 covers the methods in the fixed `/v1/...` route table"
            ))),
        }
    }
}

fn require_str(params: &Value, field: &str) -> A2AResult<String> {
    params
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            A2AError::Transport(format!(
                "missing or non-string '{field}' field in request params"
            ))
        })
}

/// Wrap a raw JSON result into a `JsonRpcResponse` envelope, so callers
/// written against `Transport` see a uniform shape regardless of binding.
fn wrap_result(id: Option<JsonRpcId>, value: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        id,
        result: Some(value),
        error: None,
    }
}

#[async_trait]
impl Transport for RestTransport {
    async fn send(&self, request: &JsonRpcRequest) -> A2AResult<JsonRpcResponse> {
        let (method, url, body) = self.build_call(request)?;

        let mut builder = self.client.request(method, &url);
        if let Some(body) = &body {
            builder = builder.header("Content-Type", "application/json").json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                A2AError::Timeout(format!("request timed out: {e}"))
            } else if e.is_connect() {
                A2AError::Transport(format!("connection failed: {e}"))
            } else {
                A2AError::Transport(format!("HTTP request failed: {e}"))
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(wrap_result(request.id.clone(), Value::Null));
        }
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            if let Ok(rpc_err) =
                serde_json::from_str::<crate::types::JsonRpcError>(&body_text)
            {
                return Ok(JsonRpcResponse {
                    jsonrpc: "2.0".to_string(),
                    id: request.id.clone(),
                    result: None,
                    error: Some(rpc_err),
                });
            }
            return Err(A2AError::Http {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| A2AError::Transport(format!("failed to read response body: {e}")))?;

        if bytes.is_empty() {
            return Ok(wrap_result(request.id.clone(), Value::Null));
        }

        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| A2AError::InvalidJson(format!("failed to parse REST response: {e}")))?;

        Ok(wrap_result(request.id.clone(), value))
    }

    async fn send_stream(&self, request: &JsonRpcRequest) -> A2AResult<SseStream> {
        let (method, url, body) = self.build_call(request)?;

        let mut builder = self
            .client
            .request(method, &url)
            .header("Accept", "text/event-stream");
        if let Some(body) = &body {
            builder = builder.header("Content-Type", "application/json").json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                A2AError::Timeout(format!("stream request timed out: {e}"))
            } else if e.is_connect() {
                A2AError::Transport(format!("stream connection failed: {e}"))
            } else {
                A2AError::Transport(format!("stream HTTP request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(A2AError::Http {
                status: status.as_u16(),
                body: body_text,
            });
        }

        Ok(SseStream::from_response(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(JsonRpcId::String("1".to_string())),
            method: method.to_string(),
            params: Some(params),
        }
    }

    #[test]
    fn maps_message_send_to_post_v1_message_send() {
        let transport = RestTransport::new("https://agent.example");
        let (method, url, body) =
            transport.build_call(&request("message/send", serde_json::json!({"message": {}}))).unwrap();
        assert_eq!(method, Method::POST);
        assert_eq!(url, "https://agent.example/v1/message:send");
        assert!(body.is_some());
    }

    #[test]
    fn maps_tasks_get_to_get_with_history_length_query() {
        let transport = RestTransport::new("https://agent.example");
        let (method, url, _) = transport
            .build_call(&request(
                "tasks/get",
                serde_json::json!({"id": "t1", "historyLength": 5}),
            ))
            .unwrap();
        assert_eq!(method, Method::GET);
        assert_eq!(url, "https://agent.example/v1/tasks/t1?historyLength=5");
    }

    #[test]
    fn maps_tasks_cancel_to_post_with_colon_action() {
        let transport = RestTransport::new("https://agent.example");
        let (method, url, body) = transport
            .build_call(&request("tasks/cancel", serde_json::json!({"id": "t1"})))
            .unwrap();
        assert_eq!(method, Method::POST);
        assert_eq!(url, "https://agent.example/v1/tasks/t1:cancel");
        assert!(body.is_none());
    }

    #[test]
    fn maps_push_notification_config_delete() {
        let transport = RestTransport::new("https://agent.example");
        let (method, url, _) = transport
            .build_call(&request(
                "tasks/pushNotificationConfig/delete",
                serde_json::json!({"id": "t1", "pushNotificationConfigId": "c1"}),
            ))
            .unwrap();
        assert_eq!(method, Method::DELETE);
        assert_eq!(
            url,
            "https://agent.example/v1/tasks/t1/pushNotificationConfigs/c1"
        );
    }

    #[test]
    fn unmapped_method_errors() {
        let transport = RestTransport::new("https://agent.example");
        assert!(transport
            .build_call(&request("tasks/list", Value::Null))
            .is_err());
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let transport = RestTransport::new("https://agent.example/");
        let (_, url, _) = transport
            .build_call(&request("tasks/cancel", serde_json::json!({"id": "t1"})))
            .unwrap();
        assert_eq!(url, "https://agent.example/v1/tasks/t1:cancel");
    }
}
