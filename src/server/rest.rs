//! REST transport — HTTP+JSON mapping of the A2A protocol, `/v1/...` route table.
//!
//! Grounded on `axum_integration.rs`'s router/handler shape, generalized from
//! one JSON-RPC POST endpoint to a full REST route table. The two transports
//! share the same [`super::request_handler::RequestHandler`] — this module is
//! a thin adapter, not a second copy of the engine.
//!
//! Inputs may use either camelCase or snake_case field names (e.g. `message_id`
//! or `messageId`); [`normalize_to_camel_case`] rewrites every object key to
//! camelCase once, at the boundary, before anything is deserialized into the
//! engine's camelCase-only types. Output is always camelCase. SSE events are
//! emitted bare (no JSON-RPC envelope), per `data: <json>\n\n`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::error;

use crate::error::{self, A2AError};
use crate::types::{AgentCard, JsonRpcError, StreamResponse};

use super::agent_executor::UserBuilder;
use super::request_handler::{
    CancelTaskParams, GetTaskParams, RequestHandler, SendMessageConfiguration, SendMessageParams,
    SubscribeToTaskParams,
};

/// Shared state for the REST routes.
struct RestAppState {
    handler: Arc<dyn RequestHandler>,
    agent_card: AgentCard,
    user_builder: Option<Arc<dyn UserBuilder>>,
}

/// Build an axum `Router` implementing the `/v1/...` REST route table.
///
/// Mounts alongside (or instead of) [`super::axum_integration::a2a_router`] —
/// both adapt the same `RequestHandler`.
pub fn rest_router(handler: Arc<dyn RequestHandler>, agent_card: AgentCard) -> Router {
    rest_router_with_user_builder(handler, agent_card, None)
}

/// Same as [`rest_router`], resolving caller identity per request through
/// `user_builder` (see [`super::axum_integration::a2a_router_with_user_builder`]).
pub fn rest_router_with_user_builder(
    handler: Arc<dyn RequestHandler>,
    agent_card: AgentCard,
    user_builder: Option<Arc<dyn UserBuilder>>,
) -> Router {
    let state = Arc::new(RestAppState {
        handler,
        agent_card,
        user_builder,
    });

    Router::new()
        .route("/v1/card", get(handle_card))
        .route("/v1/message:send", post(handle_message_send))
        .route("/v1/message:stream", post(handle_message_stream))
        .route(
            "/v1/tasks/{id}",
            get(handle_get_task).post(handle_task_action),
        )
        .route(
            "/v1/tasks/{task_id}/pushNotificationConfigs",
            get(handle_list_push_config).post(handle_create_push_config),
        )
        .route(
            "/v1/tasks/{task_id}/pushNotificationConfigs/{config_id}",
            get(handle_get_push_config).delete(handle_delete_push_config),
        )
        .with_state(state)
}

// ---------------------------------------------------------------------------
// snake_case -> camelCase normalization
// ---------------------------------------------------------------------------

/// Rewrites every object key in `value` from snake_case to camelCase,
/// recursively. Keys already in camelCase are left unchanged (idempotent).
fn normalize_to_camel_case(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(snake_to_camel(&k), normalize_to_camel_case(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_to_camel_case).collect()),
        other => other,
    }
}

fn snake_to_camel(key: &str) -> String {
    if !key.contains('_') {
        return key.to_string();
    }
    let mut out = String::with_capacity(key.len());
    let mut upcase_next = false;
    for ch in key.chars() {
        if ch == '_' {
            upcase_next = true;
            continue;
        }
        if upcase_next {
            out.extend(ch.to_uppercase());
            upcase_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Error mapping — A2A error code -> HTTP status
// ---------------------------------------------------------------------------

/// Maps a fixed A2A error code to its REST HTTP status, per the error table.
fn status_for_code(code: i64) -> StatusCode {
    match code {
        error::PARSE_ERROR => StatusCode::BAD_REQUEST,
        error::INVALID_REQUEST => StatusCode::BAD_REQUEST,
        error::INVALID_PARAMS => StatusCode::BAD_REQUEST,
        error::METHOD_NOT_FOUND => StatusCode::NOT_FOUND,
        error::TASK_NOT_FOUND => StatusCode::NOT_FOUND,
        error::TASK_NOT_CANCELABLE => StatusCode::CONFLICT,
        error::PUSH_NOTIFICATION_NOT_SUPPORTED => StatusCode::BAD_REQUEST,
        error::UNSUPPORTED_OPERATION => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: A2AError) -> Response {
    let rpc_err: JsonRpcError = err.into();
    let status = status_for_code(rpc_err.code);
    (status, Json(rpc_err)).into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    error_response(A2AError::invalid_params(message))
}

// ---------------------------------------------------------------------------
// GET /v1/card
// ---------------------------------------------------------------------------

async fn handle_card(
    State(state): State<Arc<RestAppState>>,
    headers: HeaderMap,
) -> Response {
    if !state
        .agent_card
        .supports_authenticated_extended_card
        .unwrap_or(false)
    {
        return error_response(A2AError::unsupported_operation(
            "The agent does not support an authenticated extended card",
        ));
    }

    let ctx = build_call_context(&state, &headers).await;
    match state
        .handler
        .on_get_authenticated_extended_card(&state.agent_card, ctx)
        .await
    {
        Ok(card) => (StatusCode::OK, Json(card)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn build_call_context(
    state: &RestAppState,
    headers: &HeaderMap,
) -> Option<super::agent_executor::ServerCallContext> {
    let builder = state.user_builder.as_ref()?;
    let header_state: std::collections::HashMap<String, Value> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), Value::String(v.to_string())))
        })
        .collect();
    let user = builder.build(&header_state).await;
    Some(super::agent_executor::ServerCallContext {
        state: header_state,
        user,
        ..Default::default()
    })
}

// ---------------------------------------------------------------------------
// POST /v1/message:send, /v1/message:stream
// ---------------------------------------------------------------------------

fn parse_send_message_params(body: Value) -> Result<SendMessageParams, String> {
    let body = normalize_to_camel_case(body);
    let obj = body.as_object().ok_or("body must be an object")?;

    let message: crate::types::Message = serde_json::from_value(
        obj.get("message")
            .cloned()
            .ok_or("missing 'message' field")?,
    )
    .map_err(|e| format!("invalid message: {}", e))?;

    let configuration = obj
        .get("configuration")
        .and_then(|v| {
            if v.is_null() {
                None
            } else {
                Some(parse_send_config(v.clone()))
            }
        })
        .transpose()?;

    let metadata = obj
        .get("metadata")
        .and_then(|v| if v.is_null() { None } else { Some(v.clone()) });

    let tenant = obj.get("tenant").and_then(|v| v.as_str().map(String::from));

    Ok(SendMessageParams {
        message,
        configuration,
        metadata,
        tenant,
    })
}

fn parse_send_config(value: Value) -> Result<SendMessageConfiguration, String> {
    let obj = value.as_object().ok_or("configuration must be an object")?;

    Ok(SendMessageConfiguration {
        accepted_output_modes: obj.get("acceptedOutputModes").and_then(|v| {
            v.as_array().map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
        }),
        blocking: obj.get("blocking").and_then(|v| v.as_bool()),
        history_length: obj
            .get("historyLength")
            .and_then(|v| v.as_u64().map(|n| n as usize)),
        push_notification_config: obj.get("pushNotificationConfig").cloned(),
    })
}

async fn handle_message_send(State(state): State<Arc<RestAppState>>, body: Json<Value>) -> Response {
    let params = match parse_send_message_params(body.0) {
        Ok(p) => p,
        Err(e) => return bad_request(format!("Invalid body: {}", e)),
    };

    match state.handler.on_message_send(params).await {
        Ok(response) => (StatusCode::CREATED, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_message_stream(
    State(state): State<Arc<RestAppState>>,
    body: Json<Value>,
) -> Response {
    if !state.agent_card.capabilities.streaming.unwrap_or(false) {
        return error_response(A2AError::unsupported_operation(
            "Streaming is not supported by the agent",
        ));
    }

    let params = match parse_send_message_params(body.0) {
        Ok(p) => p,
        Err(e) => return bad_request(format!("Invalid body: {}", e)),
    };

    // Obtain the first event BEFORE flushing headers, so an early error
    // surfaces as a proper HTTP status instead of a 200 + SSE error event.
    match state.handler.on_message_send_stream(params).await {
        Ok(rx) => {
            let stream = make_bare_sse_stream(rx);
            Sse::new(stream)
                .keep_alive(KeepAlive::default())
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// /v1/tasks/{id}
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GetTaskQuery {
    #[serde(rename = "historyLength", alias = "history_length", default)]
    history_length: Option<usize>,
}

async fn handle_get_task(
    State(state): State<Arc<RestAppState>>,
    Path(id): Path<String>,
    Query(query): Query<GetTaskQuery>,
) -> Response {
    let params = GetTaskParams {
        id,
        history_length: query.history_length,
        metadata: None,
        tenant: None,
    };

    match state.handler.on_get_task(params).await {
        Ok(task) => (StatusCode::OK, Json(task)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Dispatches `POST /v1/tasks/{id}:cancel` and `POST /v1/tasks/{id}:subscribe`.
///
/// The literal colon lives inside the path's single dynamic segment (matchit
/// captures only whole segments), so both actions share one route and are
/// told apart by splitting the captured segment on its last `:`.
async fn handle_task_action(
    State(state): State<Arc<RestAppState>>,
    Path(id_and_action): Path<String>,
) -> Response {
    let Some((task_id, action)) = id_and_action.rsplit_once(':') else {
        return bad_request(format!(
            "expected '{{taskId}}:cancel' or '{{taskId}}:subscribe', got '{}'",
            id_and_action
        ));
    };

    match action {
        "cancel" => {
            let params = CancelTaskParams {
                id: task_id.to_string(),
                metadata: None,
                tenant: None,
            };
            match state.handler.on_cancel_task(params).await {
                Ok(task) => (StatusCode::ACCEPTED, Json(task)).into_response(),
                Err(e) => error_response(e),
            }
        }
        "subscribe" => {
            let params = SubscribeToTaskParams {
                id: task_id.to_string(),
                metadata: None,
                tenant: None,
            };
            match state.handler.on_resubscribe_to_task(params).await {
                Ok(rx) => {
                    let stream = make_bare_sse_stream(rx);
                    Sse::new(stream)
                        .keep_alive(KeepAlive::default())
                        .into_response()
                }
                Err(e) => error_response(e),
            }
        }
        other => bad_request(format!("unknown task action '{}'", other)),
    }
}

// ---------------------------------------------------------------------------
// /v1/tasks/{task_id}/pushNotificationConfigs[/{config_id}]
// ---------------------------------------------------------------------------

async fn handle_create_push_config(
    State(state): State<Arc<RestAppState>>,
    Path(task_id): Path<String>,
    body: Json<Value>,
) -> Response {
    if !state.agent_card.capabilities.push_notifications.unwrap_or(false) {
        return error_response(A2AError::push_notification_not_supported(
            "Push notifications are not supported by the agent",
        ));
    }

    let body = normalize_to_camel_case(body.0);
    let Some(obj) = body.as_object() else {
        return bad_request("body must be an object");
    };

    let config: crate::types::PushNotificationConfig = match obj
        .get("pushNotificationConfig")
        .or_else(|| obj.get("config"))
        .cloned()
    {
        Some(v) => match serde_json::from_value(v) {
            Ok(c) => c,
            Err(e) => return bad_request(format!("invalid pushNotificationConfig: {}", e)),
        },
        None => return bad_request("missing 'pushNotificationConfig' field"),
    };

    let config_id = obj
        .get("configId")
        .and_then(|v| v.as_str())
        .map(String::from)
        .or_else(|| config.id.clone())
        .unwrap_or_else(|| task_id.clone());

    let params = serde_json::json!({
        "taskId": task_id,
        "configId": config_id,
        "config": config,
    });

    match state
        .handler
        .on_set_task_push_notification_config(params)
        .await
    {
        Ok(value) => (StatusCode::CREATED, Json(value)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_list_push_config(
    State(state): State<Arc<RestAppState>>,
    Path(task_id): Path<String>,
) -> Response {
    if !state.agent_card.capabilities.push_notifications.unwrap_or(false) {
        return error_response(A2AError::push_notification_not_supported(
            "Push notifications are not supported by the agent",
        ));
    }

    let params = serde_json::json!({ "id": task_id });
    match state
        .handler
        .on_list_task_push_notification_config(params)
        .await
    {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_get_push_config(
    State(state): State<Arc<RestAppState>>,
    Path((task_id, config_id)): Path<(String, String)>,
) -> Response {
    if !state.agent_card.capabilities.push_notifications.unwrap_or(false) {
        return error_response(A2AError::push_notification_not_supported(
            "Push notifications are not supported by the agent",
        ));
    }

    let params = serde_json::json!({
        "id": task_id,
        "pushNotificationConfigId": config_id,
    });
    match state
        .handler
        .on_get_task_push_notification_config(params)
        .await
    {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_delete_push_config(
    State(state): State<Arc<RestAppState>>,
    Path((task_id, config_id)): Path<(String, String)>,
) -> Response {
    if !state.agent_card.capabilities.push_notifications.unwrap_or(false) {
        return error_response(A2AError::push_notification_not_supported(
            "Push notifications are not supported by the agent",
        ));
    }

    let params = serde_json::json!({
        "id": task_id,
        "pushNotificationConfigId": config_id,
    });
    match state
        .handler
        .on_delete_task_push_notification_config(params)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// SSE — bare events, no JSON-RPC envelope
// ---------------------------------------------------------------------------

fn make_bare_sse_stream(
    mut rx: mpsc::Receiver<StreamResponse>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let is_terminal = match &event {
                StreamResponse::StatusUpdate(update) => update.r#final,
                _ => false,
            };

            match serde_json::to_string(&event) {
                Ok(json) => yield Ok(Event::default().data(json)),
                Err(e) => error!(error = %e, "Failed to serialize bare SSE event"),
            }

            if is_terminal {
                return;
            }
        }
    }
}
