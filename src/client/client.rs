//! Capability-aware, multitransport client.
//!
//! [`A2AClient`](super::A2AClient) talks JSON-RPC only and picks its own
//! transport. [`Client`] is the normative entry point: it wraps whichever
//! [`Transport`] a [`ClientFactory`] selected for a given agent card, applies
//! a [`ClientConfig`] policy to every outgoing `message/send`/`message/stream`
//! call, and runs an ordered chain of [`CallInterceptor`]s around every call.
//!
//! Python SDK ref: `Client` / `ClientFactory` in `client/client.py` and
//! `client/client_factory.py`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::{A2AError, A2AResult};
use crate::types::{
    AgentCard, CancelTaskParams, GetTaskParams, GetTaskPushNotificationConfigParams, JsonRpcId,
    JsonRpcRequest, JsonRpcResponse, ListTasksParams, ListTasksResponse, SendMessageConfiguration,
    SendMessageParams, SendMessageResponse, SetTaskPushNotificationConfigParams, Task,
    TaskIdParams, TaskPushNotificationConfig,
};

use super::rest_transport::RestTransport;
use super::sse::SseStream;
use super::transport::{JsonRpcTransport, Transport};

/// Policy applied to every call made through a [`Client`].
///
/// Python SDK ref: `ClientConfig` in `client/client_config.py`.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// If `true`, `message/send` is configured to return immediately rather
    /// than block on task completion (`configuration.blocking = false`).
    /// If `false` (the default), requests block until the task reaches a
    /// terminal state.
    pub polling: bool,

    /// Default accepted output MIME types, merged into a request's
    /// `configuration.accepted_output_modes` whenever the caller didn't set one.
    pub accepted_output_modes: Option<Vec<String>>,

    /// Default push notification config, merged in when the caller didn't
    /// set one.
    pub push_notification_config: Option<crate::types::PushNotificationConfig>,

    /// Transports this client prefers, in order, when a [`ClientFactory`]
    /// picks one for an agent card. Empty means "no preference" — fall back
    /// to the card's own `preferred_transport`/`additional_interfaces` order.
    pub supported_transports: Vec<String>,
}

impl ClientConfig {
    /// Apply the polling/default-modes/default-push-config policy to a
    /// `message/send` or `message/stream` params struct, filling in only
    /// what the caller left unset.
    fn apply_to_send_params(&self, mut params: SendMessageParams) -> SendMessageParams {
        let mut config = params.configuration.unwrap_or_default();

        if config.blocking.is_none() {
            config.blocking = Some(!self.polling);
        }
        if config.accepted_output_modes.is_none() {
            config.accepted_output_modes = self.accepted_output_modes.clone();
        }
        if config.push_notification_config.is_none() {
            config.push_notification_config = self.push_notification_config.clone();
        }

        params.configuration = Some(config);
        params
    }
}

/// Outcome of a [`CallInterceptor::before`] hook.
pub enum InterceptorDecision {
    /// Continue the call with (possibly modified) params.
    Continue(Value),
    /// Skip the transport call entirely and treat this value as the result.
    EarlyReturn(Value),
}

/// A hook that runs before and after every call made through a [`Client`].
///
/// Interceptors are applied in registration order on the way in
/// (`before`), and in reverse registration order on the way out (`after`) —
/// the same nesting discipline as a middleware stack. If a `before` hook
/// short-circuits with [`InterceptorDecision::EarlyReturn`], every `after`
/// hook for interceptors that already ran its `before` still fires, in
/// reverse order, so cleanup registered by an outer interceptor always sees
/// the call complete even when an inner one never reached the transport.
///
/// Python SDK ref: `ClientCallInterceptor` in `client/middleware.py`.
#[async_trait]
pub trait CallInterceptor: Send + Sync {
    /// Inspect or rewrite the call's params before it is sent. The default
    /// implementation passes params through unchanged.
    async fn before(&self, _method: &str, params: Value) -> A2AResult<InterceptorDecision> {
        Ok(InterceptorDecision::Continue(params))
    }

    /// Inspect or rewrite the call's result (or error) after it completes.
    /// The default implementation passes the result through unchanged.
    async fn after(&self, _method: &str, result: A2AResult<Value>) -> A2AResult<Value> {
        result
    }
}

/// The normative, capability-aware A2A client.
///
/// Wraps a single [`Transport`] (JSON-RPC, REST, or any other binding),
/// applies a [`ClientConfig`] to outgoing send/stream calls, and runs a
/// configured chain of [`CallInterceptor`]s around every method call.
///
/// Use [`ClientFactory`] to build one of these for a resolved [`AgentCard`],
/// or construct directly with [`Client::new`] when you already have a
/// transport.
pub struct Client {
    transport: Box<dyn Transport>,
    config: ClientConfig,
    interceptors: Vec<Arc<dyn CallInterceptor>>,
    agent_card: Option<AgentCard>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("interceptor_count", &self.interceptors.len())
            .field("agent_card", &self.agent_card)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Build a client around an already-constructed transport.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            config: ClientConfig::default(),
            interceptors: Vec::new(),
            agent_card: None,
        }
    }

    /// Attach an agent card (for callers who want `get_card()` to work and
    /// for [`ClientFactory`] bookkeeping).
    pub fn with_agent_card(mut self, card: AgentCard) -> Self {
        self.agent_card = Some(card);
        self
    }

    /// Set the [`ClientConfig`] policy (builder-style).
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Append a [`CallInterceptor`] to the chain (builder-style). Order of
    /// registration is the `before` order; `after` unwinds in reverse.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn CallInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// The agent card this client was built for, if any.
    pub fn agent_card(&self) -> Option<&AgentCard> {
        self.agent_card.as_ref()
    }

    // ──────────────────────────────────────────────────
    // Core A2A methods
    // ──────────────────────────────────────────────────

    /// Send a message (`message/send`), applying the configured policy and
    /// interceptor chain.
    pub async fn send_message(&self, params: SendMessageParams) -> A2AResult<SendMessageResponse> {
        let params = self.config.apply_to_send_params(params);
        let value = self.dispatch("message/send", params).await?;
        from_value(value)
    }

    /// Send a message with streaming (`message/stream`). Interceptors run
    /// once around the initial call that opens the stream; they do not
    /// re-run per event, since the per-event payload never leaves the
    /// transport layer as a standalone params/result pair.
    pub async fn send_message_stream(&self, params: SendMessageParams) -> A2AResult<SseStream> {
        let params = self.config.apply_to_send_params(params);
        self.dispatch_stream("message/stream", params).await
    }

    /// Get the current state of a task (`tasks/get`).
    pub async fn get_task(&self, params: GetTaskParams) -> A2AResult<Task> {
        let value = self.dispatch("tasks/get", params).await?;
        from_value(value)
    }

    /// List tasks with optional filtering (`tasks/list`).
    pub async fn list_tasks(&self, params: ListTasksParams) -> A2AResult<ListTasksResponse> {
        let value = self.dispatch("tasks/list", params).await?;
        from_value(value)
    }

    /// Cancel a running task (`tasks/cancel`).
    pub async fn cancel_task(&self, params: CancelTaskParams) -> A2AResult<Task> {
        let value = self.dispatch("tasks/cancel", params).await?;
        from_value(value)
    }

    /// Resubscribe to a task's event stream (`tasks/resubscribe`).
    pub async fn resubscribe(&self, params: TaskIdParams) -> A2AResult<SseStream> {
        self.dispatch_stream("tasks/resubscribe", params).await
    }

    /// Set push notification configuration for a task.
    pub async fn set_task_callback(
        &self,
        params: SetTaskPushNotificationConfigParams,
    ) -> A2AResult<TaskPushNotificationConfig> {
        let value = self
            .dispatch("tasks/pushNotificationConfig/set", params)
            .await?;
        from_value(value)
    }

    /// Get push notification configuration for a task.
    pub async fn get_task_callback(
        &self,
        params: GetTaskPushNotificationConfigParams,
    ) -> A2AResult<TaskPushNotificationConfig> {
        let value = self
            .dispatch("tasks/pushNotificationConfig/get", params)
            .await?;
        from_value(value)
    }

    /// Close the underlying transport.
    pub async fn close(self) -> A2AResult<()> {
        self.transport.close().await
    }

    // ──────────────────────────────────────────────────
    // Dispatch — runs interceptors around a single call.
    // ──────────────────────────────────────────────────

    async fn dispatch(&self, method: &str, params: impl Serialize) -> A2AResult<Value> {
        let params_value = serde_json::to_value(params)
            .map_err(|e| A2AError::Transport(format!("failed to serialize params: {e}")))?;

        let (ran, outcome) = self.run_before_chain(method, params_value).await;

        let result = match outcome {
            BeforeOutcome::EarlyReturn(value) => Ok(value),
            BeforeOutcome::Continue(value) => {
                let request = build_request(method, value);
                match self.transport.send(&request).await {
                    Ok(response) => parse_jsonrpc_result(response),
                    Err(e) => Err(e),
                }
            }
        };

        self.run_after_chain(method, ran, result).await
    }

    async fn dispatch_stream(
        &self,
        method: &str,
        params: impl Serialize,
    ) -> A2AResult<SseStream> {
        let params_value = serde_json::to_value(params)
            .map_err(|e| A2AError::Transport(format!("failed to serialize params: {e}")))?;

        let (ran, outcome) = self.run_before_chain(method, params_value).await;

        match outcome {
            BeforeOutcome::EarlyReturn(_) => Err(A2AError::Transport(format!(
                "interceptor short-circuited a streaming call to '{method}', which has no \
                 early-return result type"
            ))),
            BeforeOutcome::Continue(value) => {
                let request = build_request(method, value);
                let opened = self.transport.send_stream(&request).await;
                match opened {
                    Ok(stream) => {
                        // `after` hooks see `Ok(Value::Null)` marking the open
                        // succeeded — per-event mutation isn't expressible
                        // through a params/result interceptor, only whether
                        // the call as a whole is allowed to proceed.
                        self.run_after_chain(method, ran, Ok(Value::Null)).await?;
                        Ok(stream)
                    }
                    Err(e) => match self.run_after_chain(method, ran, Err(e)).await {
                        Err(e) => Err(e),
                        // An `after` hook recovered the error into a value —
                        // there's no stream to hand back for that, since the
                        // transport never produced one.
                        Ok(_) => Err(A2AError::Transport(
                            "an interceptor recovered a failed stream open into a value, but \
                             streaming calls have no value result to return"
                                .to_string(),
                        )),
                    },
                }
            }
        }
    }

    async fn run_before_chain(&self, method: &str, params: Value) -> (usize, BeforeOutcome) {
        let mut current = params;
        for (i, interceptor) in self.interceptors.iter().enumerate() {
            match interceptor.before(method, current).await {
                Ok(InterceptorDecision::Continue(p)) => current = p,
                Ok(InterceptorDecision::EarlyReturn(v)) => {
                    return (i + 1, BeforeOutcome::EarlyReturn(v));
                }
                Err(e) => {
                    return (
                        i + 1,
                        BeforeOutcome::EarlyReturn(Value::String(e.to_string())),
                    );
                }
            }
        }
        (self.interceptors.len(), BeforeOutcome::Continue(current))
    }

    async fn run_after_chain(
        &self,
        method: &str,
        ran: usize,
        mut result: A2AResult<Value>,
    ) -> A2AResult<Value> {
        for interceptor in self.interceptors[..ran].iter().rev() {
            result = interceptor.after(method, result).await;
        }
        result
    }
}

enum BeforeOutcome {
    Continue(Value),
    EarlyReturn(Value),
}

fn build_request(method: &str, params: Value) -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: "2.0".to_string(),
        id: Some(JsonRpcId::String(uuid::Uuid::new_v4().to_string())),
        method: method.to_string(),
        params: Some(params),
    }
}

fn parse_jsonrpc_result(response: JsonRpcResponse) -> A2AResult<Value> {
    if let Some(error) = response.error {
        return Err(A2AError::JsonRpc {
            code: error.code,
            message: error.message,
            data: error.data,
        });
    }
    response.result.ok_or_else(|| {
        A2AError::InvalidJson("JSON-RPC response has neither 'result' nor 'error'".to_string())
    })
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> A2AResult<T> {
    serde_json::from_value(value)
        .map_err(|e| A2AError::InvalidJson(format!("failed to deserialize response: {e}")))
}

/// Selects and builds a [`Client`] for a resolved [`AgentCard`].
///
/// Transport selection order (first match wins):
/// 1. The caller's preferred transports, in the order given to
///    [`ClientFactory::new`].
/// 2. The card's own `preferred_transport`.
/// 3. The card's `additional_interfaces`, in listed order.
///
/// Transport names are matched case-insensitively against the names
/// registered via [`ClientFactory::register`]. If no registered transport
/// matches anything the card offers, [`ClientFactory::create`] returns
/// [`A2AError::Transport`].
///
/// Python SDK ref: `ClientFactory` in `client/client_factory.py`.
pub struct ClientFactory {
    /// Transport names this factory was asked to prefer, in preference order.
    preferred: Vec<String>,
    /// Registered transport constructors, keyed by lowercased transport name.
    builders: Vec<(String, Arc<dyn Fn(&str) -> Box<dyn Transport> + Send + Sync>)>,
    config: ClientConfig,
}

impl std::fmt::Debug for ClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientFactory")
            .field("preferred", &self.preferred)
            .field(
                "registered_transports",
                &self.builders.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ClientFactory {
    /// Create a factory with a user-preferred transport order. Pass an
    /// empty slice to defer entirely to the card's own preferences.
    pub fn new(preferred_transports: &[&str]) -> Self {
        let mut factory = Self {
            preferred: preferred_transports
                .iter()
                .map(|s| s.to_string())
                .collect(),
            builders: Vec::new(),
            config: ClientConfig::default(),
        };
        factory.register("JSONRPC", |url| Box::new(JsonRpcTransport::new(url)));
        factory.register("HTTP+JSON", |url| Box::new(RestTransport::new(url)));
        factory
    }

    /// Set the [`ClientConfig`] every built [`Client`] receives.
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Register (or replace) the transport constructor for a given
    /// transport name (e.g. `"JSONRPC"`, `"HTTP+JSON"`). Matching is
    /// case-insensitive.
    pub fn register(
        &mut self,
        transport_name: &str,
        builder: impl Fn(&str) -> Box<dyn Transport> + Send + Sync + 'static,
    ) -> &mut Self {
        let key = transport_name.to_ascii_lowercase();
        self.builders.retain(|(name, _)| name != &key);
        self.builders.push((key, Arc::new(builder)));
        self
    }

    /// Build a [`Client`] for the given resolved agent card.
    pub fn create(&self, card: AgentCard) -> A2AResult<Client> {
        let (transport_name, url) = self.select_transport(&card)?;
        let builder = self
            .builders
            .iter()
            .find(|(name, _)| name == &transport_name)
            .map(|(_, b)| b.clone())
            .expect("select_transport only returns names we have a builder for");

        let transport = builder(&url);
        Ok(Client::new(transport)
            .with_config(self.config.clone())
            .with_agent_card(card))
    }

    /// Work out which (transport name, url) pair to use for `card`, per the
    /// selection order documented on [`ClientFactory`].
    fn select_transport(&self, card: &AgentCard) -> A2AResult<(String, String)> {
        let offered = self.offered_interfaces(card);

        for wanted in &self.preferred {
            let key = wanted.to_ascii_lowercase();
            if let Some((_, url)) = offered.iter().find(|(name, _)| name == &key) {
                if self.has_builder(&key) {
                    return Ok((key, url.clone()));
                }
            }
        }

        if let Some(preferred) = &card.preferred_transport {
            let key = preferred.to_ascii_lowercase();
            if self.has_builder(&key) {
                if let Some((_, url)) = offered.iter().find(|(name, _)| name == &key) {
                    return Ok((key, url.clone()));
                }
            }
        }

        for (name, url) in &offered {
            if self.has_builder(name) {
                return Ok((name.clone(), url.clone()));
            }
        }

        Err(A2AError::Transport(format!(
            "no registered transport matches any interface offered by agent card '{}' \
             (offered: {:?}, registered: {:?})",
            card.name,
            offered.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            self.builders.iter().map(|(n, _)| n).collect::<Vec<_>>(),
        )))
    }

    /// All (lowercased transport name, url) pairs the card offers: its
    /// primary url/preferred_transport pair plus every `additional_interfaces`
    /// entry, deduplicated by name (first occurrence wins).
    fn offered_interfaces(&self, card: &AgentCard) -> Vec<(String, String)> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();

        if let Some(primary) = &card.preferred_transport {
            let key = primary.to_ascii_lowercase();
            if seen.insert(key.clone()) {
                out.push((key, card.url.clone()));
            }
        }

        for iface in card.additional_interfaces.iter().flatten() {
            let key = iface.transport.to_ascii_lowercase();
            if seen.insert(key.clone()) {
                out.push((key, iface.url.clone()));
            }
        }

        for iface in &card.supported_interfaces {
            let key = iface.transport.to_ascii_lowercase();
            if seen.insert(key.clone()) {
                out.push((key, iface.url.clone()));
            }
        }

        out
    }

    fn has_builder(&self, key: &str) -> bool {
        self.builders.iter().any(|(name, _)| name == key)
    }
}

impl Default for ClientFactory {
    fn default() -> Self {
        Self::new(&[])
    }
}
