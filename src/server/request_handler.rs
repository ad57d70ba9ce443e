//! Request handler — coordinates agent execution, task storage, and event delivery.
//!
//! Mirrors Python SDK's `RequestHandler(ABC)` and `DefaultRequestHandler` from
//! `a2a.server.request_handlers`.
//!
//! The [`RequestHandler`] trait defines the interface that the axum integration
//! layer calls for each JSON-RPC method. [`DefaultRequestHandler`] provides
//! the standard implementation that wires together an [`AgentExecutor`],
//! [`TaskStore`], and [`EventQueue`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{A2AError, A2AResult};
use crate::types::{
    AgentCard, CreateTaskPushNotificationConfigParams, DeleteTaskPushNotificationConfigParams,
    GetTaskPushNotificationConfigParams, ListTaskPushNotificationConfigParams,
    ListTaskPushNotificationConfigResponse, Message, Part, SendMessageResponse, StreamResponse,
    Task, TaskPushNotificationConfig, TaskState, TaskStatus, TaskStatusUpdateEvent,
};

use super::agent_executor::{AgentExecutor, RequestContext, ServerCallContext};
use super::event_queue::EventQueue;
use super::push_notification::{PushNotificationConfigStore, PushNotificationSender};
use super::task_manager::append_artifact_to_task;
use super::task_store::{TaskListParams, TaskListResponse, TaskStore};

/// Parameters for `message/send` and `message/stream`.
#[derive(Debug, Clone)]
pub struct SendMessageParams {
    /// The message to send to the agent.
    pub message: Message,

    /// Optional configuration for the send operation.
    pub configuration: Option<SendMessageConfiguration>,

    /// Optional metadata attached to the request.
    pub metadata: Option<serde_json::Value>,

    /// Optional tenant identifier.
    pub tenant: Option<String>,
}

/// Configuration options for message sending.
#[derive(Debug, Clone)]
pub struct SendMessageConfiguration {
    /// Accepted output MIME types / modes.
    pub accepted_output_modes: Option<Vec<String>>,

    /// If `Some(false)`, the server returns as soon as the task's current
    /// state is known instead of waiting for completion. Defaults to
    /// blocking (`true`) when unset or explicitly `Some(true)`.
    pub blocking: Option<bool>,

    /// Maximum number of history messages to include in the response.
    pub history_length: Option<usize>,

    /// Push notification configuration.
    pub push_notification_config: Option<serde_json::Value>,
}

/// Parameters for `tasks/get`.
#[derive(Debug, Clone)]
pub struct GetTaskParams {
    /// The task ID to retrieve.
    pub id: String,

    /// Maximum number of history messages to include.
    pub history_length: Option<usize>,

    /// Optional metadata.
    pub metadata: Option<serde_json::Value>,

    /// Optional tenant identifier.
    pub tenant: Option<String>,
}

/// Parameters for `tasks/cancel`.
#[derive(Debug, Clone)]
pub struct CancelTaskParams {
    /// The task ID to cancel.
    pub id: String,

    /// Optional metadata.
    pub metadata: Option<serde_json::Value>,

    /// Optional tenant identifier.
    pub tenant: Option<String>,
}

/// Parameters for `tasks/subscribe`.
#[derive(Debug, Clone)]
pub struct SubscribeToTaskParams {
    /// The task ID to subscribe to.
    pub id: String,

    /// Optional metadata.
    pub metadata: Option<serde_json::Value>,

    /// Optional tenant identifier.
    pub tenant: Option<String>,
}

// Re-export from types.rs — uses proto oneof serialization pattern.
// SendMessageResponse is imported from crate::types above.

/// Trait for handling A2A JSON-RPC requests.
///
/// Each method corresponds to an A2A JSON-RPC method. The axum integration
/// layer dispatches incoming requests to these methods.
///
/// Mirrors Python SDK's `RequestHandler(ABC)` from
/// `a2a.server.request_handlers.request_handler`.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle `message/send` — execute agent logic and return the completed task or message.
    async fn on_message_send(&self, params: SendMessageParams) -> A2AResult<SendMessageResponse>;

    /// Handle `message/stream` — execute agent logic and return an event stream.
    async fn on_message_send_stream(
        &self,
        params: SendMessageParams,
    ) -> A2AResult<mpsc::Receiver<StreamResponse>>;

    /// Handle `tasks/get` — retrieve a task by ID.
    async fn on_get_task(&self, params: GetTaskParams) -> A2AResult<Task>;

    /// Handle `tasks/list` — list tasks matching filter criteria.
    async fn on_list_tasks(&self, params: TaskListParams) -> A2AResult<TaskListResponse>;

    /// Handle `tasks/cancel` — cancel a running task.
    async fn on_cancel_task(&self, params: CancelTaskParams) -> A2AResult<Task>;

    /// Handle `tasks/resubscribe` — re-subscribe to events for a running task.
    ///
    /// Allows a client to re-attach to a running streaming task's event stream.
    /// Default implementation returns `UnsupportedOperation`.
    async fn on_resubscribe_to_task(
        &self,
        params: SubscribeToTaskParams,
    ) -> A2AResult<mpsc::Receiver<StreamResponse>> {
        let _ = params;
        Err(A2AError::UnsupportedOperation {
            message: "tasks/resubscribe is not supported".to_string(),
            data: None,
        })
    }

    /// Handle `tasks/subscribe` — subscribe to events for an existing task.
    async fn on_subscribe_to_task(
        &self,
        params: SubscribeToTaskParams,
    ) -> A2AResult<mpsc::Receiver<StreamResponse>>;

    /// Handle `tasks/pushNotificationConfig/set`.
    ///
    /// Default implementation returns `UnsupportedOperation`.
    async fn on_set_task_push_notification_config(
        &self,
        _params: serde_json::Value,
    ) -> A2AResult<serde_json::Value> {
        Err(A2AError::UnsupportedOperation {
            message: "Push notification config is not supported".to_string(),
            data: None,
        })
    }

    /// Handle `tasks/pushNotificationConfig/get`.
    ///
    /// Default implementation returns `UnsupportedOperation`.
    async fn on_get_task_push_notification_config(
        &self,
        _params: serde_json::Value,
    ) -> A2AResult<serde_json::Value> {
        Err(A2AError::UnsupportedOperation {
            message: "Push notification config is not supported".to_string(),
            data: None,
        })
    }

    /// Handle `tasks/pushNotificationConfig/list`.
    ///
    /// Default implementation returns `UnsupportedOperation`.
    async fn on_list_task_push_notification_config(
        &self,
        _params: serde_json::Value,
    ) -> A2AResult<serde_json::Value> {
        Err(A2AError::UnsupportedOperation {
            message: "Push notification config is not supported".to_string(),
            data: None,
        })
    }

    /// Handle `tasks/pushNotificationConfig/delete`.
    ///
    /// Default implementation returns `UnsupportedOperation`.
    async fn on_delete_task_push_notification_config(
        &self,
        _params: serde_json::Value,
    ) -> A2AResult<()> {
        Err(A2AError::UnsupportedOperation {
            message: "Push notification config is not supported".to_string(),
            data: None,
        })
    }

    /// Handle `agent/getAuthenticatedExtendedCard`.
    ///
    /// `base_card` is the public agent card served at the well-known endpoint;
    /// a static provider falls back to it for unauthenticated callers.
    ///
    /// Default implementation returns `AuthenticatedExtendedCardNotConfigured`.
    async fn on_get_authenticated_extended_card(
        &self,
        base_card: &AgentCard,
        ctx: Option<ServerCallContext>,
    ) -> A2AResult<AgentCard> {
        let _ = (base_card, ctx);
        Err(A2AError::authenticated_extended_card_not_configured(
            "No authenticated extended card provider is configured",
        ))
    }
}

/// Supplies the extended agent card returned from `agent/getAuthenticatedExtendedCard`.
///
/// Mirrors Python SDK's two ways of configuring `AgentCard.supports_authenticated_extended_card`:
/// a fixed card to hand back to authenticated callers, or a callback that
/// computes one per request (e.g. to redact fields by caller identity).
pub enum ExtendedAgentCardProvider {
    /// Always return this card to authenticated callers; unauthenticated
    /// callers get the base public card instead.
    Static(AgentCard),
    /// Compute the extended card per request.
    Callback(Arc<dyn ExtendedAgentCardCallback>),
}

/// Callback variant of [`ExtendedAgentCardProvider`].
#[async_trait]
pub trait ExtendedAgentCardCallback: Send + Sync {
    /// Compute the extended agent card for this request's caller.
    async fn get_extended_card(&self, ctx: Option<ServerCallContext>) -> A2AResult<AgentCard>;
}

/// Tracks a running agent execution.
struct RunningAgent {
    /// Handle to the spawned tokio task running the agent.
    handle: JoinHandle<()>,
    /// The event queue for this execution.
    event_queue: EventQueue,
}

/// Default request handler — standard implementation wiring executor, store, and events.
///
/// This is the primary implementation of [`RequestHandler`] that coordinates:
/// - An [`AgentExecutor`] for running agent logic
/// - A [`TaskStore`] for persisting task state
/// - An [`EventQueue`] per task for streaming events
///
/// # Lifecycle
///
/// 1. `on_message_send` or `on_message_send_stream` creates a new task (or looks up
///    an existing one by context ID), persists it, and spawns the agent executor.
/// 2. The executor publishes events to the task's `EventQueue`.
/// 3. For `message/send`: events are consumed until a terminal state, then the
///    final task is returned.
/// 4. For `message/stream`: the event receiver is returned directly for SSE delivery.
/// 5. `on_cancel_task` calls the executor's cancel method and waits for the
///    cancellation event.
pub struct DefaultRequestHandler {
    executor: Arc<dyn AgentExecutor>,
    task_store: Arc<dyn TaskStore>,
    /// Per-task event queues and running agent handles.
    running_agents: Mutex<HashMap<String, RunningAgent>>,
    push_notification_store: Option<Arc<dyn PushNotificationConfigStore>>,
    push_notification_sender: Option<Arc<dyn PushNotificationSender>>,
    extended_card_provider: Option<ExtendedAgentCardProvider>,
}

impl DefaultRequestHandler {
    /// Create a new default request handler.
    pub fn new(executor: Arc<dyn AgentExecutor>, task_store: Arc<dyn TaskStore>) -> Self {
        Self {
            executor,
            task_store,
            running_agents: Mutex::new(HashMap::new()),
            push_notification_store: None,
            push_notification_sender: None,
            extended_card_provider: None,
        }
    }

    /// Configure the `agent/getAuthenticatedExtendedCard` provider. Without
    /// this, the method reports `AuthenticatedExtendedCardNotConfigured`.
    pub fn with_extended_agent_card_provider(mut self, provider: ExtendedAgentCardProvider) -> Self {
        self.extended_card_provider = Some(provider);
        self
    }

    /// Enable push notification delivery, backed by the given config store
    /// and sender. Without this, the `pushNotificationConfig/*` methods
    /// report `UnsupportedOperation` and no webhook is ever called.
    pub fn with_push_notifications(
        mut self,
        store: Arc<dyn PushNotificationConfigStore>,
        sender: Arc<dyn PushNotificationSender>,
    ) -> Self {
        self.push_notification_store = Some(store);
        self.push_notification_sender = Some(sender);
        self
    }

    /// Create or retrieve a task for the given message.
    ///
    /// Mirrors Python SDK's `_setup_message_execution` task resolution logic:
    /// 1. If `task_id` is set, look up the existing task and validate state.
    /// 2. If the task exists but is terminal, return `InvalidParams`.
    /// 3. If `task_id` is set but doesn't exist, return `TaskNotFound`.
    /// 4. Otherwise build a new task in `submitted` state.
    ///
    /// The returned `bool` is whether the task has already been written to
    /// the store. A followup against an existing task is always persisted
    /// immediately (there's nothing to undo). A brand new task is returned
    /// unsaved: `on_message_send` only commits it once the executor's event
    /// stream proves there's an actual Task result to persist, so a lone
    /// `Message` response can leave the store untouched (§4.2).
    async fn get_or_create_task(&self, params: &SendMessageParams) -> A2AResult<(Task, bool)> {
        // Check if the message references an existing task.
        if let Some(ref task_id) = params.message.task_id {
            if let Some(task) = self.task_store.get(task_id).await? {
                // Verify it's not in a terminal state.
                if Self::is_terminal(&task.status.state) {
                    return Err(A2AError::invalid_request(format!(
                        "Task {} is in terminal state: {}",
                        task_id, task.status.state
                    )));
                }
                // Add the new message to history (mirrors Python's update_with_message).
                // Python SDK moves status.message to history first, then clears it.
                let mut updated_task = task;
                if let Some(ref status_msg) = updated_task.status.message {
                    let history = updated_task.history.get_or_insert_with(Vec::new);
                    history.push(status_msg.clone());
                    updated_task.status.message = None;
                }
                let history = updated_task.history.get_or_insert_with(Vec::new);
                history.push(params.message.clone());
                self.task_store.save(updated_task.clone()).await?;
                return Ok((updated_task, true));
            } else {
                // task_id was specified but doesn't exist (mirrors Python SDK).
                return Err(A2AError::TaskNotFound {
                    message: format!("Task {} was specified but does not exist", task_id),
                    data: None,
                });
            }
        }

        // Build a new task, but don't persist it yet — see doc comment above.
        let task_id = Uuid::new_v4().to_string();
        let context_id = params
            .message
            .context_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let task = Task {
            id: task_id,
            context_id,
            kind: "task".to_string(),
            status: TaskStatus {
                state: TaskState::Submitted,
                message: None,
                timestamp: Some(chrono::Utc::now().to_rfc3339()),
            },
            artifacts: None,
            history: Some(vec![params.message.clone()]),
            metadata: params.metadata.clone(),
        };

        debug!(task_id = %task.id, "Built new task, not yet persisted");

        Ok((task, false))
    }

    /// Spawn the agent executor for a task.
    ///
    /// Returns the event queue for subscribing to events.
    ///
    /// Mirrors Python SDK's `_run_event_stream` — executes the agent and closes
    /// the queue afterwards. Does NOT auto-publish a `Working` status; that is
    /// the responsibility of the `AgentExecutor` implementation (matching the
    /// Python SDK where `_run_event_stream` just calls `execute` + `close`).
    async fn spawn_executor(
        &self,
        task: &Task,
        message: &Message,
        configuration: Option<&SendMessageConfiguration>,
    ) -> A2AResult<EventQueue> {
        let event_queue = EventQueue::with_default_capacity();

        // Convert the request_handler's SendMessageConfiguration to the
        // types.rs SendMessageConfiguration used by RequestContext.
        let types_config = configuration.map(|c| crate::types::SendMessageConfiguration {
            accepted_output_modes: c.accepted_output_modes.clone(),
            push_notification_config: c
                .push_notification_config
                .as_ref()
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
            history_length: c.history_length.map(|h| h as i32),
            blocking: c.blocking,
        });

        let context = RequestContext {
            task_id: task.id.clone(),
            context_id: task.context_id.clone(),
            message: Some(message.clone()),
            task: Some(task.clone()),
            configuration: types_config,
            related_tasks: Vec::new(),
            metadata: task.metadata.clone(),
            call_context: None,
        };

        let executor = Arc::clone(&self.executor);
        let queue_clone = event_queue.clone();
        let task_id = task.id.clone();
        let context_id = task.context_id.clone();

        let handle = tokio::spawn(async move {
            // Execute the agent — state transitions (working, etc.) are the
            // agent's responsibility, matching the Python SDK pattern.
            if let Err(e) = executor.execute(context, queue_clone.clone()).await {
                error!(task_id = %task_id, error = %e, "Agent execution failed");

                // Publish a failed status (matches Python SDK behavior where
                // execution errors result in a failed task).
                let failed_event = StreamResponse::StatusUpdate(TaskStatusUpdateEvent {
                    task_id: task_id.clone(),
                    context_id: context_id.clone(),
                    kind: "status-update".to_string(),
                    status: TaskStatus {
                        state: TaskState::Failed,
                        message: Some(Message {
                            message_id: Uuid::new_v4().to_string(),
                            role: crate::types::Role::Agent,
                            kind: "message".to_string(),
                            parts: vec![Part::text(format!("Agent execution failed: {}", e))],
                            context_id: None,
                            task_id: Some(task_id.clone()),
                            metadata: None,
                            extensions: None,
                            reference_task_ids: None,
                        }),
                        timestamp: Some(chrono::Utc::now().to_rfc3339()),
                    },
                    r#final: true,
                    metadata: None,
                });
                let _ = queue_clone.publish(failed_event);
            }
            // Unlike a broadcast channel, this queue doesn't close itself when
            // the producer goes out of scope — its subscriber senders live
            // inside the queue, not with us. Close explicitly so consumers
            // waiting on `recv()` past the last event get `None` instead of
            // hanging (mirrors Python SDK's `_run_event_stream` calling
            // `queue.close()` after `execute()` returns).
            queue_clone.close().await;
        });

        // Track the running agent (mirrors Python's _register_producer).
        let mut running = self.running_agents.lock().await;
        running.insert(
            task.id.clone(),
            RunningAgent {
                handle,
                event_queue: event_queue.clone(),
            },
        );

        Ok(event_queue)
    }

    /// Consume events from the queue until a terminal state is reached.
    ///
    /// Updates the task in the store as events arrive. Returns the final task.
    async fn consume_until_terminal(
        &self,
        task_id: &str,
        mut rx: mpsc::Receiver<StreamResponse>,
    ) -> A2AResult<Task> {
        while let Some(event) = rx.recv().await {
            self.apply_event(task_id, &event).await?;
            self.notify_push(task_id).await;

            if let StreamResponse::StatusUpdate(ref update) = event {
                if Self::is_terminal(&update.status.state) || update.r#final {
                    break;
                }
            }
        }

        // Clean up the running agent entry.
        {
            let mut running = self.running_agents.lock().await;
            running.remove(task_id);
        }

        // Return the final task state.
        self.task_store
            .get(task_id)
            .await?
            .ok_or_else(|| A2AError::TaskNotFound {
                message: task_id.to_string(),
                data: None,
            })
    }

    /// Apply a stream event to the persisted task state.
    ///
    /// Mirrors Python SDK's `TaskManager.save_task_event` behavior:
    /// - For `StatusUpdate`: moves current status.message to history first, merges
    ///   event metadata into task metadata, then updates status.
    /// - For `ArtifactUpdate`: uses `append_artifact_to_task` logic — when
    ///   `append=true` and the artifact doesn't exist, the chunk is ignored.
    /// - For `Task`: replaces the entire task.
    /// - For `Message`: appends to history.
    async fn apply_event(&self, task_id: &str, event: &StreamResponse) -> A2AResult<()> {
        apply_event_to_store(&self.task_store, task_id, event).await
    }

    /// Best-effort push notification delivery for the task's current state.
    ///
    /// No-op if push notifications were never configured or the task has no
    /// registered webhooks. Errors are logged, never surfaced — the push
    /// channel is a side effect of the fold, not part of its result.
    async fn notify_push(&self, task_id: &str) {
        let (Some(store), Some(sender)) =
            (&self.push_notification_store, &self.push_notification_sender)
        else {
            return;
        };
        notify_push(&self.task_store, store, sender, task_id).await;
    }

    /// Check if a state is terminal.
    fn is_terminal(state: &TaskState) -> bool {
        matches!(
            state,
            TaskState::Completed | TaskState::Failed | TaskState::Canceled | TaskState::Rejected
        )
    }

    /// Fold events for a blocking `message/send` call (`configuration.blocking`
    /// unset or `true`).
    ///
    /// Mirrors `ResultManager.getFinalResult`: as long as the only thing the
    /// executor has produced so far is a single `Message`, nothing is
    /// written to the store — the message is held rather than applied. The
    /// moment a second event arrives (of any kind), that held message proves
    /// not to be the sole event, so the task is persisted and both events
    /// are folded in order. If the stream ends with the held message still
    /// unflushed, it really was the only event: return it directly and
    /// leave the `TaskStore` untouched (§4.2, scenario S1).
    async fn fold_blocking(
        &self,
        task: Task,
        mut persisted: bool,
        mut rx: mpsc::Receiver<StreamResponse>,
        history_length: Option<usize>,
    ) -> A2AResult<SendMessageResponse> {
        let task_id = task.id.clone();
        let mut pending_message: Option<Message> = None;

        while let Some(event) = rx.recv().await {
            if let StreamResponse::Message(ref msg) = event {
                if !persisted && pending_message.is_none() {
                    pending_message = Some(msg.clone());
                    continue;
                }
            }

            if !persisted {
                self.task_store.save(task.clone()).await?;
                persisted = true;
            }
            if let Some(held) = pending_message.take() {
                self.apply_event(&task_id, &StreamResponse::Message(held))
                    .await?;
                self.notify_push(&task_id).await;
            }

            self.apply_event(&task_id, &event).await?;
            self.notify_push(&task_id).await;

            if let StreamResponse::StatusUpdate(ref update) = event {
                if Self::is_terminal(&update.status.state) || update.r#final {
                    break;
                }
            }
        }

        self.running_agents.lock().await.remove(&task_id);

        if let Some(msg) = pending_message {
            return Ok(SendMessageResponse::Message(msg));
        }

        if !persisted {
            self.task_store.save(task.clone()).await?;
        }

        let mut final_task =
            self.task_store
                .get(&task_id)
                .await?
                .ok_or_else(|| A2AError::TaskNotFound {
                    message: task_id.clone(),
                    data: None,
                })?;
        Self::trim_history(&mut final_task, history_length);
        Ok(SendMessageResponse::Task(final_task))
    }

    /// Handle a non-blocking `message/send` call (`configuration.blocking ===
    /// false`).
    ///
    /// Returns as soon as the task's current (`submitted`) state is known —
    /// persisting it first if it wasn't already — and spawns a background
    /// loop that keeps folding subsequent events into the store. Unlike the
    /// blocking path, a non-blocking caller has already committed to getting
    /// a `Task` back (it needs the id to poll or resubscribe), so there is no
    /// message-only result here.
    async fn fold_nonblocking(
        &self,
        task: Task,
        persisted: bool,
        rx: mpsc::Receiver<StreamResponse>,
        history_length: Option<usize>,
    ) -> A2AResult<SendMessageResponse> {
        if !persisted {
            self.task_store.save(task.clone()).await?;
        }

        let task_id = task.id.clone();
        let task_store = Arc::clone(&self.task_store);
        let push_config = self
            .push_notification_store
            .as_ref()
            .zip(self.push_notification_sender.as_ref())
            .map(|(store, sender)| (Arc::clone(store), Arc::clone(sender)));

        spawn_fold_loop(task_store, push_config, task_id, rx);

        let mut result = task;
        Self::trim_history(&mut result, history_length);
        Ok(SendMessageResponse::Task(result))
    }

    /// Trim task history to the requested length.
    ///
    /// `historyLength` undefined means the caller doesn't want history back
    /// at all — the result is an empty history. `Some(n)` keeps the most
    /// recent `n` messages (tail). Negative `historyLength` values never
    /// reach this function: the wire-layer parsers below fold them into
    /// `None` before constructing params, which lands on the same "empty"
    /// behavior.
    fn trim_history(task: &mut Task, max_length: Option<usize>) {
        match max_length {
            Some(max) => {
                let history = task.history.get_or_insert_with(Vec::new);
                let total = history.len();
                if total > max {
                    *history = history.split_off(total - max);
                }
            }
            None => {
                task.history = Some(Vec::new());
            }
        }
    }
}

/// Fold a single stream event into the persisted task state.
///
/// The single place both the blocking (`consume_until_terminal`) and
/// streaming (`on_message_send_stream`'s persistence task) paths go through,
/// so the merge rules only exist once:
/// - `StatusUpdate`: moves current status.message to history first, merges
///   event metadata into task metadata, then updates status.
/// - `ArtifactUpdate`: delegates to [`append_artifact_to_task`].
/// - `Task`: replaces the entire task.
/// - `Message`: appends to history.
async fn apply_event_to_store(
    task_store: &Arc<dyn TaskStore>,
    task_id: &str,
    event: &StreamResponse,
) -> A2AResult<()> {
    let mut task = task_store
        .get(task_id)
        .await?
        .ok_or_else(|| A2AError::TaskNotFound {
            message: task_id.to_string(),
            data: None,
        })?;

    match event {
        StreamResponse::StatusUpdate(update) => {
            if let Some(ref current_msg) = task.status.message {
                let history = task.history.get_or_insert_with(Vec::new);
                history.push(current_msg.clone());
            }

            if let Some(ref event_meta) = update.metadata {
                if let Some(ref mut task_meta) = task.metadata {
                    if let (Some(task_obj), Some(event_obj)) =
                        (task_meta.as_object_mut(), event_meta.as_object())
                    {
                        for (k, v) in event_obj {
                            task_obj.insert(k.clone(), v.clone());
                        }
                    }
                } else {
                    task.metadata = Some(event_meta.clone());
                }
            }

            task.status = update.status.clone();
        }
        StreamResponse::ArtifactUpdate(update) => {
            append_artifact_to_task(&mut task, update);
        }
        StreamResponse::Task(updated_task) => {
            task = updated_task.clone();
        }
        StreamResponse::Message(msg) => {
            let history = task.history.get_or_insert_with(Vec::new);
            history.push(msg.clone());
        }
    }

    task_store.save(task).await
}

/// Background persistence loop shared by non-blocking `message/send` and
/// `message/stream`, both of which have already handed their first result
/// to the caller and need to keep folding subsequent events unattended.
///
/// If persisting an event fails, there's no caller left to propagate the
/// error to — install a synthetic `failed` status update instead so a later
/// `tasks/get` reflects the breakage, then stop.
fn spawn_fold_loop(
    task_store: Arc<dyn TaskStore>,
    push_config: Option<(
        Arc<dyn PushNotificationConfigStore>,
        Arc<dyn PushNotificationSender>,
    )>,
    task_id: String,
    mut rx: mpsc::Receiver<StreamResponse>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(e) = apply_event_to_store(&task_store, &task_id, &event).await {
                warn!(task_id = %task_id, error = %e, "Failed to persist event after returning the first result");
                mark_task_failed(&task_store, &task_id, &e).await;
                return;
            }

            if let Some((ref push_store, ref push_sender)) = push_config {
                notify_push(&task_store, push_store, push_sender, &task_id).await;
            }

            if let StreamResponse::StatusUpdate(ref update) = event {
                if DefaultRequestHandler::is_terminal(&update.status.state) || update.r#final {
                    break;
                }
            }
        }
    })
}

/// Best-effort install of a synthetic `status-update{final:true,
/// state:failed}` for a task whose background fold loop broke after the
/// caller already received its first result.
async fn mark_task_failed(task_store: &Arc<dyn TaskStore>, task_id: &str, error: &A2AError) {
    let Ok(Some(mut task)) = task_store.get(task_id).await else {
        return;
    };
    if DefaultRequestHandler::is_terminal(&task.status.state) {
        return;
    }

    if let Some(ref status_msg) = task.status.message {
        let history = task.history.get_or_insert_with(Vec::new);
        history.push(status_msg.clone());
    }

    task.status = TaskStatus {
        state: TaskState::Failed,
        message: Some(Message {
            message_id: Uuid::new_v4().to_string(),
            role: crate::types::Role::Agent,
            kind: "message".to_string(),
            parts: vec![Part::text(format!("Task processing failed: {error}"))],
            context_id: None,
            task_id: Some(task_id.to_string()),
            metadata: None,
            extensions: None,
            reference_task_ids: None,
        }),
        timestamp: Some(chrono::Utc::now().to_rfc3339()),
    };

    if let Err(e) = task_store.save(task).await {
        warn!(task_id = %task_id, error = %e, "Failed to persist synthetic failed status");
    }
}

/// Best-effort push notification delivery, shared by the blocking fold loop
/// and the streaming persistence task.
async fn notify_push(
    task_store: &Arc<dyn TaskStore>,
    push_store: &Arc<dyn PushNotificationConfigStore>,
    push_sender: &Arc<dyn PushNotificationSender>,
    task_id: &str,
) {
    let configs = match push_store.list(task_id).await {
        Ok(configs) => configs,
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Failed to load push notification configs");
            return;
        }
    };
    if configs.is_empty() {
        return;
    }

    match task_store.get(task_id).await {
        Ok(Some(task)) => push_sender.send(&task, &configs).await,
        Ok(None) => {}
        Err(e) => warn!(task_id = %task_id, error = %e, "Failed to load task for push notification"),
    }
}

#[async_trait]
impl RequestHandler for DefaultRequestHandler {
    async fn on_message_send(&self, params: SendMessageParams) -> A2AResult<SendMessageResponse> {
        let (task, persisted) = self.get_or_create_task(&params).await?;
        let event_queue = self
            .spawn_executor(&task, &params.message, params.configuration.as_ref())
            .await?;
        let rx = event_queue.subscribe().await;

        let blocking = params
            .configuration
            .as_ref()
            .and_then(|c| c.blocking)
            .unwrap_or(true);
        let history_length = params.configuration.as_ref().and_then(|c| c.history_length);

        if blocking {
            self.fold_blocking(task, persisted, rx, history_length).await
        } else {
            self.fold_nonblocking(task, persisted, rx, history_length)
                .await
        }
    }

    async fn on_message_send_stream(
        &self,
        params: SendMessageParams,
    ) -> A2AResult<mpsc::Receiver<StreamResponse>> {
        let (task, persisted) = self.get_or_create_task(&params).await?;
        if !persisted {
            self.task_store.save(task.clone()).await?;
        }
        let event_queue = self
            .spawn_executor(&task, &params.message, params.configuration.as_ref())
            .await?;
        let rx = event_queue.subscribe().await;

        // Spawn a background task to persist events as they arrive, through
        // a separate subscription so the caller's own `rx` is unaffected.
        let task_id = task.id.clone();
        let task_store = Arc::clone(&self.task_store);
        let push_config = self
            .push_notification_store
            .as_ref()
            .zip(self.push_notification_sender.as_ref())
            .map(|(store, sender)| (Arc::clone(store), Arc::clone(sender)));
        let persist_rx = event_queue.subscribe().await;

        spawn_fold_loop(task_store, push_config, task_id, persist_rx);

        Ok(rx)
    }

    async fn on_get_task(&self, params: GetTaskParams) -> A2AResult<Task> {
        let mut task =
            self.task_store
                .get(&params.id)
                .await?
                .ok_or_else(|| A2AError::TaskNotFound {
                    message: params.id.clone(),
                    data: None,
                })?;

        Self::trim_history(&mut task, params.history_length);
        Ok(task)
    }

    async fn on_list_tasks(&self, params: TaskListParams) -> A2AResult<TaskListResponse> {
        self.task_store.list(&params).await
    }

    async fn on_cancel_task(&self, params: CancelTaskParams) -> A2AResult<Task> {
        // Look up the task.
        let task =
            self.task_store
                .get(&params.id)
                .await?
                .ok_or_else(|| A2AError::TaskNotFound {
                    message: params.id.clone(),
                    data: None,
                })?;

        // Can't cancel a terminal task (mirrors Python SDK check).
        if Self::is_terminal(&task.status.state) {
            return Err(A2AError::TaskNotCancelable {
                message: format!(
                    "Task cannot be canceled - current state: {}",
                    task.status.state
                ),
                data: None,
            });
        }

        // Get or create event queue for this task.
        let event_queue = {
            let running = self.running_agents.lock().await;
            if let Some(agent) = running.get(&params.id) {
                agent.event_queue.clone()
            } else {
                // No running agent — create a temporary queue.
                EventQueue::with_default_capacity()
            }
        };

        let rx = event_queue.subscribe().await;

        // Call the executor's cancel method.
        // Python SDK passes `None` for the request in cancel context.
        let context = RequestContext {
            task_id: task.id.clone(),
            context_id: task.context_id.clone(),
            message: None,
            task: Some(task.clone()),
            configuration: None,
            related_tasks: Vec::new(),
            metadata: params.metadata,
            call_context: None,
        };

        self.executor.cancel(context, event_queue.clone()).await?;

        // Cancel the ongoing producer task, if one exists
        // (mirrors Python SDK's `producer_task.cancel()`).
        {
            let running = self.running_agents.lock().await;
            if let Some(agent) = running.get(&params.id) {
                agent.handle.abort();
            }
        }

        // Consume events until terminal.
        let final_task = self.consume_until_terminal(&task.id, rx).await?;

        // Validate the cancel result (mirrors Python SDK).
        // Python SDK raises TaskNotCancelableError if the result state is not canceled.
        if final_task.status.state != TaskState::Canceled {
            return Err(A2AError::TaskNotCancelable {
                message: format!(
                    "Task cannot be canceled - current state: {}",
                    final_task.status.state
                ),
                data: None,
            });
        }

        Ok(final_task)
    }

    async fn on_subscribe_to_task(
        &self,
        params: SubscribeToTaskParams,
    ) -> A2AResult<mpsc::Receiver<StreamResponse>> {
        // Verify the task exists.
        let task =
            self.task_store
                .get(&params.id)
                .await?
                .ok_or_else(|| A2AError::TaskNotFound {
                    message: params.id.clone(),
                    data: None,
                })?;

        // If the task is already terminal, return an error.
        if Self::is_terminal(&task.status.state) {
            return Err(A2AError::InvalidParams {
                message: format!(
                    "Task {} is in terminal state {:?} — cannot subscribe",
                    params.id, task.status.state
                ),
                data: None,
            });
        }

        // Get the event queue for this running task.
        let event_queue = {
            let running = self.running_agents.lock().await;
            running.get(&params.id).map(|agent| agent.event_queue.clone())
        };
        if let Some(event_queue) = event_queue {
            Ok(event_queue.subscribe().await)
        } else {
            Err(A2AError::TaskNotFound {
                message: format!(
                    "Task {} has no active agent execution — cannot subscribe",
                    params.id
                ),
                data: None,
            })
        }
    }

    async fn on_resubscribe_to_task(
        &self,
        params: SubscribeToTaskParams,
    ) -> A2AResult<mpsc::Receiver<StreamResponse>> {
        // Load the task; yield it first regardless of state.
        let task =
            self.task_store
                .get(&params.id)
                .await?
                .ok_or_else(|| A2AError::TaskNotFound {
                    message: params.id.clone(),
                    data: None,
                })?;

        let (tx, rx) = mpsc::channel(1024);
        let _ = tx.send(StreamResponse::Task(task.clone())).await;

        // A terminal task has nothing further to stream — end after the
        // current snapshot.
        if Self::is_terminal(&task.status.state) {
            return Ok(rx);
        }

        // Attach a new queue to the existing bus, if one is still running,
        // and forward its events onto the caller's receiver. A non-terminal
        // task with no live bus (e.g. awaiting the next message) simply ends
        // here — there is nothing more to forward right now.
        let event_queue = {
            let running = self.running_agents.lock().await;
            running.get(&params.id).map(|agent| agent.event_queue.clone())
        };

        if let Some(event_queue) = event_queue {
            let mut source = event_queue.subscribe().await;
            tokio::spawn(async move {
                while let Some(event) = source.recv().await {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            });
        }

        Ok(rx)
    }

    async fn on_set_task_push_notification_config(
        &self,
        params: serde_json::Value,
    ) -> A2AResult<serde_json::Value> {
        let store = self.push_notification_store.as_ref().ok_or_else(|| {
            A2AError::push_notification_not_supported("Push notifications are not configured")
        })?;

        let params: CreateTaskPushNotificationConfigParams = serde_json::from_value(params)
            .map_err(|e| A2AError::invalid_params(format!("invalid params: {e}")))?;

        self.task_store
            .get(&params.task_id)
            .await?
            .ok_or_else(|| A2AError::TaskNotFound {
                message: params.task_id.clone(),
                data: None,
            })?;

        let mut config = params.config;
        if config.id.is_none() {
            config.id = Some(params.config_id.clone());
        }

        let entry = TaskPushNotificationConfig {
            id: Some(params.config_id),
            task_id: params.task_id,
            push_notification_config: config,
            tenant: params.tenant,
        };
        store.set(entry.clone()).await?;

        serde_json::to_value(&entry)
            .map_err(|e| A2AError::internal_error(format!("failed to serialize config: {e}")))
    }

    async fn on_get_task_push_notification_config(
        &self,
        params: serde_json::Value,
    ) -> A2AResult<serde_json::Value> {
        let store = self.push_notification_store.as_ref().ok_or_else(|| {
            A2AError::push_notification_not_supported("Push notifications are not configured")
        })?;

        let params: GetTaskPushNotificationConfigParams = serde_json::from_value(params)
            .map_err(|e| A2AError::invalid_params(format!("invalid params: {e}")))?;

        self.task_store
            .get(&params.id)
            .await?
            .ok_or_else(|| A2AError::TaskNotFound {
                message: params.id.clone(),
                data: None,
            })?;

        // Without an explicit config id, default to the task id itself.
        let config_id = params
            .push_notification_config_id
            .unwrap_or_else(|| params.id.clone());

        let mut matches = store.get(&params.id, Some(&config_id)).await?;
        let config = matches
            .pop()
            .ok_or_else(|| A2AError::TaskNotFound {
                message: format!(
                    "No push notification config {} for task {}",
                    config_id, params.id
                ),
                data: None,
            })?;

        serde_json::to_value(&config)
            .map_err(|e| A2AError::internal_error(format!("failed to serialize config: {e}")))
    }

    async fn on_list_task_push_notification_config(
        &self,
        params: serde_json::Value,
    ) -> A2AResult<serde_json::Value> {
        let store = self.push_notification_store.as_ref().ok_or_else(|| {
            A2AError::push_notification_not_supported("Push notifications are not configured")
        })?;

        let params: ListTaskPushNotificationConfigParams = serde_json::from_value(params)
            .map_err(|e| A2AError::invalid_params(format!("invalid params: {e}")))?;

        self.task_store
            .get(&params.id)
            .await?
            .ok_or_else(|| A2AError::TaskNotFound {
                message: params.id.clone(),
                data: None,
            })?;

        let configs = store.list(&params.id).await?;
        let response = ListTaskPushNotificationConfigResponse {
            configs,
            next_page_token: None,
        };

        serde_json::to_value(&response)
            .map_err(|e| A2AError::internal_error(format!("failed to serialize response: {e}")))
    }

    async fn on_delete_task_push_notification_config(
        &self,
        params: serde_json::Value,
    ) -> A2AResult<()> {
        let store = self.push_notification_store.as_ref().ok_or_else(|| {
            A2AError::push_notification_not_supported("Push notifications are not configured")
        })?;

        let params: DeleteTaskPushNotificationConfigParams = serde_json::from_value(params)
            .map_err(|e| A2AError::invalid_params(format!("invalid params: {e}")))?;

        self.task_store
            .get(&params.id)
            .await?
            .ok_or_else(|| A2AError::TaskNotFound {
                message: params.id.clone(),
                data: None,
            })?;

        store
            .delete(&params.id, &params.push_notification_config_id)
            .await
    }

    async fn on_get_authenticated_extended_card(
        &self,
        base_card: &AgentCard,
        ctx: Option<ServerCallContext>,
    ) -> A2AResult<AgentCard> {
        match &self.extended_card_provider {
            None => Err(A2AError::authenticated_extended_card_not_configured(
                "No authenticated extended card provider is configured",
            )),
            Some(ExtendedAgentCardProvider::Callback(callback)) => {
                callback.get_extended_card(ctx).await
            }
            Some(ExtendedAgentCardProvider::Static(extended)) => {
                let authenticated = ctx.map(|c| c.user.is_authenticated).unwrap_or(false);
                if authenticated {
                    Ok(extended.clone())
                } else {
                    Ok(base_card.clone())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::event_queue::EventQueue;
    use crate::server::push_notification::{
        DefaultPushNotificationSender, InMemoryPushNotificationConfigStore,
    };
    use crate::server::task_store::InMemoryTaskStore;
    use crate::server::task_updater::TaskUpdater;
    use crate::types::{PushNotificationConfig, Role};

    struct EchoExecutor;

    #[async_trait]
    impl AgentExecutor for EchoExecutor {
        async fn execute(&self, ctx: RequestContext, queue: EventQueue) -> A2AResult<()> {
            let updater = TaskUpdater::new(queue, ctx.task_id, ctx.context_id);
            updater.complete_with_text("done").await
        }

        async fn cancel(&self, ctx: RequestContext, queue: EventQueue) -> A2AResult<()> {
            let updater = TaskUpdater::new(queue, ctx.task_id, ctx.context_id);
            updater.cancel(None).await
        }
    }

    /// Replies with a single bare `Message` event and nothing else — the
    /// message-only fold case.
    struct MessageOnlyExecutor;

    #[async_trait]
    impl AgentExecutor for MessageOnlyExecutor {
        async fn execute(&self, ctx: RequestContext, queue: EventQueue) -> A2AResult<()> {
            let _ = &ctx;
            queue.publish(StreamResponse::Message(Message {
                message_id: Uuid::new_v4().to_string(),
                role: Role::Agent,
                kind: "message".to_string(),
                parts: vec![Part::text("hello back".to_string())],
                context_id: None,
                task_id: None,
                metadata: None,
                extensions: None,
                reference_task_ids: None,
            }))?;
            Ok(())
        }

        async fn cancel(&self, _ctx: RequestContext, _queue: EventQueue) -> A2AResult<()> {
            Ok(())
        }
    }

    /// Emits a submitted snapshot, then a slight delay before completing —
    /// enough for a non-blocking caller to observe the in-between state.
    struct SlowExecutor;

    #[async_trait]
    impl AgentExecutor for SlowExecutor {
        async fn execute(&self, ctx: RequestContext, queue: EventQueue) -> A2AResult<()> {
            let updater = TaskUpdater::new(queue, ctx.task_id, ctx.context_id);
            updater.start_work(None).await?;
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            updater.complete_with_text("done").await
        }

        async fn cancel(&self, ctx: RequestContext, queue: EventQueue) -> A2AResult<()> {
            let updater = TaskUpdater::new(queue, ctx.task_id, ctx.context_id);
            updater.cancel(None).await
        }
    }

    /// Wraps an [`InMemoryTaskStore`] and fails exactly the `fail_on_call`th
    /// `save` (1-indexed); every other call succeeds. Used to exercise the
    /// background fold loop's error path without making the loop's own
    /// synthetic-failure write fail too.
    struct FlakyStore {
        inner: InMemoryTaskStore,
        save_count: std::sync::atomic::AtomicUsize,
        fail_on_call: usize,
    }

    #[async_trait]
    impl TaskStore for FlakyStore {
        async fn save(&self, task: Task) -> A2AResult<()> {
            let count = self
                .save_count
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                + 1;
            if count == self.fail_on_call {
                return Err(A2AError::internal_error("simulated store outage"));
            }
            self.inner.save(task).await
        }

        async fn get(&self, task_id: &str) -> A2AResult<Option<Task>> {
            self.inner.get(task_id).await
        }

        async fn delete(&self, task_id: &str) -> A2AResult<()> {
            self.inner.delete(task_id).await
        }

        async fn list(
            &self,
            params: &crate::server::task_store::TaskListParams,
        ) -> A2AResult<crate::server::task_store::TaskListResponse> {
            self.inner.list(params).await
        }
    }

    fn make_message(text: &str) -> Message {
        Message {
            message_id: Uuid::new_v4().to_string(),
            role: Role::User,
            kind: "message".to_string(),
            parts: vec![Part::text(text.to_string())],
            context_id: None,
            task_id: None,
            metadata: None,
            extensions: None,
            reference_task_ids: None,
        }
    }

    fn make_handler() -> DefaultRequestHandler {
        DefaultRequestHandler::new(Arc::new(EchoExecutor), Arc::new(InMemoryTaskStore::new()))
    }

    #[tokio::test]
    async fn terminal_task_send_is_invalid_request() {
        let handler = make_handler();
        let sent = handler
            .on_message_send(SendMessageParams {
                message: make_message("hi"),
                configuration: None,
                metadata: None,
                tenant: None,
            })
            .await
            .unwrap();
        let task_id = match sent {
            SendMessageResponse::Task(task) => task.id,
            _ => panic!("expected a task"),
        };

        let mut followup = make_message("again");
        followup.task_id = Some(task_id);
        let err = handler
            .on_message_send(SendMessageParams {
                message: followup,
                configuration: None,
                metadata: None,
                tenant: None,
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), -32600);
    }

    #[tokio::test]
    async fn history_length_none_returns_empty_history() {
        let handler = make_handler();
        let sent = handler
            .on_message_send(SendMessageParams {
                message: make_message("hi"),
                configuration: None,
                metadata: None,
                tenant: None,
            })
            .await
            .unwrap();
        let task = match sent {
            SendMessageResponse::Task(task) => task,
            _ => panic!("expected a task"),
        };

        let fetched = handler
            .on_get_task(GetTaskParams {
                id: task.id,
                history_length: None,
                metadata: None,
                tenant: None,
            })
            .await
            .unwrap();

        assert_eq!(fetched.history, Some(Vec::new()));
    }

    #[tokio::test]
    async fn resubscribe_to_terminal_task_ends_after_snapshot() {
        let handler = make_handler();
        let sent = handler
            .on_message_send(SendMessageParams {
                message: make_message("hi"),
                configuration: None,
                metadata: None,
                tenant: None,
            })
            .await
            .unwrap();
        let task_id = match sent {
            SendMessageResponse::Task(task) => task.id,
            _ => panic!("expected a task"),
        };

        let mut rx = handler
            .on_resubscribe_to_task(SubscribeToTaskParams {
                id: task_id,
                metadata: None,
                tenant: None,
            })
            .await
            .unwrap();

        match rx.recv().await {
            Some(StreamResponse::Task(task)) => {
                assert_eq!(task.status.state, TaskState::Completed);
            }
            other => panic!("expected a Task snapshot first, got {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn push_notification_config_round_trips_through_handler() {
        let handler = make_handler().with_push_notifications(
            Arc::new(InMemoryPushNotificationConfigStore::new()),
            Arc::new(DefaultPushNotificationSender::new()),
        );

        let sent = handler
            .on_message_send(SendMessageParams {
                message: make_message("hi"),
                configuration: None,
                metadata: None,
                tenant: None,
            })
            .await
            .unwrap();
        let task_id = match sent {
            SendMessageResponse::Task(task) => task.id,
            _ => panic!("expected a task"),
        };

        let set_params = serde_json::to_value(CreateTaskPushNotificationConfigParams {
            task_id: task_id.clone(),
            config_id: "cfg-1".to_string(),
            config: PushNotificationConfig {
                id: None,
                url: "https://example.com/hook".to_string(),
                token: None,
                authentication: None,
            },
            tenant: None,
        })
        .unwrap();
        handler
            .on_set_task_push_notification_config(set_params)
            .await
            .unwrap();

        let list_params = serde_json::to_value(ListTaskPushNotificationConfigParams {
            id: task_id.clone(),
            metadata: None,
        })
        .unwrap();
        let list_result = handler
            .on_list_task_push_notification_config(list_params)
            .await
            .unwrap();
        let response: ListTaskPushNotificationConfigResponse =
            serde_json::from_value(list_result).unwrap();
        assert_eq!(response.configs.len(), 1);

        let delete_params = serde_json::to_value(DeleteTaskPushNotificationConfigParams {
            id: task_id.clone(),
            push_notification_config_id: "cfg-1".to_string(),
            metadata: None,
        })
        .unwrap();
        handler
            .on_delete_task_push_notification_config(delete_params)
            .await
            .unwrap();

        let list_params = serde_json::to_value(ListTaskPushNotificationConfigParams {
            id: task_id,
            metadata: None,
        })
        .unwrap();
        let list_result = handler
            .on_list_task_push_notification_config(list_params)
            .await
            .unwrap();
        let response: ListTaskPushNotificationConfigResponse =
            serde_json::from_value(list_result).unwrap();
        assert!(response.configs.is_empty());
    }

    #[tokio::test]
    async fn push_notification_config_without_store_is_unsupported() {
        let handler = make_handler();
        let err = handler
            .on_set_task_push_notification_config(serde_json::Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code(), -32003);
    }

    #[tokio::test]
    async fn message_only_result_leaves_task_store_untouched() {
        let handler = DefaultRequestHandler::new(
            Arc::new(MessageOnlyExecutor),
            Arc::new(InMemoryTaskStore::new()),
        );

        let response = handler
            .on_message_send(SendMessageParams {
                message: make_message("hi"),
                configuration: None,
                metadata: None,
                tenant: None,
            })
            .await
            .unwrap();

        match response {
            SendMessageResponse::Message(msg) => {
                assert_eq!(msg.parts.len(), 1);
            }
            other => panic!("expected a message, got {other:?}"),
        }

        let listed = handler
            .on_list_tasks(TaskListParams::default())
            .await
            .unwrap();
        assert!(listed.tasks.is_empty());
    }

    #[tokio::test]
    async fn nonblocking_send_returns_submitted_task_then_background_completes() {
        let handler =
            DefaultRequestHandler::new(Arc::new(SlowExecutor), Arc::new(InMemoryTaskStore::new()));

        let response = handler
            .on_message_send(SendMessageParams {
                message: make_message("hi"),
                configuration: Some(SendMessageConfiguration {
                    accepted_output_modes: None,
                    blocking: Some(false),
                    history_length: None,
                    push_notification_config: None,
                }),
                metadata: None,
                tenant: None,
            })
            .await
            .unwrap();

        let task_id = match response {
            SendMessageResponse::Task(task) => {
                assert_eq!(task.status.state, TaskState::Submitted);
                task.id
            }
            other => panic!("expected a task, got {other:?}"),
        };

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let finished = handler
            .on_get_task(GetTaskParams {
                id: task_id,
                history_length: None,
                metadata: None,
                tenant: None,
            })
            .await
            .unwrap();
        assert_eq!(finished.status.state, TaskState::Completed);
    }

    #[tokio::test]
    async fn nonblocking_send_marks_task_failed_when_background_fold_errors() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryTaskStore::new(),
            save_count: std::sync::atomic::AtomicUsize::new(0),
            fail_on_call: 2,
        });
        let handler = DefaultRequestHandler::new(Arc::new(SlowExecutor), store);

        let response = handler
            .on_message_send(SendMessageParams {
                message: make_message("hi"),
                configuration: Some(SendMessageConfiguration {
                    accepted_output_modes: None,
                    blocking: Some(false),
                    history_length: None,
                    push_notification_config: None,
                }),
                metadata: None,
                tenant: None,
            })
            .await
            .unwrap();

        let task_id = match response {
            SendMessageResponse::Task(task) => task.id,
            other => panic!("expected a task, got {other:?}"),
        };

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let finished = handler
            .on_get_task(GetTaskParams {
                id: task_id,
                history_length: None,
                metadata: None,
                tenant: None,
            })
            .await
            .unwrap();
        assert_eq!(finished.status.state, TaskState::Failed);
    }
}
