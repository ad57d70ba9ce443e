//! Push notification config storage and delivery.
//!
//! Mirrors Python SDK's `PushNotificationConfigStore`/`BasePushNotificationSender`
//! from `a2a.server.tasks.push_notification_*`. A [`PushNotificationConfigStore`]
//! persists per-task webhook configs registered via `tasks/pushNotificationConfig/*`;
//! a [`PushNotificationSender`] delivers task updates to those webhooks.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::A2AResult;
use crate::types::{Task, TaskPushNotificationConfig};

/// Trait for persisting push notification configs registered against tasks.
///
/// A single task may have more than one config (multiple webhooks), each
/// identified by `push_notification_config.id` (or, if unset, the config's
/// position of registration).
#[async_trait]
pub trait PushNotificationConfigStore: Send + Sync {
    /// Register or replace a config for a task.
    async fn set(&self, config: TaskPushNotificationConfig) -> A2AResult<()>;

    /// Fetch configs for a task, optionally narrowed to a single config id.
    async fn get(
        &self,
        task_id: &str,
        config_id: Option<&str>,
    ) -> A2AResult<Vec<TaskPushNotificationConfig>>;

    /// List all configs registered for a task.
    async fn list(&self, task_id: &str) -> A2AResult<Vec<TaskPushNotificationConfig>>;

    /// Delete a single config by id.
    async fn delete(&self, task_id: &str, config_id: &str) -> A2AResult<()>;
}

/// In-memory push notification config store, keyed by task id.
///
/// Suitable for development and testing; production deployments should back
/// this with durable storage so webhook registrations survive a restart.
#[derive(Debug, Default)]
pub struct InMemoryPushNotificationConfigStore {
    configs: Arc<RwLock<HashMap<String, Vec<TaskPushNotificationConfig>>>>,
}

impl InMemoryPushNotificationConfigStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            configs: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl PushNotificationConfigStore for InMemoryPushNotificationConfigStore {
    async fn set(&self, config: TaskPushNotificationConfig) -> A2AResult<()> {
        let mut configs = self.configs.write().await;
        let entries = configs.entry(config.task_id.clone()).or_default();

        let incoming_id = config.push_notification_config.id.as_deref();
        if let Some(id) = incoming_id {
            if let Some(existing) = entries
                .iter_mut()
                .find(|c| c.push_notification_config.id.as_deref() == Some(id))
            {
                *existing = config;
                debug!(task_id = %existing.task_id, config_id = %id, "Push notification config replaced");
                return Ok(());
            }
        }

        debug!(task_id = %config.task_id, "Push notification config registered");
        entries.push(config);
        Ok(())
    }

    async fn get(
        &self,
        task_id: &str,
        config_id: Option<&str>,
    ) -> A2AResult<Vec<TaskPushNotificationConfig>> {
        let configs = self.configs.read().await;
        let Some(entries) = configs.get(task_id) else {
            return Ok(Vec::new());
        };

        let result = match config_id {
            Some(id) => entries
                .iter()
                .filter(|c| c.push_notification_config.id.as_deref() == Some(id))
                .cloned()
                .collect(),
            None => entries.clone(),
        };
        Ok(result)
    }

    async fn list(&self, task_id: &str) -> A2AResult<Vec<TaskPushNotificationConfig>> {
        let configs = self.configs.read().await;
        Ok(configs.get(task_id).cloned().unwrap_or_default())
    }

    async fn delete(&self, task_id: &str, config_id: &str) -> A2AResult<()> {
        let mut configs = self.configs.write().await;
        if let Some(entries) = configs.get_mut(task_id) {
            entries.retain(|c| c.push_notification_config.id.as_deref() != Some(config_id));
            if entries.is_empty() {
                configs.remove(task_id);
            }
        }
        debug!(task_id = %task_id, config_id = %config_id, "Push notification config deleted");
        Ok(())
    }
}

/// Trait for delivering task updates to registered webhooks.
///
/// Delivery is best-effort: a failed POST is logged but never propagated as
/// an error back to the caller driving the task, since push notification
/// delivery is a side channel independent of the primary streaming/polling
/// response.
#[async_trait]
pub trait PushNotificationSender: Send + Sync {
    /// Send the current task state to every config registered for it.
    async fn send(&self, task: &Task, configs: &[TaskPushNotificationConfig]);
}

/// Default header name used to carry a push notification config's
/// verification token, overridable via [`DefaultPushNotificationSender::with_token_header`].
pub const DEFAULT_NOTIFICATION_TOKEN_HEADER: &str = "X-A2A-Notification-Token";

/// `reqwest`-based push notification sender.
///
/// POSTs the task's JSON representation to each config's URL, attaching the
/// optional verification token (under a configurable header, `X-A2A-Notification-Token`
/// by default) and `Bearer`/`Basic` credentials when `authentication` is present.
#[derive(Debug, Clone)]
pub struct DefaultPushNotificationSender {
    client: reqwest::Client,
    token_header: String,
}

impl DefaultPushNotificationSender {
    /// Create a sender with a default `reqwest::Client`.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            token_header: DEFAULT_NOTIFICATION_TOKEN_HEADER.to_string(),
        }
    }

    /// Create a sender with a caller-supplied `reqwest::Client`, e.g. to
    /// share a connection pool or set custom TLS options.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            token_header: DEFAULT_NOTIFICATION_TOKEN_HEADER.to_string(),
        }
    }

    /// Override the header name used to carry the verification token.
    pub fn with_token_header(mut self, header: impl Into<String>) -> Self {
        self.token_header = header.into();
        self
    }

    async fn deliver(&self, task: &Task, config: &TaskPushNotificationConfig) {
        let target = &config.push_notification_config;
        let mut request = self.client.post(&target.url).json(task);

        if let Some(token) = &target.token {
            request = request.header(self.token_header.as_str(), token);
        }

        if let Some(auth) = &target.authentication {
            if let Some(credentials) = &auth.credentials {
                if let Some(scheme) = auth.schemes.first() {
                    request = request.header("Authorization", format!("{scheme} {credentials}"));
                }
            }
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(task_id = %task.id, url = %target.url, "Push notification delivered");
            }
            Ok(response) => {
                warn!(
                    task_id = %task.id,
                    url = %target.url,
                    status = %response.status(),
                    "Push notification endpoint returned an error status"
                );
            }
            Err(e) => {
                warn!(task_id = %task.id, url = %target.url, error = %e, "Push notification delivery failed");
            }
        }
    }
}

impl Default for DefaultPushNotificationSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushNotificationSender for DefaultPushNotificationSender {
    async fn send(&self, task: &Task, configs: &[TaskPushNotificationConfig]) {
        for config in configs {
            self.deliver(task, config).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PushNotificationConfig, TaskState, TaskStatus};

    fn make_config(task_id: &str, config_id: &str, url: &str) -> TaskPushNotificationConfig {
        TaskPushNotificationConfig {
            id: None,
            task_id: task_id.to_string(),
            push_notification_config: PushNotificationConfig {
                id: Some(config_id.to_string()),
                url: url.to_string(),
                token: None,
                authentication: None,
            },
            tenant: None,
        }
    }

    #[tokio::test]
    async fn set_and_get_roundtrip() {
        let store = InMemoryPushNotificationConfigStore::new();
        let config = make_config("task-1", "cfg-1", "https://example.com/hook");
        store.set(config.clone()).await.unwrap();

        let fetched = store.get("task-1", Some("cfg-1")).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].push_notification_config.url, "https://example.com/hook");
    }

    #[tokio::test]
    async fn set_replaces_same_config_id() {
        let store = InMemoryPushNotificationConfigStore::new();
        store
            .set(make_config("task-1", "cfg-1", "https://example.com/a"))
            .await
            .unwrap();
        store
            .set(make_config("task-1", "cfg-1", "https://example.com/b"))
            .await
            .unwrap();

        let all = store.list("task-1").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].push_notification_config.url, "https://example.com/b");
    }

    #[tokio::test]
    async fn multiple_configs_per_task() {
        let store = InMemoryPushNotificationConfigStore::new();
        store
            .set(make_config("task-1", "cfg-1", "https://example.com/a"))
            .await
            .unwrap();
        store
            .set(make_config("task-1", "cfg-2", "https://example.com/b"))
            .await
            .unwrap();

        let all = store.list("task-1").await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn delete_removes_config() {
        let store = InMemoryPushNotificationConfigStore::new();
        store
            .set(make_config("task-1", "cfg-1", "https://example.com/a"))
            .await
            .unwrap();
        store.delete("task-1", "cfg-1").await.unwrap();

        let all = store.list("task-1").await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn get_unknown_task_returns_empty() {
        let store = InMemoryPushNotificationConfigStore::new();
        let result = store.get("missing", None).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn sender_handles_unreachable_url_without_erroring() {
        let sender = DefaultPushNotificationSender::new();
        let task = Task {
            id: "task-1".to_string(),
            context_id: "ctx-1".to_string(),
            kind: "task".to_string(),
            status: TaskStatus {
                state: TaskState::Completed,
                message: None,
                timestamp: None,
            },
            artifacts: None,
            history: None,
            metadata: None,
        };
        let config = make_config("task-1", "cfg-1", "http://127.0.0.1:1/unreachable");
        sender.send(&task, std::slice::from_ref(&config)).await;
    }

    #[test]
    fn with_token_header_overrides_the_default() {
        let sender = DefaultPushNotificationSender::new().with_token_header("X-Webhook-Secret");
        assert_eq!(sender.token_header, "X-Webhook-Secret");

        let default_sender = DefaultPushNotificationSender::new();
        assert_eq!(default_sender.token_header, DEFAULT_NOTIFICATION_TOKEN_HEADER);
    }
}
