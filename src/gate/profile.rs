use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::gate::types::{ChatMessage, SessionId, UserId};

#[derive(Debug, Error)]
pub enum ProfileStoreError {
    #[error("profile store unreachable: {0}")]
    Unavailable(String),
    #[error("profile store rejected {event}: status {status}")]
    Rejected { event: &'static str, status: u16 },
}

/// Where grants and conversation checkpoints end up. Calls are best effort:
/// the gate logs failures and never retries or surfaces them.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn record_grant(
        &self,
        session_id: &SessionId,
        user_id: Option<&UserId>,
    ) -> Result<(), ProfileStoreError>;

    async fn record_checkpoint(
        &self,
        session_id: &SessionId,
        messages: &[ChatMessage],
    ) -> Result<(), ProfileStoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProfileStoreConfig {
    #[default]
    None,
    Webhook {
        url: String,
        #[serde(default = "default_webhook_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_webhook_timeout_ms() -> u64 {
    5_000
}

pub fn build_profile_store(config: &ProfileStoreConfig) -> Arc<dyn ProfileStore> {
    match config {
        ProfileStoreConfig::None => Arc::new(NoopProfileStore),
        ProfileStoreConfig::Webhook { url, timeout_ms } => Arc::new(WebhookProfileStore::new(
            url.clone(),
            Duration::from_millis((*timeout_ms).max(1)),
        )),
    }
}

#[derive(Default)]
pub struct NoopProfileStore;

#[async_trait]
impl ProfileStore for NoopProfileStore {
    async fn record_grant(
        &self,
        session_id: &SessionId,
        user_id: Option<&UserId>,
    ) -> Result<(), ProfileStoreError> {
        tracing::info!(
            target: "profile_store",
            session_id = %session_id,
            user_id = user_id.map(String::as_str).unwrap_or("-"),
            "grant_not_persisted"
        );
        Ok(())
    }

    async fn record_checkpoint(
        &self,
        session_id: &SessionId,
        messages: &[ChatMessage],
    ) -> Result<(), ProfileStoreError> {
        tracing::debug!(
            target: "profile_store",
            session_id = %session_id,
            messages = messages.len(),
            "checkpoint_not_persisted"
        );
        Ok(())
    }
}

/// Posts each event as JSON to an external collector.
pub struct WebhookProfileStore {
    client: Client,
    url: String,
    timeout: Duration,
}

impl WebhookProfileStore {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            timeout,
        }
    }

    async fn post(
        &self,
        event: &'static str,
        body: serde_json::Value,
    ) -> Result<(), ProfileStoreError> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|err| ProfileStoreError::Unavailable(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ProfileStoreError::Rejected {
                event,
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for WebhookProfileStore {
    async fn record_grant(
        &self,
        session_id: &SessionId,
        user_id: Option<&UserId>,
    ) -> Result<(), ProfileStoreError> {
        self.post(
            "grant",
            json!({
                "event": "grant",
                "session_id": session_id,
                "user_id": user_id,
            }),
        )
        .await
    }

    async fn record_checkpoint(
        &self,
        session_id: &SessionId,
        messages: &[ChatMessage],
    ) -> Result<(), ProfileStoreError> {
        self.post(
            "checkpoint",
            json!({
                "event": "checkpoint",
                "session_id": session_id,
                "messages": messages,
            }),
        )
        .await
    }
}

pub fn spawn_record_grant(
    store: Arc<dyn ProfileStore>,
    session_id: SessionId,
    user_id: Option<UserId>,
) {
    tokio::spawn(async move {
        if let Err(err) = store.record_grant(&session_id, user_id.as_ref()).await {
            tracing::error!(
                target: "profile_store",
                session_id = %session_id,
                error = %err,
                "record_grant_failed"
            );
        }
    });
}

pub fn spawn_record_checkpoint(
    store: Arc<dyn ProfileStore>,
    session_id: SessionId,
    messages: Vec<ChatMessage>,
) {
    tokio::spawn(async move {
        if let Err(err) = store.record_checkpoint(&session_id, &messages).await {
            tracing::warn!(
                target: "profile_store",
                session_id = %session_id,
                error = %err,
                "record_checkpoint_failed"
            );
        }
    });
}
