use std::{sync::Arc, time::Duration};

use futures_util::stream;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    gate::{
        detector::{DetectionReport, OutcomeDetector},
        kill_switch::KillSwitch,
        profile::{ProfileStore, spawn_record_checkpoint, spawn_record_grant},
        session::SessionLedger,
        types::{
            ChatMessage, ChatRole, GateConfig, GateFragment, GateRequest, GateTurn, SessionId,
            SessionOutcome, UserId,
        },
    },
    inference::dispatcher::Dispatcher,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateRejection {
    #[error("payload too large: {count} messages exceeds the limit of {limit}")]
    TooManyMessages { count: usize, limit: usize },
    #[error("payload too large: message {index} has {chars} characters, the limit is {limit}")]
    MessageTooLong {
        index: usize,
        chars: usize,
        limit: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortCircuit {
    KillSwitch,
    CrisisPhrase,
    PersistenceThreshold,
}

impl ShortCircuit {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShortCircuit::KillSwitch => "kill_switch",
            ShortCircuit::CrisisPhrase => "crisis_phrase",
            ShortCircuit::PersistenceThreshold => "persistence_threshold",
        }
    }
}

/// Turn-level policy in front of the dispatcher.
pub struct SessionGate {
    config: GateConfig,
    dispatcher: Dispatcher,
    kill_switch: Arc<KillSwitch>,
    grants: GrantRecorder,
}

impl SessionGate {
    pub fn new(
        config: GateConfig,
        dispatcher: Dispatcher,
        kill_switch: Arc<KillSwitch>,
        profile_store: Arc<dyn ProfileStore>,
    ) -> Self {
        let ledger = SessionLedger::new(
            Duration::from_secs(config.session_idle_ttl_secs),
            config.max_tracked_sessions,
        );
        Self {
            config,
            dispatcher,
            kill_switch,
            grants: GrantRecorder {
                ledger: Arc::new(ledger),
                profile_store,
            },
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn kill_switch(&self) -> &Arc<KillSwitch> {
        &self.kill_switch
    }

    pub fn ledger(&self) -> &Arc<SessionLedger> {
        &self.grants.ledger
    }

    pub async fn handle(&self, request: GateRequest) -> Result<GateTurn, GateRejection> {
        self.validate(&request.messages)?;

        let session_id = request
            .session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let user_id = request.user_id;
        let messages = request.messages;

        if let Some(reason) = self.short_circuit(&session_id, &messages).await {
            tracing::info!(
                target: "gate",
                session_id = %session_id,
                reason = reason.as_str(),
                messages = messages.len(),
                "turn_short_circuited"
            );
            let notice = match reason {
                ShortCircuit::KillSwitch => self.config.kill_switch_message.clone(),
                ShortCircuit::CrisisPhrase => {
                    self.grants.grant(&session_id, user_id.as_ref()).await;
                    self.config.crisis_message.clone()
                }
                ShortCircuit::PersistenceThreshold => {
                    self.grants.grant(&session_id, user_id.as_ref()).await;
                    self.config.persistence_message.clone()
                }
            };
            let fragments = vec![
                GateFragment::Text(notice),
                GateFragment::GateOpen(self.config.gate_open_signal.clone()),
            ];
            return Ok(GateTurn {
                session_id,
                stream: Box::pin(stream::iter(fragments)),
            });
        }

        let window = self.window(&messages);
        tracing::debug!(
            target: "gate",
            session_id = %session_id,
            messages = messages.len(),
            window = window.len(),
            "turn_dispatched"
        );
        let upstream = self.dispatcher.dispatch(&window);
        let (stream, report) = OutcomeDetector::new(self.config.sentinel_marker.clone())
            .attach(upstream, self.config.gate_open_signal.clone());

        let grants = self.grants.clone();
        let watched_session = session_id.clone();
        tokio::spawn(async move {
            // Sender dropped: the caller went away before the reply finished.
            let Ok(report) = report.await else {
                return;
            };
            grants
                .settle(watched_session, user_id, messages, report)
                .await;
        });

        Ok(GateTurn { session_id, stream })
    }

    pub fn validate(&self, messages: &[ChatMessage]) -> Result<(), GateRejection> {
        if messages.len() > self.config.max_messages {
            return Err(GateRejection::TooManyMessages {
                count: messages.len(),
                limit: self.config.max_messages,
            });
        }

        for (index, message) in messages.iter().enumerate() {
            let chars = message.content.chars().count();
            if chars > self.config.max_message_chars {
                return Err(GateRejection::MessageTooLong {
                    index,
                    chars,
                    limit: self.config.max_message_chars,
                });
            }
        }

        Ok(())
    }

    pub async fn short_circuit(
        &self,
        session_id: &SessionId,
        messages: &[ChatMessage],
    ) -> Option<ShortCircuit> {
        if self.kill_switch.is_engaged() {
            return Some(ShortCircuit::KillSwitch);
        }

        let phrase = self.config.crisis_phrase.trim().to_lowercase();
        if !phrase.is_empty()
            && let Some(latest) = messages.iter().rev().find(|m| m.role == ChatRole::User)
            && latest.content.to_lowercase().contains(&phrase)
        {
            return Some(ShortCircuit::CrisisPhrase);
        }

        let exchanged = messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .count();
        // A session the model already let through keeps talking to the model.
        if self.config.persistence_threshold > 0
            && exchanged >= self.config.persistence_threshold
            && self.grants.ledger.outcome(session_id).await != SessionOutcome::Granted
        {
            return Some(ShortCircuit::PersistenceThreshold);
        }

        None
    }

    /// The most recent `history_window` non-system messages. Caller system
    /// messages are dropped before dispatch and must not take window slots.
    pub fn window(&self, messages: &[ChatMessage]) -> Vec<ChatMessage> {
        let exchanged: Vec<&ChatMessage> = messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .collect();
        let start = exchanged.len().saturating_sub(self.config.history_window);
        exchanged[start..].iter().map(|m| (*m).clone()).collect()
    }
}

#[derive(Clone)]
struct GrantRecorder {
    ledger: Arc<SessionLedger>,
    profile_store: Arc<dyn ProfileStore>,
}

impl GrantRecorder {
    async fn grant(&self, session_id: &SessionId, user_id: Option<&UserId>) {
        if !self.ledger.mark_granted(session_id).await {
            tracing::debug!(
                target: "gate",
                session_id = %session_id,
                "grant_already_recorded"
            );
            return;
        }

        tracing::info!(
            target: "gate",
            session_id = %session_id,
            user_id = user_id.map(String::as_str).unwrap_or("-"),
            "session_granted"
        );
        spawn_record_grant(
            Arc::clone(&self.profile_store),
            session_id.clone(),
            user_id.cloned(),
        );
    }

    async fn settle(
        &self,
        session_id: SessionId,
        user_id: Option<UserId>,
        mut messages: Vec<ChatMessage>,
        report: DetectionReport,
    ) {
        if report.granted {
            self.grant(&session_id, user_id.as_ref()).await;
        }

        if report.exhausted {
            tracing::warn!(
                target: "gate",
                session_id = %session_id,
                "turn_failed_in_band"
            );
            return;
        }

        messages.push(ChatMessage::assistant(report.reply));
        spawn_record_checkpoint(Arc::clone(&self.profile_store), session_id, messages);
    }
}
