use std::pin::Pin;

use futures_core::Stream;
use serde::{Deserialize, Serialize};

pub type SessionId = String;
pub type UserId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    InProgress,
    Granted,
    /// Applied by the profile store on timeout; never set by the gate itself.
    Abandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub user_id: Option<UserId>,
}

/// What the caller sees for one turn. The last item of a turn may be a
/// `GateOpen` or `Failure` notice; everything before it is model text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateFragment {
    Text(String),
    GateOpen(String),
    Failure(String),
}

impl GateFragment {
    pub fn text(&self) -> &str {
        match self {
            GateFragment::Text(text)
            | GateFragment::GateOpen(text)
            | GateFragment::Failure(text) => text,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, GateFragment::Text(_))
    }
}

pub type GateStream = Pin<Box<dyn Stream<Item = GateFragment> + Send>>;

pub struct GateTurn {
    pub session_id: SessionId,
    pub stream: GateStream,
}

pub const DEFAULT_SENTINEL_MARKER: &str = "[[GATE:7f3a9c]]";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_sentinel_marker")]
    pub sentinel_marker: String,
    #[serde(default = "default_gate_open_signal")]
    pub gate_open_signal: String,
    #[serde(default = "default_kill_switch_message")]
    pub kill_switch_message: String,
    #[serde(default)]
    pub kill_switch_enabled: bool,
    #[serde(default)]
    pub crisis_phrase: String,
    #[serde(default = "default_crisis_message")]
    pub crisis_message: String,
    #[serde(default = "default_persistence_threshold")]
    pub persistence_threshold: usize,
    #[serde(default = "default_persistence_message")]
    pub persistence_message: String,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    /// Ledger entries idle this long are forgotten.
    #[serde(default = "default_session_idle_ttl_secs")]
    pub session_idle_ttl_secs: u64,
    #[serde(default = "default_max_tracked_sessions")]
    pub max_tracked_sessions: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            sentinel_marker: default_sentinel_marker(),
            gate_open_signal: default_gate_open_signal(),
            kill_switch_message: default_kill_switch_message(),
            kill_switch_enabled: false,
            crisis_phrase: String::new(),
            crisis_message: default_crisis_message(),
            persistence_threshold: default_persistence_threshold(),
            persistence_message: default_persistence_message(),
            history_window: default_history_window(),
            max_messages: default_max_messages(),
            max_message_chars: default_max_message_chars(),
            session_idle_ttl_secs: default_session_idle_ttl_secs(),
            max_tracked_sessions: default_max_tracked_sessions(),
        }
    }
}

fn default_sentinel_marker() -> String {
    DEFAULT_SENTINEL_MARKER.to_string()
}

fn default_gate_open_signal() -> String {
    "[ACCESS GRANTED]".to_string()
}

fn default_kill_switch_message() -> String {
    "Protocol Override. The Gatekeeper is offline. You may pass.".to_string()
}

fn default_crisis_message() -> String {
    "Override acknowledged. You may pass.".to_string()
}

fn default_persistence_threshold() -> usize {
    40
}

fn default_persistence_message() -> String {
    "Your persistence borders on the absurd. Fine. You may pass.".to_string()
}

fn default_history_window() -> usize {
    10
}

fn default_max_messages() -> usize {
    64
}

fn default_max_message_chars() -> usize {
    1000
}

fn default_session_idle_ttl_secs() -> u64 {
    6 * 60 * 60
}

fn default_max_tracked_sessions() -> usize {
    10_000
}
