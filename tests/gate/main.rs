mod detector;

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{StreamExt, stream};

use gatekeeper::{
    gate::{
        profile::{ProfileStore, ProfileStoreError},
        types::{ChatMessage, GateFragment, GateStream, SessionId, UserId},
    },
    inference::{
        client::{FragmentStream, StreamingInferenceClient},
        credentials::Credential,
        error::{InferenceError, InferenceErrorKind},
        types::SamplingConfig,
    },
};

pub const MARKER: &str = "[[GATE:test]]";

/// Answers every call with the same fragments, or fails every call when
/// `fragments` is `None`.
pub struct FixedReplyClient {
    fragments: Option<Vec<String>>,
    calls: AtomicUsize,
    seen_messages: Mutex<Vec<Vec<ChatMessage>>>,
}

impl FixedReplyClient {
    pub fn replying(fragments: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            fragments: Some(fragments.iter().map(|f| f.to_string()).collect()),
            calls: AtomicUsize::new(0),
            seen_messages: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fragments: None,
            calls: AtomicUsize::new(0),
            seen_messages: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_messages(&self) -> Vec<ChatMessage> {
        self.seen_messages
            .lock()
            .expect("lock")
            .last()
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl StreamingInferenceClient for FixedReplyClient {
    async fn open(
        &self,
        _credential: &Credential,
        messages: &[ChatMessage],
        _sampling: &SamplingConfig,
    ) -> Result<FragmentStream, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_messages
            .lock()
            .expect("lock")
            .push(messages.to_vec());

        match &self.fragments {
            Some(fragments) => Ok(Box::pin(stream::iter(
                fragments.clone().into_iter().map(Ok),
            ))),
            None => Err(InferenceError::new(
                InferenceErrorKind::RateLimited,
                "429 too many requests",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Grant(SessionId, Option<UserId>),
    Checkpoint(SessionId, Vec<ChatMessage>),
}

#[derive(Default)]
pub struct RecordingProfileStore {
    events: Mutex<Vec<Recorded>>,
    unreachable: bool,
}

impl RecordingProfileStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn unreachable() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            unreachable: true,
        })
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().expect("lock").clone()
    }

    pub fn grants(&self) -> Vec<(SessionId, Option<UserId>)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Recorded::Grant(session, user) => Some((session, user)),
                Recorded::Checkpoint(..) => None,
            })
            .collect()
    }

    pub fn checkpoints(&self) -> Vec<(SessionId, Vec<ChatMessage>)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Recorded::Checkpoint(session, messages) => Some((session, messages)),
                Recorded::Grant(..) => None,
            })
            .collect()
    }
}

#[async_trait]
impl ProfileStore for RecordingProfileStore {
    async fn record_grant(
        &self,
        session_id: &SessionId,
        user_id: Option<&UserId>,
    ) -> Result<(), ProfileStoreError> {
        self.events
            .lock()
            .expect("lock")
            .push(Recorded::Grant(session_id.clone(), user_id.cloned()));
        if self.unreachable {
            return Err(ProfileStoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    async fn record_checkpoint(
        &self,
        session_id: &SessionId,
        messages: &[ChatMessage],
    ) -> Result<(), ProfileStoreError> {
        self.events
            .lock()
            .expect("lock")
            .push(Recorded::Checkpoint(session_id.clone(), messages.to_vec()));
        if self.unreachable {
            return Err(ProfileStoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

pub async fn drain(stream: GateStream) -> Vec<GateFragment> {
    stream.collect().await
}

/// Polls `condition` until it holds; background persistence runs on spawned tasks.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition did not hold in time");
}

/// Gives spawned background tasks a chance to run before asserting on absence.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}
