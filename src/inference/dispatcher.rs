use std::{pin::Pin, sync::Arc};

use futures_core::Stream;
use futures_util::{StreamExt, stream};
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    gate::types::{ChatMessage, ChatRole},
    inference::{
        client::StreamingInferenceClient,
        credentials::{Credential, CredentialPool},
        error::InferenceError,
        telemetry::{DispatchTelemetryEvent, emit_dispatch_event},
        types::{DispatcherConfig, InferenceConfig, MARKER_PLACEHOLDER, SamplingConfig},
    },
};

/// Upper bound on credential selections for one dispatch, independent of pool size.
pub const MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchFragment {
    Text(String),
    /// Every attempt failed or the pool had nothing to offer. Always the last item.
    Exhausted(String),
}

pub type DispatchStream = Pin<Box<dyn Stream<Item = DispatchFragment> + Send>>;

#[derive(Clone)]
pub struct Dispatcher {
    pool: Arc<CredentialPool>,
    client: Arc<dyn StreamingInferenceClient>,
    sampling: SamplingConfig,
    system_prompt: String,
    modes: Vec<String>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<CredentialPool>,
        client: Arc<dyn StreamingInferenceClient>,
        inference: &InferenceConfig,
        config: DispatcherConfig,
        sentinel_marker: &str,
    ) -> Self {
        Self {
            pool,
            client,
            sampling: inference.sampling(),
            system_prompt: inference
                .system_prompt
                .replace(MARKER_PLACEHOLDER, sentinel_marker),
            modes: inference.modes.clone(),
            config,
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn sampling(&self) -> &SamplingConfig {
        &self.sampling
    }

    /// Streams one reply for `conversation`. Nothing touches the network until
    /// the returned stream is first polled; dropping it abandons the in-flight
    /// attempt without charging the credential.
    pub fn dispatch(&self, conversation: &[ChatMessage]) -> DispatchStream {
        let messages = self.prepare_messages(conversation);
        let fallback = self.fallback_for(conversation);
        let pool = Arc::clone(&self.pool);
        let client = Arc::clone(&self.client);
        let sampling = self.sampling.clone();
        let capacity = self.config.channel_capacity.max(1);

        let started = stream::once(async move {
            let (tx, rx) = mpsc::channel::<DispatchFragment>(capacity);
            let dispatch_id = Uuid::now_v7().to_string();
            let span = tracing::info_span!(
                target: "dispatcher",
                "dispatch",
                dispatch_id = %dispatch_id,
                model = %sampling.model,
                messages = messages.len()
            );
            tokio::spawn(
                run_dispatch(DispatchTask {
                    tx,
                    pool,
                    client,
                    messages,
                    sampling,
                    fallback,
                    dispatch_id,
                })
                .instrument(span),
            );
            ReceiverStream::new(rx)
        })
        .flatten();

        Box::pin(started)
    }

    /// System prompt (with the current persona mode) followed by the caller's
    /// non-system messages.
    pub fn prepare_messages(&self, conversation: &[ChatMessage]) -> Vec<ChatMessage> {
        let mut system = self.system_prompt.clone();
        if let Some(mode) = self.modes.choose(&mut rand::thread_rng()) {
            system.push_str("\nCURRENT MODE: ");
            system.push_str(mode);
        }

        let mut messages = Vec::with_capacity(conversation.len() + 1);
        messages.push(ChatMessage::system(system));
        messages.extend(
            conversation
                .iter()
                .filter(|message| message.role != ChatRole::System)
                .cloned(),
        );
        messages
    }

    /// The persona falls asleep on the first total failure and keeps snoring
    /// while the service stays down.
    pub fn fallback_for(&self, conversation: &[ChatMessage]) -> String {
        let already_dormant = conversation
            .iter()
            .rev()
            .find(|message| message.role == ChatRole::Assistant)
            .is_some_and(|message| {
                message.content == self.config.fallback_message || message.content.contains("Zzz")
            });

        if already_dormant
            && let Some(noise) = self.config.dormant_noises.choose(&mut rand::thread_rng())
        {
            return noise.clone();
        }

        self.config.fallback_message.clone()
    }
}

struct DispatchTask {
    tx: mpsc::Sender<DispatchFragment>,
    pool: Arc<CredentialPool>,
    client: Arc<dyn StreamingInferenceClient>,
    messages: Vec<ChatMessage>,
    sampling: SamplingConfig,
    fallback: String,
    dispatch_id: String,
}

async fn run_dispatch(task: DispatchTask) {
    let DispatchTask {
        tx,
        pool,
        client,
        messages,
        sampling,
        fallback,
        dispatch_id,
    } = task;
    let mut attempts = 0_u32;
    let mut forwarded = 0_usize;

    while attempts < MAX_ATTEMPTS {
        if tx.is_closed() {
            emit_dispatch_event(DispatchTelemetryEvent::Cancelled {
                dispatch_id,
                attempts,
            });
            return;
        }

        let Some(credential) = pool.select_credential().await else {
            emit_dispatch_event(DispatchTelemetryEvent::PoolExhausted {
                dispatch_id: dispatch_id.clone(),
                attempts,
            });
            break;
        };
        attempts += 1;
        emit_dispatch_event(DispatchTelemetryEvent::AttemptStarted {
            dispatch_id: dispatch_id.clone(),
            attempt: attempts,
            credential: credential.fingerprint().to_string(),
        });

        let opened = tokio::select! {
            _ = tx.closed() => {
                emit_dispatch_event(DispatchTelemetryEvent::Cancelled { dispatch_id, attempts });
                return;
            }
            opened = client.open(&credential, &messages, &sampling) => opened,
        };

        let mut fragments = match opened {
            Ok(fragments) => fragments,
            Err(err) => {
                record_failure(&pool, &credential, &err, &dispatch_id, attempts, false).await;
                continue;
            }
        };

        let mut emitted_output = false;
        let outcome: Result<(), InferenceError> = loop {
            tokio::select! {
                _ = tx.closed() => {
                    emit_dispatch_event(DispatchTelemetryEvent::Cancelled { dispatch_id, attempts });
                    return;
                }
                next = fragments.next() => match next {
                    None => break Ok(()),
                    Some(Err(err)) => break Err(err),
                    Some(Ok(fragment)) => {
                        if fragment.is_empty() {
                            continue;
                        }
                        if tx.send(DispatchFragment::Text(fragment)).await.is_err() {
                            emit_dispatch_event(DispatchTelemetryEvent::Cancelled { dispatch_id, attempts });
                            return;
                        }
                        emitted_output = true;
                        forwarded += 1;
                    }
                },
            }
        };

        match outcome {
            Ok(()) => {
                emit_dispatch_event(DispatchTelemetryEvent::Completed {
                    dispatch_id,
                    attempts,
                    fragments: forwarded,
                });
                return;
            }
            // Already forwarded fragments stay with the caller; the next
            // credential starts a fresh reply after them.
            Err(err) => {
                record_failure(
                    &pool,
                    &credential,
                    &err,
                    &dispatch_id,
                    attempts,
                    emitted_output,
                )
                .await;
            }
        }
    }

    emit_dispatch_event(DispatchTelemetryEvent::Failed {
        dispatch_id,
        attempts,
    });
    let _ = tx.send(DispatchFragment::Exhausted(fallback)).await;
}

async fn record_failure(
    pool: &CredentialPool,
    credential: &Credential,
    err: &InferenceError,
    dispatch_id: &str,
    attempt: u32,
    after_output: bool,
) {
    emit_dispatch_event(DispatchTelemetryEvent::AttemptFailed {
        dispatch_id: dispatch_id.to_string(),
        attempt,
        credential: credential.fingerprint().to_string(),
        kind: err.kind,
        after_output,
        error: err.message.clone(),
    });
    // Every failure kind gets the same cooldown; the kind is only logged.
    pool.report_failure(credential).await;
}
