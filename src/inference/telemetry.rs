use crate::inference::error::InferenceErrorKind;

#[derive(Debug, Clone)]
pub enum DispatchTelemetryEvent {
    AttemptStarted {
        dispatch_id: String,
        attempt: u32,
        credential: String,
    },
    AttemptFailed {
        dispatch_id: String,
        attempt: u32,
        credential: String,
        kind: InferenceErrorKind,
        after_output: bool,
        error: String,
    },
    PoolExhausted {
        dispatch_id: String,
        attempts: u32,
    },
    Completed {
        dispatch_id: String,
        attempts: u32,
        fragments: usize,
    },
    Failed {
        dispatch_id: String,
        attempts: u32,
    },
    Cancelled {
        dispatch_id: String,
        attempts: u32,
    },
}

pub fn emit_dispatch_event(event: DispatchTelemetryEvent) {
    match event {
        DispatchTelemetryEvent::AttemptStarted {
            dispatch_id,
            attempt,
            credential,
        } => {
            tracing::debug!(
                target: "dispatcher",
                dispatch_id = %dispatch_id,
                attempt = attempt,
                credential = %credential,
                "attempt_started"
            );
        }
        DispatchTelemetryEvent::AttemptFailed {
            dispatch_id,
            attempt,
            credential,
            kind,
            after_output,
            error,
        } => {
            tracing::warn!(
                target: "dispatcher",
                dispatch_id = %dispatch_id,
                attempt = attempt,
                credential = %credential,
                kind = kind.as_str(),
                after_output = after_output,
                error = %error,
                "attempt_failed"
            );
        }
        DispatchTelemetryEvent::PoolExhausted {
            dispatch_id,
            attempts,
        } => {
            tracing::warn!(
                target: "dispatcher",
                dispatch_id = %dispatch_id,
                attempts = attempts,
                "credential_pool_exhausted"
            );
        }
        DispatchTelemetryEvent::Completed {
            dispatch_id,
            attempts,
            fragments,
        } => {
            tracing::info!(
                target: "dispatcher",
                dispatch_id = %dispatch_id,
                attempts = attempts,
                fragments = fragments,
                "dispatch_completed"
            );
        }
        DispatchTelemetryEvent::Failed {
            dispatch_id,
            attempts,
        } => {
            tracing::error!(
                target: "dispatcher",
                dispatch_id = %dispatch_id,
                attempts = attempts,
                "dispatch_failed_all_attempts"
            );
        }
        DispatchTelemetryEvent::Cancelled {
            dispatch_id,
            attempts,
        } => {
            tracing::info!(
                target: "dispatcher",
                dispatch_id = %dispatch_id,
                attempts = attempts,
                "dispatch_cancelled"
            );
        }
    }
}
