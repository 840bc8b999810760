use std::{collections::HashMap, time::Duration};

use tokio::{sync::Mutex, time::Instant};

use crate::gate::types::{SessionId, SessionOutcome};

#[derive(Debug, Clone, Copy)]
struct LedgerEntry {
    outcome: SessionOutcome,
    last_seen: Instant,
}

/// In-process view of session outcomes, used to keep grants idempotent.
///
/// Entries idle for longer than `idle_ttl` are forgotten, and at most
/// `capacity` sessions are tracked; the least recently seen entry is evicted
/// first. A forgotten session reads as `InProgress` again.
#[derive(Debug)]
pub struct SessionLedger {
    outcomes: Mutex<HashMap<SessionId, LedgerEntry>>,
    idle_ttl: Duration,
    capacity: usize,
}

impl SessionLedger {
    pub fn new(idle_ttl: Duration, capacity: usize) -> Self {
        Self {
            outcomes: Mutex::new(HashMap::new()),
            idle_ttl,
            capacity: capacity.max(1),
        }
    }

    /// Current outcome. Reading a live entry counts as activity.
    pub async fn outcome(&self, session_id: &SessionId) -> SessionOutcome {
        let now = Instant::now();
        let mut outcomes = self.outcomes.lock().await;
        match outcomes.get_mut(session_id) {
            Some(entry) if now.duration_since(entry.last_seen) < self.idle_ttl => {
                entry.last_seen = now;
                entry.outcome
            }
            Some(_) => {
                outcomes.remove(session_id);
                SessionOutcome::InProgress
            }
            None => SessionOutcome::InProgress,
        }
    }

    /// Moves the session to `Granted`. Returns `true` only for the call that
    /// performed the transition.
    pub async fn mark_granted(&self, session_id: &SessionId) -> bool {
        let now = Instant::now();
        let mut outcomes = self.outcomes.lock().await;
        self.prune(&mut outcomes, now);

        if let Some(entry) = outcomes.get_mut(session_id) {
            entry.last_seen = now;
            if entry.outcome == SessionOutcome::Granted {
                return false;
            }
            entry.outcome = SessionOutcome::Granted;
            return true;
        }

        if outcomes.len() >= self.capacity
            && let Some(oldest) = outcomes
                .iter()
                .min_by_key(|(_, entry)| entry.last_seen)
                .map(|(id, _)| id.clone())
        {
            outcomes.remove(&oldest);
            tracing::debug!(
                target: "gate",
                session_id = %oldest,
                capacity = self.capacity,
                "session_ledger_evicted"
            );
        }
        outcomes.insert(
            session_id.clone(),
            LedgerEntry {
                outcome: SessionOutcome::Granted,
                last_seen: now,
            },
        );
        true
    }

    pub async fn granted_count(&self) -> usize {
        let now = Instant::now();
        let mut outcomes = self.outcomes.lock().await;
        self.prune(&mut outcomes, now);
        outcomes
            .values()
            .filter(|entry| entry.outcome == SessionOutcome::Granted)
            .count()
    }

    pub async fn tracked(&self) -> usize {
        self.outcomes.lock().await.len()
    }

    fn prune(&self, outcomes: &mut HashMap<SessionId, LedgerEntry>, now: Instant) {
        let before = outcomes.len();
        outcomes.retain(|_, entry| now.duration_since(entry.last_seen) < self.idle_ttl);
        let expired = before - outcomes.len();
        if expired > 0 {
            tracing::debug!(target: "gate", expired, "session_ledger_pruned");
        }
    }
}
