use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};
use tokio::{sync::Mutex, time::Instant};

use crate::inference::types::CredentialsConfig;

/// A credential is excluded from selection for this long after a failure.
pub const COOLDOWN: Duration = Duration::from_secs(60);
/// When every credential is cooling down, the oldest failure must be at least
/// this old before it is reused.
pub const MIN_GRACE: Duration = Duration::from_secs(10);

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential {
    slot: usize,
    secret: Arc<str>,
    fingerprint: Arc<str>,
}

impl Credential {
    fn new(slot: usize, secret: &str) -> Self {
        Self {
            slot,
            secret: Arc::from(secret),
            fingerprint: Arc::from(fingerprint(secret).as_str()),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("slot", &self.slot)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Short, non-reversible identifier safe to put in logs.
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    digest
        .iter()
        .take(4)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub total: usize,
    pub cooling: usize,
}

pub struct CredentialPool {
    credentials: Vec<Credential>,
    failed_at: Mutex<HashMap<usize, Instant>>,
}

impl CredentialPool {
    /// Registers every non-blank secret once, in the given order.
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut credentials: Vec<Credential> = Vec::new();
        for secret in secrets {
            let secret = secret.as_ref().trim();
            if secret.is_empty() || credentials.iter().any(|c| c.secret() == secret) {
                continue;
            }
            credentials.push(Credential::new(credentials.len(), secret));
        }

        Self {
            credentials,
            failed_at: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_env(config: &CredentialsConfig) -> Self {
        Self::new(collect_secrets(config, |name| std::env::var(name).ok()))
    }

    pub fn count(&self) -> usize {
        self.credentials.len()
    }

    pub async fn select_credential(&self) -> Option<Credential> {
        let now = Instant::now();
        let mut failed_at = self.failed_at.lock().await;

        failed_at.retain(|_, failed| now.duration_since(*failed) <= COOLDOWN);

        let candidates: Vec<&Credential> = self
            .credentials
            .iter()
            .filter(|credential| !failed_at.contains_key(&credential.slot))
            .collect();

        if let Some(chosen) = candidates.choose(&mut rand::thread_rng()) {
            return Some((*chosen).clone());
        }

        let (&oldest_slot, &oldest_failure) =
            failed_at.iter().min_by_key(|(_, failed)| **failed)?;
        let idle = now.duration_since(oldest_failure);
        if idle < MIN_GRACE {
            tracing::warn!(
                target: "credential_pool",
                total = self.credentials.len(),
                oldest_failure_age_ms = idle.as_millis() as u64,
                "credential_pool_exhausted"
            );
            return None;
        }

        failed_at.remove(&oldest_slot);
        let credential = self.credentials.get(oldest_slot)?.clone();
        tracing::warn!(
            target: "credential_pool",
            credential = %credential.fingerprint(),
            oldest_failure_age_ms = idle.as_millis() as u64,
            "credential_forced_resurrection"
        );
        Some(credential)
    }

    pub async fn report_failure(&self, credential: &Credential) {
        if self.credentials.get(credential.slot) != Some(credential) {
            tracing::warn!(
                target: "credential_pool",
                credential = %credential.fingerprint(),
                "failure_reported_for_unknown_credential"
            );
            return;
        }

        let mut failed_at = self.failed_at.lock().await;
        failed_at.insert(credential.slot, Instant::now());
        tracing::info!(
            target: "credential_pool",
            credential = %credential.fingerprint(),
            cooling = failed_at.len(),
            total = self.credentials.len(),
            "credential_cooldown_started"
        );
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        let now = Instant::now();
        let failed_at = self.failed_at.lock().await;
        let cooling = failed_at
            .values()
            .filter(|failed| now.duration_since(**failed) <= COOLDOWN)
            .count();
        PoolSnapshot {
            total: self.credentials.len(),
            cooling,
        }
    }
}

/// Reads secrets from the comma separated list variable, falling back to the
/// single variable, then appends numbered `<single>_1`, `<single>_2`, ... until
/// the first gap.
pub fn collect_secrets<F>(config: &CredentialsConfig, lookup: F) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut secrets: Vec<String> = lookup(&config.list_env)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    if secrets.is_empty()
        && let Some(single) = lookup(&config.single_env)
        && !single.trim().is_empty()
    {
        secrets.push(single.trim().to_string());
    }

    let mut index = 1;
    while let Some(numbered) = lookup(&format!("{}_{}", config.single_env, index)) {
        let numbered = numbered.trim().to_string();
        if !numbered.is_empty() && !secrets.contains(&numbered) {
            secrets.push(numbered);
        }
        index += 1;
    }

    secrets
}
