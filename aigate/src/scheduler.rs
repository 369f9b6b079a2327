//! Credential acquisition: tiered selection with idle/busy sub-tiers,
//! balanced or sequential rotation, fair-cycle filtering, and deadline-bound
//! waits for a slot to open.

use crate::auth::registry::CredentialStore;
use crate::auth::tokens::TokenManager;
use crate::auth::CredentialRecord;
use crate::error::GatewayError;
use crate::providers::{ProviderAdapter, RotationMode};
use crate::usage::{now_ms, AttemptOutcome, UsageManager};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;

pub struct CredentialScheduler {
    adapter: Arc<dyn ProviderAdapter>,
    store: Arc<CredentialStore>,
    tokens: TokenManager,
    usage: Arc<UsageManager>,
}

/// A reserved (credential, model) slot. Completing the lease reports the
/// outcome; dropping it un-reported releases the slot without touching
/// counters or cooldowns.
pub struct Lease {
    usage: Arc<UsageManager>,
    record: CredentialRecord,
    tier: u8,
    model: String,
    completed: bool,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("record", &self.record)
            .field("tier", &self.tier)
            .field("model", &self.model)
            .field("completed", &self.completed)
            .finish()
    }
}

impl Lease {
    pub fn credential(&self) -> &CredentialRecord {
        &self.record
    }

    pub fn tier(&self) -> u8 {
        self.tier
    }

    pub fn complete(mut self, outcome: AttemptOutcome<'_>) {
        self.usage
            .end_attempt(&self.record.id, &self.model, self.tier, outcome, now_ms());
        self.completed = true;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.completed {
            self.usage.end_attempt(
                &self.record.id,
                &self.model,
                self.tier,
                AttemptOutcome::Aborted,
                now_ms(),
            );
        }
    }
}

struct Candidate {
    record: CredentialRecord,
    tier: u8,
    in_flight: u32,
    window_usage: u64,
}

impl CredentialScheduler {
    pub fn new(
        adapter: Arc<dyn ProviderAdapter>,
        store: Arc<CredentialStore>,
        tokens: TokenManager,
        usage: Arc<UsageManager>,
    ) -> Self {
        Self { adapter, store, tokens, usage }
    }

    /// Select a credential for `model` and reserve a slot on it, waiting for
    /// releases or cooldown expiries until `deadline`.
    ///
    /// Waiters are not FIFO: every wake re-runs the exclusion scan, so a key
    /// that just finished a cooldown is immediately eligible again.
    pub async fn acquire(&self, model: &str, deadline: Instant) -> Result<Lease, GatewayError> {
        let notify = self.usage.notifier();
        loop {
            // Register the waiter before scanning so a release between the
            // scan and the wait cannot be missed.
            let mut notified = std::pin::pin!(notify.notified());
            notified.as_mut().enable();

            if let Some(lease) = self.try_acquire(model) {
                return Ok(lease);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.no_key_error(model));
            }

            // Wake at the earliest cooldown expiry, a release, or the
            // deadline, whichever comes first.
            let wall_now = now_ms();
            let wake_at = match self.usage.earliest_cooldown_expiry(model, wall_now) {
                Some(expiry_ms) => {
                    let delta = (expiry_ms - wall_now).max(0) as u64;
                    deadline.min(now + std::time::Duration::from_millis(delta))
                }
                None => deadline,
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }

            if Instant::now() >= deadline {
                // One final scan: a cooldown may expire exactly at the
                // deadline.
                if let Some(lease) = self.try_acquire(model) {
                    return Ok(lease);
                }
                return Err(self.no_key_error(model));
            }
        }
    }

    fn no_key_error(&self, model: &str) -> GatewayError {
        GatewayError::NoKeyAvailable {
            detail: format!(
                "all {} credentials cooling down or busy for {model}",
                self.adapter.tag()
            ),
            next_reset_ms: self.usage.earliest_cooldown_expiry(model, now_ms()),
        }
    }

    /// One pass over the exclusion and selection ladder.
    fn try_acquire(&self, model: &str) -> Option<Lease> {
        let now = now_ms();
        let ids = self.store.list(self.adapter.tag());
        let ids = self.usage.filter_fair_cycle(ids, model, now);

        let mut by_tier: BTreeMap<u8, Vec<Candidate>> = BTreeMap::new();
        for id in ids {
            let Some(record) = self.store.load(&id) else { continue };
            let tier = self.adapter.assign_tier(&record);
            if !self.tokens.is_available(&id) {
                continue;
            }
            if let Some(required) = self.adapter.min_tier(model) {
                if tier > required {
                    continue;
                }
            }
            if !self.usage.is_available(&id, tier, model, now) {
                continue;
            }
            let candidate = Candidate {
                tier,
                in_flight: self.usage.in_flight(&id),
                window_usage: self.usage.window_usage(&id, model),
                record,
            };
            by_tier.entry(tier).or_default().push(candidate);
        }

        for (_, tier_group) in by_tier {
            let (idle, busy): (Vec<Candidate>, Vec<Candidate>) =
                tier_group.into_iter().partition(|c| c.in_flight == 0);
            for mut sub_tier in [idle, busy] {
                while !sub_tier.is_empty() {
                    let index = self.pick(&sub_tier);
                    let candidate = sub_tier.swap_remove(index);
                    match self
                        .usage
                        .begin_attempt(&candidate.record.id, model, candidate.tier)
                    {
                        Ok(()) => {
                            self.usage.mark_used(&candidate.record.id, model, now);
                            tracing::debug!(
                                provider = self.adapter.tag(),
                                credential = %candidate.record.display_label(),
                                model,
                                tier = candidate.tier,
                                "credential acquired"
                            );
                            return Some(Lease {
                                usage: Arc::clone(&self.usage),
                                record: candidate.record,
                                tier: candidate.tier,
                                model: model.to_string(),
                                completed: false,
                            });
                        }
                        // Raced into a full credential; try the next one.
                        Err(_) => continue,
                    }
                }
            }
        }
        None
    }

    /// Index of the next candidate under the adapter's rotation mode.
    fn pick(&self, candidates: &[Candidate]) -> usize {
        match self.adapter.rotation_mode() {
            RotationMode::Sequential => candidates
                .iter()
                .enumerate()
                .max_by_key(|(_, c)| (c.window_usage, std::cmp::Reverse(c.record.id.clone())))
                .map(|(i, _)| i)
                .unwrap_or(0),
            RotationMode::Balanced { tolerance } if tolerance <= 0.0 => candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| (c.window_usage, c.record.id.clone()))
                .map(|(i, _)| i)
                .unwrap_or(0),
            RotationMode::Balanced { tolerance } => {
                // Weight toward the least-used; the exponent flattens as the
                // tolerance grows.
                let exponent = 1.0 / tolerance;
                let weights: Vec<f64> = candidates
                    .iter()
                    .map(|c| (1.0 / (1.0 + c.window_usage as f64)).powf(exponent))
                    .collect();
                let total: f64 = weights.iter().sum();
                if total <= 0.0 {
                    return 0;
                }
                let mut roll = rand::rng().random_range(0.0..total);
                for (index, weight) in weights.iter().enumerate() {
                    if roll < *weight {
                        return index;
                    }
                    roll -= weight;
                }
                candidates.len() - 1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ResilientWriter, StatePaths};
    use crate::types::*;
    use crate::usage::{UsageConfig, UsageManager};
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use serde_json::json;
    use std::time::Duration;

    struct TestAdapter {
        rotation: RotationMode,
        fair_cycle: bool,
    }

    #[async_trait]
    impl ProviderAdapter for TestAdapter {
        fn tag(&self) -> &str {
            "testprov"
        }

        fn models(&self) -> Vec<ModelDef> {
            Vec::new()
        }

        fn rotation_mode(&self) -> RotationMode {
            self.rotation
        }

        fn usage_config(&self) -> UsageConfig {
            let mut config = UsageConfig::new("testprov");
            config.max_concurrent = 2;
            config.fair_cycle = self.fair_cycle;
            config
        }

        async fn chat(
            &self,
            _request: &ChatRequest,
            _auth: &crate::providers::AdapterAuth,
        ) -> Result<AssistantMessage, GatewayError> {
            Err(GatewayError::Other("not wired in tests".into()))
        }

        fn stream_chat(
            &self,
            _request: &ChatRequest,
            _auth: &crate::providers::AdapterAuth,
        ) -> BoxStream<'static, Result<StreamEvent, GatewayError>> {
            Box::pin(futures::stream::empty())
        }
    }

    fn oauth_file_json(email: &str) -> String {
        json!({
            "access_token": "at",
            "refresh_token": "rt",
            "expiry_date": i64::MAX,
            "token_uri": "https://oauth2.example/token",
            "_proxy_metadata": {"email": email}
        })
        .to_string()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        scheduler: CredentialScheduler,
        usage: Arc<UsageManager>,
        ids: Vec<String>,
    }

    async fn fixture(credentials: usize, rotation: RotationMode, fair_cycle: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path());
        for index in 0..credentials {
            let path = paths.oauth_cred_file("testprov", index as u32);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, oauth_file_json(&format!("u{index}@example.com"))).unwrap();
        }
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(TestAdapter { rotation, fair_cycle });
        let store = Arc::new(CredentialStore::open(paths.clone(), &["testprov"]));
        let writer = ResilientWriter::new(false);
        let usage = UsageManager::open(
            adapter.usage_config(),
            writer.clone(),
            paths.usage_file("testprov"),
        );
        let tokens = TokenManager::new(Arc::clone(&store), writer, reqwest::Client::new());
        let ids = store.list("testprov");
        let scheduler =
            CredentialScheduler::new(adapter, store, tokens, Arc::clone(&usage));
        Fixture { _dir: dir, scheduler, usage, ids }
    }

    #[tokio::test]
    async fn acquire_prefers_idle_credentials() {
        let f = fixture(2, RotationMode::Balanced { tolerance: 0.0 }, false).await;
        let deadline = Instant::now() + Duration::from_secs(5);

        let first = f.scheduler.acquire("m", deadline).await.unwrap();
        let second = f.scheduler.acquire("m", deadline).await.unwrap();
        // Both credentials busy once each before anyone doubles up.
        assert_ne!(first.credential().id, second.credential().id);
    }

    #[tokio::test]
    async fn acquire_skips_cooled_down_credentials() {
        let f = fixture(2, RotationMode::Balanced { tolerance: 0.0 }, false).await;
        let deadline = Instant::now() + Duration::from_secs(5);
        let now = now_ms();
        f.usage.apply_quota_reset(&f.ids[0], "m", now + 600_000, now);

        for _ in 0..2 {
            let lease = f.scheduler.acquire("m", deadline).await.unwrap();
            assert_eq!(lease.credential().id, f.ids[1]);
            lease.complete(AttemptOutcome::Success(&Usage::default()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_fails_with_no_key_at_deadline() {
        let f = fixture(1, RotationMode::Balanced { tolerance: 0.0 }, false).await;
        let now = now_ms();
        f.usage.apply_quota_reset(&f.ids[0], "m", now + 600_000, now);

        let deadline = Instant::now() + Duration::from_secs(2);
        let err = f.scheduler.acquire("m", deadline).await.unwrap_err();
        match err {
            GatewayError::NoKeyAvailable { next_reset_ms, .. } => {
                assert!(next_reset_ms.is_some());
            }
            other => panic!("expected NoKeyAvailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn release_wakes_waiter() {
        let f = fixture(1, RotationMode::Balanced { tolerance: 0.0 }, false).await;
        let deadline = Instant::now() + Duration::from_secs(5);

        // Saturate the only credential (max_concurrent = 2).
        let a = f.scheduler.acquire("m", deadline).await.unwrap();
        let b = f.scheduler.acquire("m", deadline).await.unwrap();

        let pending = f.scheduler.acquire("m", deadline);
        tokio::pin!(pending);

        // Not ready while both slots are held.
        tokio::select! {
            _ = &mut pending => panic!("acquired despite full slots"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }

        a.complete(AttemptOutcome::Success(&Usage::default()));
        let lease = pending.await.unwrap();
        drop(lease);
        drop(b);
    }

    #[tokio::test]
    async fn sequential_mode_sticks_to_most_used() {
        let f = fixture(2, RotationMode::Sequential, false).await;
        let deadline = Instant::now() + Duration::from_secs(5);
        let usage = Usage { total_tokens: 1, ..Usage::default() };

        // Give the first credential some history.
        let lease = f.scheduler.acquire("m", deadline).await.unwrap();
        let sticky = lease.credential().id.clone();
        lease.complete(AttemptOutcome::Success(&usage));

        for _ in 0..3 {
            let lease = f.scheduler.acquire("m", deadline).await.unwrap();
            assert_eq!(lease.credential().id, sticky);
            lease.complete(AttemptOutcome::Success(&usage));
        }
    }

    #[tokio::test]
    async fn balanced_strict_picks_least_used() {
        let f = fixture(2, RotationMode::Balanced { tolerance: 0.0 }, false).await;
        let deadline = Instant::now() + Duration::from_secs(5);
        let usage = Usage::default();

        // Alternates between the two credentials.
        let mut last = String::new();
        for round in 0..4 {
            let lease = f.scheduler.acquire("m", deadline).await.unwrap();
            let id = lease.credential().id.clone();
            if round > 0 {
                assert_ne!(id, last, "least-used rotation should alternate");
            }
            last = id;
            lease.complete(AttemptOutcome::Success(&usage));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fair_cycle_rotates_through_all_before_reuse() {
        let f = fixture(3, RotationMode::Sequential, true).await;
        let deadline = Instant::now() + Duration::from_secs(1);
        let now = now_ms();

        // Credential 0 forced onto a 10-minute quota cooldown.
        f.usage.apply_quota_reset(&f.ids[0], "m", now + 600_000, now);

        // The next two requests drain the two remaining credentials in some
        // order, never repeating.
        let first = f.scheduler.acquire("m", deadline).await.unwrap();
        let first_id = first.credential().id.clone();
        first.complete(AttemptOutcome::Success(&Usage::default()));

        let second = f.scheduler.acquire("m", deadline).await.unwrap();
        let second_id = second.credential().id.clone();
        second.complete(AttemptOutcome::Success(&Usage::default()));

        assert_ne!(first_id, f.ids[0]);
        assert_ne!(second_id, f.ids[0]);
        assert_ne!(first_id, second_id);

        // Everyone is used or cooling down: the fourth request waits out its
        // deadline instead of reusing a credential.
        let err = f
            .scheduler
            .acquire("m", Instant::now() + Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoKeyAvailable { .. }));
    }
}
