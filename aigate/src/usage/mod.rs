//! Per-provider usage accounting: windows, counters, concurrency slots,
//! cooldowns, quota groups, custom caps, and fair-cycle rotation state.

pub mod caps;
pub mod cooldown;

use crate::error::GatewayError;
use crate::store::ResilientWriter;
use crate::types::Usage;
use caps::{resolve_cap, CustomCap};
use cooldown::{
    transient_cooldown_s, Cooldown, CooldownKind, FairCycleState, AUTH_LOCKOUT_S,
    EXHAUSTION_COOLDOWN_THRESHOLD_S,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Delay between a state mutation and the persisted snapshot.
const PERSIST_DEBOUNCE: Duration = Duration::from_secs(2);

/// Window for the dead-key heuristic: this many distinct models failing on
/// one credential inside the window promotes to a credential-wide lockout.
const DEAD_KEY_WINDOW_MS: i64 = 60_000;
const DEAD_KEY_DISTINCT_MODELS: usize = 3;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Configuration (declared by the provider adapter)
// ---------------------------------------------------------------------------

/// How usage windows reset for a tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetMode {
    /// Independent window per model, advanced by authoritative resets.
    PerModel { default_window_ms: i64 },
    /// One rolling window per credential.
    Credential { window_ms: i64 },
    /// Legacy: reset at a fixed UTC hour.
    Daily { utc_hour: u32 },
}

/// A named set of models sharing one quota bucket at the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaGroup {
    pub name: String,
    pub models: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct UsageConfig {
    pub provider: String,
    /// Base concurrent in-flight calls per credential.
    pub max_concurrent: u32,
    /// Tier -> concurrency multiplier; absent tiers use 1.
    pub tier_multipliers: HashMap<u8, u32>,
    /// Tier -> reset mode; absent tiers use `default_reset`.
    pub reset_modes: HashMap<u8, ResetMode>,
    pub default_reset: ResetMode,
    pub quota_groups: Vec<QuotaGroup>,
    pub custom_caps: Vec<CustomCap>,
    pub fair_cycle: bool,
}

impl UsageConfig {
    pub fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            max_concurrent: 4,
            tier_multipliers: HashMap::new(),
            reset_modes: HashMap::new(),
            default_reset: ResetMode::PerModel { default_window_ms: 5 * 60 * 1000 },
            quota_groups: Vec::new(),
            custom_caps: Vec::new(),
            fair_cycle: false,
        }
    }

    pub fn multiplier(&self, tier: u8) -> u32 {
        self.tier_multipliers.get(&tier).copied().unwrap_or(1)
    }

    pub fn reset_mode(&self, tier: u8) -> ResetMode {
        self.reset_modes.get(&tier).copied().unwrap_or(self.default_reset)
    }

    pub fn group_of(&self, model: &str) -> Option<&QuotaGroup> {
        self.quota_groups.iter().find(|g| g.models.iter().any(|m| m == model))
    }

    /// Models sharing the quota bucket of `model`, including itself.
    fn bucket_members(&self, model: &str) -> Vec<String> {
        match self.group_of(model) {
            Some(group) => group.models.clone(),
            None => vec![model.to_string()],
        }
    }

    /// Fair-cycle tracking scope for a model: its quota group when it has
    /// one, otherwise the credential-wide scope.
    fn scope_key(&self, model: &str) -> String {
        match self.group_of(model) {
            Some(group) => format!("group:{}", group.name),
            None => "credential".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Usage inside the current window for one (credential, model) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub window_start_ms: i64,
    /// Authoritative reset from the provider; 0 when unknown.
    pub quota_reset_ms: i64,
    pub success_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_remaining_fraction: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_fetched_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_at_baseline: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_max_requests: Option<u64>,
}

impl UsageRecord {
    fn reset_window(&mut self, now_ms: i64) {
        let preserved_reset = if self.quota_reset_ms > now_ms { self.quota_reset_ms } else { 0 };
        *self = UsageRecord {
            window_start_ms: now_ms,
            quota_reset_ms: preserved_reset,
            quota_max_requests: self.quota_max_requests,
            ..UsageRecord::default()
        };
    }
}

/// Per-credential lifetime aggregate across all models.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateUsage {
    pub success_count: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CredentialUsage {
    models: BTreeMap<String, UsageRecord>,
    total: AggregateUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CooldownEntry {
    credential: String,
    /// `None` means credential-wide.
    model: Option<String>,
    #[serde(flatten)]
    cooldown: Cooldown,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    credentials: BTreeMap<String, CredentialUsage>,
    cooldowns: Vec<CooldownEntry>,
    #[serde(default)]
    fair_cycle: BTreeMap<String, FairCycleState>,
}

#[derive(Default)]
struct State {
    credentials: BTreeMap<String, CredentialUsage>,
    cooldowns: HashMap<(String, Option<String>), Cooldown>,
    /// Transient-failure ladder position per (credential, model).
    strikes: HashMap<(String, String), u32>,
    in_flight: HashMap<(String, String), u32>,
    in_flight_per_credential: HashMap<String, u32>,
    fair_cycle: HashMap<String, FairCycleState>,
    /// Until when a credential counts as exhausted within a fair-cycle
    /// scope (set by cooldowns at or above the exhaustion threshold).
    exhausted_until: HashMap<(String, String), i64>,
    /// Recent failing (model, timestamp) pairs per credential, for the
    /// dead-key heuristic.
    recent_failures: HashMap<String, Vec<(String, i64)>>,
}

/// Outcome reported back to `end_attempt`.
pub enum AttemptOutcome<'a> {
    Success(&'a Usage),
    Failure(&'a GatewayError),
    /// Cancelled before an upstream verdict; releases the slot only.
    Aborted,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct UsageManager {
    config: UsageConfig,
    state: Mutex<State>,
    writer: ResilientWriter,
    path: PathBuf,
    notify: Arc<Notify>,
    persist_tx: tokio::sync::mpsc::UnboundedSender<()>,
}

impl UsageManager {
    pub fn open(config: UsageConfig, writer: ResilientWriter, path: PathBuf) -> Arc<Self> {
        let mut state = State::default();
        if let Some(value) = writer.load(&path) {
            match serde_json::from_value::<PersistedState>(value) {
                Ok(persisted) => {
                    state.credentials = persisted.credentials;
                    for entry in persisted.cooldowns {
                        state
                            .cooldowns
                            .insert((entry.credential, entry.model), entry.cooldown);
                    }
                    state.fair_cycle = persisted.fair_cycle.into_iter().collect();
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "discarding unreadable usage state");
                }
            }
        }

        let (persist_tx, persist_rx) = tokio::sync::mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            config,
            state: Mutex::new(state),
            writer,
            path,
            notify: Arc::new(Notify::new()),
            persist_tx,
        });
        spawn_persist_worker(&manager, persist_rx);
        manager
    }

    pub fn config(&self) -> &UsageConfig {
        &self.config
    }

    /// Scheduler waiters park on this and are woken by releases and cooldown
    /// changes.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    // -- slots ---------------------------------------------------------------

    /// Reserve a concurrency slot. Fails with `Overloaded` when the
    /// credential is at `max_concurrent * tier_multiplier`.
    pub fn begin_attempt(&self, credential: &str, model: &str, tier: u8) -> Result<(), GatewayError> {
        let cap = self.config.max_concurrent.saturating_mul(self.config.multiplier(tier));
        let mut state = self.state.lock().expect("usage state lock");
        let per_credential = state
            .in_flight_per_credential
            .get(credential)
            .copied()
            .unwrap_or(0);
        if per_credential >= cap {
            return Err(GatewayError::Overloaded);
        }
        *state
            .in_flight
            .entry((credential.to_string(), model.to_string()))
            .or_insert(0) += 1;
        *state
            .in_flight_per_credential
            .entry(credential.to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    /// Release the slot and fold the outcome into usage/cooldown state.
    pub fn end_attempt(
        &self,
        credential: &str,
        model: &str,
        tier: u8,
        outcome: AttemptOutcome<'_>,
        now_ms: i64,
    ) {
        {
            let mut state = self.state.lock().expect("usage state lock");
            release_slot(&mut state, credential, model);

            match outcome {
                AttemptOutcome::Success(usage) => {
                    self.record_success(&mut state, credential, model, tier, usage, now_ms);
                }
                AttemptOutcome::Failure(error) => {
                    self.record_failure(&mut state, credential, model, error, now_ms);
                }
                AttemptOutcome::Aborted => {}
            }
        }
        self.mark_dirty();
        self.notify.notify_waiters();
    }

    /// In-flight calls for the credential across all models.
    pub fn in_flight(&self, credential: &str) -> u32 {
        self.state
            .lock()
            .expect("usage state lock")
            .in_flight_per_credential
            .get(credential)
            .copied()
            .unwrap_or(0)
    }

    // -- availability --------------------------------------------------------

    /// Whether (credential, model) may be selected at `now`: no active
    /// cooldown and not past a custom cap.
    pub fn is_available(&self, credential: &str, tier: u8, model: &str, now_ms: i64) -> bool {
        let mut state = self.state.lock().expect("usage state lock");
        if cooldown_active(&state, credential, Some(model), now_ms)
            || cooldown_active(&state, credential, None, now_ms)
        {
            return false;
        }
        // Custom caps are enforced lazily: the first availability check past
        // the cap installs the cooldown.
        if let Some(expiry) = self.cap_tripped(&mut state, credential, tier, model, now_ms) {
            self.install_cooldown(
                &mut state,
                credential,
                Some(model),
                Cooldown { expires_at_ms: expiry, kind: CooldownKind::CustomCap },
                now_ms,
            );
            return false;
        }
        true
    }

    /// Whether the credential is on a credential-wide cooldown.
    pub fn credential_locked(&self, credential: &str, now_ms: i64) -> bool {
        let state = self.state.lock().expect("usage state lock");
        cooldown_active(&state, credential, None, now_ms)
    }

    /// Earliest upcoming cooldown expiry for the model (or credential-wide),
    /// across all credentials. Drives scheduler sleeps and the 503 advisory.
    pub fn earliest_cooldown_expiry(&self, model: &str, now_ms: i64) -> Option<i64> {
        let state = self.state.lock().expect("usage state lock");
        state
            .cooldowns
            .iter()
            .filter(|((_, m), cooldown)| {
                cooldown.active_at(now_ms) && m.as_deref().is_none_or(|mm| mm == model)
            })
            .map(|(_, cooldown)| cooldown.expires_at_ms)
            .min()
    }

    /// Requests already used in the current window; rotation weight input.
    pub fn window_usage(&self, credential: &str, model: &str) -> u64 {
        let state = self.state.lock().expect("usage state lock");
        state
            .credentials
            .get(credential)
            .and_then(|c| c.models.get(model))
            .map(|r| r.success_count)
            .unwrap_or(0)
    }

    // -- quota ---------------------------------------------------------------

    /// Apply an authoritative reset to the model and every member of its
    /// quota group, keeping any farther-future reset already recorded.
    pub fn apply_quota_reset(&self, credential: &str, model: &str, reset_at_ms: i64, now_ms: i64) {
        {
            let mut state = self.state.lock().expect("usage state lock");
            self.apply_quota_reset_locked(&mut state, credential, model, reset_at_ms, now_ms);
        }
        self.mark_dirty();
        self.notify.notify_waiters();
    }

    fn apply_quota_reset_locked(
        &self,
        state: &mut State,
        credential: &str,
        model: &str,
        reset_at_ms: i64,
        now_ms: i64,
    ) {
        for member in self.config.bucket_members(model) {
            let record = record_mut(state, credential, &member);
            let effective = if record.quota_reset_ms > now_ms {
                record.quota_reset_ms.max(reset_at_ms)
            } else {
                reset_at_ms
            };
            record.quota_reset_ms = effective;
            if record.window_start_ms == 0 {
                record.window_start_ms = now_ms;
            }
            self.install_cooldown(
                state,
                credential,
                Some(&member),
                Cooldown { expires_at_ms: effective, kind: CooldownKind::QuotaAuthoritative },
                now_ms,
            );
        }
    }

    /// Record a remaining-quota baseline fetched from the provider.
    pub fn set_baseline(
        &self,
        credential: &str,
        model: &str,
        remaining_fraction: f64,
        max_requests: Option<u64>,
        now_ms: i64,
    ) {
        {
            let mut state = self.state.lock().expect("usage state lock");
            let record = record_mut(&mut state, credential, model);
            record.baseline_remaining_fraction = Some(remaining_fraction);
            record.baseline_fetched_at_ms = Some(now_ms);
            record.requests_at_baseline = Some(record.success_count);
            if max_requests.is_some() {
                record.quota_max_requests = max_requests;
            }
        }
        self.mark_dirty();
    }

    // -- fair cycle ----------------------------------------------------------

    /// Drop credentials already used this fair cycle and currently-exhausted
    /// ones from `candidates`. Resets the cycle first when it completed, when
    /// every member is exhausted, or when it aged out; a reset re-admits the
    /// entire scope at once.
    pub fn filter_fair_cycle(
        &self,
        candidates: Vec<String>,
        model: &str,
        now_ms: i64,
    ) -> Vec<String> {
        if !self.config.fair_cycle || candidates.is_empty() {
            return candidates;
        }
        let scope = self.config.scope_key(model);
        let mut state = self.state.lock().expect("usage state lock");
        // A credential-wide exhaustion covers every scope.
        let exhausted: Vec<bool> = candidates
            .iter()
            .map(|id| {
                [scope.as_str(), "credential"].iter().any(|s| {
                    state
                        .exhausted_until
                        .get(&(s.to_string(), id.clone()))
                        .is_some_and(|until| now_ms < *until)
                })
            })
            .collect();
        let all_exhausted = exhausted.iter().all(|e| *e);
        let cycle = state.fair_cycle.entry(scope).or_default();
        cycle.maybe_reset(candidates.len(), all_exhausted, now_ms);
        candidates
            .into_iter()
            .zip(exhausted)
            .filter(|(id, exhausted)| !*exhausted && !cycle.is_used(id))
            .map(|(id, _)| id)
            .collect()
    }

    /// Record that the credential served a request in this fair cycle.
    pub fn mark_used(&self, credential: &str, model: &str, now_ms: i64) {
        if !self.config.fair_cycle {
            return;
        }
        let scope = self.config.scope_key(model);
        let mut state = self.state.lock().expect("usage state lock");
        state
            .fair_cycle
            .entry(scope)
            .or_default()
            .mark_used(credential, now_ms);
    }

    // -- persistence ---------------------------------------------------------

    /// Snapshot and persist immediately; used at shutdown.
    pub fn flush(&self) {
        let snapshot = self.snapshot();
        self.writer.write_blocking(self.path.clone(), snapshot);
    }

    fn snapshot(&self) -> serde_json::Value {
        let state = self.state.lock().expect("usage state lock");
        let persisted = PersistedState {
            credentials: state.credentials.clone(),
            cooldowns: state
                .cooldowns
                .iter()
                .map(|((credential, model), cooldown)| CooldownEntry {
                    credential: credential.clone(),
                    model: model.clone(),
                    cooldown: cooldown.clone(),
                })
                .collect(),
            fair_cycle: state.fair_cycle.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        serde_json::to_value(&persisted).unwrap_or_else(|_| serde_json::json!({}))
    }

    fn mark_dirty(&self) {
        let _ = self.persist_tx.send(());
    }

    // -- internals -----------------------------------------------------------

    fn record_success(
        &self,
        state: &mut State,
        credential: &str,
        model: &str,
        tier: u8,
        usage: &Usage,
        now_ms: i64,
    ) {
        let mode = self.config.reset_mode(tier);
        let record = record_mut(state, credential, model);
        roll_window_if_needed(record, mode, now_ms);
        if record.window_start_ms == 0 {
            record.window_start_ms = now_ms;
        }
        record.success_count += 1;
        record.input_tokens += usage.input_tokens;
        record.output_tokens += usage.output_tokens;
        record.total_tokens += usage.total_tokens;

        let entry = state.credentials.entry(credential.to_string()).or_default();
        entry.total.success_count += 1;
        entry.total.total_tokens += usage.total_tokens;

        state.strikes.remove(&(credential.to_string(), model.to_string()));
    }

    fn record_failure(
        &self,
        state: &mut State,
        credential: &str,
        model: &str,
        error: &GatewayError,
        now_ms: i64,
    ) {
        match error {
            GatewayError::Auth { .. } | GatewayError::NeedsReauth { .. } => {
                self.install_cooldown(
                    state,
                    credential,
                    None,
                    Cooldown {
                        expires_at_ms: now_ms + (AUTH_LOCKOUT_S as i64) * 1000,
                        kind: CooldownKind::AuthLockout,
                    },
                    now_ms,
                );
            }
            GatewayError::Quota { reset_at_ms, .. } => {
                self.apply_quota_reset_locked(state, credential, model, *reset_at_ms, now_ms);
                self.note_failure(state, credential, model, now_ms);
            }
            GatewayError::RateLimit { reset_at_ms, retry_after, .. } => {
                if let Some(reset) = reset_at_ms {
                    self.apply_quota_reset_locked(state, credential, model, *reset, now_ms);
                } else if let Some(after) = retry_after {
                    self.install_cooldown(
                        state,
                        credential,
                        Some(model),
                        Cooldown {
                            expires_at_ms: now_ms + after.as_millis() as i64,
                            kind: CooldownKind::Transient,
                        },
                        now_ms,
                    );
                } else {
                    self.escalate_transient(state, credential, model, now_ms);
                }
                self.note_failure(state, credential, model, now_ms);
            }
            // Preserves throughput: bare 429s with no hint rotate without
            // poisoning the pair.
            GatewayError::TransientQuota { .. } => {}
            GatewayError::Server { .. }
            | GatewayError::Timeout(_)
            | GatewayError::Streamed(_)
            | GatewayError::Network(_)
            | GatewayError::Other(_) => {
                self.escalate_transient(state, credential, model, now_ms);
                self.note_failure(state, credential, model, now_ms);
            }
            // Client-shaped failures say nothing about the credential.
            GatewayError::ContextLength(_)
            | GatewayError::ContentFilter(_)
            | GatewayError::NotFound(_)
            | GatewayError::Json(_)
            | GatewayError::DeadlineExceeded
            | GatewayError::NoKeyAvailable { .. }
            | GatewayError::Overloaded => {}
        }
    }

    fn escalate_transient(&self, state: &mut State, credential: &str, model: &str, now_ms: i64) {
        let key = (credential.to_string(), model.to_string());
        let strikes = state.strikes.entry(key).or_insert(0);
        let seconds = transient_cooldown_s(*strikes);
        *strikes += 1;
        self.install_cooldown(
            state,
            credential,
            Some(model),
            Cooldown {
                expires_at_ms: now_ms + (seconds as i64) * 1000,
                kind: CooldownKind::Transient,
            },
            now_ms,
        );
    }

    /// Track failing models per credential; 3+ distinct models inside the
    /// window promote to a credential-wide lockout.
    fn note_failure(&self, state: &mut State, credential: &str, model: &str, now_ms: i64) {
        let failures = state.recent_failures.entry(credential.to_string()).or_default();
        failures.push((model.to_string(), now_ms));
        failures.retain(|(_, ts)| now_ms - *ts <= DEAD_KEY_WINDOW_MS);
        let distinct: std::collections::HashSet<&str> =
            failures.iter().map(|(m, _)| m.as_str()).collect();
        if distinct.len() >= DEAD_KEY_DISTINCT_MODELS {
            tracing::warn!(
                credential,
                models = distinct.len(),
                "multiple models failing; locking credential"
            );
            self.install_cooldown(
                state,
                credential,
                None,
                Cooldown {
                    expires_at_ms: now_ms + (AUTH_LOCKOUT_S as i64) * 1000,
                    kind: CooldownKind::AuthLockout,
                },
                now_ms,
            );
            state.recent_failures.remove(credential);
        }
    }

    fn install_cooldown(
        &self,
        state: &mut State,
        credential: &str,
        model: Option<&str>,
        cooldown: Cooldown,
        now_ms: i64,
    ) {
        let remaining_ms = cooldown.expires_at_ms - now_ms;
        if remaining_ms >= (EXHAUSTION_COOLDOWN_THRESHOLD_S as i64) * 1000 && self.config.fair_cycle
        {
            let scope = match model {
                Some(m) => self.config.scope_key(m),
                None => "credential".to_string(),
            };
            let entry = state
                .exhausted_until
                .entry((scope, credential.to_string()))
                .or_insert(0);
            *entry = (*entry).max(cooldown.expires_at_ms);
        }
        let key = (credential.to_string(), model.map(String::from));
        // Keep the farther-future expiry if one is already installed.
        let entry = state.cooldowns.entry(key).or_insert_with(|| cooldown.clone());
        if cooldown.expires_at_ms > entry.expires_at_ms {
            *entry = cooldown;
        }
    }
}

/// Debounced persistence. The worker holds only a weak reference so it winds
/// down when the manager is dropped (the sender closes with it).
fn spawn_persist_worker(
    manager: &Arc<UsageManager>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<()>,
) {
    let weak = Arc::downgrade(manager);
    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            tokio::time::sleep(PERSIST_DEBOUNCE).await;
            // Coalesce every mutation that arrived during the debounce.
            while rx.try_recv().is_ok() {}
            let Some(manager) = weak.upgrade() else { return };
            let snapshot = manager.snapshot();
            manager.writer.write(manager.path.clone(), snapshot).await;
        }
    });
}

fn release_slot(state: &mut State, credential: &str, model: &str) {
    if let Some(count) = state
        .in_flight
        .get_mut(&(credential.to_string(), model.to_string()))
    {
        *count = count.saturating_sub(1);
    }
    if let Some(count) = state.in_flight_per_credential.get_mut(credential) {
        *count = count.saturating_sub(1);
    }
}

fn cooldown_active(state: &State, credential: &str, model: Option<&str>, now_ms: i64) -> bool {
    state
        .cooldowns
        .get(&(credential.to_string(), model.map(String::from)))
        .is_some_and(|c| c.active_at(now_ms))
}

fn record_mut<'a>(state: &'a mut State, credential: &str, model: &str) -> &'a mut UsageRecord {
    state
        .credentials
        .entry(credential.to_string())
        .or_default()
        .models
        .entry(model.to_string())
        .or_default()
}

fn roll_window_if_needed(record: &mut UsageRecord, mode: ResetMode, now_ms: i64) {
    match mode {
        ResetMode::PerModel { default_window_ms } => {
            if record.quota_reset_ms != 0 && now_ms >= record.quota_reset_ms {
                record.reset_window(now_ms);
                if record.quota_reset_ms == 0 {
                    record.quota_reset_ms = now_ms + default_window_ms;
                }
            }
        }
        ResetMode::Credential { window_ms } => {
            if record.window_start_ms != 0 && now_ms >= record.window_start_ms + window_ms {
                record.reset_window(now_ms);
                if record.quota_reset_ms == 0 {
                    record.quota_reset_ms = now_ms + window_ms;
                }
            }
        }
        ResetMode::Daily { utc_hour } => {
            let boundary = last_daily_boundary_ms(utc_hour, now_ms);
            if record.window_start_ms != 0 && record.window_start_ms < boundary {
                record.reset_window(now_ms);
                record.quota_reset_ms = boundary + 24 * 60 * 60 * 1000;
            }
        }
    }
}

/// Most recent occurrence of `utc_hour:00` at or before `now`.
fn last_daily_boundary_ms(utc_hour: u32, now_ms: i64) -> i64 {
    use chrono::{TimeZone, Timelike, Utc};
    let now = Utc.timestamp_millis_opt(now_ms).single().unwrap_or_else(Utc::now);
    let today = now
        .with_hour(utc_hour.min(23))
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    let boundary = if today <= now { today } else { today - chrono::Duration::days(1) };
    boundary.timestamp_millis()
}

impl UsageManager {
    fn cap_tripped(
        &self,
        state: &mut State,
        credential: &str,
        tier: u8,
        model: &str,
        now_ms: i64,
    ) -> Option<i64> {
        let group = self.config.group_of(model).map(|g| g.name.clone());
        let cap = resolve_cap(&self.config.custom_caps, tier, model, group.as_deref())?.clone();
        let mode = self.config.reset_mode(tier);
        let record = record_mut(state, credential, model);
        // A stale window must not pin the cap past its natural reset.
        roll_window_if_needed(record, mode, now_ms);
        let effective = cap.effective_cap(record.quota_max_requests);
        if record.success_count < effective {
            return None;
        }
        let natural_reset = if record.quota_reset_ms > now_ms { record.quota_reset_ms } else { now_ms };
        Some(cap.cooldown_expiry_ms(now_ms, record.window_start_ms, natural_reset))
    }
}
