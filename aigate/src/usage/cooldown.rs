//! Cooldown bookkeeping and fair-cycle rotation state.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Escalating cooldown ladder for transient failures, seconds.
pub const TRANSIENT_LADDER_S: [u64; 4] = [10, 30, 60, 120];

/// Credential-wide lockout applied on authentication failures.
pub const AUTH_LOCKOUT_S: u64 = 5 * 60;

/// A cooldown at or above this length marks the credential exhausted for
/// fair-cycle purposes.
pub const EXHAUSTION_COOLDOWN_THRESHOLD_S: u64 = 300;

/// A fair cycle older than this clears even if members remain unexhausted.
pub const FAIR_CYCLE_DURATION_S: u64 = 1800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownKind {
    /// Escalating 10/30/60/120 s ladder.
    Transient,
    /// Credential-wide 5-minute lockout after auth failures.
    AuthLockout,
    /// Authoritative reset parsed from the provider.
    QuotaAuthoritative,
    /// Configured custom cap tripped.
    CustomCap,
}

/// Temporary exclusion of a (credential, model) or (credential, *) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cooldown {
    pub expires_at_ms: i64,
    pub kind: CooldownKind,
}

impl Cooldown {
    pub fn active_at(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// Pick the ladder step for the given strike count (0-based).
pub fn transient_cooldown_s(strikes: u32) -> u64 {
    let index = (strikes as usize).min(TRANSIENT_LADDER_S.len() - 1);
    TRANSIENT_LADDER_S[index]
}

// ---------------------------------------------------------------------------
// Fair cycle
// ---------------------------------------------------------------------------

/// Per-scope rotation state. A member that served a request this cycle is
/// `used` and skipped until peers have also been used or are exhausted (on a
/// long cooldown). The cycle clears atomically when every member has been
/// used, when every member is exhausted, or when the cycle ages out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FairCycleState {
    used: HashSet<String>,
    cycle_started_ms: i64,
}

impl FairCycleState {
    pub fn mark_used(&mut self, member: &str, now_ms: i64) {
        if self.used.is_empty() {
            self.cycle_started_ms = now_ms;
        }
        self.used.insert(member.to_string());
    }

    pub fn is_used(&self, member: &str) -> bool {
        self.used.contains(member)
    }

    pub fn used_count(&self) -> usize {
        self.used.len()
    }

    /// Clear the cycle in one step so re-admitted members all become
    /// selectable in the same instant, never incrementally.
    pub fn maybe_reset(&mut self, scope_size: usize, all_exhausted: bool, now_ms: i64) -> bool {
        let complete = scope_size > 0 && self.used.len() >= scope_size;
        let aged_out = !self.used.is_empty()
            && now_ms - self.cycle_started_ms >= (FAIR_CYCLE_DURATION_S as i64) * 1000;
        if complete || all_exhausted || aged_out {
            self.used.clear();
            self.cycle_started_ms = now_ms;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_escalates_then_saturates() {
        assert_eq!(transient_cooldown_s(0), 10);
        assert_eq!(transient_cooldown_s(1), 30);
        assert_eq!(transient_cooldown_s(2), 60);
        assert_eq!(transient_cooldown_s(3), 120);
        assert_eq!(transient_cooldown_s(99), 120);
    }

    #[test]
    fn fair_cycle_clears_atomically_when_complete() {
        let mut cycle = FairCycleState::default();
        cycle.mark_used("a", 1_000);
        cycle.mark_used("b", 2_000);
        assert!(!cycle.maybe_reset(3, false, 3_000));
        assert!(cycle.is_used("a"));

        cycle.mark_used("c", 4_000);
        assert!(cycle.maybe_reset(3, false, 5_000));
        // Every member re-admitted at once.
        assert!(!cycle.is_used("a"));
        assert!(!cycle.is_used("b"));
        assert!(!cycle.is_used("c"));
    }

    #[test]
    fn fair_cycle_clears_when_all_members_exhaust() {
        let mut cycle = FairCycleState::default();
        cycle.mark_used("a", 1_000);
        assert!(cycle.maybe_reset(3, true, 2_000));
        assert_eq!(cycle.used_count(), 0);
    }

    #[test]
    fn fair_cycle_ages_out() {
        let mut cycle = FairCycleState::default();
        cycle.mark_used("a", 0);
        let not_yet = (FAIR_CYCLE_DURATION_S as i64) * 1000 - 1;
        assert!(!cycle.maybe_reset(5, false, not_yet));
        assert!(cycle.maybe_reset(5, false, not_yet + 1));
        assert_eq!(cycle.used_count(), 0);
    }
}
