//! Operator-configured request caps below the provider's real quota.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapTarget {
    Model(String),
    Group(String),
}

/// When a tripped cap releases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapCooldown {
    /// Hold until the natural quota reset.
    QuotaReset,
    /// Hold for a fixed delta from the moment the cap trips.
    Offset { delta_ms: i64 },
    /// Hold until `window_start + delta`.
    FixedFromWindowStart { delta_ms: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomCap {
    /// Tier this cap applies to; `None` is the default for all tiers.
    pub tier: Option<u8>,
    pub target: CapTarget,
    pub max_requests: u64,
    pub cooldown: CapCooldown,
}

impl CustomCap {
    fn matches_target(&self, model: &str, group: Option<&str>) -> bool {
        match &self.target {
            CapTarget::Model(m) => m == model,
            CapTarget::Group(g) => group.is_some_and(|name| name == g),
        }
    }

    /// Specificity used for resolution ordering:
    /// tier+model > tier+group > default+model > default+group.
    fn specificity(&self) -> u8 {
        match (&self.tier, &self.target) {
            (Some(_), CapTarget::Model(_)) => 4,
            (Some(_), CapTarget::Group(_)) => 3,
            (None, CapTarget::Model(_)) => 2,
            (None, CapTarget::Group(_)) => 1,
        }
    }

    /// Effective cap, clamped so configuration can never raise the limit
    /// above what the provider actually grants.
    pub fn effective_cap(&self, real_max: Option<u64>) -> u64 {
        match real_max {
            Some(real) => self.max_requests.min(real),
            None => self.max_requests,
        }
    }

    /// Expiry of a tripped cap, clamped so it never releases before the
    /// natural quota reset.
    pub fn cooldown_expiry_ms(
        &self,
        now_ms: i64,
        window_start_ms: i64,
        quota_reset_ms: i64,
    ) -> i64 {
        let configured = match self.cooldown {
            CapCooldown::QuotaReset => quota_reset_ms,
            CapCooldown::Offset { delta_ms } => now_ms + delta_ms,
            CapCooldown::FixedFromWindowStart { delta_ms } => window_start_ms + delta_ms,
        };
        configured.max(quota_reset_ms)
    }
}

/// Pick the most specific cap for (tier, model, group), or none.
pub fn resolve_cap<'a>(
    caps: &'a [CustomCap],
    tier: u8,
    model: &str,
    group: Option<&str>,
) -> Option<&'a CustomCap> {
    caps.iter()
        .filter(|cap| cap.tier.is_none_or(|t| t == tier))
        .filter(|cap| cap.matches_target(model, group))
        .max_by_key(|cap| cap.specificity())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(tier: Option<u8>, target: CapTarget, max: u64) -> CustomCap {
        CustomCap {
            tier,
            target,
            max_requests: max,
            cooldown: CapCooldown::QuotaReset,
        }
    }

    #[test]
    fn resolution_prefers_tier_and_model() {
        let caps = vec![
            cap(None, CapTarget::Group("pro".into()), 10),
            cap(None, CapTarget::Model("m".into()), 20),
            cap(Some(1), CapTarget::Group("pro".into()), 30),
            cap(Some(1), CapTarget::Model("m".into()), 40),
        ];
        let chosen = resolve_cap(&caps, 1, "m", Some("pro")).unwrap();
        assert_eq!(chosen.max_requests, 40);

        let chosen = resolve_cap(&caps, 2, "m", Some("pro")).unwrap();
        assert_eq!(chosen.max_requests, 20);

        let chosen = resolve_cap(&caps, 2, "other", Some("pro")).unwrap();
        assert_eq!(chosen.max_requests, 10);

        assert!(resolve_cap(&caps, 2, "other", None).is_none());
    }

    #[test]
    fn cap_clamps_to_real_max() {
        let c = cap(None, CapTarget::Model("m".into()), 100);
        assert_eq!(c.effective_cap(Some(50)), 50);
        assert_eq!(c.effective_cap(Some(500)), 100);
        assert_eq!(c.effective_cap(None), 100);
    }

    #[test]
    fn cooldown_never_releases_before_natural_reset() {
        let c = CustomCap {
            tier: None,
            target: CapTarget::Model("m".into()),
            max_requests: 10,
            cooldown: CapCooldown::Offset { delta_ms: 1_000 },
        };
        // Configured offset lands before the quota reset: clamped up.
        assert_eq!(c.cooldown_expiry_ms(0, 0, 60_000), 60_000);
        // Configured offset lands after: kept.
        assert_eq!(c.cooldown_expiry_ms(100_000, 0, 60_000), 101_000);
    }

    #[test]
    fn fixed_window_cooldown_uses_window_start() {
        let c = CustomCap {
            tier: None,
            target: CapTarget::Model("m".into()),
            max_requests: 10,
            cooldown: CapCooldown::FixedFromWindowStart { delta_ms: 90_000 },
        };
        assert_eq!(c.cooldown_expiry_ms(10_000, 5_000, 0), 95_000);
    }
}
