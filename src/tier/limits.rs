//! Subscription tiers and their limits
//!
//! Every plan is compiled in. A limit is either a numeric ceiling or
//! unlimited; on the wire unlimited is encoded as `-1`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::OnceLock;

/// Wire value for an unlimited ceiling
pub const UNLIMITED_SENTINEL: i64 = -1;

/// Subscription tier of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Basic,
    Pro,
    Enterprise,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Basic, Tier::Pro, Tier::Enterprise];

    /// Parse a tier name, case-insensitive. Unknown names resolve to Free.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "basic" => Tier::Basic,
            "pro" => Tier::Pro,
            "enterprise" => Tier::Enterprise,
            _ => Tier::Free,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }

    pub fn plan(&self) -> &'static SubscriptionPlan {
        SubscriptionPlan::for_tier(*self)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ceiling that is either a number or absent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Limit {
    Bounded(u32),
    Unlimited,
}

impl Limit {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Limit::Unlimited)
    }

    /// True when `used` has hit the ceiling. Never true for unlimited.
    pub fn is_reached_by(&self, used: u32) -> bool {
        match self {
            Limit::Bounded(limit) => used >= *limit,
            Limit::Unlimited => false,
        }
    }

    /// What is left after `used`; stays unlimited when there is no ceiling
    pub fn remaining_after(&self, used: u32) -> Limit {
        match self {
            Limit::Bounded(limit) => Limit::Bounded(limit.saturating_sub(used)),
            Limit::Unlimited => Limit::Unlimited,
        }
    }

    pub fn bounded(&self) -> Option<u32> {
        match self {
            Limit::Bounded(limit) => Some(*limit),
            Limit::Unlimited => None,
        }
    }

    pub fn to_wire(self) -> i64 {
        match self {
            Limit::Bounded(limit) => i64::from(limit),
            Limit::Unlimited => UNLIMITED_SENTINEL,
        }
    }

    pub fn from_wire(value: i64) -> Option<Self> {
        if value == UNLIMITED_SENTINEL {
            Some(Limit::Unlimited)
        } else {
            u32::try_from(value).ok().map(Limit::Bounded)
        }
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Bounded(limit) => write!(f, "{}", limit),
            Limit::Unlimited => f.write_str("unlimited"),
        }
    }
}

impl Serialize for Limit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.to_wire())
    }
}

impl<'de> Deserialize<'de> for Limit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = i64::deserialize(deserializer)?;
        Limit::from_wire(value).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "invalid limit {}: expected a non-negative integer or -1",
                value
            ))
        })
    }
}

/// Numeric limits attached to a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanLimits {
    /// Quota-gated operations per action type per UTC day
    pub processes_per_day: Limit,
    #[serde(rename = "maxFileSizeMB")]
    pub max_file_size_mb: Limit,
    pub max_duration_minutes: Limit,
    pub concurrent_processes: Limit,
    pub batch_size: Limit,
}

impl PlanLimits {
    /// Check an upload size in bytes against `max_file_size_mb`
    pub fn allows_file_size(&self, bytes: u64) -> bool {
        match self.max_file_size_mb {
            Limit::Bounded(mb) => bytes <= u64::from(mb) * 1024 * 1024,
            Limit::Unlimited => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPlan {
    pub tier: Tier,
    pub name: String,
    pub monthly_price_cents: u32,
    pub limits: PlanLimits,
}

impl SubscriptionPlan {
    /// All plans, one per tier, in tier order
    pub fn catalog() -> &'static [SubscriptionPlan] {
        static CATALOG: OnceLock<Vec<SubscriptionPlan>> = OnceLock::new();
        CATALOG.get_or_init(|| Tier::ALL.into_iter().map(Self::build).collect())
    }

    pub fn for_tier(tier: Tier) -> &'static SubscriptionPlan {
        let catalog = Self::catalog();
        // catalog is built from Tier::ALL in declaration order
        &catalog[tier as usize]
    }

    fn build(tier: Tier) -> Self {
        use Limit::{Bounded, Unlimited};

        match tier {
            Tier::Free => Self {
                tier,
                name: "Free".to_string(),
                monthly_price_cents: 0,
                limits: PlanLimits {
                    processes_per_day: Bounded(5),
                    max_file_size_mb: Bounded(100),
                    max_duration_minutes: Bounded(10),
                    concurrent_processes: Bounded(1),
                    batch_size: Bounded(1),
                },
            },
            Tier::Basic => Self {
                tier,
                name: "Basic".to_string(),
                monthly_price_cents: 900,
                limits: PlanLimits {
                    processes_per_day: Bounded(50),
                    max_file_size_mb: Bounded(500),
                    max_duration_minutes: Bounded(60),
                    concurrent_processes: Bounded(2),
                    batch_size: Bounded(5),
                },
            },
            Tier::Pro => Self {
                tier,
                name: "Pro".to_string(),
                monthly_price_cents: 2900,
                limits: PlanLimits {
                    processes_per_day: Unlimited,
                    max_file_size_mb: Bounded(2048),
                    max_duration_minutes: Bounded(240),
                    concurrent_processes: Bounded(5),
                    batch_size: Bounded(20),
                },
            },
            Tier::Enterprise => Self {
                tier,
                name: "Enterprise".to_string(),
                monthly_price_cents: 9900,
                limits: PlanLimits {
                    processes_per_day: Unlimited,
                    max_file_size_mb: Unlimited,
                    max_duration_minutes: Unlimited,
                    concurrent_processes: Unlimited,
                    batch_size: Unlimited,
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_plan_per_tier() {
        let catalog = SubscriptionPlan::catalog();
        assert_eq!(catalog.len(), Tier::ALL.len());
        for tier in Tier::ALL {
            assert_eq!(SubscriptionPlan::for_tier(tier).tier, tier);
            assert_eq!(catalog.iter().filter(|p| p.tier == tier).count(), 1);
        }
    }

    #[test]
    fn test_tier_from_name() {
        assert_eq!(Tier::from_name("PRO"), Tier::Pro);
        assert_eq!(Tier::from_name(" basic "), Tier::Basic);
        assert_eq!(Tier::from_name("enterprise"), Tier::Enterprise);
        assert_eq!(Tier::from_name("platinum"), Tier::Free);
        assert_eq!(Tier::from_name(""), Tier::Free);
    }

    #[test]
    fn test_limit_wire_format() {
        assert_eq!(serde_json::to_string(&Limit::Unlimited).unwrap(), "-1");
        assert_eq!(serde_json::to_string(&Limit::Bounded(5)).unwrap(), "5");

        let unlimited: Limit = serde_json::from_str("-1").unwrap();
        assert_eq!(unlimited, Limit::Unlimited);
        assert!(serde_json::from_str::<Limit>("-7").is_err());
    }

    #[test]
    fn test_unlimited_is_never_reached() {
        for used in [0, 1, 1_000, u32::MAX] {
            assert!(!Limit::Unlimited.is_reached_by(used));
            assert_eq!(Limit::Unlimited.remaining_after(used), Limit::Unlimited);
        }
    }

    #[test]
    fn test_bounded_remaining_saturates() {
        let limit = Limit::Bounded(5);
        assert_eq!(limit.remaining_after(3), Limit::Bounded(2));
        assert_eq!(limit.remaining_after(5), Limit::Bounded(0));
        assert_eq!(limit.remaining_after(9), Limit::Bounded(0));
        assert!(!limit.is_reached_by(4));
        assert!(limit.is_reached_by(5));
    }

    #[test]
    fn test_file_size_limit() {
        let free = &Tier::Free.plan().limits;
        assert!(free.allows_file_size(100 * 1024 * 1024));
        assert!(!free.allows_file_size(100 * 1024 * 1024 + 1));
        assert!(Tier::Enterprise.plan().limits.allows_file_size(u64::MAX));
    }

    #[test]
    fn test_plan_limits_json_names() {
        let json = serde_json::to_value(&Tier::Pro.plan().limits).unwrap();
        assert_eq!(json["processesPerDay"], -1);
        assert_eq!(json["maxFileSizeMB"], 2048);
        assert_eq!(json["batchSize"], 20);
    }
}
