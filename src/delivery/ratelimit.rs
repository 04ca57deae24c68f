//! Per-destination send budgets
//!
//! Each destination channel gets its own GCRA budget from a keyed
//! `governor` limiter. Destinations in supporter guilds draw from a second
//! limiter with a larger quota.

use std::collections::HashSet;
use std::num::NonZeroU32;

use governor::{
    clock::DefaultClock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter,
};

use crate::models::Destination;

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Budget tier of a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Standard,
    Supporter,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Supporter => "supporter",
        }
    }
}

/// A destination ran out of budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetExhausted {
    pub tier: Tier,
}

/// Keyed rate limiter over destination channels
pub struct DestinationLimiter {
    standard: KeyedLimiter,
    supporter: KeyedLimiter,
    supporter_guilds: HashSet<String>,
}

impl DestinationLimiter {
    /// Create a limiter; zero budgets are raised to one send per minute
    pub fn new(
        standard_per_minute: u32,
        supporter_per_minute: u32,
        supporter_guilds: HashSet<String>,
    ) -> Self {
        let quota = |per_minute: u32| {
            Quota::per_minute(NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN))
        };
        Self {
            standard: RateLimiter::keyed(quota(standard_per_minute)),
            supporter: RateLimiter::keyed(quota(supporter_per_minute)),
            supporter_guilds,
        }
    }

    pub fn tier(&self, destination: &Destination) -> Tier {
        if self.supporter_guilds.contains(&destination.guild_id) {
            Tier::Supporter
        } else {
            Tier::Standard
        }
    }

    fn limiter(&self, tier: Tier) -> &KeyedLimiter {
        match tier {
            Tier::Standard => &self.standard,
            Tier::Supporter => &self.supporter,
        }
    }

    /// Take one unit of budget now, or report that none is left
    pub fn check(&self, destination: &Destination) -> Result<(), BudgetExhausted> {
        let tier = self.tier(destination);
        self.limiter(tier)
            .check_key(&destination.channel)
            .map_err(|_| BudgetExhausted { tier })
    }

    /// Wait until one unit of budget is available, then take it
    pub async fn until_ready(&self, destination: &Destination) {
        let tier = self.tier(destination);
        self.limiter(tier).until_key_ready(&destination.channel).await;
    }

    /// Drop state of destinations whose budget is fully replenished
    pub fn retain_recent(&self) {
        self.standard.retain_recent();
        self.supporter.retain_recent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_is_per_destination() {
        let limiter = DestinationLimiter::new(2, 10, HashSet::new());
        let a = Destination::channel("a", "g1");
        let b = Destination::channel("b", "g1");

        assert!(limiter.check(&a).is_ok());
        assert!(limiter.check(&a).is_ok());
        assert_eq!(
            limiter.check(&a),
            Err(BudgetExhausted {
                tier: Tier::Standard
            })
        );
        // Another destination is unaffected
        assert!(limiter.check(&b).is_ok());
    }

    #[test]
    fn test_supporter_budget_is_larger() {
        let guilds: HashSet<String> = ["vip".to_string()].into_iter().collect();
        let limiter = DestinationLimiter::new(1, 5, guilds);
        let vip = Destination::channel("c", "vip");
        assert_eq!(limiter.tier(&vip), Tier::Supporter);

        for _ in 0..5 {
            assert!(limiter.check(&vip).is_ok());
        }
        assert!(limiter.check(&vip).is_err());
    }

    #[tokio::test]
    async fn test_until_ready_consumes_budget() {
        let limiter = DestinationLimiter::new(60, 60, HashSet::new());
        let dest = Destination::channel("c", "g");
        limiter.until_ready(&dest).await;
        assert_eq!(limiter.tier(&dest).as_str(), "standard");
    }
}
