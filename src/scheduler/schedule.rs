//! Schedule definitions and startup validation
//!
//! A [`ScheduleSet`] is the validated collection of cadences the process runs:
//! the mandatory `default` schedule, an optional fast tier granted to
//! supporter guilds, and any number of custom schedules.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use super::error::{SchedulerError, SchedulerResult};

/// Name of the schedule every unmatched subscription falls back to
pub const DEFAULT_SCHEDULE: &str = "default";

/// Default fast tier name
pub const SUPPORTER_SCHEDULE: &str = "supporter";

// ============================================================================
// Schedule
// ============================================================================

/// A named cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub name: String,

    /// Period between cycles
    pub refresh_rate_minutes: f64,

    /// Subscriptions explicitly assigned to this schedule
    #[serde(default)]
    pub subscription_ids: Vec<String>,

    /// URL substrings that assign a subscription to this schedule
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl Schedule {
    /// Create a schedule without assignment rules
    pub fn new(name: impl Into<String>, refresh_rate_minutes: f64) -> Self {
        Self {
            name: name.into(),
            refresh_rate_minutes,
            subscription_ids: Vec::new(),
            keywords: Vec::new(),
        }
    }

    /// Add URL keywords
    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords.extend(keywords.into_iter().map(Into::into));
        self
    }

    /// Add explicitly assigned subscription ids
    pub fn with_subscription_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscription_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Timer period
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(self.refresh_rate_minutes * 60.0)
    }

    fn check_rate(&self) -> SchedulerResult<()> {
        if !self.refresh_rate_minutes.is_finite() || self.refresh_rate_minutes <= 0.0 {
            return Err(SchedulerError::MissingRefreshRate {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Fast Tier
// ============================================================================

/// Shorter cadence granted to supporter guilds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FastTier {
    #[serde(default = "default_fast_tier_name")]
    pub name: String,

    pub refresh_rate_minutes: f64,

    /// Guilds that qualify for the fast tier
    #[serde(default)]
    pub guild_ids: HashSet<String>,

    /// Subscriptions kept on their normal schedule even in a qualifying guild
    #[serde(default)]
    pub excluded_subscription_ids: HashSet<String>,
}

fn default_fast_tier_name() -> String {
    SUPPORTER_SCHEDULE.to_string()
}

impl FastTier {
    pub fn new(refresh_rate_minutes: f64) -> Self {
        Self {
            name: default_fast_tier_name(),
            refresh_rate_minutes,
            guild_ids: HashSet::new(),
            excluded_subscription_ids: HashSet::new(),
        }
    }

    pub fn with_guilds<I, S>(mut self, guilds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.guild_ids.extend(guilds.into_iter().map(Into::into));
        self
    }

    pub fn excluding<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_subscription_ids
            .extend(ids.into_iter().map(Into::into));
        self
    }

    /// The fast tier as a plain schedule
    pub fn schedule(&self) -> Schedule {
        Schedule::new(self.name.clone(), self.refresh_rate_minutes)
    }
}

// ============================================================================
// Schedule Set
// ============================================================================

/// Validated set of schedules
#[derive(Debug, Clone)]
pub struct ScheduleSet {
    default: Schedule,
    fast_tier: Option<FastTier>,
    custom: Vec<Schedule>,
}

impl ScheduleSet {
    /// Build and validate a schedule set
    ///
    /// Fails when any two schedules share a refresh rate or a name, when the
    /// fast tier reuses the default rate, when a rate is not positive, or
    /// when a custom schedule has no assignment rule.
    pub fn new(
        default_rate_minutes: f64,
        custom: Vec<Schedule>,
        fast_tier: Option<FastTier>,
    ) -> SchedulerResult<Self> {
        let default = Schedule::new(DEFAULT_SCHEDULE, default_rate_minutes);
        default.check_rate()?;

        let mut names: HashSet<String> = HashSet::new();
        names.insert(default.name.clone());

        // (name, rate) pairs already claimed
        let mut claimed: Vec<(String, f64)> = vec![(default.name.clone(), default.refresh_rate_minutes)];

        if let Some(tier) = &fast_tier {
            let schedule = tier.schedule();
            schedule.check_rate()?;
            if !names.insert(schedule.name.clone()) {
                return Err(SchedulerError::DuplicateName {
                    name: schedule.name,
                });
            }
            if schedule.refresh_rate_minutes == default.refresh_rate_minutes {
                return Err(SchedulerError::FastTierRateConflict {
                    name: schedule.name,
                    minutes: schedule.refresh_rate_minutes,
                });
            }
            claimed.push((schedule.name, schedule.refresh_rate_minutes));
        }

        for schedule in &custom {
            schedule.check_rate()?;
            if !names.insert(schedule.name.clone()) {
                return Err(SchedulerError::DuplicateName {
                    name: schedule.name.clone(),
                });
            }
            if schedule.keywords.is_empty() && schedule.subscription_ids.is_empty() {
                return Err(SchedulerError::EmptySchedule {
                    name: schedule.name.clone(),
                });
            }
            if let Some((other, _)) = claimed
                .iter()
                .find(|(_, rate)| *rate == schedule.refresh_rate_minutes)
            {
                return Err(SchedulerError::duplicate_rate(
                    other.clone(),
                    schedule.name.clone(),
                    schedule.refresh_rate_minutes,
                ));
            }
            claimed.push((schedule.name.clone(), schedule.refresh_rate_minutes));
        }

        Ok(Self {
            default,
            fast_tier,
            custom,
        })
    }

    /// Only the default schedule
    pub fn default_only(default_rate_minutes: f64) -> SchedulerResult<Self> {
        Self::new(default_rate_minutes, Vec::new(), None)
    }

    pub fn default_schedule(&self) -> &Schedule {
        &self.default
    }

    pub fn fast_tier(&self) -> Option<&FastTier> {
        self.fast_tier.as_ref()
    }

    /// Custom schedules in declared order
    pub fn custom(&self) -> &[Schedule] {
        &self.custom
    }

    /// Every schedule that gets its own timer
    pub fn all(&self) -> Vec<Schedule> {
        let mut out = vec![self.default.clone()];
        if let Some(tier) = &self.fast_tier {
            out.push(tier.schedule());
        }
        out.extend(self.custom.iter().cloned());
        out
    }

    /// Look up a schedule by name
    pub fn get(&self, name: &str) -> Option<Schedule> {
        self.all().into_iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        1 + usize::from(self.fast_tier.is_some()) + self.custom.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}
