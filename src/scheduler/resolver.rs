//! Subscription to schedule assignment

use std::collections::HashMap;

use super::schedule::ScheduleSet;
use crate::models::Subscription;

/// Name of the schedule a subscription belongs to
///
/// Precedence: the fast tier for qualifying guilds (unless the subscription
/// is excluded), then the first custom schedule whose allowlist contains the
/// subscription id or whose keyword occurs in the source URL, then `default`.
pub fn resolve<'a>(subscription: &Subscription, schedules: &'a ScheduleSet) -> &'a str {
    if let Some(tier) = schedules.fast_tier() {
        if tier.guild_ids.contains(&subscription.guild_id)
            && !tier.excluded_subscription_ids.contains(&subscription.id)
        {
            return &tier.name;
        }
    }

    for schedule in schedules.custom() {
        if schedule.subscription_ids.iter().any(|id| *id == subscription.id) {
            return &schedule.name;
        }
        if schedule
            .keywords
            .iter()
            .any(|keyword| subscription.url.contains(keyword.as_str()))
        {
            return &schedule.name;
        }
    }

    &schedules.default_schedule().name
}

/// Keep only the subscriptions that belong to `schedule`
pub fn subscriptions_for<'s>(
    subscriptions: &'s [Subscription],
    schedules: &ScheduleSet,
    schedule: &str,
) -> Vec<&'s Subscription> {
    subscriptions
        .iter()
        .filter(|sub| resolve(sub, schedules) == schedule)
        .collect()
}

/// Subscription count per schedule name
pub fn count_by_schedule(
    subscriptions: &[Subscription],
    schedules: &ScheduleSet,
) -> HashMap<String, usize> {
    let mut counts: HashMap<String, usize> = schedules
        .all()
        .into_iter()
        .map(|s| (s.name, 0))
        .collect();
    for sub in subscriptions {
        *counts.entry(resolve(sub, schedules).to_string()).or_insert(0) += 1;
    }
    counts
}
