//! Eligibility, grouping and batching of one cycle's subscriptions

use std::collections::{BTreeMap, HashMap};

use crate::models::{FailRecord, Subscription};

/// Subscriptions of one URL, keyed by subscription id
pub type UrlSubscriptions = BTreeMap<String, Subscription>;

/// URLs processed together by one worker
pub type Batch = BTreeMap<String, UrlSubscriptions>;

/// Batches executed one after another by the same worker slot
pub type BatchGroup = Vec<Batch>;

/// Result of the eligibility filter
#[derive(Debug, Clone, Default)]
pub struct Eligibility {
    pub eligible: Vec<Subscription>,
    pub disabled: usize,
    /// Subscriptions skipped because their URL is past the failure cutoff
    pub excluded: usize,
}

/// Drop disabled subscriptions and those whose URL failed for good
pub fn filter_eligible<F>(
    subscriptions: Vec<Subscription>,
    fail_records: &HashMap<String, FailRecord>,
    is_excluded: F,
) -> Eligibility
where
    F: Fn(&FailRecord) -> bool,
{
    let mut result = Eligibility::default();
    for subscription in subscriptions {
        if subscription.is_disabled() {
            result.disabled += 1;
            continue;
        }
        if fail_records.get(&subscription.url).is_some_and(&is_excluded) {
            result.excluded += 1;
            continue;
        }
        result.eligible.push(subscription);
    }
    result
}

/// Group subscriptions by their source URL
pub fn group_by_url(subscriptions: Vec<Subscription>) -> BTreeMap<String, UrlSubscriptions> {
    let mut grouped: BTreeMap<String, UrlSubscriptions> = BTreeMap::new();
    for subscription in subscriptions {
        grouped
            .entry(subscription.url.clone())
            .or_default()
            .insert(subscription.id.clone(), subscription);
    }
    grouped
}

/// Split grouped URLs into batches of at most `batch_size` URLs
pub fn make_batches(grouped: BTreeMap<String, UrlSubscriptions>, batch_size: usize) -> Vec<Batch> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::new();
    let mut current = Batch::new();
    for (url, subscriptions) in grouped {
        current.insert(url, subscriptions);
        if current.len() == batch_size {
            batches.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Split batches into at most `parallel` groups of `ceil(len / parallel)` batches
pub fn make_groups(batches: Vec<Batch>, parallel: usize) -> Vec<BatchGroup> {
    if batches.is_empty() {
        return Vec::new();
    }
    let per_group = batches.len().div_ceil(parallel.max(1));
    let mut groups = Vec::new();
    let mut iter = batches.into_iter().peekable();
    while iter.peek().is_some() {
        groups.push(iter.by_ref().take(per_group).collect());
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn sub(id: &str, url: &str) -> Subscription {
        Subscription::new(id, url, format!("chan-{id}"), "g1")
    }

    #[test]
    fn test_shared_urls_collapse() {
        let grouped = group_by_url(vec![
            sub("a", "https://x"),
            sub("b", "https://x"),
            sub("c", "https://x"),
            sub("d", "https://y"),
        ]);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["https://x"].len(), 3);
    }

    #[test]
    fn test_five_urls_two_per_batch_two_groups() {
        let subs: Vec<_> = (0..5)
            .map(|i| sub(&i.to_string(), &format!("https://feed{i}")))
            .collect();
        let batches = make_batches(group_by_url(subs), 2);
        assert_eq!(batches.iter().map(|b| b.len()).collect::<Vec<_>>(), vec![2, 2, 1]);

        let groups = make_groups(batches, 2);
        assert_eq!(groups.iter().map(|g| g.len()).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn test_each_url_in_exactly_one_batch() {
        let subs: Vec<_> = (0..23)
            .map(|i| sub(&i.to_string(), &format!("https://feed{}", i % 17)))
            .collect();
        let batches = make_batches(group_by_url(subs), 4);
        let mut urls: Vec<&String> = batches.iter().flat_map(|b| b.keys()).collect();
        let total = urls.len();
        urls.sort();
        urls.dedup();
        assert_eq!(urls.len(), total);
        assert_eq!(total, 17);
    }

    #[test]
    fn test_more_parallelism_than_batches() {
        let subs = vec![sub("a", "https://x")];
        let groups = make_groups(make_batches(group_by_url(subs), 10), 8);
        assert_eq!(groups.len(), 1);
        assert!(make_groups(Vec::new(), 4).is_empty());
    }

    #[test]
    fn test_eligibility() {
        let mut broken = FailRecord::new("https://broken", "timeout");
        broken.first_failed_at = Utc::now() - Duration::hours(30);
        broken.alerted = true;
        let mut flaky = FailRecord::new("https://flaky", "timeout");
        flaky.alerted = false;

        let records: HashMap<_, _> = [broken, flaky]
            .into_iter()
            .map(|r| (r.url.clone(), r))
            .collect();

        let result = filter_eligible(
            vec![
                sub("a", "https://ok"),
                sub("b", "https://broken"),
                sub("c", "https://flaky"),
                sub("d", "https://ok").disabled_because("missing permissions"),
            ],
            &records,
            |r| r.alerted,
        );

        let ids: Vec<_> = result.eligible.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(result.disabled, 1);
        assert_eq!(result.excluded, 1);
    }
}
