//! Outstanding URL bookkeeping per group and batch
//!
//! Each dispatched batch registers its URLs; completion messages remove them.
//! Whatever is left is "hung". The tracker only reports, it never blocks or
//! cancels anything.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use serde::Serialize;

/// A URL that has not reported completion
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct HungUrl {
    pub group: usize,
    pub batch: usize,
    pub url: String,
}

#[derive(Debug, Default)]
pub struct HangTracker {
    outstanding: Mutex<BTreeMap<(usize, usize), BTreeSet<String>>>,
}

impl HangTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the URLs of a freshly dispatched batch
    pub fn start_batch<I, S>(&self, group: usize, batch: usize, urls: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut map) = self.outstanding.lock() {
            map.insert((group, batch), urls.into_iter().map(Into::into).collect());
        }
    }

    /// Mark one URL as done; returns false for unknown URLs
    pub fn complete(&self, group: usize, batch: usize, url: &str) -> bool {
        let Ok(mut map) = self.outstanding.lock() else {
            return false;
        };
        let Some(set) = map.get_mut(&(group, batch)) else {
            return false;
        };
        let removed = set.remove(url);
        if set.is_empty() {
            map.remove(&(group, batch));
        }
        removed
    }

    /// Outstanding URL count of one batch
    pub fn outstanding(&self, group: usize, batch: usize) -> usize {
        self.outstanding
            .lock()
            .ok()
            .and_then(|map| map.get(&(group, batch)).map(BTreeSet::len))
            .unwrap_or(0)
    }

    /// Every URL still outstanding, ordered by group and batch
    pub fn hung_urls(&self) -> Vec<HungUrl> {
        let Ok(map) = self.outstanding.lock() else {
            return Vec::new();
        };
        map.iter()
            .flat_map(|(&(group, batch), urls)| {
                urls.iter().map(move |url| HungUrl {
                    group,
                    batch,
                    url: url.clone(),
                })
            })
            .collect()
    }

    pub fn hung_count(&self) -> usize {
        self.outstanding
            .lock()
            .map(|map| map.values().map(BTreeSet::len).sum())
            .unwrap_or(0)
    }

    /// Forget everything, at the start of a new cycle
    pub fn clear(&self) {
        if let Ok(mut map) = self.outstanding.lock() {
            map.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_removes_urls() {
        let tracker = HangTracker::new();
        tracker.start_batch(0, 0, ["https://a", "https://b"]);
        tracker.start_batch(1, 0, ["https://c"]);
        assert_eq!(tracker.hung_count(), 3);

        assert!(tracker.complete(0, 0, "https://a"));
        assert!(!tracker.complete(0, 0, "https://a"));
        assert!(tracker.complete(1, 0, "https://c"));
        assert_eq!(tracker.outstanding(0, 0), 1);
        assert_eq!(tracker.outstanding(1, 0), 0);

        assert_eq!(
            tracker.hung_urls(),
            vec![HungUrl {
                group: 0,
                batch: 0,
                url: "https://b".to_string()
            }]
        );
    }

    #[test]
    fn test_clear() {
        let tracker = HangTracker::new();
        tracker.start_batch(0, 3, ["https://a"]);
        tracker.clear();
        assert!(tracker.hung_urls().is_empty());
        assert!(!tracker.complete(0, 3, "https://a"));
    }
}
