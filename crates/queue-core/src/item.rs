use crate::codec::KeyLayout;
use serde::{Deserialize, Serialize};

/// A unit of work tracked by the queue.
///
/// `created_at` and `request_id` are immutable after creation (§3 invariant 4).
/// `key` is assigned once, at construction, and never changes even if `weight`
/// or `value` are updated in place (§3 invariant 2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub bucket: String,
    pub created_at: String,
    pub key: String,
    pub value: String,
    pub weight: u16,
    pub progress: i32,
    pub canceled: bool,
    pub error: String,
    pub request_id: String,
}

impl Item {
    /// Builds a new item, deriving its pending key from `bucket`/`weight`/
    /// `created_at`/a fresh random suffix. The item has no storage
    /// interaction until it is passed to `Queue::enqueue`.
    pub fn new(
        layout: &KeyLayout,
        bucket: impl Into<String>,
        value: impl Into<String>,
        weight: u16,
    ) -> Self {
        let bucket = bucket.into();
        let created_at = now_rfc3339_nanos();
        let suffix = crate::codec::random_suffix();
        let key = layout.pending_key(&bucket, weight, &created_at, &suffix);

        Item {
            bucket,
            created_at,
            key,
            value: value.into(),
            weight,
            progress: 0,
            canceled: false,
            error: String::new(),
            request_id: String::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Clamps `progress` into `0..=100` and returns the item unchanged otherwise.
    /// `progress > 100` is clamped to 100, per §4.C edge cases.
    pub fn clamped(mut self) -> Self {
        if self.progress > 100 {
            self.progress = 100;
        }
        if self.progress < 0 {
            self.progress = 0;
        }
        self
    }

    /// An item is completed once `progress == 100`, `error` is non-empty, or
    /// `canceled` is set (§3 Derived state).
    pub fn is_completed(&self) -> bool {
        self.progress == 100 || !self.error.is_empty() || self.canceled
    }

    /// Compares every field exactly except `created_at`, which is compared on
    /// only its first 29 characters (§4.B, §8 "Equality tolerance"). Useful
    /// when comparing an item against one that has round-tripped through a
    /// KV store or codec whose timestamp formatting may normalize trailing
    /// zeros differently than ours.
    pub fn eq_ignoring_created_at_precision(&self, other: &Item) -> bool {
        fn prefix(s: &str) -> &str {
            let n = s.len().min(29);
            &s[..n]
        }

        self.bucket == other.bucket
            && prefix(&self.created_at) == prefix(&other.created_at)
            && self.key == other.key
            && self.value == other.value
            && self.weight == other.weight
            && self.progress == other.progress
            && self.canceled == other.canceled
            && self.error == other.error
            && self.request_id == other.request_id
    }
}

fn now_rfc3339_nanos() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_rules() {
        let layout = KeyLayout::default();
        let mut item = Item::new(&layout, "b", "v", 10);
        assert!(!item.is_completed());

        item.progress = 100;
        assert!(item.is_completed());

        let mut item2 = Item::new(&layout, "b", "v", 10);
        item2.error = "boom".to_string();
        assert!(item2.is_completed());

        let mut item3 = Item::new(&layout, "b", "v", 10);
        item3.canceled = true;
        assert!(item3.is_completed());
    }

    #[test]
    fn progress_clamped_to_100() {
        let layout = KeyLayout::default();
        let item = Item::new(&layout, "b", "v", 10);
        let mut item = item;
        item.progress = 250;
        let item = item.clamped();
        assert_eq!(item.progress, 100);
        assert!(item.is_completed());
    }

    #[test]
    fn json_round_trip_is_exact() {
        let layout = KeyLayout::default();
        let item = Item::new(&layout, "b", "v", 10).with_request_id("req-1");
        let encoded = serde_json::to_vec(&item).unwrap();
        let decoded: Item = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(item, decoded);
    }

    #[test]
    fn tolerant_eq_ignores_created_at_tail() {
        let layout = KeyLayout::default();
        let mut a = Item::new(&layout, "b", "v", 10);
        // First 29 characters identical; only trailing precision differs,
        // simulating a decoder that normalizes trailing nanosecond digits.
        a.created_at = "2024-01-02T03:04:05.12345678".to_string() + "9Z";
        let mut b = a.clone();
        b.created_at = "2024-01-02T03:04:05.12345678".to_string() + "0000Z";

        assert_eq!(&a.created_at[..29], &b.created_at[..29]);
        assert!(a.eq_ignoring_created_at_precision(&b));

        b.value.push('x');
        assert!(!a.eq_ignoring_created_at_precision(&b));
    }
}
