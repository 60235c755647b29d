//! Maps logical items to lexicographically ordered keys under the pending and
//! completed prefixes (§4.A), and parses pending keys back into their parts.
//!
//! The codec is total and pure: given a `KeyLayout`, key construction and
//! parsing never touch the KV store and never fail except on malformed input
//! to `parse_pending_key`.

use crate::error::{Error, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;

/// Highest representable weight. Subtracting `weight` from this value inverts
/// the sort so that a lexicographic ascending scan yields the highest weight
/// first (§4.A).
pub const MAX_WEIGHT: u16 = 65535;

const DEFAULT_PENDING_PREFIX: &str = "queue/pending/";
const DEFAULT_COMPLETED_PREFIX: &str = "queue/completed/";
const SUFFIX_LEN: usize = 8;

/// The reserved key prefixes partitioning the keyspace (§4.A, §6).
#[derive(Debug, Clone)]
pub struct KeyLayout {
    pending_prefix: String,
    completed_prefix: String,
}

impl Default for KeyLayout {
    fn default() -> Self {
        KeyLayout {
            pending_prefix: DEFAULT_PENDING_PREFIX.to_string(),
            completed_prefix: DEFAULT_COMPLETED_PREFIX.to_string(),
        }
    }
}

/// The parsed components of a pending key, as produced by [`KeyLayout::parse_pending_key`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub bucket: String,
    pub weight: u16,
    pub created_at: String,
    pub suffix: String,
}

impl KeyLayout {
    pub fn new(pending_prefix: impl Into<String>, completed_prefix: impl Into<String>) -> Self {
        let mut pending_prefix = pending_prefix.into();
        let mut completed_prefix = completed_prefix.into();
        if !pending_prefix.ends_with('/') {
            pending_prefix.push('/');
        }
        if !completed_prefix.ends_with('/') {
            completed_prefix.push('/');
        }
        KeyLayout {
            pending_prefix,
            completed_prefix,
        }
    }

    pub fn pending_prefix(&self) -> &str {
        &self.pending_prefix
    }

    pub fn completed_prefix(&self) -> &str {
        &self.completed_prefix
    }

    /// The range prefix covering every pending key in `bucket`.
    pub fn bucket_prefix(&self, bucket: &str) -> String {
        format!("{}{}/", self.pending_prefix, bucket)
    }

    /// Builds the pending key for an item, per the format in §4.A/§6:
    /// `PFX_PENDING/bucket/(MAX_WEIGHT-weight):05d/created_at/rand_suffix`.
    pub fn pending_key(&self, bucket: &str, weight: u16, created_at: &str, suffix: &str) -> String {
        format!(
            "{}{}/{:05}/{}/{}",
            self.pending_prefix,
            bucket,
            MAX_WEIGHT - weight,
            created_at,
            suffix
        )
    }

    /// Derives the completed key for a pending key by prefix substitution
    /// (§4.A: "otherwise identical").
    pub fn completed_key(&self, pending_key: &str) -> Result<String> {
        let suffix = pending_key.strip_prefix(&self.pending_prefix).ok_or(
            Error::MalformedKey(pending_key.to_string(), "missing pending prefix"),
        )?;
        Ok(format!("{}{}", self.completed_prefix, suffix))
    }

    /// Parses a pending key back into its components.
    pub fn parse_pending_key(&self, key: &str) -> Result<ParsedKey> {
        let rest = key
            .strip_prefix(&self.pending_prefix)
            .ok_or(Error::MalformedKey(key.to_string(), "missing pending prefix"))?;

        // rest = bucket/inverted_weight/created_at/suffix, and bucket itself
        // may not contain '/', so split from the back.
        let mut parts = rest.rsplitn(4, '/');
        let suffix = parts
            .next()
            .ok_or(Error::MalformedKey(key.to_string(), "missing suffix"))?;
        let created_at = parts
            .next()
            .ok_or(Error::MalformedKey(key.to_string(), "missing created_at"))?;
        let inverted_weight = parts
            .next()
            .ok_or(Error::MalformedKey(key.to_string(), "missing weight"))?;
        let bucket = parts
            .next()
            .ok_or(Error::MalformedKey(key.to_string(), "missing bucket"))?;

        let inverted_weight: u16 = inverted_weight
            .parse()
            .map_err(|_| Error::MalformedKey(key.to_string(), "weight segment is not numeric"))?;

        Ok(ParsedKey {
            bucket: bucket.to_string(),
            weight: MAX_WEIGHT - inverted_weight,
            created_at: created_at.to_string(),
            suffix: suffix.to_string(),
        })
    }
}

/// Generates a short random alphanumeric suffix used to disambiguate items
/// created in the same nanosecond (§4.A).
pub fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_key_orders_by_descending_weight() {
        let layout = KeyLayout::default();
        let low = layout.pending_key("b", 1000, "2024-01-01T00:00:00.000000000Z", "aaaaaaaa");
        let high = layout.pending_key("b", 9000, "2024-01-01T00:00:00.000000000Z", "aaaaaaaa");
        // Higher weight sorts first (lexicographically smaller inverted weight segment).
        assert!(high < low);
    }

    #[test]
    fn ties_broken_by_created_at_then_suffix() {
        let layout = KeyLayout::default();
        let earlier = layout.pending_key("b", 5000, "2024-01-01T00:00:00.000000000Z", "aaaaaaaa");
        let later = layout.pending_key("b", 5000, "2024-01-01T00:00:01.000000000Z", "aaaaaaaa");
        assert!(earlier < later);

        let a = layout.pending_key("b", 5000, "2024-01-01T00:00:00.000000000Z", "aaaaaaaa");
        let b = layout.pending_key("b", 5000, "2024-01-01T00:00:00.000000000Z", "bbbbbbbb");
        assert!(a < b);
    }

    #[test]
    fn completed_key_swaps_prefix_only() {
        let layout = KeyLayout::default();
        let pending = layout.pending_key("b", 5000, "2024-01-01T00:00:00.000000000Z", "aaaaaaaa");
        let completed = layout.completed_key(&pending).unwrap();
        assert_eq!(
            completed,
            "queue/completed/b/60535/2024-01-01T00:00:00.000000000Z/aaaaaaaa"
        );
    }

    #[test]
    fn parse_pending_key_round_trips() {
        let layout = KeyLayout::default();
        let key = layout.pending_key("my-bucket", 1234, "2024-01-01T00:00:00.000000000Z", "suffix12");
        let parsed = layout.parse_pending_key(&key).unwrap();
        assert_eq!(parsed.bucket, "my-bucket");
        assert_eq!(parsed.weight, 1234);
        assert_eq!(parsed.created_at, "2024-01-01T00:00:00.000000000Z");
        assert_eq!(parsed.suffix, "suffix12");
    }

    #[test]
    fn parse_rejects_foreign_prefix() {
        let layout = KeyLayout::default();
        assert!(layout.parse_pending_key("other/pending/b/00001/ts/suffix").is_err());
    }

    #[test]
    fn random_suffix_has_expected_length_and_alphabet() {
        let suffix = random_suffix();
        assert_eq!(suffix.len(), SUFFIX_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
