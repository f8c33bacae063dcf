//! The same-file predicate (§4.7), used to decide whether a freshly
//! observed file matches what the index already has on record.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

const TEN_MICROS: i64 = 10;

/// The subset of a FileIndex row (or a fresh filesystem stat) the
/// predicate needs.
#[derive(Debug, Clone, Copy)]
pub struct FileStat<'a> {
    pub hash: Option<&'a str>,
    pub mod_time: Option<DateTime<Utc>>,
    pub size: Option<i64>,
}

/// True if `a` and `b` describe the same file content, per the three
/// branches of §4.7.
pub fn is_same_file(a: FileStat<'_>, b: FileStat<'_>) -> bool {
    // Rule 3: an absent mtime on either side decides the answer outright.
    if a.mod_time.is_none() || b.mod_time.is_none() {
        return a.mod_time.is_none() && b.mod_time.is_none();
    }

    let t1 = a.mod_time.unwrap();
    let t2 = b.mod_time.unwrap();
    let diff_micros = (t1 - t2).num_microseconds().unwrap_or(i64::MAX).abs();

    match (a.hash, b.hash) {
        (Some(h1), Some(h2)) => {
            if h1 != h2 {
                return false;
            }
            if a.size != b.size {
                warn!(hash = h1, ?a.size, ?b.size, "same hash but different size");
                return false;
            }
            if diff_micros > TEN_MICROS {
                warn!(
                    hash = h1,
                    size = ?a.size,
                    t1 = %t1,
                    t2 = %t2,
                    "same hash and size but mtimes differ"
                );
            }
            true
        }
        _ => {
            let same = a.size == b.size && diff_micros < TEN_MICROS;
            if !same && (1..=1000).contains(&diff_micros) {
                info!(t1 = %t1, t2 = %t2, diff_micros, "small mtime difference without a hash, treating as distinct");
            }
            same
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat<'a>(hash: Option<&'a str>, mod_time: Option<DateTime<Utc>>, size: Option<i64>) -> FileStat<'a> {
        FileStat { hash, mod_time, size }
    }

    #[test]
    fn reflexive_for_a_well_formed_entry() {
        let t = Utc::now();
        let s = stat(Some("abc"), Some(t), Some(100));
        assert!(is_same_file(s, s));
    }

    #[test]
    fn differing_hash_is_not_same() {
        let t = Utc::now();
        assert!(!is_same_file(
            stat(Some("abc"), Some(t), Some(100)),
            stat(Some("def"), Some(t), Some(100)),
        ));
    }

    #[test]
    fn same_hash_but_different_size_is_not_same() {
        let t = Utc::now();
        assert!(!is_same_file(
            stat(Some("abc"), Some(t), Some(100)),
            stat(Some("abc"), Some(t), Some(200)),
        ));
    }

    #[test]
    fn same_hash_and_size_with_drifted_mtime_is_still_same() {
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(5);
        assert!(is_same_file(
            stat(Some("abc"), Some(t1), Some(100)),
            stat(Some("abc"), Some(t2), Some(100)),
        ));
    }

    #[test]
    fn without_hash_uses_time_and_size_within_ten_micros() {
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::microseconds(1);
        assert!(is_same_file(
            stat(None, Some(t1), Some(100)),
            stat(None, Some(t2), Some(100)),
        ));
    }

    #[test]
    fn without_hash_distinct_beyond_threshold() {
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::microseconds(500);
        assert!(!is_same_file(
            stat(None, Some(t1), Some(100)),
            stat(None, Some(t2), Some(100)),
        ));
    }

    #[test]
    fn absent_mtime_on_either_side_requires_both_absent() {
        let t = Utc::now();
        assert!(!is_same_file(
            stat(Some("abc"), None, Some(100)),
            stat(Some("abc"), Some(t), Some(100)),
        ));
        assert!(is_same_file(
            stat(Some("abc"), None, Some(100)),
            stat(Some("def"), None, Some(999)),
        ));
    }
}
