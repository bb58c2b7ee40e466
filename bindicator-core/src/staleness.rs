//! Decides whether a cached schedule can be served without asking the source.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::cache::CacheEntry;

/// Why a request has to go to the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchReason {
    /// Nothing cached for the key.
    Missing,
    /// Cached on an earlier UTC day.
    Stale,
    /// Caller asked for a refresh.
    Forced,
}

impl fmt::Display for FetchReason {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            FetchReason::Missing => "missing",
            FetchReason::Stale => "stale",
            FetchReason::Forced => "refresh requested",
        };
        formatter.write_str(reason)
    }
}

/// Outcome of checking a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDecision {
    /// The cached value may be served as-is.
    Serve,
    /// The source has to be consulted.
    Fetch(FetchReason),
}

/// Freshness rule: an entry is valid for the rest of the UTC day it was fetched on.
///
/// There is no rolling TTL; a result fetched at 23:59 is stale a minute later.
#[derive(Debug, Default, Clone, Copy)]
pub struct StalenessPolicy;

impl StalenessPolicy {
    /// Whether a result fetched at `fetched_at` is still fresh at `now`.
    #[must_use]
    pub fn is_fresh(self, fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        fetched_at.date_naive() == now.date_naive()
    }

    /// Decide between serving `entry` and fetching anew.
    #[must_use]
    pub fn assess(self, entry: Option<&CacheEntry>, now: DateTime<Utc>, refresh: bool) -> CacheDecision {
        if refresh {
            return CacheDecision::Fetch(FetchReason::Forced);
        }
        match entry {
            None => CacheDecision::Fetch(FetchReason::Missing),
            Some(entry) if self.is_fresh(entry.fetched_at, now) => CacheDecision::Serve,
            Some(_) => CacheDecision::Fetch(FetchReason::Stale),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, day, hour, minute, 0).unwrap()
    }

    #[test]
    fn same_utc_day_is_fresh() {
        let policy = StalenessPolicy;
        assert!(policy.is_fresh(at(14, 0, 1), at(14, 23, 59)));
        assert!(!policy.is_fresh(at(14, 23, 59), at(15, 0, 0)));
        assert!(!policy.is_fresh(at(13, 12, 0), at(14, 11, 0)));
    }

    #[test]
    fn refresh_overrides_freshness() {
        let policy = StalenessPolicy;
        assert_eq!(
            policy.assess(None, at(14, 9, 0), true),
            CacheDecision::Fetch(FetchReason::Forced)
        );
        assert_eq!(
            policy.assess(None, at(14, 9, 0), false),
            CacheDecision::Fetch(FetchReason::Missing)
        );
    }
}
