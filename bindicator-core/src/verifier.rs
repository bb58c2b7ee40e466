//! Detects postcodes whose addresses are served by more than one collection route.
//!
//! The schedule fast path assumes one route per postcode. On request, the
//! verifier samples a few addresses, fetches each one's schedule by property
//! reference, and flags the postcode when any two disagree.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheEntry, CacheKey, CacheStore, RouteCheck};
use crate::clock::Clock;
use crate::locks::KeyedLocks;
use crate::model::{AddressCandidate, BinKind, Postcode, ScheduleRef};
use crate::ports::{AddressPort, PortError, SchedulePort, bounded};

#[async_trait]
/// Spacing between consecutive upstream calls while sampling.
pub trait Pacer: Send + Sync {
    /// Wait before the next upstream call.
    async fn pause(&self);
}

/// Pacer that never waits.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPause;

#[async_trait]
impl Pacer for NoPause {
    async fn pause(&self) {}
}

/// Pacer sleeping for a random duration within a range.
#[derive(Debug, Clone, Copy)]
pub struct JitterPacer {
    min: Duration,
    max: Duration,
}

impl JitterPacer {
    /// Sleep between `min` and `max` (inclusive); the bounds are swapped if given backwards.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }
}

#[async_trait]
impl Pacer for JitterPacer {
    async fn pause(&self) {
        let min = u64::try_from(self.min.as_millis()).unwrap_or(u64::MAX);
        let max = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX);
        let millis = rand::thread_rng().gen_range(min..=max);
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Sampling and throttling knobs.
pub struct VerifySettings {
    /// Upper bound on addresses sampled per check; at least two are compared.
    pub sample_size: usize,
    /// Minimum time between two checks of the same postcode.
    pub throttle: chrono::Duration,
}

impl Default for VerifySettings {
    fn default() -> Self {
        Self {
            sample_size: 3,
            throttle: chrono::Duration::hours(24),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Result of a mixed-route check.
pub struct Verification {
    /// Whether sampled addresses disagreed.
    pub mixed_routes: bool,
    /// When the comparison ran.
    pub checked_at: DateTime<Utc>,
    /// Addresses that were sampled.
    pub addresses: Vec<AddressCandidate>,
}

impl Verification {
    fn from_entry(entry: &CacheEntry) -> Option<Self> {
        entry.verification.as_ref().map(|check| Self {
            mixed_routes: entry.mixed_routes,
            checked_at: check.checked_at,
            addresses: check.addresses.clone(),
        })
    }
}

/// Samples addresses under a postcode and compares their schedules.
pub struct MixedRouteVerifier {
    address_port: Arc<dyn AddressPort>,
    schedule_port: Arc<dyn SchedulePort>,
    store: Arc<CacheStore>,
    clock: Arc<dyn Clock>,
    pacer: Arc<dyn Pacer>,
    settings: VerifySettings,
    deadline: Duration,
    locks: KeyedLocks<Postcode>,
}

impl MixedRouteVerifier {
    /// Wire a verifier to its ports and the shared cache.
    #[must_use]
    pub fn new(
        address_port: Arc<dyn AddressPort>,
        schedule_port: Arc<dyn SchedulePort>,
        store: Arc<CacheStore>,
        clock: Arc<dyn Clock>,
        pacer: Arc<dyn Pacer>,
        settings: VerifySettings,
        deadline: Duration,
    ) -> Self {
        Self {
            address_port,
            schedule_port,
            store,
            clock,
            pacer,
            settings,
            deadline,
            locks: KeyedLocks::new(),
        }
    }

    /// Check `postcode` for mixed routes, or return the previous check inside the throttle window.
    ///
    /// The postcode must already have a cache entry; the result is merged into it.
    /// Concurrent checks of one postcode run one after another, so the later
    /// one sees the earlier result and is throttled.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::NotFound`] when the postcode has no addresses or no cache
    /// entry, and propagates upstream and storage errors.
    pub async fn verify(&self, postcode: &Postcode) -> Result<Verification, PortError> {
        let _guard = self.locks.acquire(postcode).await;
        let key = CacheKey::Postcode(postcode.clone());
        let now = self.clock.now();

        if let Some(previous) = self.store.get(&key).await.as_ref().and_then(Verification::from_entry)
            && now.signed_duration_since(previous.checked_at) < self.settings.throttle
        {
            tracing::debug!(%postcode, checked_at = %previous.checked_at, "verification throttled");
            return Ok(previous);
        }

        let candidates = bounded(
            self.deadline,
            "address lookup",
            self.address_port.lookup_addresses(postcode),
        )
        .await?;
        if candidates.is_empty() {
            return Err(PortError::NotFound(format!("no addresses listed for {postcode}")));
        }

        let sample = sample_evenly(candidates, self.settings.sample_size);
        let mut patterns: Vec<(NaiveDate, BTreeSet<BinKind>)> = Vec::with_capacity(sample.len());
        for (index, candidate) in sample.iter().enumerate() {
            if index > 0 {
                self.pacer.pause().await;
            }
            let reference = ScheduleRef::Uprn(candidate.uprn.clone());
            let schedule = bounded(
                self.deadline,
                "schedule lookup",
                self.schedule_port.lookup_schedule(&reference),
            )
            .await?;
            patterns.push((schedule.next_collection_date, schedule.bins));
        }

        let mixed_routes = patterns
            .split_first()
            .is_some_and(|(first, rest)| rest.iter().any(|pattern| pattern != first));
        let check = RouteCheck {
            checked_at: self.clock.now(),
            addresses: sample,
        };

        let entry = self
            .store
            .record_verification(&key, mixed_routes, check)
            .await?
            .ok_or_else(|| PortError::NotFound(format!("nothing cached for {key}")))?;

        tracing::info!(
            %postcode,
            mixed_routes,
            sampled = patterns.len(),
            "mixed-route verification finished"
        );

        Verification::from_entry(&entry)
            .ok_or_else(|| PortError::Internal(format!("verification for {key} was not stored")))
    }
}

/// Pick up to `size` candidates spread evenly from first to last.
fn sample_evenly(candidates: Vec<AddressCandidate>, size: usize) -> Vec<AddressCandidate> {
    let size = size.max(2);
    let len = candidates.len();
    if len <= size {
        return candidates;
    }
    let picks: BTreeSet<usize> = (0..size).map(|step| step * (len - 1) / (size - 1)).collect();
    candidates
        .into_iter()
        .enumerate()
        .filter_map(|(index, candidate)| picks.contains(&index).then_some(candidate))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use chrono::TimeZone;

    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{CollectionSchedule, ScheduleResult, SourceKind, Uprn};

    struct Street {
        addresses: Vec<AddressCandidate>,
        schedules: Mutex<HashMap<String, CollectionSchedule>>,
        calls: Mutex<usize>,
        delay: Duration,
    }

    impl Street {
        fn new(uprns: &[&str]) -> Self {
            let postcode = Postcode::parse("SL6 6AH").unwrap();
            let addresses = uprns
                .iter()
                .enumerate()
                .map(|(index, uprn)| AddressCandidate {
                    uprn: Uprn((*uprn).to_owned()),
                    address: format!("{} The Crescent, Maidenhead, SL6 6AH", index + 1),
                    postcode: postcode.clone(),
                })
                .collect();
            let schedules = uprns
                .iter()
                .map(|uprn| ((*uprn).to_owned(), schedule(17, BinKind::Refuse)))
                .collect();
            Self {
                addresses,
                schedules: Mutex::new(schedules),
                calls: Mutex::new(0),
                delay: Duration::ZERO,
            }
        }

        fn with_delay(self, delay: Duration) -> Self {
            Self { delay, ..self }
        }

        fn set(&self, uprn: &str, next: CollectionSchedule) {
            self.schedules.lock().unwrap().insert(uprn.to_owned(), next);
        }
    }

    fn schedule(day: u32, companion: BinKind) -> CollectionSchedule {
        CollectionSchedule {
            postcode: "SL6 6AH".to_owned(),
            next_collection_date: NaiveDate::from_ymd_opt(2024, 10, day).unwrap(),
            bins: BTreeSet::from([BinKind::Recycling, companion]),
        }
    }

    #[async_trait]
    impl AddressPort for Street {
        fn kind(&self) -> SourceKind {
            SourceKind::Live
        }

        async fn lookup_addresses(&self, _postcode: &Postcode) -> Result<Vec<AddressCandidate>, PortError> {
            Ok(self.addresses.clone())
        }
    }

    #[async_trait]
    impl SchedulePort for Street {
        fn kind(&self) -> SourceKind {
            SourceKind::Live
        }

        async fn lookup_schedule(&self, reference: &ScheduleRef) -> Result<CollectionSchedule, PortError> {
            tokio::time::sleep(self.delay).await;
            *self.calls.lock().unwrap() += 1;
            let ScheduleRef::Uprn(uprn) = reference else {
                return Err(PortError::InvalidInput("expected a uprn".to_owned()));
            };
            self.schedules
                .lock()
                .unwrap()
                .get(uprn.as_str())
                .cloned()
                .ok_or_else(|| PortError::NotFound(uprn.to_string()))
        }
    }

    async fn setup(street: &Arc<Street>) -> (MixedRouteVerifier, Arc<ManualClock>, Arc<CacheStore>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 10, 14, 9, 0, 0).unwrap()));
        let store = Arc::new(CacheStore::in_memory());
        let postcode = Postcode::parse("SL6 6AH").unwrap();
        store
            .put(
                CacheKey::Postcode(postcode),
                ScheduleResult::new(schedule(17, BinKind::Refuse), SourceKind::Live, clock.now()),
            )
            .await
            .unwrap();
        let verifier = MixedRouteVerifier::new(
            Arc::clone(street) as Arc<dyn AddressPort>,
            Arc::clone(street) as Arc<dyn SchedulePort>,
            Arc::clone(&store),
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::new(NoPause),
            VerifySettings::default(),
            Duration::from_secs(5),
        );
        (verifier, clock, store)
    }

    #[tokio::test]
    async fn agreeing_schedules_are_single_route() {
        let street = Arc::new(Street::new(&["1", "2", "3", "4", "5", "6", "7"]));
        let (verifier, _clock, _store) = setup(&street).await;

        let outcome = verifier.verify(&Postcode::parse("SL6 6AH").unwrap()).await.unwrap();
        assert!(!outcome.mixed_routes);
        let sampled: Vec<&str> = outcome.addresses.iter().map(|address| address.uprn.as_str()).collect();
        assert_eq!(sampled, ["1", "4", "7"]);
        assert_eq!(*street.calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn disagreement_marks_mixed_routes_and_keeps_data() {
        let street = Arc::new(Street::new(&["1", "2", "3"]));
        street.set("3", schedule(18, BinKind::Garden));
        let (verifier, _clock, store) = setup(&street).await;
        let key = CacheKey::Postcode(Postcode::parse("SL6 6AH").unwrap());
        let before = store.get(&key).await.unwrap();

        let outcome = verifier.verify(&Postcode::parse("SL6 6AH").unwrap()).await.unwrap();
        assert!(outcome.mixed_routes);

        let after = store.get(&key).await.unwrap();
        assert!(after.mixed_routes);
        assert_eq!(after.data, before.data);
        assert_eq!(after.fetched_at, before.fetched_at);
    }

    #[tokio::test]
    async fn second_check_within_window_is_throttled() {
        let street = Arc::new(Street::new(&["1", "2"]));
        let (verifier, clock, _store) = setup(&street).await;
        let postcode = Postcode::parse("SL6 6AH").unwrap();

        let first = verifier.verify(&postcode).await.unwrap();
        street.set("2", schedule(18, BinKind::Garden));
        clock.advance(chrono::Duration::hours(23));

        let second = verifier.verify(&postcode).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(*street.calls.lock().unwrap(), 2);

        clock.advance(chrono::Duration::hours(2));
        let third = verifier.verify(&postcode).await.unwrap();
        assert!(third.mixed_routes);
        assert!(third.checked_at > first.checked_at);
    }

    #[tokio::test]
    async fn concurrent_checks_sample_once() {
        let street = Arc::new(Street::new(&["1", "2", "3"]).with_delay(Duration::from_millis(30)));
        let (verifier, _clock, _store) = setup(&street).await;
        let postcode = Postcode::parse("SL6 6AH").unwrap();

        let (left, right) = tokio::join!(verifier.verify(&postcode), verifier.verify(&postcode));

        assert_eq!(left.unwrap(), right.unwrap());
        assert_eq!(*street.calls.lock().unwrap(), 3);
        assert_eq!(verifier.locks.len(), 0);
    }

    #[tokio::test]
    async fn upstream_failure_leaves_entry_unverified() {
        let street = Arc::new(Street::new(&["1", "2"]));
        street.schedules.lock().unwrap().remove("2");
        let (verifier, _clock, store) = setup(&street).await;

        let err = verifier.verify(&Postcode::parse("SL6 6AH").unwrap()).await;
        assert!(matches!(err, Err(PortError::NotFound(_))));
        let entry = store
            .get(&CacheKey::Postcode(Postcode::parse("SL6 6AH").unwrap()))
            .await
            .unwrap();
        assert!(entry.verification.is_none());
    }

    #[test]
    fn sampling_is_bounded_and_spread() {
        let postcode = Postcode::parse("SL6 6AH").unwrap();
        let candidates: Vec<AddressCandidate> = (0..10)
            .map(|index| AddressCandidate {
                uprn: Uprn(index.to_string()),
                address: format!("{index} Road"),
                postcode: postcode.clone(),
            })
            .collect();
        let picked: Vec<String> = sample_evenly(candidates.clone(), 4)
            .into_iter()
            .map(|candidate| candidate.uprn.0)
            .collect();
        assert_eq!(picked, ["0", "3", "6", "9"]);
        assert_eq!(sample_evenly(candidates[..2].to_vec(), 3).len(), 2);
    }
}
