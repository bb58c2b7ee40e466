//! High-level service facade combining the source, the cache, and the matcher.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::{CacheEntry, CacheKey, CacheStore, ClearScope};
use crate::clock::Clock;
use crate::locks::KeyedLocks;
use crate::matcher::{AddressMatcher, MatchWeights, MatchedAddress};
use crate::model::{AddressCandidate, Postcode, ScheduleRef, ScheduleResult, SourceKind};
use crate::plugin::SourcePlugin;
use crate::ports::{PortError, bounded};
use crate::staleness::{CacheDecision, FetchReason, StalenessPolicy};
use crate::verifier::{MixedRouteVerifier, Pacer, Verification, VerifySettings};

const MAX_HOUSE_TOKEN_LEN: usize = 100;

#[derive(Debug, Clone, Copy)]
/// Tunables for the resolution service.
pub struct ServiceSettings {
    /// Deadline for every upstream call.
    pub upstream_timeout: Duration,
    /// Mixed-route sampling and throttling.
    pub verify: VerifySettings,
    /// Address match scoring.
    pub weights: MatchWeights,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_secs(20),
            verify: VerifySettings::default(),
            weights: MatchWeights::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Schedule plus whether it came straight from the cache.
pub struct ScheduleOutcome {
    /// The schedule.
    pub result: ScheduleResult,
    /// `true` when served without contacting the source.
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Answer to a house lookup.
pub enum Resolution {
    /// One candidate matched exactly and beat every other candidate.
    Accepted(MatchedAddress),
    /// Ranked candidates for the caller to choose from.
    Candidates(Vec<MatchedAddress>),
}

impl Resolution {
    /// Ranked list view; an accepted match becomes a single-element list.
    #[must_use]
    pub fn into_candidates(self) -> Vec<MatchedAddress> {
        match self {
            Resolution::Accepted(matched) => vec![matched],
            Resolution::Candidates(ranked) => ranked,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Freshness summary of one cache entry.
pub struct CacheStatusEntry {
    /// Normalized key.
    pub key: CacheKey,
    /// When the cached schedule was fetched.
    pub fetched_at: DateTime<Utc>,
    /// Whether it can be served today without refetching.
    pub fresh: bool,
    /// Whether verification found several routes.
    pub mixed_routes: bool,
    /// When verification last ran.
    pub verified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Tally of a startup prefetch run.
pub struct PrefetchReport {
    /// Entries refreshed successfully.
    pub refreshed: usize,
    /// Entries whose refresh failed and were left as they were.
    pub failed: usize,
}

struct Inner {
    plugin: SourcePlugin,
    store: Arc<CacheStore>,
    clock: Arc<dyn Clock>,
    policy: StalenessPolicy,
    matcher: AddressMatcher,
    verifier: MixedRouteVerifier,
    locks: KeyedLocks<CacheKey>,
    upstream_timeout: Duration,
}

/// Public entry point for address resolution, schedules, and verification.
///
/// Cheap to clone; clones share the cache and the per-key fetch locks.
#[derive(Clone)]
pub struct ResolutionService {
    inner: Arc<Inner>,
}

impl ResolutionService {
    /// Create a service over the selected source plugin and cache.
    #[must_use]
    pub fn new(
        plugin: SourcePlugin,
        store: Arc<CacheStore>,
        clock: Arc<dyn Clock>,
        pacer: Arc<dyn Pacer>,
        settings: ServiceSettings,
    ) -> Self {
        let verifier = MixedRouteVerifier::new(
            Arc::clone(&plugin.address_port),
            Arc::clone(&plugin.schedule_port),
            Arc::clone(&store),
            Arc::clone(&clock),
            pacer,
            settings.verify,
            settings.upstream_timeout,
        );
        Self {
            inner: Arc::new(Inner {
                plugin,
                store,
                clock,
                policy: StalenessPolicy,
                matcher: AddressMatcher::new(settings.weights),
                verifier,
                locks: KeyedLocks::new(),
                upstream_timeout: settings.upstream_timeout,
            }),
        }
    }

    /// Which source variant this deployment uses.
    #[must_use]
    pub fn source_kind(&self) -> SourceKind {
        self.inner.plugin.kind
    }

    /// List the addresses of a postcode.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::NotFound`] when the source lists nothing, or the source's error.
    pub async fn addresses(&self, postcode: &Postcode) -> Result<Vec<AddressCandidate>, PortError> {
        let addresses = bounded(
            self.inner.upstream_timeout,
            "address lookup",
            self.inner.plugin.address_port.lookup_addresses(postcode),
        )
        .await?;
        if addresses.is_empty() {
            return Err(PortError::NotFound(format!("no addresses listed for {postcode}")));
        }
        tracing::info!(%postcode, candidates = addresses.len(), "addresses listed");
        Ok(addresses)
    }

    /// Match free-text house input against the addresses of a postcode.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::InvalidInput`] for unusable house input,
    /// [`PortError::NotFound`] when the postcode has no addresses, or the source's error.
    pub async fn resolve(&self, postcode: &Postcode, house: &str) -> Result<Resolution, PortError> {
        if house.len() > MAX_HOUSE_TOKEN_LEN || house.chars().any(char::is_control) {
            return Err(PortError::InvalidInput(
                "house must be a short house number or name".to_owned(),
            ));
        }

        let ranked = bounded(
            self.inner.upstream_timeout,
            "address lookup",
            self.inner
                .matcher
                .resolve(self.inner.plugin.address_port.as_ref(), postcode, house),
        )
        .await?;

        let Some((top, rest)) = ranked.split_first() else {
            return Err(PortError::NotFound(format!("no addresses listed for {postcode}")));
        };
        if top.exact && rest.first().is_none_or(|runner_up| top.score > runner_up.score) {
            tracing::info!(%postcode, uprn = %top.candidate.uprn, "house resolved automatically");
            return Ok(Resolution::Accepted(top.clone()));
        }
        Ok(Resolution::Candidates(ranked))
    }

    /// Schedule for a postcode or property, from the cache when fresh.
    ///
    /// The fetch runs on its own task: if the caller goes away mid-fetch, the
    /// result still lands in the cache for the next request. A failed fetch
    /// leaves any previous entry untouched.
    ///
    /// # Errors
    ///
    /// Returns the source's [`PortError`] or a storage error; nothing stale or
    /// synthetic is substituted.
    pub async fn schedule(&self, reference: ScheduleRef, refresh: bool) -> Result<ScheduleOutcome, PortError> {
        let key = CacheKey::from(&reference);
        let entry = self.inner.store.get(&key).await;

        let decision = self.inner.policy.assess(entry.as_ref(), self.inner.clock.now(), refresh);

        let reason = match (decision, entry) {
            (CacheDecision::Serve, Some(entry)) => {
                tracing::debug!(%key, "cache hit");
                return Ok(ScheduleOutcome {
                    result: entry.data,
                    cached: true,
                });
            }
            (CacheDecision::Fetch(reason), _) => reason,
            (CacheDecision::Serve, None) => FetchReason::Missing,
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.fetch_and_store(reference, key, reason).await })
            .await
            .map_err(|err| PortError::Internal(format!("schedule fetch task failed: {err}")))?
    }

    /// Check a postcode for mixed collection routes, at most once per throttle window.
    ///
    /// A postcode without a cache entry gets one through the normal schedule path first.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::NotFound`] when the postcode has no addresses, or the source's error.
    pub async fn verify(&self, postcode: &Postcode) -> Result<Verification, PortError> {
        let key = CacheKey::Postcode(postcode.clone());
        if self.inner.store.get(&key).await.is_none() {
            self.schedule(ScheduleRef::Postcode(postcode.clone()), false)
                .await?;
        }
        self.inner.verifier.verify(postcode).await
    }

    /// Refresh every cached entry fetched before today, one at a time.
    ///
    /// Failures are logged and skipped.
    pub async fn refresh_stale(&self) -> PrefetchReport {
        let now = self.inner.clock.now();
        let stale: Vec<CacheEntry> = self
            .inner
            .store
            .entries()
            .await
            .into_iter()
            .filter(|entry| !self.inner.policy.is_fresh(entry.fetched_at, now))
            .collect();

        let mut report = PrefetchReport::default();
        for entry in stale {
            match self.schedule(ScheduleRef::from(&entry.key), false).await {
                Ok(_) => report.refreshed += 1,
                Err(err) => {
                    tracing::warn!(key = %entry.key, error = %err, "prefetch failed, keeping stale entry");
                    report.failed += 1;
                }
            }
        }
        tracing::info!(refreshed = report.refreshed, failed = report.failed, "prefetch finished");
        report
    }

    /// Freshness of every cached entry, ordered by key.
    pub async fn cache_status(&self) -> Vec<CacheStatusEntry> {
        let now = self.inner.clock.now();
        self.inner
            .store
            .entries()
            .await
            .into_iter()
            .map(|entry| CacheStatusEntry {
                fresh: self.inner.policy.is_fresh(entry.fetched_at, now),
                fetched_at: entry.fetched_at,
                mixed_routes: entry.mixed_routes,
                verified_at: entry.verification.as_ref().map(|check| check.checked_at),
                key: entry.key,
            })
            .collect()
    }

    /// Remove cached entries.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::Storage`] when the snapshot cannot be rewritten.
    pub async fn clear_cache(&self, scope: &ClearScope) -> Result<usize, PortError> {
        let removed = self.inner.store.clear(scope).await?;
        tracing::info!(?scope, removed, "cache cleared");
        Ok(removed)
    }

    /// Current time as seen by the service.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }
}

impl Inner {
    async fn fetch_and_store(
        &self,
        reference: ScheduleRef,
        key: CacheKey,
        reason: FetchReason,
    ) -> Result<ScheduleOutcome, PortError> {
        let _guard = self.locks.acquire(&key).await;

        // another request may have stored a fresh value while this one waited
        let previous = self.store.get(&key).await;
        if reason != FetchReason::Forced
            && let Some(entry) = previous
                .as_ref()
                .filter(|entry| self.policy.is_fresh(entry.fetched_at, self.clock.now()))
        {
            return Ok(ScheduleOutcome {
                result: entry.data.clone(),
                cached: true,
            });
        }

        tracing::info!(%key, %reason, source = %self.plugin.kind, "fetching schedule");
        let schedule = match bounded(
            self.upstream_timeout,
            "schedule lookup",
            self.plugin.schedule_port.lookup_schedule(&reference),
        )
        .await
        {
            Ok(schedule) => schedule,
            Err(err) => {
                tracing::warn!(%key, error = %err, "schedule fetch failed, cache left untouched");
                return Err(err);
            }
        };

        let mut fetched_at = self.clock.now();
        if let Some(previous) = &previous
            && fetched_at <= previous.fetched_at
        {
            fetched_at = previous.fetched_at + chrono::Duration::microseconds(1);
        }

        let entry = self
            .store
            .put(key, ScheduleResult::new(schedule, self.plugin.kind, fetched_at))
            .await?;
        Ok(ScheduleOutcome {
            result: entry.data,
            cached: false,
        })
    }
}
