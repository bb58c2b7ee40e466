//! Traits describing source capabilities and shared helper types.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::ParseError as ChronoParseError;
use reqwest::Error as ReqwestError;

use crate::cache::CacheError;
use crate::model::{AddressCandidate, CollectionSchedule, Postcode, ScheduleRef, SourceKind};

#[derive(thiserror::Error, Debug)]
/// Errors that can occur while resolving addresses and schedules.
pub enum PortError {
    /// Network failure, timeout, or error status from the upstream authority.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    /// Upstream page no longer has the expected structure.
    #[error("Parse failure: {0}")]
    ParseFailure(String),
    /// Postcode or property has no candidates.
    #[error("Not found: {0}")]
    NotFound(String),
    /// Malformed postcode, property reference, or house token.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// Reading or writing the cache failed.
    #[error("Cache storage error: {0}")]
    Storage(#[from] CacheError),
    /// Internal service error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ReqwestError> for PortError {
    fn from(err: ReqwestError) -> Self {
        PortError::UpstreamUnavailable(err.to_string())
    }
}

impl From<ChronoParseError> for PortError {
    fn from(err: ChronoParseError) -> Self {
        PortError::ParseFailure(err.to_string())
    }
}

impl PortError {
    /// Whether the error came from the upstream source rather than the caller or the cache.
    #[must_use]
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            PortError::UpstreamUnavailable(_) | PortError::ParseFailure(_)
        )
    }
}

#[async_trait]
/// Trait for source-specific address lookup backends.
pub trait AddressPort: Send + Sync {
    /// Kind of source backing this port.
    fn kind(&self) -> SourceKind;

    /// List every address the source knows for a postcode.
    ///
    /// An unknown postcode yields an empty list rather than an error.
    ///
    /// # Errors
    ///
    /// Returns a [`PortError`] when the upstream request fails or cannot be parsed.
    async fn lookup_addresses(&self, postcode: &Postcode)
    -> Result<Vec<AddressCandidate>, PortError>;
}

#[async_trait]
/// Trait for source-specific collection schedule backends.
pub trait SchedulePort: Send + Sync {
    /// Kind of source backing this port.
    fn kind(&self) -> SourceKind;

    /// Fetch the next collection for a postcode or property.
    ///
    /// # Errors
    ///
    /// Returns a [`PortError`] when the upstream request fails, cannot be parsed,
    /// or knows nothing about the reference.
    async fn lookup_schedule(&self, reference: &ScheduleRef)
    -> Result<CollectionSchedule, PortError>;
}

/// Run a port call under a deadline so a hung upstream cannot stall a request.
///
/// # Errors
///
/// Returns the call's own error, or [`PortError::UpstreamUnavailable`] once `limit` elapses.
pub async fn bounded<T, F>(limit: Duration, what: &str, call: F) -> Result<T, PortError>
where
    F: Future<Output = Result<T, PortError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_elapsed) => Err(PortError::UpstreamUnavailable(format!(
            "{what} timed out after {}s",
            limit.as_secs_f32()
        ))),
    }
}
