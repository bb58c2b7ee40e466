//! Domain data structures for postcodes, addresses, and collection schedules.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ports::PortError;

/// Outward code (1-2 letters, digit, optional alphanumeric) followed by the inward code.
static POSTCODE_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z]{1,2}[0-9][A-Z0-9]?[0-9][A-Z]{2}$").expect("postcode pattern is valid")
});

const INWARD_CODE_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
/// Normalized UK postcode, always upper case with a single space before the inward code.
pub struct Postcode(String);

impl Postcode {
    /// Normalize and validate free-text postcode input.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::InvalidInput`] when the input does not have the shape of a UK postcode.
    pub fn parse(raw: &str) -> Result<Self, PortError> {
        let compact: String = raw
            .chars()
            .filter(|ch| !ch.is_whitespace())
            .map(|ch| ch.to_ascii_uppercase())
            .collect();

        if !POSTCODE_SHAPE.is_match(&compact) {
            return Err(PortError::InvalidInput(format!(
                "'{}' is not a valid UK postcode",
                raw.trim()
            )));
        }

        let (outward, inward) = compact.split_at(compact.len() - INWARD_CODE_LEN);
        Ok(Self(format!("{outward} {inward}")))
    }

    /// Normalized text, e.g. `SL6 6AH`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Postcode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl FromStr for Postcode {
    type Err = PortError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl TryFrom<String> for Postcode {
    type Error = PortError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<Postcode> for String {
    fn from(postcode: Postcode) -> Self {
        postcode.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
/// Unique property reference number, kept verbatim.
pub struct Uprn(pub String);

impl Uprn {
    /// Validate a property reference without rewriting it.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::InvalidInput`] for empty references or references containing whitespace.
    pub fn parse(raw: &str) -> Result<Self, PortError> {
        if raw.is_empty() || raw.chars().any(char::is_whitespace) {
            return Err(PortError::InvalidInput(format!(
                "'{raw}' is not a valid property reference"
            )));
        }
        Ok(Self(raw.to_owned()))
    }

    /// Reference text as given.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uprn {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// What a schedule lookup is keyed on.
pub enum ScheduleRef {
    /// Whole postcode, assuming a single route.
    Postcode(Postcode),
    /// A single property.
    Uprn(Uprn),
}

impl fmt::Display for ScheduleRef {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleRef::Postcode(postcode) => write!(formatter, "postcode {postcode}"),
            ScheduleRef::Uprn(uprn) => write!(formatter, "uprn {uprn}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Address returned from a source lookup.
pub struct AddressCandidate {
    /// Property reference used for precise schedule lookups.
    pub uprn: Uprn,
    /// Display text as published upstream.
    pub address: String,
    /// Postcode the candidate was listed under.
    pub postcode: Postcode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Bin categories collected on a given day.
pub enum BinKind {
    /// Blue bin, collected every week.
    Recycling,
    /// Green bin for garden waste.
    Garden,
    /// Black bin for general rubbish.
    Refuse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Which kind of source produced a schedule.
pub enum SourceKind {
    /// Deterministic offline generator.
    Mock,
    /// Upstream authority website.
    Live,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slug = match self {
            SourceKind::Mock => "mock",
            SourceKind::Live => "live",
        };
        write!(formatter, "{slug}")
    }
}

impl FromStr for SourceKind {
    type Err = PortError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "mock" => Ok(SourceKind::Mock),
            "live" | "rbwm" => Ok(SourceKind::Live),
            other => Err(PortError::InvalidInput(format!(
                "unknown datasource '{other}', expected 'mock' or 'live'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Raw answer of a schedule port, before it is stamped and cached.
pub struct CollectionSchedule {
    /// Postcode reported by the source; empty when upstream did not show one.
    pub postcode: String,
    /// Next day any bin is collected.
    pub next_collection_date: NaiveDate,
    /// Bins collected on that day.
    pub bins: BTreeSet<BinKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Schedule as served to callers and stored in the cache.
pub struct ScheduleResult {
    /// Postcode reported by the source.
    pub postcode: String,
    /// Next day any bin is collected.
    pub next_collection_date: NaiveDate,
    /// Bins collected on that day.
    pub bins: BTreeSet<BinKind>,
    /// Source that produced the data.
    pub source: SourceKind,
    /// When the data was fetched.
    pub fetched_at: DateTime<Utc>,
}

impl ScheduleResult {
    /// Stamp a raw schedule with its origin and fetch time.
    #[must_use]
    pub fn new(schedule: CollectionSchedule, source: SourceKind, fetched_at: DateTime<Utc>) -> Self {
        Self {
            postcode: schedule.postcode,
            next_collection_date: schedule.next_collection_date,
            bins: schedule.bins,
            source,
            fetched_at,
        }
    }

    /// English weekday name of the next collection, e.g. `Tuesday`.
    #[must_use]
    pub fn next_collection_day(&self) -> String {
        self.next_collection_date.format("%A").to_string()
    }
}
