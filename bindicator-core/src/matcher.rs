//! Ranks the addresses of a postcode against what the user typed as their house.

use std::cmp::Reverse;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::{AddressCandidate, Postcode};
use crate::ports::{AddressPort, PortError};

/// Street types whose first occurrence ends a house name, e.g. `Rose Cottage Green Lane`.
const STREET_TYPES: [&str; 23] = [
    "Close", "Road", "Street", "Avenue", "Court", "Lane", "Drive", "Way", "Gardens", "Place",
    "Crescent", "Rise", "Hill", "Green", "Grove", "Park", "Vale", "Row", "Terrace", "Mews",
    "Square", "Walk", "View",
];

static HOUSE_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+[A-Za-z]?)(?:\s|$)").expect("house number pattern is valid")
});

static STREET_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    let alternatives = STREET_TYPES.join("|");
    Regex::new(&format!(r"(?i)\s(?:{alternatives})\b")).expect("street type pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Score awarded to each tier of match.
pub struct MatchWeights {
    /// House token equals the candidate's token.
    pub exact: u32,
    /// One token contains the other.
    pub partial: u32,
    /// No relation; the candidate is still listed.
    pub unrelated: u32,
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self {
            exact: 100,
            partial: 50,
            unrelated: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Candidate annotated with how well it matches the house input.
pub struct MatchedAddress {
    /// Address as listed by the source.
    pub candidate: AddressCandidate,
    /// Whether the house token matched exactly.
    pub exact: bool,
    /// Match score, higher is better.
    pub score: u32,
}

/// Scores free-text house input against address candidates.
#[derive(Debug, Default, Clone, Copy)]
pub struct AddressMatcher {
    weights: MatchWeights,
}

impl AddressMatcher {
    /// Create a matcher with custom weights.
    #[must_use]
    pub fn new(weights: MatchWeights) -> Self {
        Self { weights }
    }

    /// Fetch the candidates for `postcode` and rank them against `house`.
    ///
    /// # Errors
    ///
    /// Propagates the address port's [`PortError`].
    pub async fn resolve(
        &self,
        port: &dyn AddressPort,
        postcode: &Postcode,
        house: &str,
    ) -> Result<Vec<MatchedAddress>, PortError> {
        let candidates = port.lookup_addresses(postcode).await?;
        let ranked = self.rank(candidates, house);
        tracing::debug!(
            %postcode,
            house,
            candidates = ranked.len(),
            exact = ranked.iter().filter(|matched| matched.exact).count(),
            "ranked address candidates"
        );
        Ok(ranked)
    }

    /// Score every candidate and order them best first.
    ///
    /// Nothing is filtered out. Ties go to the shorter address text.
    #[must_use]
    pub fn rank(&self, candidates: Vec<AddressCandidate>, house: &str) -> Vec<MatchedAddress> {
        let wanted = normalize_house_token(house);

        let mut ranked: Vec<MatchedAddress> = candidates
            .into_iter()
            .map(|candidate| {
                let (exact, score) = if wanted.is_empty() {
                    (false, 0)
                } else {
                    let token = normalize_house_token(&extract_house_token(&candidate.address));
                    self.score(&wanted, &token)
                };
                MatchedAddress {
                    candidate,
                    exact,
                    score,
                }
            })
            .collect();

        ranked.sort_by(|left, right| {
            (Reverse(left.score), left.candidate.address.len(), &left.candidate.address).cmp(&(
                Reverse(right.score),
                right.candidate.address.len(),
                &right.candidate.address,
            ))
        });
        ranked
    }

    fn score(&self, wanted: &str, token: &str) -> (bool, u32) {
        if token.is_empty() {
            return (false, self.weights.unrelated);
        }
        if wanted == token {
            (true, self.weights.exact)
        } else if token.contains(wanted) || wanted.contains(token) {
            (false, self.weights.partial)
        } else {
            (false, self.weights.unrelated)
        }
    }
}

/// Trim, lower-case, and drop trailing punctuation from a house token.
#[must_use]
pub fn normalize_house_token(raw: &str) -> String {
    raw.trim()
        .trim_end_matches(|ch: char| ch.is_ascii_punctuation())
        .trim_end()
        .to_lowercase()
}

/// Pull the house number or name out of an address line.
///
/// Looks at the first comma-separated segment and takes, in order: a leading
/// number with an optional one-letter suffix, the text before the first street
/// type word, or the whole segment.
#[must_use]
pub fn extract_house_token(address: &str) -> String {
    let first_segment = address.split(',').next().unwrap_or_default().trim();

    if let Some(number) = HOUSE_NUMBER
        .captures(first_segment)
        .and_then(|captures| captures.get(1))
    {
        return number.as_str().to_owned();
    }

    if let Some(street) = STREET_TYPE.find(first_segment) {
        let name = first_segment.get(..street.start()).unwrap_or_default().trim();
        if !name.is_empty() {
            return name.to_owned();
        }
    }

    first_segment.to_owned()
}
