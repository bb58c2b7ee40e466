//! Durable cache of schedule results.
//!
//! The store keeps the whole cache in memory and mirrors it to a single JSON
//! snapshot on disk. Every mutation builds the next snapshot, writes it to a
//! temporary file, syncs it, and renames it over the previous snapshot. The
//! in-memory view only changes once the rename succeeded, so a failed write
//! leaves both copies at the last committed state.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::model::{AddressCandidate, Postcode, ScheduleRef, ScheduleResult, Uprn};
use crate::ports::PortError;

const POSTCODE_PREFIX: &str = "pc:";
const UPRN_PREFIX: &str = "uprn:";

#[derive(thiserror::Error, Debug)]
/// Failures of the on-disk snapshot.
pub enum CacheError {
    /// Filesystem access failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Snapshot could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
/// Normalized cache key, rendered as `pc:<postcode>` or `uprn:<reference>`.
pub enum CacheKey {
    /// Entry for a whole postcode.
    Postcode(Postcode),
    /// Entry for a single property.
    Uprn(Uprn),
}

impl CacheKey {
    /// Whether the key addresses a postcode entry.
    #[must_use]
    pub fn is_postcode(&self) -> bool {
        matches!(self, CacheKey::Postcode(_))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Postcode(postcode) => write!(formatter, "{POSTCODE_PREFIX}{postcode}"),
            CacheKey::Uprn(uprn) => write!(formatter, "{UPRN_PREFIX}{uprn}"),
        }
    }
}

impl FromStr for CacheKey {
    type Err = PortError;

    /// Accepts `pc:` and `uprn:` prefixes in any case; anything else is read as a bare postcode.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with(UPRN_PREFIX) {
            let reference = trimmed.get(UPRN_PREFIX.len()..).unwrap_or_default();
            return Ok(CacheKey::Uprn(Uprn::parse(reference.trim())?));
        }
        if lower.starts_with(POSTCODE_PREFIX) {
            let postcode = trimmed.get(POSTCODE_PREFIX.len()..).unwrap_or_default();
            return Ok(CacheKey::Postcode(Postcode::parse(postcode)?));
        }
        Ok(CacheKey::Postcode(Postcode::parse(trimmed)?))
    }
}

impl TryFrom<String> for CacheKey {
    type Error = PortError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.to_string()
    }
}

impl From<&ScheduleRef> for CacheKey {
    fn from(reference: &ScheduleRef) -> Self {
        match reference {
            ScheduleRef::Postcode(postcode) => CacheKey::Postcode(postcode.clone()),
            ScheduleRef::Uprn(uprn) => CacheKey::Uprn(uprn.clone()),
        }
    }
}

impl From<&CacheKey> for ScheduleRef {
    fn from(key: &CacheKey) -> Self {
        match key {
            CacheKey::Postcode(postcode) => ScheduleRef::Postcode(postcode.clone()),
            CacheKey::Uprn(uprn) => ScheduleRef::Uprn(uprn.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Outcome of the last mixed-route check for a postcode.
pub struct RouteCheck {
    /// When the sampled schedules were compared.
    pub checked_at: DateTime<Utc>,
    /// Addresses whose schedules were sampled.
    pub addresses: Vec<AddressCandidate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// One cached schedule plus its verification metadata.
pub struct CacheEntry {
    /// Normalized key.
    pub key: CacheKey,
    /// Cached schedule.
    pub data: ScheduleResult,
    /// When `data` was fetched.
    pub fetched_at: DateTime<Utc>,
    /// Whether sampling found more than one route under the postcode.
    #[serde(default)]
    pub mixed_routes: bool,
    /// Present once the postcode has been verified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<RouteCheck>,
}

/// Which entries an administrative clear removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearScope {
    /// Every entry.
    All,
    /// Only `pc:*` entries.
    Postcodes,
    /// Only `uprn:*` entries.
    Uprns,
    /// A single entry.
    Key(CacheKey),
}

impl ClearScope {
    fn matches(&self, key: &CacheKey) -> bool {
        match self {
            ClearScope::All => true,
            ClearScope::Postcodes => key.is_postcode(),
            ClearScope::Uprns => !key.is_postcode(),
            ClearScope::Key(target) => target == key,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    entries: Vec<CacheEntry>,
}

type EntryMap = HashMap<CacheKey, CacheEntry>;

/// Owner of the cached entries and their on-disk snapshot.
#[derive(Debug)]
pub struct CacheStore {
    path: Option<PathBuf>,
    entries: RwLock<EntryMap>,
    writer: Mutex<()>,
}

impl CacheStore {
    /// Store that lives only as long as the process.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(HashMap::new()),
            writer: Mutex::new(()),
        }
    }

    /// Load the snapshot at `path`, starting empty when it does not exist yet.
    ///
    /// A snapshot that cannot be decoded is renamed to `<path>.corrupt` and the
    /// store starts empty.
    ///
    /// # Errors
    ///
    /// Returns a [`CacheError`] when the snapshot exists but cannot be read or moved aside.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Snapshot>(&bytes) {
                Ok(snapshot) => snapshot
                    .entries
                    .into_iter()
                    .map(|entry| (entry.key.clone(), entry))
                    .collect(),
                Err(err) => {
                    let aside = sibling(&path, ".corrupt");
                    tracing::warn!(
                        path = %path.display(),
                        moved_to = %aside.display(),
                        error = %err,
                        "cache snapshot unreadable, starting empty"
                    );
                    tokio::fs::rename(&path, &aside).await?;
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };

        tracing::info!(path = %path.display(), entries = entries.len(), "cache loaded");

        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
            writer: Mutex::new(()),
        })
    }

    /// Look up a single entry.
    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.read().await.get(key).cloned()
    }

    /// All entries, ordered by key.
    pub async fn entries(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.entries.read().await.values().cloned().collect();
        entries.sort_by(|left, right| left.key.cmp(&right.key));
        entries
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Replace the schedule stored under `key`, keeping its verification metadata.
    ///
    /// # Errors
    ///
    /// Returns a [`CacheError`] when the snapshot cannot be written; the previous
    /// entry stays in place.
    pub async fn put(&self, key: CacheKey, data: ScheduleResult) -> Result<CacheEntry, CacheError> {
        self.commit(|entries| {
            let (mixed_routes, verification) = entries
                .get(&key)
                .map(|previous| (previous.mixed_routes, previous.verification.clone()))
                .unwrap_or_default();
            let entry = CacheEntry {
                key: key.clone(),
                fetched_at: data.fetched_at,
                data,
                mixed_routes,
                verification,
            };
            entries.insert(key, entry.clone());
            (entry, true)
        })
        .await
    }

    /// Attach a mixed-route check to an existing entry without touching its schedule.
    ///
    /// Returns `None` when nothing is cached under `key`.
    ///
    /// # Errors
    ///
    /// Returns a [`CacheError`] when the snapshot cannot be written.
    pub async fn record_verification(
        &self,
        key: &CacheKey,
        mixed_routes: bool,
        check: RouteCheck,
    ) -> Result<Option<CacheEntry>, CacheError> {
        self.commit(|entries| match entries.get_mut(key) {
            Some(entry) => {
                entry.mixed_routes = mixed_routes;
                entry.verification = Some(check);
                (Some(entry.clone()), true)
            }
            None => (None, false),
        })
        .await
    }

    /// Remove every entry matched by `scope`, returning how many went.
    ///
    /// # Errors
    ///
    /// Returns a [`CacheError`] when the snapshot cannot be written.
    pub async fn clear(&self, scope: &ClearScope) -> Result<usize, CacheError> {
        self.commit(|entries| {
            let before = entries.len();
            entries.retain(|key, _entry| !scope.matches(key));
            let removed = before - entries.len();
            (removed, removed > 0)
        })
        .await
    }

    /// Apply a mutation to a copy of the entries, persist it, then publish it.
    async fn commit<R>(&self, apply: impl FnOnce(&mut EntryMap) -> (R, bool)) -> Result<R, CacheError> {
        let _writer = self.writer.lock().await;

        let mut next = self.entries.read().await.clone();
        let (outcome, changed) = apply(&mut next);
        if !changed {
            return Ok(outcome);
        }

        if let Some(path) = &self.path {
            write_snapshot(path, &next).await?;
        }
        *self.entries.write().await = next;

        Ok(outcome)
    }
}

async fn write_snapshot(path: &Path, entries: &EntryMap) -> Result<(), CacheError> {
    let mut snapshot = Snapshot {
        entries: entries.values().cloned().collect(),
    };
    snapshot
        .entries
        .sort_by(|left, right| left.key.cmp(&right.key));
    let bytes = serde_json::to_vec_pretty(&snapshot)?;

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp_path = sibling(path, ".tmp");
    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
        // the committed snapshot is untouched; only the temp file needs cleaning up
        if let Err(cleanup) = tokio::fs::remove_file(&tmp_path).await {
            tracing::debug!(path = %tmp_path.display(), error = %cleanup, "temp snapshot not removed");
        }
        return Err(err.into());
    }
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
