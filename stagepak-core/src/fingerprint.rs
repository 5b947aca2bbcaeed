//! Change detection for staged files: content hash for hash-tracked paths,
//! modification time for everything else.

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::time::SystemTime;

use crate::error::{IoResultExt, Result, StageError};

/// Millisecond precision, literal trailing `Z`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Destination paths whose reuse must be byte-exact regardless of mtime noise.
#[derive(Clone, Debug, Default)]
pub struct HashTrackedSet {
    paths: HashSet<String>,
}

impl HashTrackedSet {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self { paths: paths.into_iter().map(|p| normalize(p.as_ref())).collect() }
    }

    pub fn contains(&self, dest: &str) -> bool {
        self.paths.contains(&normalize(dest))
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

fn normalize(dest: &str) -> String {
    dest.replace('\\', "/").to_lowercase()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FingerprintKind {
    Hash,
    Timestamp,
}

impl FingerprintKind {
    pub fn for_path(dest: &str, tracked: &HashTrackedSet) -> Self {
        if tracked.contains(dest) {
            FingerprintKind::Hash
        } else {
            FingerprintKind::Timestamp
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fingerprint {
    Hash(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

impl Fingerprint {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Fingerprint::Hash(blake3::hash(bytes).as_bytes().to_vec())
    }

    pub fn of_file_contents(path: &Path) -> Result<Self> {
        let mut f = File::open(path).at(path)?;
        let mut hasher = blake3::Hasher::new();
        std::io::copy(&mut f, &mut hasher).at(path)?;
        Ok(Fingerprint::Hash(hasher.finalize().as_bytes().to_vec()))
    }

    /// UTC, truncated to whole milliseconds so it survives a text round trip.
    pub fn of_mtime(mtime: SystemTime) -> Self {
        let dt: DateTime<Utc> = mtime.into();
        let millis = dt.nanosecond() / 1_000_000 * 1_000_000;
        Fingerprint::Timestamp(dt.with_nanosecond(millis).unwrap_or(dt))
    }

    pub fn of_file_mtime(path: &Path) -> Result<Self> {
        let modified = std::fs::metadata(path).and_then(|m| m.modified()).at(path)?;
        Ok(Self::of_mtime(modified))
    }

    /// Hash kinds read the staged copy; timestamp kinds read the source's mtime.
    pub fn compute(source: &Path, staged: &Path, kind: FingerprintKind) -> Result<Self> {
        match kind {
            FingerprintKind::Hash => Self::of_file_contents(staged),
            FingerprintKind::Timestamp => Self::of_file_mtime(source),
        }
    }

    pub fn kind(&self) -> FingerprintKind {
        match self {
            Fingerprint::Hash(_) => FingerprintKind::Hash,
            Fingerprint::Timestamp(_) => FingerprintKind::Timestamp,
        }
    }

    /// Interpret persisted text under the kind the path currently has.
    pub fn parse(dest: &str, raw: &str, kind: FingerprintKind) -> Result<Self> {
        let raw = raw.trim();
        match kind {
            FingerprintKind::Hash => hex::decode(raw).map(Fingerprint::Hash).map_err(|_| {
                StageError::HashParse { path: dest.to_string(), value: raw.to_string() }
            }),
            FingerprintKind::Timestamp => parse_timestamp(raw).map(Fingerprint::Timestamp).ok_or_else(
                || StageError::TimestampParse { path: dest.to_string(), value: raw.to_string() },
            ),
        }
    }

    /// Whether a freshly staged fingerprint means the deployed copy is out of date.
    pub fn is_stale_against(&self, deployed: &Fingerprint) -> bool {
        match (self, deployed) {
            (Fingerprint::Hash(staged), Fingerprint::Hash(prior)) => staged != prior,
            (Fingerprint::Timestamp(staged), Fingerprint::Timestamp(prior)) => staged > prior,
            // Both sides are parsed with the same kind, so this only happens
            // for hand-built values.
            _ => true,
        }
    }

    /// Merge rule when one path is recorded more than once: a distinct hash
    /// replaces the old one, a timestamp only replaces an earlier one.
    pub fn supersedes(&self, existing: &Fingerprint) -> bool {
        match (self, existing) {
            (Fingerprint::Hash(new), Fingerprint::Hash(old)) => new != old,
            (Fingerprint::Timestamp(new), Fingerprint::Timestamp(old)) => new > old,
            _ => true,
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fingerprint::Hash(bytes) => f.write_str(&hex::encode(bytes)),
            Fingerprint::Timestamp(ts) => write!(f, "{}", ts.format(TIMESTAMP_FORMAT)),
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
