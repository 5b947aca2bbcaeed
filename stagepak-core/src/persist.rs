//! Line-oriented `dest<TAB>fingerprint` manifest files.
//!
//! The same format serves as the staging build log and as the device-side
//! record consumed by the next incremental deploy. Reading is tolerant:
//! lines without a tab or with bytes that are not UTF-8 (e.g. a log cut
//! short by an interrupted run) are skipped rather than failing the read.

use indexmap::IndexMap;
use rayon::prelude::*;
use std::fmt::Write as _;
use std::path::Path;

use crate::error::{IoResultExt, Result, StageError};
use crate::fingerprint::{Fingerprint, FingerprintKind, HashTrackedSet};
use crate::manifest::{Manifest, ManifestEntry};

/// Write one line per entry in iteration order. Returns `false` (and writes
/// no file at all) when there is nothing to record. A destination holding a
/// tab or line break would not read back as itself and is rejected.
pub fn write<'a, I>(entries: I, path: &Path) -> Result<bool>
where
    I: IntoIterator<Item = (&'a str, &'a Fingerprint)>,
{
    let mut out = String::new();
    for (dest, fp) in entries {
        if dest.contains(['\t', '\n', '\r']) {
            return Err(StageError::UnsafePath {
                path: dest.to_string(),
                reason: "destination contains a tab or line break",
            });
        }
        let _ = writeln!(out, "{dest}\t{fp}");
    }
    if out.is_empty() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).at(parent)?;
    }
    std::fs::write(path, out).at(path)?;
    Ok(true)
}

/// Every well-formed `(dest, fingerprint)` pair in file order, duplicates included.
pub fn read_lines(path: &Path) -> Result<Vec<(String, String)>> {
    let data = std::fs::read(path).at(path)?;
    Ok(data
        .split(|b| *b == b'\n')
        .filter_map(|line| std::str::from_utf8(line).ok())
        .map(|line| line.trim_end_matches('\r'))
        .filter_map(|line| line.split_once('\t'))
        .map(|(dest, fp)| (dest.to_string(), fp.to_string()))
        .collect())
}

/// Parsed mapping; the first line for a path wins.
pub fn read(path: &Path) -> Result<IndexMap<String, String>> {
    let mut map = IndexMap::new();
    for (dest, fp) in read_lines(path)? {
        map.entry(dest).or_insert(fp);
    }
    Ok(map)
}

/// Fingerprint every entry of `manifest`, in manifest order. Hash-tracked
/// entries are hashed from their staged copy under `stage_dir`.
pub fn fingerprint_manifest(
    manifest: &Manifest,
    stage_dir: &Path,
    tracked: &HashTrackedSet,
) -> Result<Vec<(String, Fingerprint)>> {
    let entries: Vec<&ManifestEntry> = manifest.iter().collect();
    entries
        .par_iter()
        .map(|e| -> Result<(String, Fingerprint)> {
            let kind = FingerprintKind::for_path(&e.dest_path, tracked);
            let staged = stage_dir.join(&e.dest_path);
            let fp = Fingerprint::compute(Path::new(&e.source_path), &staged, kind)?;
            Ok((e.dest_path.clone(), fp))
        })
        .collect()
}

/// Fingerprint `manifest` and persist it to `path`.
pub fn write_manifest(
    manifest: &Manifest,
    stage_dir: &Path,
    tracked: &HashTrackedSet,
    path: &Path,
) -> Result<bool> {
    let fingerprints = fingerprint_manifest(manifest, stage_dir, tracked)?;
    write(fingerprints.iter().map(|(d, f)| (d.as_str(), f)), path)
}
