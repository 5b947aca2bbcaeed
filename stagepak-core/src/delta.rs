//! Incremental deploy: diff what a device reports as deployed against what
//! this run staged, and list the files that must be transferred again.
//!
//! Files removed since the last deploy are not detected.

use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{IoResultExt, Result};
use crate::fingerprint::{Fingerprint, FingerprintKind, HashTrackedSet};
use crate::path_safety::file_exists;
use crate::persist;

pub const PACKED_MANIFEST: &str = "Manifest_PackedFiles.txt";
pub const VERBATIM_MANIFEST: &str = "Manifest_VerbatimFiles.txt";
pub const DEBUG_MANIFEST: &str = "Manifest_DebugFiles.txt";
pub const PACKED_DELTA: &str = "Manifest_DeltaPackedFiles.txt";
pub const VERBATIM_DELTA: &str = "Manifest_DeltaVerbatimFiles.txt";

/// Destination path -> fingerprint, in first-seen order.
pub type FingerprintMap = IndexMap<String, Fingerprint>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeltaCategory {
    Packed,
    /// Also the category the bookkeeping manifests themselves belong to.
    Verbatim,
}

impl DeltaCategory {
    pub fn staged_manifest(self) -> &'static str {
        match self {
            DeltaCategory::Packed => PACKED_MANIFEST,
            DeltaCategory::Verbatim => VERBATIM_MANIFEST,
        }
    }

    pub fn delta_file(self) -> &'static str {
        match self {
            DeltaCategory::Packed => PACKED_DELTA,
            DeltaCategory::Verbatim => VERBATIM_DELTA,
        }
    }

    fn appends_bookkeeping(self) -> bool {
        self != DeltaCategory::Verbatim
    }
}

fn merge_entry(map: &mut FingerprintMap, dest: String, fp: Fingerprint) {
    match map.get_mut(&dest) {
        Some(existing) => {
            if fp.supersedes(existing) {
                *existing = fp;
            }
        }
        None => {
            map.insert(dest, fp);
        }
    }
}

/// Parse every well-formed line of `path`, interpreting each value under
/// the kind its destination currently has.
fn read_fingerprints(path: &Path, tracked: &HashTrackedSet) -> Result<Vec<(String, Fingerprint)>> {
    persist::read_lines(path)?
        .into_iter()
        .map(|(dest, raw)| -> Result<(String, Fingerprint)> {
            let kind = FingerprintKind::for_path(&dest, tracked);
            let fp = Fingerprint::parse(&dest, &raw, kind)?;
            Ok((dest, fp))
        })
        .collect()
}

/// Merge device-side manifests in priority order, consuming (deleting) each.
///
/// The first manifest contributing no entries (a missing file counts as
/// such) discards everything merged so far and ends the merge, so the
/// whole staged set is redeployed.
pub fn merge_deployed(paths: &[PathBuf], tracked: &HashTrackedSet) -> Result<FingerprintMap> {
    let mut merged = FingerprintMap::new();
    let mut searching = true;
    for path in paths {
        let exists = file_exists(path);
        let mut added = 0usize;
        if searching && exists {
            for (dest, fp) in read_fingerprints(path, tracked)? {
                merge_entry(&mut merged, dest, fp);
                added += 1;
            }
        }
        if exists {
            std::fs::remove_file(path).at(path)?;
        }
        if searching && added == 0 {
            warn!(manifest = %path.display(), "deployed manifest is empty, redeploying everything");
            merged.clear();
            searching = false;
        }
    }
    debug!(entries = merged.len(), "merged deployed manifests");
    Ok(merged)
}

/// The manifest this run wrote into the stage dir; missing means nothing staged.
pub fn read_staged(stage_dir: &Path, name: &str, tracked: &HashTrackedSet) -> Result<FingerprintMap> {
    let path = stage_dir.join(name);
    let mut staged = FingerprintMap::new();
    if !file_exists(&path) {
        return Ok(staged);
    }
    for (dest, fp) in read_fingerprints(&path, tracked)? {
        merge_entry(&mut staged, dest, fp);
    }
    Ok(staged)
}

/// Staged paths that are new, whose hash changed, or whose timestamp is
/// strictly later than the deployed one. Outside the verbatim category the
/// bookkeeping manifests are always appended.
pub fn compute_delta(deployed: &FingerprintMap, staged: &FingerprintMap, category: DeltaCategory) -> Vec<String> {
    let mut delta: Vec<String> = staged
        .iter()
        .filter(|(dest, fp)| deployed.get(*dest).map_or(true, |prior| fp.is_stale_against(prior)))
        .map(|(dest, _)| dest.clone())
        .collect();
    if category.appends_bookkeeping() {
        delta.push(VERBATIM_MANIFEST.to_string());
        delta.push(PACKED_MANIFEST.to_string());
    }
    delta
}

/// Write one path per line to the category's delta file in `stage_dir`.
pub fn write_delta(stage_dir: &Path, category: DeltaCategory, paths: &[String]) -> Result<PathBuf> {
    let path = stage_dir.join(category.delta_file());
    let mut out = String::new();
    for p in paths {
        out.push_str(p);
        out.push('\n');
    }
    std::fs::create_dir_all(stage_dir).at(stage_dir)?;
    std::fs::write(&path, out).at(&path)?;
    info!(delta = %path.display(), files = paths.len(), "wrote deploy delta");
    Ok(path)
}
