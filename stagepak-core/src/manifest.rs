use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;

use crate::config::LowercasePolicy;
use crate::error::{IoResultExt, Result, StageError};

/// How source paths are compared when checking manifest key uniqueness.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CasePolicy {
    #[default]
    Sensitive,
    /// Case-folding targets: `A.txt` and `a.txt` are the same key.
    Insensitive,
}

impl CasePolicy {
    pub fn key(self, path: &str) -> String {
        match self {
            CasePolicy::Sensitive => path.to_string(),
            CasePolicy::Insensitive => path.to_lowercase(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ManifestEntry {
    pub source_path: String,
    pub dest_path: String,
}

/// Insertion-ordered mapping of source file -> relative staged destination.
#[derive(Clone, Debug, Default)]
pub struct Manifest {
    policy: CasePolicy,
    entries: IndexMap<String, ManifestEntry>,
}

impl Manifest {
    pub fn new(policy: CasePolicy) -> Self {
        Self { policy, entries: IndexMap::new() }
    }

    pub fn policy(&self) -> CasePolicy {
        self.policy
    }

    /// Add `source -> dest`. Re-adding the same pair is a no-op; mapping an
    /// existing source to another destination is a `DuplicateKey` error.
    pub fn add(&mut self, source: impl Into<String>, dest: impl Into<String>) -> Result<()> {
        let source = source.into();
        let dest = dest.into();
        let key = self.policy.key(&source);
        if let Some(existing) = self.entries.get(&key) {
            if existing.dest_path == dest {
                return Ok(());
            }
            return Err(StageError::DuplicateKey {
                source_path: source,
                existing: existing.dest_path.clone(),
                requested: dest,
            });
        }
        self.entries.insert(key, ManifestEntry { source_path: source, dest_path: dest });
        Ok(())
    }

    pub fn get(&self, source: &str) -> Option<&ManifestEntry> {
        self.entries.get(&self.policy.key(source))
    }

    pub fn contains(&self, source: &str) -> bool {
        self.get(source).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManifestEntry> + '_ {
        self.entries.values()
    }

    /// Same keys and order, destinations lowercased.
    pub fn lowercase_destinations(&self) -> Manifest {
        let entries = self
            .entries
            .iter()
            .map(|(k, e)| {
                let entry = ManifestEntry {
                    source_path: e.source_path.clone(),
                    dest_path: e.dest_path.to_lowercase(),
                };
                (k.clone(), entry)
            })
            .collect();
        Manifest { policy: self.policy, entries }
    }

    /// Debug listing of `"source" "dest"` lines. Nothing is written for an empty manifest.
    pub fn write_listing(&self, path: &Path) -> Result<bool> {
        if self.is_empty() {
            return Ok(false);
        }
        let mut out = String::new();
        for e in self.iter() {
            let _ = writeln!(out, "\"{}\" \"{}\"", e.source_path, e.dest_path);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).at(parent)?;
        }
        std::fs::write(path, out).at(path)?;
        Ok(true)
    }
}

/// The manifests tracked for one staging run.
#[derive(Clone, Debug, Default)]
pub struct StagingManifests {
    /// Files eligible for archiving.
    pub packed: Manifest,
    /// Files always copied loose; produced archives are registered here too.
    pub verbatim: Manifest,
    /// Loose debug files, skipped when debug info is not staged.
    pub verbatim_debug: Manifest,
}

impl StagingManifests {
    pub fn new(policy: CasePolicy) -> Self {
        Self {
            packed: Manifest::new(policy),
            verbatim: Manifest::new(policy),
            verbatim_debug: Manifest::new(policy),
        }
    }

    /// Lowercase destinations per platform policy. Packed files follow the
    /// in-archive rule when archives are produced, the loose rule otherwise.
    pub fn apply_lowercase(&mut self, policy: &LowercasePolicy, archives: bool) {
        if policy.verbatim {
            self.verbatim = self.verbatim.lowercase_destinations();
            self.verbatim_debug = self.verbatim_debug.lowercase_destinations();
        }
        let packed = if archives { policy.archive_contents } else { policy.packed };
        if packed {
            self.packed = self.packed.lowercase_destinations();
        }
    }

    pub fn write_listings(&self, log_dir: &Path, base: &str, include_debug: bool) -> Result<()> {
        self.verbatim.write_listing(&log_dir.join(format!("{base}_VerbatimFiles.txt")))?;
        if include_debug {
            self.verbatim_debug.write_listing(&log_dir.join(format!("{base}_DebugFiles.txt")))?;
        }
        self.packed.write_listing(&log_dir.join(format!("{base}_PackedFiles.txt")))?;
        Ok(())
    }
}
