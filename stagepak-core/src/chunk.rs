//! Split the packed-set manifest into archive chunks using externally
//! produced membership lists.

use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;

use crate::error::{IoResultExt, Result, StageError};
use crate::manifest::Manifest;

/// Index of the base chunk that absorbs entries listed nowhere else.
pub const DEFAULT_CHUNK: usize = 0;

/// List file naming the per-chunk membership files, one per line.
pub const CHUNK_LIST_FILE: &str = "pakchunklist.txt";
/// Layer description produced alongside the chunk list.
pub const CHUNK_LAYER_FILE: &str = "pakchunklayers.txt";

fn chunk_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)chunk(\d+)").expect("chunk id pattern"))
}

/// Chunk name with its numeric id parsed once, where the name carries one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkName {
    pub name: String,
    pub id: Option<u32>,
}

impl ChunkName {
    pub fn parse(name: impl Into<String>) -> Self {
        let name = name.into();
        let id = chunk_id_pattern()
            .captures(&name)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok());
        Self { name, id }
    }

    pub fn require_id(&self) -> Result<u32> {
        self.id.ok_or_else(|| StageError::InvalidChunkName { name: self.name.clone() })
    }
}

/// Destination paths assigned to one chunk, compared case-insensitively.
#[derive(Clone, Debug)]
pub struct ChunkMembership {
    name: ChunkName,
    paths: HashSet<String>,
}

impl ChunkMembership {
    pub fn new<I, S>(name: impl Into<String>, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            name: ChunkName::parse(name),
            paths: paths.into_iter().map(|p| p.as_ref().to_lowercase()).collect(),
        }
    }

    /// Load one membership file; the chunk is named after the file stem.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).at(path)?;
        let name = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        Ok(Self::new(name, data.lines().map(str::trim).filter(|l| !l.is_empty())))
    }

    pub fn name(&self) -> &ChunkName {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Lists may be authored with either separator, so the backslash
    /// spelling of `dest` is checked as well.
    pub fn contains(&self, dest: &str) -> bool {
        let lower = dest.to_lowercase();
        self.paths.contains(&lower) || self.paths.contains(&lower.replace('/', "\\"))
    }
}

/// Read the chunk list file and each membership file it names (relative to `dir`).
pub fn load_chunk_list(list_file: &Path, dir: &Path) -> Result<Vec<ChunkMembership>> {
    let data = std::fs::read_to_string(list_file).at(list_file)?;
    data.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|name| ChunkMembership::load(&dir.join(name)))
        .collect()
}

#[derive(Clone, Debug)]
pub struct Chunk {
    pub index: usize,
    pub name: ChunkName,
    pub entries: Manifest,
}

impl Chunk {
    /// A single chunk holding the whole manifest, used when no chunk lists exist.
    pub fn whole(name: impl Into<String>, entries: Manifest) -> Self {
        Self { index: DEFAULT_CHUNK, name: ChunkName::parse(name), entries }
    }
}

/// Assign every entry to the first chunk (by ascending index) whose
/// membership contains its destination; unlisted entries go to chunk 0.
/// Overlapping lists resolve to the lower index. Per-chunk order follows
/// the original manifest order.
pub fn partition(
    manifest: &Manifest,
    memberships: &[ChunkMembership],
    default_name: &str,
) -> Result<Vec<Chunk>> {
    if memberships.is_empty() {
        return Ok(vec![Chunk::whole(default_name, manifest.clone())]);
    }
    let mut chunks: Vec<Chunk> = memberships
        .iter()
        .enumerate()
        .map(|(index, m)| Chunk {
            index,
            name: m.name().clone(),
            entries: Manifest::new(manifest.policy()),
        })
        .collect();
    for entry in manifest.iter() {
        let index = memberships
            .iter()
            .position(|m| m.contains(&entry.dest_path))
            .unwrap_or(DEFAULT_CHUNK);
        chunks[index].entries.add(entry.source_path.clone(), entry.dest_path.clone())?;
    }
    Ok(chunks)
}
