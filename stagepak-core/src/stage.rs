//! One staging run: collect manifests, clean, archive, copy into the stage
//! dir, and diff against the last deploy when iterating.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use tracing::{debug, info, info_span};
use walkdir::WalkDir;

use crate::archive::{ArchiveOrchestrator, ArchiveOutcome, Archiver, PatchManifestGenerator};
use crate::chunk::load_chunk_list;
use crate::config::{SourceKind, StageConfig, StageSource};
use crate::delta::{self, DeltaCategory, DEBUG_MANIFEST, PACKED_MANIFEST, VERBATIM_MANIFEST};
use crate::error::{IoResultExt, Result, StageError};
use crate::fingerprint::HashTrackedSet;
use crate::manifest::{Manifest, StagingManifests};
use crate::path_safety::{dir_exists, file_exists, resolve_dest};
use crate::persist;

/// Include/exclude globs matched against paths relative to the walked root.
#[derive(Clone, Debug)]
pub struct SourceFilter {
    include: Option<GlobSet>,
    exclude: GlobSet,
}

impl SourceFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        let include = if include.is_empty() { None } else { Some(build_set(include)?) };
        Ok(Self { include, exclude: build_set(exclude)? })
    }

    pub fn matches(&self, rel: &str) -> bool {
        if self.exclude.is_match(rel) {
            return false;
        }
        self.include.as_ref().map_or(true, |set| set.is_match(rel))
    }
}

fn build_set(patterns: &[String]) -> Result<GlobSet> {
    let mut b = GlobSetBuilder::new();
    for p in patterns {
        b.add(Glob::new(p)?);
    }
    Ok(b.build()?)
}

/// Add every file under `root` passing `filter`, destined for
/// `<dest_prefix>/<path relative to root>`. Walk order is sorted so the
/// manifest order is reproducible. Returns the number of files added.
pub fn collect_directory(
    manifest: &mut Manifest,
    root: &Path,
    dest_prefix: &str,
    filter: &SourceFilter,
) -> Result<usize> {
    let mut added = 0;
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = pathdiff::diff_paths(entry.path(), root) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        if !filter.matches(&rel) {
            continue;
        }
        let prefix = dest_prefix.trim_end_matches(['/', '\\']);
        let dest = if prefix.is_empty() { rel } else { format!("{prefix}/{rel}") };
        manifest.add(entry.path().to_string_lossy().into_owned(), dest)?;
        added += 1;
    }
    debug!(root = %root.display(), added, "collected directory");
    Ok(added)
}

/// Build this run's manifests from the configured sources.
pub fn collect_sources(policy: crate::manifest::CasePolicy, sources: &[StageSource]) -> Result<StagingManifests> {
    let mut manifests = StagingManifests::new(policy);
    for source in sources {
        let filter = SourceFilter::new(&source.include, &source.exclude)?;
        let target = match source.kind {
            SourceKind::Packed => &mut manifests.packed,
            SourceKind::Verbatim => &mut manifests.verbatim,
            SourceKind::Debug => &mut manifests.verbatim_debug,
        };
        collect_directory(target, &source.root, &source.dest, &filter)?;
    }
    Ok(manifests)
}

/// Remove every `*.pak` left in `dir` by a previous run. Returns how many went.
pub fn delete_archives(dir: &Path) -> Result<usize> {
    if !dir_exists(dir) {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in WalkDir::new(dir) {
        let entry = entry?;
        let is_archive = entry
            .path()
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("pak"));
        if entry.file_type().is_file() && is_archive {
            std::fs::remove_file(entry.path()).at(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Copy unless `dst` already has the same size and mtime; the copy takes
/// the source's mtime so the next run can skip it.
fn copy_incremental(src: &Path, dst: &Path) -> Result<bool> {
    let src_meta = std::fs::metadata(src).at(src)?;
    let src_mtime = src_meta.modified().at(src)?;
    if let Ok(dst_meta) = std::fs::metadata(dst) {
        if dst_meta.len() == src_meta.len() && dst_meta.modified().ok() == Some(src_mtime) {
            return Ok(false);
        }
    }
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent).at(parent)?;
    }
    std::fs::copy(src, dst).at(dst)?;
    std::fs::File::options()
        .write(true)
        .open(dst)
        .and_then(|f| f.set_modified(src_mtime))
        .at(dst)?;
    Ok(true)
}

/// Copy `manifest` into `stage_dir`, then record it as `manifest_name` in
/// the stage dir and the log dir. Entries already inside the stage (e.g. a
/// built archive) are not copied onto themselves. Returns the written
/// manifest path, or `None` for an empty manifest.
pub fn copy_to_stage(
    manifest: &Manifest,
    stage_dir: &Path,
    log_dir: &Path,
    manifest_name: &str,
    tracked: &HashTrackedSet,
) -> Result<Option<PathBuf>> {
    let manifest_path = stage_dir.join(manifest_name);
    if file_exists(&manifest_path) {
        std::fs::remove_file(&manifest_path).at(&manifest_path)?;
    }
    let mut copied = 0usize;
    for e in manifest.iter() {
        let dest = resolve_dest(stage_dir, &e.dest_path)?;
        let src = Path::new(&e.source_path);
        if src == dest {
            continue;
        }
        if copy_incremental(src, &dest)? {
            copied += 1;
        }
    }
    debug!(manifest = manifest_name, copied, total = manifest.len(), "copied to stage");
    if manifest.is_empty() {
        return Ok(None);
    }
    persist::write_manifest(manifest, stage_dir, tracked, &manifest_path)?;
    if !file_exists(&manifest_path) {
        return Err(StageError::io(
            &manifest_path,
            std::io::Error::new(std::io::ErrorKind::NotFound, "manifest missing after write"),
        ));
    }
    std::fs::create_dir_all(log_dir).at(log_dir)?;
    let log_copy = log_dir.join(manifest_name);
    std::fs::copy(&manifest_path, &log_copy).at(&log_copy)?;
    Ok(Some(manifest_path))
}

#[derive(Clone, Debug, Default)]
pub struct DeltaReport {
    pub packed: Vec<String>,
    pub verbatim: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct StageReport {
    pub archives: Vec<ArchiveOutcome>,
    pub manifests: Vec<PathBuf>,
    pub delta: Option<DeltaReport>,
}

/// Merge the deployed manifests, read what was staged and write both deltas.
pub fn iterative_delta(config: &StageConfig, tracked: &HashTrackedSet) -> Result<DeltaReport> {
    let mut report = DeltaReport::default();
    let categories = [
        (DeltaCategory::Packed, &config.deploy.deployed_packed),
        (DeltaCategory::Verbatim, &config.deploy.deployed_verbatim),
    ];
    for (category, deployed_paths) in categories {
        let deployed = delta::merge_deployed(deployed_paths, tracked)?;
        let staged = delta::read_staged(&config.stage_dir, category.staged_manifest(), tracked)?;
        let files = delta::compute_delta(&deployed, &staged, category);
        delta::write_delta(&config.stage_dir, category, &files)?;
        match category {
            DeltaCategory::Packed => report.packed = files,
            DeltaCategory::Verbatim => report.verbatim = files,
        }
    }
    Ok(report)
}

pub struct StagingRun<'a> {
    config: &'a StageConfig,
    orchestrator: ArchiveOrchestrator<'a>,
}

impl<'a> StagingRun<'a> {
    pub fn new(
        config: &'a StageConfig,
        archiver: &'a dyn Archiver,
        lock: &'a crate::tool_lock::ToolBuildLock,
    ) -> Self {
        Self { config, orchestrator: ArchiveOrchestrator::new(config, archiver, lock) }
    }

    pub fn with_patch_tool(mut self, tool: &'a dyn PatchManifestGenerator) -> Self {
        self.orchestrator = self.orchestrator.with_patch_tool(tool);
        self
    }

    pub fn collect(&self) -> Result<StagingManifests> {
        collect_sources(self.config.case_policy, &self.config.sources)
    }

    pub fn run(&self) -> Result<StageReport> {
        let mut manifests = self.collect()?;
        self.apply(&mut manifests)
    }

    pub fn apply(&self, manifests: &mut StagingManifests) -> Result<StageReport> {
        let cfg = self.config;
        let _span = info_span!("stage", platform = %cfg.target.name).entered();
        let tracked = cfg.hash_tracked_set();
        let archives = cfg.creates_archives();
        manifests.apply_lowercase(&cfg.target.lowercase, archives);

        if !cfg.deploy.iterative && !cfg.deploy.no_clean {
            if dir_exists(&cfg.stage_dir) {
                info!(dir = %cfg.stage_dir.display(), "cleaning stage dir");
                std::fs::remove_dir_all(&cfg.stage_dir).at(&cfg.stage_dir)?;
            }
        } else {
            let removed = delete_archives(&cfg.stage_dir)?;
            debug!(removed, "deleted stale archives");
        }

        let mut report = StageReport::default();
        if archives {
            report.archives = match self.chunk_list() {
                Some((list, dir)) => {
                    let memberships = load_chunk_list(&list, &dir)?;
                    self.orchestrator.archive_chunked(&memberships, manifests)?
                }
                None => vec![self.orchestrator.archive_whole(manifests)?],
            };
        }

        manifests.write_listings(&cfg.log_dir, "FinalCopy", !cfg.deploy.no_debug_info)?;
        let mut copies: Vec<(&Manifest, &str)> = vec![(&manifests.verbatim, VERBATIM_MANIFEST)];
        if !cfg.deploy.no_debug_info {
            copies.push((&manifests.verbatim_debug, DEBUG_MANIFEST));
        }
        if !archives {
            copies.push((&manifests.packed, PACKED_MANIFEST));
        }
        for (manifest, name) in copies {
            if let Some(path) = copy_to_stage(manifest, &cfg.stage_dir, &cfg.log_dir, name, &tracked)? {
                report.manifests.push(path);
            }
        }

        if cfg.deploy.iterative {
            report.delta = Some(iterative_delta(cfg, &tracked)?);
        }
        info!(
            archives = report.archives.len(),
            manifests = report.manifests.len(),
            "staging complete"
        );
        Ok(report)
    }

    /// Chunk list and its directory, when chunked archiving applies.
    fn chunk_list(&self) -> Option<(PathBuf, PathBuf)> {
        if !self.config.archive.use_chunk_manifests {
            return None;
        }
        let dir = self.config.archive.temp_packaging_dir.clone()?;
        let list = self.config.chunk_list_file()?;
        file_exists(&list).then_some((list, dir))
    }
}
