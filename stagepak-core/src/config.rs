//! Staging configuration, parsed once from JSON at the boundary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{IoResultExt, Result, StageError};
use crate::fingerprint::HashTrackedSet;
use crate::manifest::CasePolicy;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StageConfig {
    pub project: ProjectConfig,
    pub stage_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Platform being staged.
    pub target: PlatformConfig,
    /// Platform the content was actually cooked for, when it differs.
    #[serde(default)]
    pub cook_source: Option<PlatformConfig>,
    #[serde(default)]
    pub case_policy: CasePolicy,
    /// Destination paths fingerprinted by content instead of mtime.
    #[serde(default)]
    pub hash_tracked: Vec<String>,
    #[serde(default)]
    pub sources: Vec<StageSource>,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub patch: PatchConfig,
    #[serde(default)]
    pub chunk_install: Option<ChunkInstallConfig>,
    #[serde(default)]
    pub deploy: DeployConfig,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ProjectConfig {
    pub name: String,
    pub root: PathBuf,
    /// Project root relative to the stage dir, e.g. `MyGame`.
    #[serde(default)]
    pub stage_root: String,
    /// Prefix every archive entry is re-rooted under, e.g. `../../../MyGame/`.
    #[serde(default)]
    pub archive_internal_root: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PlatformConfig {
    pub name: String,
    /// Root the platform's staged files live under. Defaults to `stage_dir`
    /// for the target; required for a cook source to be reused from.
    #[serde(default)]
    pub runtime_root: Option<PathBuf>,
    #[serde(default)]
    pub lowercase: LowercasePolicy,
    /// Extra archiver arguments for this platform.
    #[serde(default)]
    pub archive_options: String,
    #[serde(default)]
    pub remap: Vec<RemapRule>,
}

/// Which staged destinations a platform wants lowercased.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LowercasePolicy {
    #[serde(default)]
    pub verbatim: bool,
    /// Packed files staged loose; also governs archive file names.
    #[serde(default)]
    pub packed: bool,
    /// Packed files as stored inside an archive.
    #[serde(default)]
    pub archive_contents: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RemapRule {
    pub from: String,
    pub to: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Packed,
    Verbatim,
    Debug,
}

/// A directory tree to add to one of the staging manifests.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StageSource {
    pub kind: SourceKind,
    pub root: PathBuf,
    /// Destination prefix inside the stage dir.
    #[serde(default)]
    pub dest: String,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ArchivePolicy {
    Always,
    Never,
    /// Archive only when requested (or signing is requested).
    #[default]
    DontCare,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub policy: ArchivePolicy,
    #[serde(default)]
    pub requested: bool,
    #[serde(default)]
    pub skip: bool,
    /// Archiver executable.
    #[serde(default)]
    pub archiver: PathBuf,
    #[serde(default)]
    pub sign_key: Option<PathBuf>,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub installed: bool,
    #[serde(default)]
    pub utf8_output: bool,
    /// Split into chunks using the chunk lists under `temp_packaging_dir`.
    #[serde(default)]
    pub use_chunk_manifests: bool,
    #[serde(default)]
    pub temp_packaging_dir: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct PatchConfig {
    #[serde(default)]
    pub generating_patch: bool,
    /// Release the patch is generated against.
    #[serde(default)]
    pub based_on_release: Option<String>,
    /// Release to snapshot produced archives into.
    #[serde(default)]
    pub create_release: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChunkInstallConfig {
    pub directory: PathBuf,
    pub version: String,
    /// Patch-manifest generator executable.
    pub patch_tool: PathBuf,
    /// Command that builds the generator when it is missing.
    #[serde(default)]
    pub patch_tool_build: Vec<String>,
    #[serde(default)]
    pub patch_tool_lock_file: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct DeployConfig {
    #[serde(default)]
    pub iterative: bool,
    #[serde(default)]
    pub no_clean: bool,
    #[serde(default)]
    pub no_debug_info: bool,
    /// Deployed packed-set manifests retrieved from the device, highest priority first.
    #[serde(default)]
    pub deployed_packed: Vec<PathBuf>,
    #[serde(default)]
    pub deployed_verbatim: Vec<PathBuf>,
}

impl StageConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).at(path)?;
        let cfg: StageConfig = serde_json::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.project.name.is_empty() {
            return Err(StageError::Config("project.name is empty".into()));
        }
        if self.target.name.is_empty() {
            return Err(StageError::Config("target.name is empty".into()));
        }
        if let Some(ci) = &self.chunk_install {
            if ci.version.is_empty() {
                return Err(StageError::Config("chunk_install.version is empty".into()));
            }
        }
        if self.archive.use_chunk_manifests && self.archive.temp_packaging_dir.is_none() {
            return Err(StageError::Config(
                "archive.use_chunk_manifests requires archive.temp_packaging_dir".into(),
            ));
        }
        Ok(())
    }

    pub fn runtime_root(&self) -> &Path {
        self.target.runtime_root.as_deref().unwrap_or(&self.stage_dir)
    }

    pub fn hash_tracked_set(&self) -> HashTrackedSet {
        HashTrackedSet::new(&self.hash_tracked)
    }

    /// Whether this run produces archives at all.
    pub fn creates_archives(&self) -> bool {
        if self.archive.skip {
            return false;
        }
        match self.archive.policy {
            ArchivePolicy::Always => true,
            ArchivePolicy::Never => false,
            ArchivePolicy::DontCare => self.archive.requested || self.archive.sign_key.is_some(),
        }
    }

    pub fn chunk_list_file(&self) -> Option<PathBuf> {
        self.archive.temp_packaging_dir.as_ref().map(|d| d.join(crate::chunk::CHUNK_LIST_FILE))
    }
}
