//! Per-chunk archive production: reuse a cross-platform artifact when one
//! exists, otherwise drive the external archiver, then relocate chunk-install
//! chunks and register what stays in the stage.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

use crate::chunk::{self, Chunk, ChunkMembership, CHUNK_LAYER_FILE};
use crate::config::{ChunkInstallConfig, PlatformConfig, StageConfig};
use crate::error::{IoResultExt, Result, StageError};
use crate::manifest::StagingManifests;
use crate::path_safety::{dir_exists, file_exists};
use crate::tool_lock::ToolBuildLock;

const PATCH_SUFFIX: &str = "_P";
const ARCHIVE_EXT: &str = "pak";

/// Platform-specific rewrite of a relative staged path.
pub trait PathRemapper {
    fn remap(&self, rel: &str) -> String;
}

/// First rule whose `from` prefixes the path wins; no rules means identity.
impl PathRemapper for PlatformConfig {
    fn remap(&self, rel: &str) -> String {
        for rule in &self.remap {
            if let Some(rest) = rel.strip_prefix(rule.from.as_str()) {
                return format!("{}{}", rule.to, rest);
            }
        }
        rel.to_string()
    }
}

/// Everything the archiver needs for one output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiverInvocation {
    pub output: PathBuf,
    pub response_file: PathBuf,
    pub sign_key: Option<PathBuf>,
    pub installed: bool,
    pub order_file: PathBuf,
    pub utf8_output: bool,
    pub patch_base: Option<PathBuf>,
    pub platform_options: String,
}

impl ArchiverInvocation {
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![self.output.clone().into_os_string()];
        args.push(prefixed("-create=", &self.response_file));
        if let Some(key) = &self.sign_key {
            args.push(prefixed("-sign=", key));
        }
        if self.installed {
            args.push("-installed".into());
        }
        args.push(prefixed("-order=", &self.order_file));
        if self.utf8_output {
            args.push("-UTF8Output".into());
        }
        if let Some(base) = &self.patch_base {
            args.push(prefixed("-generatepatch=", base));
        }
        args.extend(self.platform_options.split_whitespace().map(OsString::from));
        args
    }

    /// Quoted rendering for logs.
    pub fn command_line(&self) -> String {
        let mut cmd = format!("{} -create={}", quoted(&self.output), quoted(&self.response_file));
        if let Some(key) = &self.sign_key {
            let _ = write!(cmd, " -sign={}", quoted(key));
        }
        if self.installed {
            cmd.push_str(" -installed");
        }
        let _ = write!(cmd, " -order={}", quoted(&self.order_file));
        if self.utf8_output {
            cmd.push_str(" -UTF8Output");
        }
        if let Some(base) = &self.patch_base {
            let _ = write!(cmd, " -generatepatch={}", quoted(base));
        }
        if !self.platform_options.trim().is_empty() {
            let _ = write!(cmd, " {}", self.platform_options.trim());
        }
        cmd
    }
}

fn prefixed(flag: &str, path: &Path) -> OsString {
    let mut s = OsString::from(flag);
    s.push(path.as_os_str());
    s
}

fn quoted(path: &Path) -> String {
    format!("\"{}\"", path.display())
}

pub trait Archiver {
    /// Build one archive; a non-zero exit is `ArchiveBuildFailed`.
    fn build(&self, invocation: &ArchiverInvocation) -> Result<()>;
}

/// Runs the archiver executable synchronously.
#[derive(Clone, Debug)]
pub struct ProcessArchiver {
    exe: PathBuf,
}

impl ProcessArchiver {
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        Self { exe: exe.into() }
    }
}

impl Archiver for ProcessArchiver {
    fn build(&self, invocation: &ArchiverInvocation) -> Result<()> {
        info!(exe = %self.exe.display(), cmd = %invocation.command_line(), "running archiver");
        let status = Command::new(&self.exe).args(invocation.args()).status().at(&self.exe)?;
        if !status.success() {
            return Err(StageError::ArchiveBuildFailed {
                output: invocation.output.clone(),
                status: status.to_string(),
            });
        }
        Ok(())
    }
}

/// Inputs for one run of the patch-manifest generator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchManifestRequest {
    pub build_root: PathBuf,
    pub cloud_dir: PathBuf,
    pub app_name: String,
    pub version: String,
    pub chunk_id: u32,
}

impl PatchManifestRequest {
    const APP_ID: u32 = 1;

    pub fn args(&self) -> Vec<String> {
        vec![
            format!("-BuildRoot={}", self.build_root.display()),
            format!("-CloudDir={}", self.cloud_dir.display()),
            format!("-AppID={}", Self::APP_ID),
            format!("-AppName={}", self.app_name),
            format!("-BuildVersion={}", self.version),
            "-AppLaunch=".to_string(),
            "-DataAgeThreshold=12".to_string(),
            "-AppArgs=".to_string(),
            "-custom=bIsPatch=false".to_string(),
            format!("-customint=ChunkID={}", self.chunk_id),
            "-customint=PakReadOrdering=0".to_string(),
            "-stdout".to_string(),
        ]
    }

    pub fn command_line(&self) -> String {
        format!(
            "-BuildRoot=\"{}\" -CloudDir=\"{}\" -AppID={} -AppName=\"{}\" -BuildVersion=\"{}\" \
             -AppLaunch=\"\" -DataAgeThreshold=12 -AppArgs=\"\" -custom=\"bIsPatch=false\" \
             -customint=\"ChunkID={}\" -customint=\"PakReadOrdering=0\" -stdout",
            self.build_root.display(),
            self.cloud_dir.display(),
            Self::APP_ID,
            self.app_name,
            self.version,
            self.chunk_id,
        )
    }

    /// Name of the manifest the generator leaves in the cloud dir.
    pub fn manifest_file_name(&self) -> String {
        format!("{}{}.manifest", self.app_name, self.version)
    }
}

pub trait PatchManifestGenerator {
    fn tool_path(&self) -> &Path;

    /// Produce the tool executable at `tool_path`.
    fn build_tool(&self) -> Result<()>;

    fn generate(&self, request: &PatchManifestRequest) -> Result<()>;

    fn ensure_available(&self, lock: &ToolBuildLock) -> Result<bool> {
        lock.ensure(self.tool_path(), || self.build_tool())
    }
}

#[derive(Clone, Debug)]
pub struct ProcessPatchTool {
    exe: PathBuf,
    build_command: Vec<String>,
}

impl ProcessPatchTool {
    pub fn new(exe: impl Into<PathBuf>, build_command: Vec<String>) -> Self {
        Self { exe: exe.into(), build_command }
    }

    pub fn from_config(cfg: &ChunkInstallConfig) -> Self {
        Self::new(cfg.patch_tool.clone(), cfg.patch_tool_build.clone())
    }
}

impl PatchManifestGenerator for ProcessPatchTool {
    fn tool_path(&self) -> &Path {
        &self.exe
    }

    fn build_tool(&self) -> Result<()> {
        let Some((program, args)) = self.build_command.split_first() else {
            return Err(StageError::Config(format!(
                "patch tool {} is missing and no build command is configured",
                self.exe.display()
            )));
        };
        let status = Command::new(program).args(args).status().at(Path::new(program))?;
        if !status.success() {
            return Err(StageError::ToolBuildFailed {
                tool: self.exe.clone(),
                status: status.to_string(),
            });
        }
        Ok(())
    }

    fn generate(&self, request: &PatchManifestRequest) -> Result<()> {
        info!(exe = %self.exe.display(), cmd = %request.command_line(), "running patch manifest generator");
        let status = Command::new(&self.exe).args(request.args()).status().at(&self.exe)?;
        if !status.success() {
            return Err(StageError::PatchToolFailed {
                chunk: request.app_name.clone(),
                status: status.to_string(),
            });
        }
        Ok(())
    }
}

/// Where an archive lands: absolute on disk, and relative to the runtime root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveTarget {
    pub absolute: PathBuf,
    pub relative: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveDisposition {
    /// Copied from the cook-source platform's stage.
    Reused,
    Built,
    /// Nothing to archive.
    Empty,
}

#[derive(Clone, Debug)]
pub struct ArchiveOutcome {
    pub chunk: String,
    pub target: ArchiveTarget,
    pub disposition: ArchiveDisposition,
    /// Set when the archive was moved out of the stage for out-of-band install.
    pub raw_data_dir: Option<PathBuf>,
    pub registered: bool,
}

pub struct ArchiveOrchestrator<'a> {
    config: &'a StageConfig,
    archiver: &'a dyn Archiver,
    patch_tool: Option<&'a dyn PatchManifestGenerator>,
    lock: &'a ToolBuildLock,
}

impl<'a> ArchiveOrchestrator<'a> {
    pub fn new(config: &'a StageConfig, archiver: &'a dyn Archiver, lock: &'a ToolBuildLock) -> Self {
        Self { config, archiver, patch_tool: None, lock }
    }

    pub fn with_patch_tool(mut self, tool: &'a dyn PatchManifestGenerator) -> Self {
        self.patch_tool = Some(tool);
        self
    }

    fn target_platform(&self) -> &str {
        &self.config.target.name
    }

    fn suffix(&self) -> &'static str {
        if self.config.patch.generating_patch {
            PATCH_SUFFIX
        } else {
            ""
        }
    }

    fn archive_file_name(chunk: &str, platform: &str, suffix: &str) -> String {
        format!("{chunk}-{platform}{suffix}.{ARCHIVE_EXT}")
    }

    fn relative_for(&self, chunk: &str, platform: &PlatformConfig) -> String {
        let mut rel = join_slash(
            &join_slash(&self.config.project.stage_root, "Content/Paks"),
            &Self::archive_file_name(chunk, &platform.name, self.suffix()),
        );
        if platform.lowercase.packed {
            rel = rel.to_lowercase();
        }
        platform.remap(&rel)
    }

    pub fn target_path(&self, chunk: &str) -> ArchiveTarget {
        let relative = self.relative_for(chunk, &self.config.target);
        let absolute = self.config.runtime_root().join(&relative);
        ArchiveTarget { absolute, relative }
    }

    /// The analogous archive under the cook-source platform's root, when
    /// the content was cooked for a different platform.
    pub fn reuse_source(&self, chunk: &str) -> Option<PathBuf> {
        let source = self.config.cook_source.as_ref()?;
        if source.name == self.config.target.name {
            return None;
        }
        let root = source.runtime_root.as_ref()?;
        Some(root.join(self.relative_for(chunk, source)))
    }

    /// Copy a cross-platform archive into place. Failures only log.
    pub fn try_reuse(&self, chunk: &str, target: &ArchiveTarget) -> bool {
        let Some(source) = self.reuse_source(chunk) else {
            return false;
        };
        if file_exists(&source) {
            let copied = target
                .absolute
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|_| std::fs::copy(&source, &target.absolute));
            match copied {
                Ok(_) => {
                    info!(from = %source.display(), to = %target.absolute.display(), "reusing archive instead of building");
                    return true;
                }
                Err(err) => warn!(from = %source.display(), error = %err, "archive copy failed"),
            }
        }
        warn!(from = %source.display(), to = %target.absolute.display(), "no reusable archive, building new one");
        false
    }

    fn release_path(&self, version: &str, file_name: &str) -> PathBuf {
        self.config
            .project
            .root
            .join("Releases")
            .join(version)
            .join(self.target_platform())
            .join(file_name)
    }

    /// Prior release's archive for the same chunk, without the patch suffix.
    pub fn patch_base(&self, chunk: &str) -> Option<PathBuf> {
        if !self.config.patch.generating_patch {
            return None;
        }
        let version = self.config.patch.based_on_release.as_deref()?;
        let name = Self::archive_file_name(chunk, self.target_platform(), "");
        Some(self.release_path(version, &name))
    }

    /// `GameOpenOrder.log` when present, else `EditorOpenOrder.log` whether or not it exists.
    pub fn order_file(&self) -> PathBuf {
        let base = self
            .config
            .project
            .root
            .join("Build")
            .join(self.target_platform())
            .join("FileOpenOrder");
        let game = base.join("GameOpenOrder.log");
        if file_exists(&game) {
            game
        } else {
            base.join("EditorOpenOrder.log")
        }
    }

    /// Write `PakList_<chunk>.txt` into the log dir. Archives are
    /// case-insensitive, so sources differing only in case are rejected.
    pub fn write_response_file(&self, chunk: &Chunk) -> Result<PathBuf> {
        let mut seen: HashMap<String, &str> = HashMap::new();
        let mut out = String::new();
        let root = &self.config.project.archive_internal_root;
        for e in chunk.entries.iter() {
            if let Some(existing) = seen.insert(e.source_path.to_lowercase(), &e.dest_path) {
                return Err(StageError::DuplicateKey {
                    source_path: e.source_path.clone(),
                    existing: existing.to_string(),
                    requested: e.dest_path.clone(),
                });
            }
            let dest = join_slash(root, &e.dest_path.replace('\\', "/"));
            let _ = write!(out, "\"{}\" \"{}\"", e.source_path, dest);
            if self.config.archive.compress {
                out.push_str(" -compress");
            }
            out.push('\n');
        }
        let path = self.config.log_dir.join(format!("PakList_{}.txt", chunk.name.name));
        std::fs::create_dir_all(&self.config.log_dir).at(&self.config.log_dir)?;
        std::fs::write(&path, out).at(&path)?;
        Ok(path)
    }

    /// Run the per-chunk state machine and register the result into `manifests.verbatim`.
    pub fn build_chunk(&self, chunk: &Chunk, manifests: &mut StagingManifests) -> Result<ArchiveOutcome> {
        let name = chunk.name.name.clone();
        let target = self.target_path(&name);
        let reused = self.try_reuse(&name, &target);
        let patch_base = self.patch_base(&name);

        let disposition = if reused {
            ArchiveDisposition::Reused
        } else if chunk.entries.is_empty() {
            debug!(chunk = %name, "empty chunk, no archive");
            ArchiveDisposition::Empty
        } else {
            let response_file = self.write_response_file(chunk)?;
            if let Some(parent) = target.absolute.parent() {
                std::fs::create_dir_all(parent).at(parent)?;
            }
            let invocation = ArchiverInvocation {
                output: target.absolute.clone(),
                response_file,
                sign_key: self.config.archive.sign_key.clone(),
                installed: self.config.archive.installed,
                order_file: self.order_file(),
                utf8_output: self.config.archive.utf8_output,
                patch_base: patch_base.clone(),
                platform_options: self.config.target.archive_options.clone(),
            };
            self.archiver.build(&invocation)?;
            ArchiveDisposition::Built
        };

        let mut outcome = ArchiveOutcome {
            chunk: name.clone(),
            target: target.clone(),
            disposition,
            raw_data_dir: None,
            registered: false,
        };
        if disposition == ArchiveDisposition::Empty {
            return Ok(outcome);
        }

        self.snapshot_release(&target)?;

        if let Some(install) = &self.config.chunk_install {
            let id = chunk.name.require_id()?;
            if id != 0 {
                let raw = self.install_out_of_band(install, &name, id, &target, patch_base.as_deref())?;
                outcome.raw_data_dir = Some(raw);
                return Ok(outcome);
            }
        }

        manifests
            .verbatim
            .add(target.absolute.to_string_lossy().into_owned(), target.relative.clone())?;
        outcome.registered = true;
        Ok(outcome)
    }

    /// Keep a copy of the produced archive under `Releases/<version>` for later patching.
    fn snapshot_release(&self, target: &ArchiveTarget) -> Result<()> {
        let Some(version) = self.config.patch.create_release.as_deref() else {
            return Ok(());
        };
        let file_name = target
            .absolute
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dest = self.release_path(version, &file_name);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).at(parent)?;
        }
        std::fs::copy(&target.absolute, &dest).at(&dest)?;
        info!(release = version, archive = %dest.display(), "archive copied to release");
        Ok(())
    }

    fn chunk_install_base(&self, install: &ChunkInstallConfig) -> PathBuf {
        install.directory.join(self.target_platform())
    }

    /// Move a non-base chunk into the versioned raw-data area and generate its patch manifest.
    fn install_out_of_band(
        &self,
        install: &ChunkInstallConfig,
        chunk: &str,
        id: u32,
        target: &ArchiveTarget,
        patch_base: Option<&Path>,
    ) -> Result<PathBuf> {
        let Some(tool) = self.patch_tool else {
            return Err(StageError::Config("chunk install requires a patch manifest generator".into()));
        };
        let base = self.chunk_install_base(install);
        let raw = base.join(&install.version).join(chunk);
        let platform = self.target_platform();

        let original = if self.config.patch.generating_patch {
            match patch_base {
                Some(p) if file_exists(p) => Some(p.to_path_buf()),
                _ => return Err(StageError::MissingPatchBase { archive: target.absolute.clone() }),
            }
        } else {
            None
        };

        std::fs::create_dir_all(&raw).at(&raw)?;
        let raw_archive = raw.join(Self::archive_file_name(chunk, platform, self.suffix()));
        if file_exists(&raw_archive) {
            std::fs::remove_file(&raw_archive).at(&raw_archive)?;
        }
        std::fs::copy(&target.absolute, &raw_archive).at(&raw_archive)?;
        std::fs::remove_file(&target.absolute).at(&target.absolute)?;
        if let Some(original) = original {
            let dest = raw.join(Self::archive_file_name(chunk, platform, ""));
            std::fs::copy(&original, &dest).at(&dest)?;
        }

        tool.ensure_available(self.lock)?;
        let manifest_dir = base.join("ManifestDir");
        std::fs::create_dir_all(&manifest_dir).at(&manifest_dir)?;
        let request = PatchManifestRequest {
            build_root: raw.clone(),
            cloud_dir: base.join("CloudDir"),
            app_name: format!("{}_{}", self.config.project.name, chunk),
            version: install.version.clone(),
            chunk_id: id,
        };
        tool.generate(&request)?;

        let file_name = request.manifest_file_name();
        let produced = request.cloud_dir.join(&file_name);
        for dest in [raw.join(&file_name), manifest_dir.join(&file_name)] {
            if let Err(err) = std::fs::copy(&produced, &dest) {
                warn!(from = %produced.display(), to = %dest.display(), error = %err, "patch manifest copy failed");
            }
        }
        info!(chunk, id, raw = %raw.display(), "chunk moved to install data");
        Ok(raw)
    }

    /// Drop manifests and raw data left by a previous chunk-install run of this version.
    pub fn clean_chunk_install(&self) -> Result<()> {
        let Some(install) = &self.config.chunk_install else {
            return Ok(());
        };
        let base = self.chunk_install_base(install);
        let manifest_dir = base.join("ManifestDir");
        if dir_exists(&manifest_dir) {
            for entry in std::fs::read_dir(&manifest_dir).at(&manifest_dir)? {
                let path = entry.at(&manifest_dir)?.path();
                if path.extension().is_some_and(|e| e == "manifest") {
                    std::fs::remove_file(&path).at(&path)?;
                }
            }
        }
        let versioned = base.join(&install.version);
        if dir_exists(&versioned) {
            std::fs::remove_dir_all(&versioned).at(&versioned)?;
        }
        Ok(())
    }

    /// Copy the chunk layer description next to the project build data, when present.
    pub fn copy_chunk_layers(&self) -> Result<Option<PathBuf>> {
        let Some(tmp) = &self.config.archive.temp_packaging_dir else {
            return Ok(None);
        };
        let source = tmp.join(CHUNK_LAYER_FILE);
        if !file_exists(&source) {
            return Ok(None);
        }
        let dest_dir = self
            .config
            .project
            .root
            .join("Build")
            .join(self.target_platform())
            .join("ChunkLayerInfo");
        std::fs::create_dir_all(&dest_dir).at(&dest_dir)?;
        let dest = dest_dir.join(CHUNK_LAYER_FILE);
        std::fs::copy(&source, &dest).at(&dest)?;
        Ok(Some(dest))
    }

    /// One archive named after the project holding the whole packed set.
    pub fn archive_whole(&self, manifests: &mut StagingManifests) -> Result<ArchiveOutcome> {
        info!("creating archive from staging manifest");
        manifests.write_listings(&self.config.log_dir, "PrePak", true)?;
        let chunk = Chunk::whole(self.config.project.name.clone(), manifests.packed.clone());
        self.build_chunk(&chunk, manifests)
    }

    /// Partition the packed set by `memberships` and archive every chunk in index order.
    pub fn archive_chunked(
        &self,
        memberships: &[ChunkMembership],
        manifests: &mut StagingManifests,
    ) -> Result<Vec<ArchiveOutcome>> {
        info!(chunks = memberships.len(), "creating archives from chunk manifests");
        manifests.write_listings(&self.config.log_dir, "PrePak", true)?;
        let chunks = chunk::partition(&manifests.packed, memberships, &self.config.project.name)?;
        self.clean_chunk_install()?;
        let mut outcomes = Vec::with_capacity(chunks.len());
        for c in &chunks {
            outcomes.push(self.build_chunk(c, manifests)?);
        }
        self.copy_chunk_layers()?;
        Ok(outcomes)
    }
}

fn join_slash(base: &str, rest: &str) -> String {
    let base = base.trim_end_matches(['/', '\\']);
    let rest = rest.trim_start_matches(['/', '\\']);
    if base.is_empty() {
        rest.to_string()
    } else {
        format!("{base}/{rest}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_slash_collapses_separators() {
        assert_eq!(join_slash("../../../Game/", "/Content/a.uasset"), "../../../Game/Content/a.uasset");
        assert_eq!(join_slash("", "Content/a"), "Content/a");
    }

    #[test]
    fn invocation_orders_flags() {
        let inv = ArchiverInvocation {
            output: PathBuf::from("out.pak"),
            response_file: PathBuf::from("resp.txt"),
            sign_key: Some(PathBuf::from("key.txt")),
            installed: true,
            order_file: PathBuf::from("order.log"),
            utf8_output: true,
            patch_base: Some(PathBuf::from("base.pak")),
            platform_options: " -platform=Foo".into(),
        };
        let args: Vec<String> = inv.args().into_iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            [
                "out.pak",
                "-create=resp.txt",
                "-sign=key.txt",
                "-installed",
                "-order=order.log",
                "-UTF8Output",
                "-generatepatch=base.pak",
                "-platform=Foo",
            ]
        );
        assert_eq!(
            inv.command_line(),
            "\"out.pak\" -create=\"resp.txt\" -sign=\"key.txt\" -installed -order=\"order.log\" -UTF8Output -generatepatch=\"base.pak\" -platform=Foo"
        );
    }
}
