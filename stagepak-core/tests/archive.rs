use serde_json::json;
use std::cell::RefCell;
use std::path::{Path, PathBuf};

use stagepak_core::archive::{
    ArchiveDisposition, ArchiveOrchestrator, Archiver, ArchiverInvocation, PatchManifestGenerator,
    PatchManifestRequest,
};
use stagepak_core::chunk::{Chunk, ChunkMembership};
use stagepak_core::config::StageConfig;
use stagepak_core::manifest::{CasePolicy, Manifest, StagingManifests};
use stagepak_core::tool_lock::ToolBuildLock;
use stagepak_core::{Result, StageError};

/// Records invocations and writes a stub archive, or fails on demand.
#[derive(Default)]
struct FakeArchiver {
    calls: RefCell<Vec<ArchiverInvocation>>,
    fail: bool,
}

impl Archiver for FakeArchiver {
    fn build(&self, invocation: &ArchiverInvocation) -> Result<()> {
        self.calls.borrow_mut().push(invocation.clone());
        if self.fail {
            return Err(StageError::ArchiveBuildFailed {
                output: invocation.output.clone(),
                status: "exit status: 1".into(),
            });
        }
        std::fs::write(&invocation.output, b"PAK").unwrap();
        Ok(())
    }
}

struct FakePatchTool {
    exe: PathBuf,
    requests: RefCell<Vec<PatchManifestRequest>>,
}

impl PatchManifestGenerator for FakePatchTool {
    fn tool_path(&self) -> &Path {
        &self.exe
    }

    fn build_tool(&self) -> Result<()> {
        std::fs::write(&self.exe, b"tool").unwrap();
        Ok(())
    }

    fn generate(&self, request: &PatchManifestRequest) -> Result<()> {
        std::fs::create_dir_all(&request.cloud_dir).unwrap();
        std::fs::write(request.cloud_dir.join(request.manifest_file_name()), b"manifest").unwrap();
        self.requests.borrow_mut().push(request.clone());
        Ok(())
    }
}

fn config(root: &Path, extra: serde_json::Value) -> StageConfig {
    let mut base = json!({
        "project": {
            "name": "Game",
            "root": root.join("project"),
            "stage_root": "Game",
            "archive_internal_root": "../../../Game/"
        },
        "stage_dir": root.join("stage"),
        "log_dir": root.join("logs"),
        "target": { "name": "LinuxClient" },
        "archive": { "policy": "always", "compress": true }
    });
    merge(&mut base, extra);
    let cfg: StageConfig = serde_json::from_value(base).unwrap();
    cfg.validate().unwrap();
    cfg
}

fn merge(base: &mut serde_json::Value, extra: serde_json::Value) {
    match (base, extra) {
        (serde_json::Value::Object(b), serde_json::Value::Object(e)) => {
            for (k, v) in e {
                merge(b.entry(k).or_insert(serde_json::Value::Null), v);
            }
        }
        (b, e) => *b = e,
    }
}

fn chunk_with(name: &str, files: &[(&Path, &str)]) -> Chunk {
    let mut m = Manifest::new(CasePolicy::Sensitive);
    for (src, dest) in files {
        m.add(src.to_string_lossy(), *dest).unwrap();
    }
    Chunk { index: 0, name: stagepak_core::chunk::ChunkName::parse(name), entries: m }
}

fn source_file(root: &Path, name: &str) -> PathBuf {
    let p = root.join("cooked").join(name);
    std::fs::create_dir_all(p.parent().unwrap()).unwrap();
    std::fs::write(&p, name.as_bytes()).unwrap();
    p
}

#[test]
fn builds_and_registers_archive() {
    let td = tempfile::tempdir().unwrap();
    let cfg = config(td.path(), json!({}));
    let archiver = FakeArchiver::default();
    let lock = ToolBuildLock::new();
    let orch = ArchiveOrchestrator::new(&cfg, &archiver, &lock);
    let a = source_file(td.path(), "a.uasset");
    let chunk = chunk_with("Game", &[(a.as_path(), "Game/Content/a.uasset")]);
    let mut manifests = StagingManifests::new(CasePolicy::Sensitive);

    let outcome = orch.build_chunk(&chunk, &mut manifests).unwrap();
    assert_eq!(outcome.disposition, ArchiveDisposition::Built);
    assert!(outcome.registered);
    assert_eq!(outcome.target.relative, "Game/Content/Paks/Game-LinuxClient.pak");
    assert!(outcome.target.absolute.exists());

    let calls = archiver.calls.borrow();
    assert_eq!(calls.len(), 1);
    let inv = &calls[0];
    assert!(inv.order_file.ends_with("Build/LinuxClient/FileOpenOrder/EditorOpenOrder.log"));
    assert!(inv.patch_base.is_none());
    let resp = std::fs::read_to_string(&inv.response_file).unwrap();
    assert_eq!(inv.response_file.file_name().unwrap(), "PakList_Game.txt");
    assert_eq!(
        resp,
        format!("\"{}\" \"../../../Game/Game/Content/a.uasset\" -compress\n", a.display())
    );

    let entry = manifests.verbatim.iter().next().unwrap();
    assert_eq!(entry.dest_path, "Game/Content/Paks/Game-LinuxClient.pak");
    assert_eq!(PathBuf::from(&entry.source_path), outcome.target.absolute);
}

#[test]
fn reuses_cook_source_archive_without_building() {
    let td = tempfile::tempdir().unwrap();
    let other_root = td.path().join("other_stage");
    let cfg = config(
        td.path(),
        json!({ "cook_source": { "name": "Linux", "runtime_root": other_root } }),
    );
    let existing = other_root.join("Game/Content/Paks/Game-Linux.pak");
    std::fs::create_dir_all(existing.parent().unwrap()).unwrap();
    std::fs::write(&existing, b"PREBUILT").unwrap();

    let archiver = FakeArchiver::default();
    let lock = ToolBuildLock::new();
    let orch = ArchiveOrchestrator::new(&cfg, &archiver, &lock);
    let a = source_file(td.path(), "a.uasset");
    let chunk = chunk_with("Game", &[(a.as_path(), "Game/Content/a.uasset")]);
    let mut manifests = StagingManifests::new(CasePolicy::Sensitive);

    let outcome = orch.build_chunk(&chunk, &mut manifests).unwrap();
    assert_eq!(outcome.disposition, ArchiveDisposition::Reused);
    assert!(archiver.calls.borrow().is_empty());
    assert_eq!(std::fs::read(&outcome.target.absolute).unwrap(), b"PREBUILT");
    assert_eq!(manifests.verbatim.len(), 1);
}

#[test]
fn empty_chunk_produces_nothing() {
    let td = tempfile::tempdir().unwrap();
    let cfg = config(td.path(), json!({}));
    let archiver = FakeArchiver::default();
    let lock = ToolBuildLock::new();
    let orch = ArchiveOrchestrator::new(&cfg, &archiver, &lock);
    let mut manifests = StagingManifests::new(CasePolicy::Sensitive);

    let outcome = orch.build_chunk(&chunk_with("pakchunk3", &[]), &mut manifests).unwrap();
    assert_eq!(outcome.disposition, ArchiveDisposition::Empty);
    assert!(!outcome.registered);
    assert!(archiver.calls.borrow().is_empty());
    assert!(manifests.verbatim.is_empty());
}

#[test]
fn archiver_failure_is_fatal() {
    let td = tempfile::tempdir().unwrap();
    let cfg = config(td.path(), json!({}));
    let archiver = FakeArchiver { fail: true, ..Default::default() };
    let lock = ToolBuildLock::new();
    let orch = ArchiveOrchestrator::new(&cfg, &archiver, &lock);
    let a = source_file(td.path(), "a.uasset");
    let mut manifests = StagingManifests::new(CasePolicy::Sensitive);

    let err = orch
        .build_chunk(&chunk_with("Game", &[(a.as_path(), "Game/a.uasset")]), &mut manifests)
        .unwrap_err();
    assert!(matches!(err, StageError::ArchiveBuildFailed { .. }), "{err}");
    assert!(manifests.verbatim.is_empty());
}

#[test]
fn patch_build_targets_suffix_and_release_base() {
    let td = tempfile::tempdir().unwrap();
    let cfg = config(
        td.path(),
        json!({
            "patch": { "generating_patch": true, "based_on_release": "1.0" },
            "target": { "name": "LinuxClient", "lowercase": { "packed": true } }
        }),
    );
    let archiver = FakeArchiver::default();
    let lock = ToolBuildLock::new();
    let orch = ArchiveOrchestrator::new(&cfg, &archiver, &lock);

    let target = orch.target_path("Game");
    assert_eq!(target.relative, "game/content/paks/game-linuxclient_p.pak");
    let base = orch.patch_base("Game").unwrap();
    assert!(base.ends_with("project/Releases/1.0/LinuxClient/Game-LinuxClient.pak"));
}

#[test]
fn prefers_game_order_file() {
    let td = tempfile::tempdir().unwrap();
    let cfg = config(td.path(), json!({}));
    let order_dir = td.path().join("project/Build/LinuxClient/FileOpenOrder");
    std::fs::create_dir_all(&order_dir).unwrap();
    std::fs::write(order_dir.join("GameOpenOrder.log"), "").unwrap();
    let archiver = FakeArchiver::default();
    let lock = ToolBuildLock::new();
    let orch = ArchiveOrchestrator::new(&cfg, &archiver, &lock);
    assert_eq!(orch.order_file(), order_dir.join("GameOpenOrder.log"));
}

#[test]
fn response_file_rejects_case_only_duplicates() {
    let td = tempfile::tempdir().unwrap();
    let cfg = config(td.path(), json!({}));
    let archiver = FakeArchiver::default();
    let lock = ToolBuildLock::new();
    let orch = ArchiveOrchestrator::new(&cfg, &archiver, &lock);
    let chunk = chunk_with(
        "Game",
        &[(Path::new("/src/A.uasset"), "Game/A.uasset"), (Path::new("/src/a.uasset"), "Game/a2.uasset")],
    );
    match orch.write_response_file(&chunk) {
        Err(StageError::DuplicateKey { source_path, existing, requested }) => {
            assert_eq!(source_path, "/src/a.uasset");
            assert_eq!(existing, "Game/A.uasset");
            assert_eq!(requested, "Game/a2.uasset");
        }
        other => panic!("expected DuplicateKey, got {other:?}"),
    }
}

#[cfg(unix)]
#[test]
fn failed_tool_build_names_the_tool() {
    use stagepak_core::archive::ProcessPatchTool;

    let td = tempfile::tempdir().unwrap();
    let exe = td.path().join("bin/BuildPatchTool");
    let tool = ProcessPatchTool::new(&exe, vec!["false".to_string()]);
    match tool.build_tool() {
        Err(StageError::ToolBuildFailed { tool, .. }) => assert_eq!(tool, exe),
        other => panic!("expected ToolBuildFailed, got {other:?}"),
    }
}

#[test]
fn release_snapshot_copies_archive() {
    let td = tempfile::tempdir().unwrap();
    let cfg = config(td.path(), json!({ "patch": { "create_release": "2.0" } }));
    let archiver = FakeArchiver::default();
    let lock = ToolBuildLock::new();
    let orch = ArchiveOrchestrator::new(&cfg, &archiver, &lock);
    let a = source_file(td.path(), "a.uasset");
    let mut manifests = StagingManifests::new(CasePolicy::Sensitive);
    orch.build_chunk(&chunk_with("Game", &[(a.as_path(), "Game/a.uasset")]), &mut manifests).unwrap();
    let release = td.path().join("project/Releases/2.0/LinuxClient/Game-LinuxClient.pak");
    assert_eq!(std::fs::read(release).unwrap(), b"PAK");
}

fn chunk_install_config(root: &Path, extra: serde_json::Value) -> StageConfig {
    let mut install = json!({
        "chunk_install": {
            "directory": root.join("install"),
            "version": "v7",
            "patch_tool": root.join("tools/bpt")
        }
    });
    merge(&mut install, extra);
    config(root, install)
}

#[test]
fn chunk_install_moves_nonzero_chunks_out_of_stage() {
    let td = tempfile::tempdir().unwrap();
    let cfg = chunk_install_config(td.path(), json!({}));
    let archiver = FakeArchiver::default();
    let lock = ToolBuildLock::new();
    std::fs::create_dir_all(td.path().join("tools")).unwrap();
    let tool = FakePatchTool { exe: td.path().join("tools/bpt"), requests: RefCell::default() };
    let orch = ArchiveOrchestrator::new(&cfg, &archiver, &lock).with_patch_tool(&tool);
    let a = source_file(td.path(), "a.uasset");
    let b = source_file(td.path(), "b.uasset");
    let mut manifests = StagingManifests::new(CasePolicy::Sensitive);

    let base = orch.build_chunk(&chunk_with("pakchunk0", &[(a.as_path(), "Game/a.uasset")]), &mut manifests).unwrap();
    assert!(base.registered);
    assert!(base.target.absolute.exists());

    let optional = orch.build_chunk(&chunk_with("pakchunk2", &[(b.as_path(), "Game/b.uasset")]), &mut manifests).unwrap();
    assert!(!optional.registered);
    assert!(!optional.target.absolute.exists());
    let raw = optional.raw_data_dir.unwrap();
    assert_eq!(raw, td.path().join("install/LinuxClient/v7/pakchunk2"));
    assert!(raw.join("pakchunk2-LinuxClient.pak").exists());
    assert!(raw.join("Game_pakchunk2v7.manifest").exists());
    assert!(td.path().join("install/LinuxClient/ManifestDir/Game_pakchunk2v7.manifest").exists());
    assert!(tool.exe.exists());

    let requests = tool.requests.borrow();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].chunk_id, 2);
    assert_eq!(requests[0].app_name, "Game_pakchunk2");
    assert!(requests[0].command_line().contains("-customint=\"ChunkID=2\""));
    assert_eq!(manifests.verbatim.len(), 1);
}

#[test]
fn chunk_install_requires_numeric_chunk_name() {
    let td = tempfile::tempdir().unwrap();
    let cfg = chunk_install_config(td.path(), json!({}));
    let archiver = FakeArchiver::default();
    let lock = ToolBuildLock::new();
    let orch = ArchiveOrchestrator::new(&cfg, &archiver, &lock);
    let a = source_file(td.path(), "a.uasset");
    let mut manifests = StagingManifests::new(CasePolicy::Sensitive);
    let err = orch
        .build_chunk(&chunk_with("Game", &[(a.as_path(), "Game/a.uasset")]), &mut manifests)
        .unwrap_err();
    assert!(matches!(err, StageError::InvalidChunkName { .. }), "{err}");
}

#[test]
fn chunk_install_patch_without_base_fails() {
    let td = tempfile::tempdir().unwrap();
    let cfg = chunk_install_config(
        td.path(),
        json!({ "patch": { "generating_patch": true, "based_on_release": "1.0" } }),
    );
    let archiver = FakeArchiver::default();
    let lock = ToolBuildLock::new();
    let tool = FakePatchTool { exe: td.path().join("bpt"), requests: RefCell::default() };
    let orch = ArchiveOrchestrator::new(&cfg, &archiver, &lock).with_patch_tool(&tool);
    let a = source_file(td.path(), "a.uasset");
    let mut manifests = StagingManifests::new(CasePolicy::Sensitive);
    let err = orch
        .build_chunk(&chunk_with("pakchunk1", &[(a.as_path(), "Game/a.uasset")]), &mut manifests)
        .unwrap_err();
    assert!(matches!(err, StageError::MissingPatchBase { .. }), "{err}");
    assert!(tool.requests.borrow().is_empty());
}

#[test]
fn chunked_run_cleans_install_dir_and_copies_layers() {
    let td = tempfile::tempdir().unwrap();
    let tmp = td.path().join("tmp");
    let cfg = chunk_install_config(
        td.path(),
        json!({ "archive": { "use_chunk_manifests": true, "temp_packaging_dir": tmp } }),
    );
    std::fs::create_dir_all(&tmp).unwrap();
    std::fs::write(tmp.join("pakchunklayers.txt"), "layers").unwrap();
    let stale_manifest = td.path().join("install/LinuxClient/ManifestDir/old.manifest");
    std::fs::create_dir_all(stale_manifest.parent().unwrap()).unwrap();
    std::fs::write(&stale_manifest, "old").unwrap();
    let stale_raw = td.path().join("install/LinuxClient/v7/pakchunk9/old.pak");
    std::fs::create_dir_all(stale_raw.parent().unwrap()).unwrap();
    std::fs::write(&stale_raw, "old").unwrap();

    let archiver = FakeArchiver::default();
    let lock = ToolBuildLock::new();
    let tool = FakePatchTool { exe: td.path().join("bpt"), requests: RefCell::default() };
    let orch = ArchiveOrchestrator::new(&cfg, &archiver, &lock).with_patch_tool(&tool);

    let a = source_file(td.path(), "a.uasset");
    let mut manifests = StagingManifests::new(CasePolicy::Sensitive);
    manifests.packed.add(a.to_string_lossy(), "Game/a.uasset").unwrap();
    let memberships = vec![
        ChunkMembership::new("pakchunk0", Vec::<String>::new()),
        ChunkMembership::new("pakchunk1", Vec::<String>::new()),
    ];

    let outcomes = orch.archive_chunked(&memberships, &mut manifests).unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].disposition, ArchiveDisposition::Built);
    assert_eq!(outcomes[1].disposition, ArchiveDisposition::Empty);
    assert!(!stale_manifest.exists());
    assert!(!stale_raw.exists());
    let layers = td.path().join("project/Build/LinuxClient/ChunkLayerInfo/pakchunklayers.txt");
    assert_eq!(std::fs::read_to_string(layers).unwrap(), "layers");
    assert!(td.path().join("logs/PrePak_PackedFiles.txt").exists());
}
