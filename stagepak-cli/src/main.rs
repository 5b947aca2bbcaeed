use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use stagepak_core::archive::{ProcessArchiver, ProcessPatchTool};
use stagepak_core::chunk::{self, load_chunk_list};
use stagepak_core::config::StageConfig;
use stagepak_core::delta::{self, DeltaCategory};
use stagepak_core::fingerprint::HashTrackedSet;
use stagepak_core::manifest::{CasePolicy, Manifest};
use stagepak_core::persist;
use stagepak_core::stage::{collect_directory, SourceFilter, StagingRun};
use stagepak_core::tool_lock::ToolBuildLock;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Category {
    Packed,
    Verbatim,
}

impl From<Category> for DeltaCategory {
    fn from(c: Category) -> Self {
        match c {
            Category::Packed => DeltaCategory::Packed,
            Category::Verbatim => DeltaCategory::Verbatim,
        }
    }
}

#[derive(Parser)]
#[command(name = "stagepak", version, about = "Stage build output, archive it in chunks, diff deploys")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run a full staging pass from a JSON config
    Stage { config: PathBuf },
    /// Show which chunk each file under a directory lands in
    Partition {
        root: PathBuf,
        #[arg(long)]
        chunk_list: PathBuf,
        /// Directory holding the per-chunk lists (defaults to the chunk list's dir)
        #[arg(long)]
        chunk_dir: Option<PathBuf>,
        #[arg(long, default_value = "")]
        dest_prefix: String,
    },
    /// Fingerprint a directory into a `dest<TAB>fingerprint` manifest
    Manifest {
        root: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        hash_tracked: Vec<String>,
        #[arg(long)]
        include: Vec<String>,
        #[arg(long)]
        exclude: Vec<String>,
    },
    /// Compute and write the deploy delta for one category
    Delta {
        #[arg(long)]
        stage_dir: PathBuf,
        #[arg(long, value_enum, default_value_t = Category::Packed)]
        category: Category,
        /// Deployed manifests in priority order; each is deleted once read
        #[arg(long)]
        deployed: Vec<PathBuf>,
        #[arg(long)]
        hash_tracked: Vec<String>,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Stage { config } => stage(&config)?,
        Cmd::Partition { root, chunk_list, chunk_dir, dest_prefix } => {
            partition(&root, &chunk_list, chunk_dir.as_deref(), &dest_prefix)?
        }
        Cmd::Manifest { root, out, hash_tracked, include, exclude } => {
            manifest(&root, &out, &hash_tracked, &include, &exclude)?
        }
        Cmd::Delta { stage_dir, category, deployed, hash_tracked } => {
            delta(&stage_dir, category.into(), &deployed, &hash_tracked)?
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn stage(config_path: &Path) -> Result<()> {
    tracing::info!(config = %config_path.display(), "stage started");
    let config = StageConfig::load(config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;
    let archiver = ProcessArchiver::new(config.archive.archiver.clone());
    let lock = match config.chunk_install.as_ref().and_then(|c| c.patch_tool_lock_file.clone()) {
        Some(path) => ToolBuildLock::with_lock_file(path),
        None => ToolBuildLock::new(),
    };
    let patch_tool = config.chunk_install.as_ref().map(ProcessPatchTool::from_config);
    let mut run = StagingRun::new(&config, &archiver, &lock);
    if let Some(tool) = &patch_tool {
        run = run.with_patch_tool(tool);
    }
    let report = run.run().context("staging failed")?;
    for a in &report.archives {
        println!("archive\t{}\t{:?}\t{}", a.chunk, a.disposition, a.target.relative);
    }
    for m in &report.manifests {
        println!("manifest\t{}", m.display());
    }
    if let Some(d) = &report.delta {
        println!("delta\tpacked={}\tverbatim={}", d.packed.len(), d.verbatim.len());
    }
    println!("OK");
    Ok(())
}

fn partition(root: &Path, chunk_list: &Path, chunk_dir: Option<&Path>, dest_prefix: &str) -> Result<()> {
    let dir = chunk_dir
        .map(Path::to_path_buf)
        .or_else(|| chunk_list.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    let memberships = load_chunk_list(chunk_list, &dir)
        .with_context(|| format!("read chunk list {}", chunk_list.display()))?;
    let mut manifest = Manifest::new(CasePolicy::Sensitive);
    collect_directory(&mut manifest, root, dest_prefix, &SourceFilter::new(&[], &[])?)?;
    for c in chunk::partition(&manifest, &memberships, "default")? {
        for e in c.entries.iter() {
            println!("{}\t{}\t{}", c.index, c.name.name, e.dest_path);
        }
    }
    Ok(())
}

fn manifest(
    root: &Path,
    out: &Path,
    hash_tracked: &[String],
    include: &[String],
    exclude: &[String],
) -> Result<()> {
    let mut manifest = Manifest::new(CasePolicy::Sensitive);
    let filter = SourceFilter::new(include, exclude)?;
    let n = collect_directory(&mut manifest, root, "", &filter)?;
    let tracked = HashTrackedSet::new(hash_tracked);
    let fingerprints = persist::fingerprint_manifest(&manifest, root, &tracked)?;
    let written = persist::write(fingerprints.iter().map(|(d, f)| (d.as_str(), f)), out)
        .with_context(|| format!("write {}", out.display()))?;
    if written {
        println!("wrote {} entries to {}", n, out.display());
    } else {
        println!("nothing to record");
    }
    Ok(())
}

fn delta(stage_dir: &Path, category: DeltaCategory, deployed: &[PathBuf], hash_tracked: &[String]) -> Result<()> {
    let tracked = HashTrackedSet::new(hash_tracked);
    let merged = delta::merge_deployed(deployed, &tracked).context("merge deployed manifests")?;
    let staged = delta::read_staged(stage_dir, category.staged_manifest(), &tracked)?;
    let files = delta::compute_delta(&merged, &staged, category);
    delta::write_delta(stage_dir, category, &files)?;
    for f in &files {
        println!("{f}");
    }
    Ok(())
}
