use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, StageError>;

/// Errors produced while building, archiving, persisting or diffing staging manifests.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("manifest already contains {source_path} mapped to {existing} (or a path differing in case only), cannot map it to {requested}")]
    DuplicateKey { source_path: String, existing: String, requested: String },

    #[error("io error on {path}: {err}")]
    Io {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("archiver failed ({status}) while building {output}")]
    ArchiveBuildFailed { output: PathBuf, status: String },

    #[error("patch manifest generator failed ({status}) for chunk {chunk}")]
    PatchToolFailed { chunk: String, status: String },

    #[error("building {tool} failed ({status})")]
    ToolBuildFailed { tool: PathBuf, status: String },

    #[error("no source archive for patch archive {archive}")]
    MissingPatchBase { archive: PathBuf },

    #[error("unable to parse chunk id from {name}")]
    InvalidChunkName { name: String },

    #[error("invalid timestamp fingerprint {value:?} for {path}")]
    TimestampParse { path: String, value: String },

    #[error("invalid hash fingerprint {value:?} for {path}")]
    HashParse { path: String, value: String },

    #[error("unsafe staging path {path:?}: {reason}")]
    UnsafePath { path: String, reason: &'static str },

    #[error("config error: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("pattern error: {0}")]
    Pattern(#[from] globset::Error),

    #[error("walkdir error: {0}")]
    Walk(#[from] walkdir::Error),
}

impl StageError {
    pub fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        StageError::Io { path: path.into(), err }
    }
}

/// Attach the offending path to a bare `std::io::Result`.
pub trait IoResultExt<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|err| StageError::io(path, err))
    }
}
