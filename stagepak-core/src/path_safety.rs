use std::path::{Component, Path, PathBuf};

use crate::error::{Result, StageError};

/// Ensure a staging destination stays under `stage_dir`: no absolute paths,
/// no `..`, no symlinked ancestor inside the stage dir. Accepts either
/// separator in `dest`.
pub fn resolve_dest(stage_dir: &Path, dest: &str) -> Result<PathBuf> {
    let normalized = dest.replace('\\', "/");
    let rel = Path::new(&normalized);
    if rel.is_absolute() || normalized.starts_with('/') {
        return Err(StageError::UnsafePath { path: dest.to_string(), reason: "absolute path" });
    }
    let mut cur = stage_dir.to_path_buf();
    for comp in rel.components() {
        match comp {
            Component::ParentDir => {
                return Err(StageError::UnsafePath {
                    path: dest.to_string(),
                    reason: "parent traversal",
                })
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(StageError::UnsafePath { path: dest.to_string(), reason: "absolute path" })
            }
            _ => {}
        }
        cur = cur.join(comp);
        if let Ok(m) = std::fs::symlink_metadata(&cur) {
            if m.file_type().is_symlink() {
                return Err(StageError::UnsafePath { path: dest.to_string(), reason: "symlink in path" });
            }
        }
    }
    Ok(stage_dir.join(rel))
}

/// Never fails; a broken or unreadable entry counts as absent.
pub fn file_exists(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

pub fn dir_exists(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}
