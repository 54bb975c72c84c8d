// File: testing-framework/src/provisioning/cleanup.rs
//
// Persisted node state removal
//
// Walks the configured data directory and removes every directory carrying
// the node state directory name, the root included. Nodes from a previous run
// must already be dead: removing state under a live node is undefined.

use log::{info, warn};
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};

/// Remove every directory named `state_dir_name` at or below `root`
///
/// Returns the removed directories. A missing root is not an error.
pub fn clear_history_data(root: &Path, state_dir_name: &OsStr) -> io::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    if !root.exists() {
        info!("No history data under {}", root.display());
        return Ok(removed);
    }
    visit(root, state_dir_name, &mut removed)?;
    info!("Clear history data SUCCESS ({} directories)", removed.len());
    Ok(removed)
}

fn visit(dir: &Path, state_dir_name: &OsStr, removed: &mut Vec<PathBuf>) -> io::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    if dir.file_name() == Some(state_dir_name) {
        std::fs::remove_dir_all(dir)?;
        removed.push(dir.to_path_buf());
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(e) => {
                warn!("Skipping {}: {}", entry.path().display(), e);
                continue;
            }
        };
        if file_type.is_dir() {
            visit(&entry.path(), state_dir_name, removed)?;
        }
    }
    Ok(())
}
