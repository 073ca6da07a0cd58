//! Naming rules for files in a worker's staging directory.

use std::path::{Component, Path, PathBuf};

/// Validate a staged file name received from a peer.
///
/// Names must be relative and may not climb out of the staging directory.
/// Returns `None` for empty, absolute, or `..`-containing names.
#[must_use]
pub fn staged_path(name: &str) -> Option<PathBuf> {
    let path = Path::new(name);
    let mut has_normal = false;
    for component in path.components() {
        match component {
            Component::Normal(_) => has_normal = true,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    has_normal.then(|| path.to_path_buf())
}
