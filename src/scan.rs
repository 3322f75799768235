//! Full-tree listing of the watched root.
//!
//! Used for the initial scan and to recover after the watcher overflows.

use ignore::WalkBuilder;
use std::path::{Component, Path};

/// Wire name of `path` relative to `root`, `/`-separated.
///
/// Returns `None` for paths outside `root` and for `root` itself.
pub fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Relative names of every regular file under `root`.
///
/// Hidden files and ignore files are not filtered: the whole tree is
/// replicated. Symlinks are not followed.
pub fn list_files(root: &Path) -> Vec<String> {
    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(false)
        .build();

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("Scan error: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        if let Some(name) = relative_name(root, entry.path()) {
            files.push(name);
        }
    }
    files.sort();
    files
}
