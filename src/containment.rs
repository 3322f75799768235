//! Path containment guard.
//!
//! Every path received from a peer is resolved by the OS to its canonical
//! form and compared against the canonical root. Lexical checks alone miss
//! symlinks and other aliases, so nothing here trusts the raw string.

use crate::error::{Result, SyncError};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Attempts before a contended placeholder gives up
const PLACEHOLDER_ATTEMPTS: usize = 8;

/// Proves that wire paths resolve inside one root directory.
#[derive(Debug)]
pub struct ContainmentGuard {
    root: PathBuf,
    apply: Mutex<()>,
}

impl ContainmentGuard {
    /// Canonicalize `root` once; all later checks compare against it.
    pub fn new(root: &Path) -> Result<Self> {
        let root = fs::canonicalize(root)?;
        if !root.is_dir() {
            return Err(SyncError::Config(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(Self {
            root,
            apply: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a wire path to its canonical location inside the root.
    ///
    /// A path that does not exist yet is created empty for the duration of
    /// the resolution and removed again. Any failure to resolve is reported
    /// as `OutsideRoot`. The root itself is not a valid target.
    pub fn resolve(&self, wire_path: &str) -> Result<PathBuf> {
        let candidate = self.root.join(wire_path);

        // NotFound also covers a placeholder another caller removed meanwhile
        let canonical = match fs::canonicalize(&candidate) {
            Ok(canonical) => Ok(canonical),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Never create placeholders in a directory outside the root
                let parent = candidate
                    .parent()
                    .ok_or_else(|| SyncError::OutsideRoot(wire_path.to_string()))?;
                match fs::canonicalize(parent) {
                    Ok(p) if p.starts_with(&self.root) => canonicalize_by_creating(&candidate),
                    Ok(_) => return Err(SyncError::OutsideRoot(wire_path.to_string())),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };
        let canonical = canonical.map_err(|e| {
            debug!("Cannot resolve {}: {}", candidate.display(), e);
            SyncError::OutsideRoot(wire_path.to_string())
        })?;

        if canonical != self.root && canonical.starts_with(&self.root) {
            Ok(canonical)
        } else {
            Err(SyncError::OutsideRoot(wire_path.to_string()))
        }
    }

    pub fn is_contained(&self, wire_path: &str) -> bool {
        self.resolve(wire_path).is_ok()
    }

    /// Check `wire_path` and return it joined to the root, unresolved.
    ///
    /// Used where the operation must act on a symlink itself rather than on
    /// its target.
    pub fn approve(&self, wire_path: &str) -> Result<PathBuf> {
        self.resolve(wire_path)?;
        Ok(self.root.join(wire_path))
    }

    /// Run `f` while no other caller is inside `exclusive`.
    ///
    /// Resolving a new path creates and removes a placeholder file, so
    /// checking a path and acting on it must not interleave with another
    /// connection doing the same.
    pub fn exclusive<T>(&self, f: impl FnOnce(&Self) -> T) -> T {
        let _held = self.apply.lock().unwrap_or_else(PoisonError::into_inner);
        f(self)
    }

    /// Create the missing parent directories of a wire path.
    ///
    /// The nearest existing ancestor must resolve inside the root (or be the
    /// root), and every missing component must be a plain name.
    pub fn prepare_parent(&self, wire_path: &str) -> Result<()> {
        let outside = || SyncError::OutsideRoot(wire_path.to_string());

        let candidate = self.root.join(wire_path);
        let parent = candidate.parent().ok_or_else(outside)?;

        let mut existing = None;
        for ancestor in parent.ancestors() {
            match fs::symlink_metadata(ancestor) {
                Ok(_) => {
                    existing = Some(ancestor);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let existing = existing.ok_or_else(outside)?;

        let anchor = fs::canonicalize(existing).map_err(|_| outside())?;
        if !anchor.starts_with(&self.root) {
            return Err(outside());
        }

        let missing = parent.strip_prefix(existing).map_err(|_| outside())?;
        if missing.as_os_str().is_empty() {
            return Ok(());
        }
        if !missing
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(outside());
        }

        fs::create_dir_all(anchor.join(missing))?;
        Ok(())
    }
}

/// Create `path` exclusively, resolve it, then remove it again.
///
/// Exclusive creation refuses to follow a dangling symlink, so the
/// placeholder can never land outside the root. If another caller creates the path
/// first, that file is resolved instead and left alone.
fn canonicalize_by_creating(path: &Path) -> io::Result<PathBuf> {
    let mut last_err = None;
    for _ in 0..PLACEHOLDER_ATTEMPTS {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => {
                let created = file.metadata()?;
                let resolved = fs::canonicalize(path);
                remove_placeholder(path, &created)?;
                return resolved;
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => match fs::canonicalize(path) {
                Ok(resolved) => return Ok(resolved),
                // Gone again before it could be resolved; try once more
                Err(e) if e.kind() == io::ErrorKind::NotFound => last_err = Some(e),
                Err(e) => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::NotFound)))
}

/// Remove the placeholder, but only if `path` still names the file we created.
fn remove_placeholder(path: &Path, created: &fs::Metadata) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(current) if same_file(&current, created) => match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        },
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn same_file(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_file(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    a.len() == b.len() && a.modified().ok() == b.modified().ok()
}
