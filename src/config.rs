//! Configuration file parsing (`config.toml`)
//!
//! Looked up at `--config <path>` if given, otherwise at
//! `<config dir>/dropsync/config.toml`. Command-line flags override it.

use crate::error::{Result, SyncError};
use crate::transport::tcp::DEFAULT_PORT;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file name
pub const CONFIG_FILE: &str = "config.toml";

/// dropsync configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// TCP port to listen on or connect to
    pub port: u16,

    /// Address the server binds to
    pub bind: String,

    /// Batch window in milliseconds
    pub debounce_ms: u64,

    /// Send every existing file when the client starts
    pub initial_scan: bool,

    /// Default log filter when neither RUST_LOG nor -v is given
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: "0.0.0.0".to_string(),
            debounce_ms: 1000,
            initial_scan: true,
            log_level: None,
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// An explicit path must exist. The default location is optional and
    /// yields the defaults when absent.
    ///
    /// # Errors
    /// Returns an error if a file exists but cannot be read or parsed.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("dropsync").join(CONFIG_FILE))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| SyncError::Config(e.to_string()))
    }

    pub fn frame_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        }
    } else {
        path.to_path_buf()
    }
}

/// Turn a directory argument into a canonical root.
///
/// A missing or empty argument means the current directory.
pub fn resolve_root(dir: Option<&Path>) -> Result<PathBuf> {
    let dir = match dir {
        Some(d) if !d.as_os_str().is_empty() => expand_tilde(d),
        _ => std::env::current_dir()?,
    };
    let root = std::fs::canonicalize(&dir)
        .map_err(|e| SyncError::Config(format!("{}: {}", dir.display(), e)))?;
    if !root.is_dir() {
        return Err(SyncError::Config(format!(
            "{} is not a directory",
            root.display()
        )));
    }
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 41218);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.frame_window(), Duration::from_secs(1));
        assert!(config.initial_scan);
        assert_eq!(config.log_level, None);
    }

    #[test]
    fn test_parse_partial_config() {
        let config = Config::from_toml(
            r#"
port = 9000
debounce_ms = 250
log_level = "debug"
"#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.frame_window(), Duration::from_millis(250));
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_parse_empty_config() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn test_parse_error() {
        let err = Config::from_toml("port = \"not a number\"").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_load_explicit_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        std::fs::write(&path, "initial_scan = false\nbind = \"127.0.0.1\"\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert!(!config.initial_scan);
        assert_eq!(config.bind, "127.0.0.1");

        assert!(Config::load(Some(&tmp.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_expand_tilde() {
        let plain = Path::new("/srv/sync");
        assert_eq!(expand_tilde(plain), PathBuf::from("/srv/sync"));

        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~")), home);
            assert_eq!(expand_tilde(Path::new("~/sync")), home.join("sync"));
        }
    }

    #[test]
    fn test_resolve_root() {
        let tmp = TempDir::new().unwrap();
        let root = resolve_root(Some(tmp.path())).unwrap();
        assert_eq!(root, std::fs::canonicalize(tmp.path()).unwrap());

        let file = tmp.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        assert!(resolve_root(Some(&file)).is_err());
        assert!(resolve_root(Some(&tmp.path().join("missing"))).is_err());
    }
}
