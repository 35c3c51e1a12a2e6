//! On-disk firmware version store.
//!
//! `version.txt` holds `{"version": "...", "module": "..."}`. Reads
//! also accept a bare version string on a single line (older agents
//! wrote that); writes always emit JSON. Writes try the configured
//! path, the working directory, and the executable directory in order;
//! the first that succeeds wins.

use edgelink_core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

/// Default file name for the version store.
pub const VERSION_FILE: &str = "version.txt";

/// Persisted version record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: String,
    pub module: String,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            module: "default".to_string(),
        }
    }
}

/// Supplies and persists the current firmware version and module.
pub trait VersionProvider: Send + Sync {
    fn version(&self) -> String;
    fn set_version(&self, version: &str) -> Result<()>;
    fn module(&self) -> String;
    fn set_module(&self, module: &str) -> Result<()>;
}

/// File-backed version store.
pub struct FileVersionStore {
    path: PathBuf,
    cache: RwLock<VersionInfo>,
}

impl FileVersionStore {
    /// Open (or default) the store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cache = RwLock::new(load(&path));
        Self { path, cache }
    }

    /// The store at `version.txt` in the working directory.
    pub fn default_location() -> Self {
        Self::new(VERSION_FILE)
    }

    pub fn info(&self) -> VersionInfo {
        self.cache.read().unwrap().clone()
    }

    fn save(&self) -> Result<()> {
        let info = self.cache.read().unwrap().clone();
        let data = serde_json::to_string_pretty(&info)?;

        let mut last_error: Option<std::io::Error> = None;
        for candidate in self.candidate_paths() {
            if let Some(dir) = candidate.parent() {
                if !dir.as_os_str().is_empty() {
                    let _ = std::fs::create_dir_all(dir);
                }
            }
            match std::fs::write(&candidate, &data) {
                Ok(()) => {
                    debug!("wrote version info to {}", candidate.display());
                    return Ok(());
                }
                Err(e) => {
                    warn!("failed to write {}: {e}", candidate.display());
                    last_error = Some(e);
                }
            }
        }

        Err(Error::Io(format!(
            "failed to persist version info: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Configured path first, then `./version.txt`, then the executable
    /// directory.
    fn candidate_paths(&self) -> Vec<PathBuf> {
        let mut candidates = vec![self.path.clone()];

        let fallback = PathBuf::from(VERSION_FILE);
        if fallback != self.path {
            candidates.push(fallback);
        }

        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                let in_exe_dir = dir.join(VERSION_FILE);
                if !candidates.contains(&in_exe_dir) {
                    candidates.push(in_exe_dir);
                }
            }
        }
        candidates
    }
}

impl VersionProvider for FileVersionStore {
    fn version(&self) -> String {
        self.cache.read().unwrap().version.clone()
    }

    fn set_version(&self, version: &str) -> Result<()> {
        self.cache.write().unwrap().version = version.to_string();
        self.save()
    }

    fn module(&self) -> String {
        let module = self.cache.read().unwrap().module.clone();
        if module.is_empty() {
            "default".to_string()
        } else {
            module
        }
    }

    fn set_module(&self, module: &str) -> Result<()> {
        self.cache.write().unwrap().module = module.to_string();
        self.save()
    }
}

/// Read the file: JSON first, then the plain-text single-line fallback,
/// defaulting when absent or empty.
fn load(path: &Path) -> VersionInfo {
    let Ok(data) = std::fs::read_to_string(path) else {
        return VersionInfo::default();
    };

    if let Ok(info) = serde_json::from_str::<VersionInfo>(&data) {
        return info;
    }

    let version = data.trim();
    if version.is_empty() {
        return VersionInfo::default();
    }
    VersionInfo {
        version: version.to_string(),
        module: "default".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileVersionStore::new(dir.path().join("version.txt"));
        assert_eq!(store.version(), "1.0.0");
        assert_eq!(store.module(), "default");
    }

    #[test]
    fn test_plain_text_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("version.txt");
        std::fs::write(&path, "1.2.3\n").unwrap();

        let store = FileVersionStore::new(&path);
        assert_eq!(store.version(), "1.2.3");
        assert_eq!(store.module(), "default");
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("version.txt");

        let store = FileVersionStore::new(&path);
        store.set_version("1.0.13").unwrap();
        store.set_module("arm").unwrap();

        // A fresh store reads back what was written.
        let reopened = FileVersionStore::new(&path);
        assert_eq!(reopened.version(), "1.0.13");
        assert_eq!(reopened.module(), "arm");

        // And the on-disk format is JSON.
        let data = std::fs::read_to_string(&path).unwrap();
        let info: VersionInfo = serde_json::from_str(&data).unwrap();
        assert_eq!(
            info,
            VersionInfo {
                version: "1.0.13".to_string(),
                module: "arm".to_string(),
            }
        );
    }

    #[test]
    fn test_write_upgrades_plain_text_to_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("version.txt");
        std::fs::write(&path, "0.9.0").unwrap();

        let store = FileVersionStore::new(&path);
        store.set_version("1.0.0").unwrap();

        let data = std::fs::read_to_string(&path).unwrap();
        assert!(serde_json::from_str::<VersionInfo>(&data).is_ok());
    }

    #[test]
    fn test_empty_module_reads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("version.txt");
        std::fs::write(&path, r#"{"version":"1.0.5","module":""}"#).unwrap();

        let store = FileVersionStore::new(&path);
        assert_eq!(store.module(), "default");
    }
}
