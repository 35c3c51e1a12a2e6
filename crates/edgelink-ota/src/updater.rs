//! Binary self-replacement.
//!
//! The running executable is backed up to `{exe}.backup`, the new image
//! staged at `{exe}.new`, and the swap is platform specific: Unix can
//! unlink a running binary, so the sequence is unlink → rename → chmod
//! → exec with the original argv and environment; Windows cannot, so a
//! batch script waits for the process to exit, moves the image into
//! place, restarts the app, and deletes itself while we exit(0).

use edgelink_core::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Applies a downloaded firmware image.
pub trait Updater: Send + Sync {
    /// Whether the target location is writable at all.
    fn can_update(&self) -> bool;

    /// Back up the current image and stage the new one.
    fn prepare_update(&self, data: &[u8]) -> Result<()>;

    /// Swap images and restart. On Unix this call does not return on
    /// success: the process is replaced.
    fn execute_update(&self) -> Result<()>;

    /// Restore the backup after a failed update.
    fn rollback(&self) -> Result<()>;
}

/// Self-replacing updater for the agent's own executable.
pub struct BinaryUpdater {
    executable_path: PathBuf,
    backup_path: PathBuf,
    staged_path: PathBuf,
}

impl BinaryUpdater {
    /// Target the currently running executable (symlinks resolved).
    pub fn new() -> Self {
        let executable_path = std::env::current_exe()
            .and_then(|p| p.canonicalize())
            .unwrap_or_else(|e| {
                warn!("failed to resolve executable path: {e}");
                PathBuf::from("./app")
            });
        Self::for_path(executable_path)
    }

    /// Target an explicit path. Test seam.
    pub fn for_path(executable_path: impl Into<PathBuf>) -> Self {
        let executable_path = executable_path.into();
        let backup_path = sibling(&executable_path, ".backup");
        let staged_path = sibling(&executable_path, ".new");
        Self {
            executable_path,
            backup_path,
            staged_path,
        }
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    pub fn staged_path(&self) -> &Path {
        &self.staged_path
    }

    fn backup_current(&self) -> Result<()> {
        // A stale backup from an earlier attempt is replaced.
        let _ = std::fs::remove_file(&self.backup_path);

        let data = std::fs::read(&self.executable_path)
            .map_err(|e| Error::ota(format!("failed to read current executable: {e}")))?;
        write_executable(&self.backup_path, &data)
            .map_err(|e| Error::ota(format!("failed to write backup: {e}")))?;
        info!("backed up current executable to {}", self.backup_path.display());
        Ok(())
    }

    #[cfg(unix)]
    fn execute_unix(&self) -> Result<()> {
        use std::os::unix::process::CommandExt;

        // Unix allows unlinking a running binary.
        if let Err(e) = std::fs::remove_file(&self.executable_path) {
            warn!("failed to remove old executable: {e}");
        }

        if let Err(rename_err) = std::fs::rename(&self.staged_path, &self.executable_path) {
            // Cross-device staging directories make rename fail; copy instead.
            warn!("rename failed ({rename_err}), copying instead");
            let data = std::fs::read(&self.staged_path)
                .map_err(|e| Error::ota(format!("failed to read new executable: {e}")))?;
            write_executable(&self.executable_path, &data)
                .map_err(|e| Error::ota(format!("failed to write new executable: {e}")))?;
            let _ = std::fs::remove_file(&self.staged_path);
        }
        set_executable_mode(&self.executable_path)?;

        info!("restarting with new version");
        let args: Vec<String> = std::env::args().skip(1).collect();
        // exec() only returns on failure; env is inherited.
        let err = std::process::Command::new(&self.executable_path)
            .args(args)
            .exec();
        Err(Error::ota(format!("exec failed: {err}")))
    }

    #[cfg(windows)]
    fn execute_windows(&self) -> Result<()> {
        let script_path = sibling(&self.executable_path, "_update.bat");
        let script = format!(
            "@echo off\r\n\
             echo Waiting for process to exit...\r\n\
             timeout /t 2 /nobreak > nul\r\n\
             echo Updating executable...\r\n\
             move /y \"{staged}\" \"{exe}\"\r\n\
             echo Starting new version...\r\n\
             start \"\" \"{exe}\"\r\n\
             del \"%~f0\"\r\n",
            staged = self.staged_path.display(),
            exe = self.executable_path.display(),
        );
        std::fs::write(&script_path, script)
            .map_err(|e| Error::ota(format!("failed to create update script: {e}")))?;

        info!("starting update script");
        std::process::Command::new("cmd")
            .args(["/c", &script_path.to_string_lossy()])
            .spawn()
            .map_err(|e| Error::ota(format!("failed to start update script: {e}")))?;

        // The script takes over from here.
        std::process::exit(0);
    }
}

impl Default for BinaryUpdater {
    fn default() -> Self {
        Self::new()
    }
}

impl Updater for BinaryUpdater {
    fn can_update(&self) -> bool {
        let dir = match self.executable_path.parent() {
            Some(dir) => dir,
            None => return false,
        };
        let probe = dir.join(".ota_test");
        match std::fs::write(&probe, b"test") {
            Ok(()) => {
                let _ = std::fs::remove_file(&probe);
                true
            }
            Err(_) => {
                warn!("cannot update: no write permission in {}", dir.display());
                false
            }
        }
    }

    fn prepare_update(&self, data: &[u8]) -> Result<()> {
        self.backup_current()?;
        write_executable(&self.staged_path, data)
            .map_err(|e| Error::ota(format!("failed to write new executable: {e}")))?;
        info!(
            "new firmware staged at {} ({} bytes)",
            self.staged_path.display(),
            data.len()
        );
        Ok(())
    }

    fn execute_update(&self) -> Result<()> {
        info!("executing update");
        #[cfg(unix)]
        {
            self.execute_unix()
        }
        #[cfg(windows)]
        {
            self.execute_windows()
        }
        #[cfg(not(any(unix, windows)))]
        {
            Err(Error::ota("self-update is not supported on this platform"))
        }
    }

    fn rollback(&self) -> Result<()> {
        if !self.backup_path.exists() {
            return Err(Error::ota("backup file does not exist"));
        }

        let _ = std::fs::remove_file(&self.staged_path);

        if std::fs::rename(&self.backup_path, &self.executable_path).is_err() {
            let data = std::fs::read(&self.backup_path)
                .map_err(|e| Error::ota(format!("failed to read backup: {e}")))?;
            write_executable(&self.executable_path, &data)
                .map_err(|e| Error::ota(format!("failed to restore backup: {e}")))?;
        }

        info!("rolled back to previous version");
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn write_executable(path: &Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, data)?;
    set_executable_mode(path).map_err(|e| std::io::Error::other(e.to_string()))?;
    Ok(())
}

#[cfg(unix)]
fn set_executable_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| Error::ota(format!("failed to set executable mode: {e}")))
}

#[cfg(not(unix))]
fn set_executable_mode(_path: &Path) -> Result<()> {
    Ok(())
}
