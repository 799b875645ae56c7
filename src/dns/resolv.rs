//! resolv.conf backup, restore and override writing

use super::DnsError;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::debug;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const DEFAULT_RESOLV_PATH: &str = "/etc/resolv.conf";
pub const DEFAULT_BACKUP_PATH: &str = "/etc/resolv.conf.vpnguard-save";

const GENERATOR: &str = env!("CARGO_PKG_NAME");
const OVERRIDE_FILE_MODE: u32 = 0o644;

/// Content written while the DNS override is active
pub fn render_override(addr: IpAddr) -> String {
    format!(
        "# resolv.conf autogenerated by '{}'\n\nnameserver {}\n",
        GENERATOR, addr
    )
}

/// The live DNS configuration file and its backup copy
#[derive(Debug, Clone)]
pub struct ResolvFile {
    path: PathBuf,
    backup_path: PathBuf,
}

impl ResolvFile {
    pub fn new(path: impl Into<PathBuf>, backup_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backup_path: backup_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    pub fn backup_exists(&self) -> bool {
        self.backup_path.exists()
    }

    /// Move the live file aside as the backup.
    ///
    /// Returns `Ok(false)` without touching anything when a backup already
    /// exists and `overwrite` is false.
    pub fn create_backup(&self, overwrite: bool) -> Result<bool, DnsError> {
        fs::metadata(&self.path).map_err(|source| DnsError::BackupFailed {
            step: "file availability check",
            source,
        })?;

        if !overwrite && self.backup_exists() {
            return Ok(false);
        }

        fs::rename(&self.path, &self.backup_path).map_err(|source| DnsError::BackupFailed {
            step: "rename",
            source,
        })?;
        debug!("DNS configuration backed up to {}", self.backup_path.display());
        Ok(true)
    }

    /// Put the backup back in place.
    ///
    /// With `delete_backup` the backup is renamed over the live file. Without
    /// it the backup is copied, so the override can be reapplied later. A
    /// missing backup means there is nothing to restore.
    pub fn restore_backup(&self, delete_backup: bool) -> Result<(), DnsError> {
        if !self.backup_exists() {
            return Ok(());
        }

        if delete_backup {
            fs::rename(&self.backup_path, &self.path).map_err(|source| {
                DnsError::RestoreFailed {
                    step: "rename",
                    source,
                }
            })?;
            debug!("DNS configuration restored, backup removed");
            return Ok(());
        }

        let tmp_path = self.tmp_path();
        fs::copy(&self.backup_path, &tmp_path)
            .map_err(|source| DnsError::RestoreFailed { step: "copy", source })?;

        let permissions = fs::metadata(&self.backup_path)
            .map_err(|source| DnsError::RestoreFailed {
                step: "read permissions",
                source,
            })?
            .permissions();
        fs::set_permissions(&tmp_path, permissions).map_err(|source| {
            DnsError::RestoreFailed {
                step: "set permissions",
                source,
            }
        })?;

        fs::rename(&tmp_path, &self.path).map_err(|source| DnsError::RestoreFailed {
            step: "rename",
            source,
        })?;
        debug!("DNS configuration restored, backup kept");
        Ok(())
    }

    /// Replace the live file with a single `nameserver` override
    pub fn write_override(&self, addr: IpAddr) -> Result<(), DnsError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|source| DnsError::WriteFailed { step: "open", source })?;
        // Explicit so the result does not depend on the daemon's umask
        #[cfg(unix)]
        file.set_permissions(fs::Permissions::from_mode(OVERRIDE_FILE_MODE))
            .map_err(|source| DnsError::WriteFailed { step: "chmod", source })?;
        file.write_all(render_override(addr).as_bytes())
            .map_err(|source| DnsError::WriteFailed { step: "write", source })?;
        file.sync_all()
            .map_err(|source| DnsError::WriteFailed { step: "sync", source })?;
        Ok(())
    }

    /// Back up (only if no backup yet) and write the override.
    ///
    /// Used to re-assert the override after external tampering, where the
    /// live file may already be gone; a failed backup does not prevent the
    /// write.
    pub fn reapply_override(&self, addr: IpAddr) -> Result<(), DnsError> {
        if let Err(e) = self.create_backup(false) {
            debug!("Backup skipped before reapplying DNS override: {}", e);
        }
        self.write_override(addr)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl Default for ResolvFile {
    fn default() -> Self {
        Self::new(DEFAULT_RESOLV_PATH, DEFAULT_BACKUP_PATH)
    }
}
