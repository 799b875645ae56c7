//! DNS override management
//!
//! While a tunnel is up the [`DnsManager`] owns the system DNS configuration:
//! the OS-defined resolv.conf is moved aside as a backup, replaced by a single
//! `nameserver` pointing into the tunnel, and kept that way by a watcher
//! until the override is deleted.
//!
//! # States
//!
//! ```text
//!            set_manual              delete_manual
//!   Normal ─────────────▶ ManualActive ─────────────▶ Normal
//!      │                     │    ▲
//!      │ pause (if backup)   │    │ resume
//!      ▼                     ▼    │
//!   Paused ◀──────────────────────┘
//! ```
//!
//! While paused the OS configuration is back in place but the backup is
//! kept; `set_manual`/`delete_manual` only record the desired value, which
//! `resume` applies. `reset` leaves any state for `Normal`.

pub mod resolv;
mod watcher;

use resolv::ResolvFile;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use watcher::WatcherHandle;

pub use watcher::SETTLE_PERIOD;

#[derive(Error, Debug)]
pub enum DnsError {
    #[error("Failed to backup DNS configuration ({step}): {source}")]
    BackupFailed {
        step: &'static str,
        source: io::Error,
    },
    #[error("Failed to restore DNS configuration ({step}): {source}")]
    RestoreFailed {
        step: &'static str,
        source: io::Error,
    },
    #[error("Failed to update DNS configuration ({step}): {source}")]
    WriteFailed {
        step: &'static str,
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsMode {
    /// OS-defined configuration, no override
    Normal,
    /// Override written and watched
    ManualActive,
    /// OS configuration temporarily restored, override deferred
    Paused,
}

/// Snapshot of the manager's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsState {
    pub mode: DnsMode,
    pub desired: Option<IpAddr>,
    pub backup_exists: bool,
}

struct Inner {
    mode: DnsMode,
    desired: Option<IpAddr>,
    watcher: Option<WatcherHandle>,
}

pub struct DnsManager {
    resolv: Arc<ResolvFile>,
    settle: Duration,
    inner: Mutex<Inner>,
}

impl DnsManager {
    pub fn new(resolv: ResolvFile) -> Self {
        Self::with_settle_period(resolv, SETTLE_PERIOD)
    }

    pub fn with_settle_period(resolv: ResolvFile, settle: Duration) -> Self {
        Self {
            resolv: Arc::new(resolv),
            settle,
            inner: Mutex::new(Inner {
                mode: DnsMode::Normal,
                desired: None,
                watcher: None,
            }),
        }
    }

    pub fn resolv(&self) -> &ResolvFile {
        &self.resolv
    }

    /// Restore a backup left behind by a previous run (e.g. after a crash)
    pub async fn recover(&self) -> Result<(), DnsError> {
        let mut inner = self.inner.lock().await;
        if !self.resolv.backup_exists() {
            return Ok(());
        }

        info!("Detected DNS configuration from the previous VPN connection. Restoring OS-default DNS values ...");
        stop_watcher(&mut inner).await;
        self.resolv.restore_backup(true)?;
        inner.mode = DnsMode::Normal;
        inner.desired = None;
        Ok(())
    }

    /// Point the system resolver at `addr`
    pub async fn set_manual(&self, addr: IpAddr) -> Result<(), DnsError> {
        let mut inner = self.inner.lock().await;
        self.set_manual_locked(&mut inner, addr).await
    }

    /// Remove the override and restore the OS-defined configuration
    pub async fn delete_manual(&self) -> Result<(), DnsError> {
        let mut inner = self.inner.lock().await;

        if inner.mode == DnsMode::Paused {
            debug!("DNS paused, clearing deferred override");
            inner.desired = None;
            return Ok(());
        }

        stop_watcher(&mut inner).await;
        self.resolv.restore_backup(true)?;
        inner.mode = DnsMode::Normal;
        inner.desired = None;
        info!("DNS restored to OS default");
        Ok(())
    }

    /// Drop the override in any mode, `Paused` included, and return to `Normal`.
    ///
    /// Used for session teardown. A failed restore still leaves the manager
    /// `Normal`; the backup stays on disk and is never overwritten by the
    /// next `set_manual`.
    pub async fn reset(&self) -> Result<(), DnsError> {
        let mut inner = self.inner.lock().await;

        stop_watcher(&mut inner).await;
        inner.mode = DnsMode::Normal;
        inner.desired = None;
        self.resolv.restore_backup(true)?;
        info!("DNS restored to OS default");
        Ok(())
    }

    /// Temporarily restore the OS-defined configuration, keeping the backup
    pub async fn pause(&self) -> Result<(), DnsError> {
        let mut inner = self.inner.lock().await;

        if !self.resolv.backup_exists() {
            // No override in place, nothing to pause
            return Ok(());
        }

        stop_watcher(&mut inner).await;
        if let Err(e) = self.resolv.restore_backup(false) {
            // The override is still live, keep guarding it
            if inner.mode == DnsMode::ManualActive {
                if let Some(addr) = inner.desired {
                    inner.watcher = Some(watcher::spawn(Arc::clone(&self.resolv), addr, self.settle));
                }
            }
            return Err(e);
        }
        inner.mode = DnsMode::Paused;
        info!("DNS override paused");
        Ok(())
    }

    /// Leave the paused state.
    ///
    /// Reapplies the desired value if one was recorded, otherwise `fallback`.
    /// With neither, any leftover backup is restored so no backup outlives
    /// the override.
    pub async fn resume(&self, fallback: Option<IpAddr>) -> Result<(), DnsError> {
        let mut inner = self.inner.lock().await;

        if inner.mode == DnsMode::Paused {
            inner.mode = DnsMode::Normal;
        }

        match inner.desired.or(fallback) {
            Some(addr) => self.set_manual_locked(&mut inner, addr).await,
            None => {
                if inner.mode == DnsMode::Normal {
                    self.resolv.restore_backup(true)?;
                }
                Ok(())
            }
        }
    }

    pub async fn status(&self) -> DnsState {
        let inner = self.inner.lock().await;
        DnsState {
            mode: inner.mode,
            desired: inner.desired,
            backup_exists: self.resolv.backup_exists(),
        }
    }

    async fn set_manual_locked(&self, inner: &mut Inner, addr: IpAddr) -> Result<(), DnsError> {
        if inner.mode == DnsMode::Paused {
            debug!("DNS paused, deferring override to {}", addr);
            inner.desired = Some(addr);
            return Ok(());
        }

        stop_watcher(inner).await;

        self.resolv.create_backup(false)?;
        self.resolv.write_override(addr)?;

        inner.desired = Some(addr);
        inner.mode = DnsMode::ManualActive;
        inner.watcher = Some(watcher::spawn(Arc::clone(&self.resolv), addr, self.settle));
        info!("DNS set to {}", addr);
        Ok(())
    }
}

async fn stop_watcher(inner: &mut Inner) {
    if let Some(watcher) = inner.watcher.take() {
        watcher.stop().await;
    }
}
