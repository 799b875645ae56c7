//! Tunnel transport backends

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

pub const DEFAULT_WG_QUICK: &str = "wg-quick";

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to start tunnel: {0}")]
    StartFailed(String),
    #[error("Failed to stop tunnel: {0}")]
    StopFailed(String),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// The engine that actually carries packets
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bring the link up; returns once it is up
    async fn start(&self, config_path: &Path) -> Result<(), TransportError>;

    async fn stop(&self, config_path: &Path) -> Result<(), TransportError>;

    fn supports_pause(&self) -> bool {
        false
    }

    async fn pause(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn resume(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Drives the kernel WireGuard implementation through `wg-quick`
pub struct WgQuickTransport {
    binary: PathBuf,
}

impl WgQuickTransport {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run `<binary> <action> <config>`, returning stderr on failure
    async fn run(&self, action: &str, config_path: &Path) -> Result<Result<(), String>, io::Error> {
        debug!("Running {} {} {}", self.binary.display(), action, config_path.display());
        let output = Command::new(&self.binary)
            .arg(action)
            .arg(config_path)
            .output()
            .await?;

        if output.status.success() {
            return Ok(Ok(()));
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Ok(Err(format!("{} {} exited with {}: {}", self.binary.display(), action, output.status, stderr)))
    }
}

impl Default for WgQuickTransport {
    fn default() -> Self {
        Self::new(DEFAULT_WG_QUICK)
    }
}

#[async_trait]
impl Transport for WgQuickTransport {
    async fn start(&self, config_path: &Path) -> Result<(), TransportError> {
        self.run("up", config_path)
            .await?
            .map_err(TransportError::StartFailed)
    }

    async fn stop(&self, config_path: &Path) -> Result<(), TransportError> {
        self.run("down", config_path)
            .await?
            .map_err(TransportError::StopFailed)
    }
}
