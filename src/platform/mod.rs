//! Platform-specific implementations
//!
//! Each OS provides two small capabilities used by the route change detector:
//! reading the route the system currently uses for internet traffic
//! ([`RouteTable`]) and producing a raw "routes changed" signal
//! ([`RouteMonitor`]). Everything above this layer is OS-agnostic.

#[cfg(target_os = "macos")]
pub mod mac;

#[cfg(target_os = "linux")]
pub mod linux;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Failed to query routing table: {0}")]
    RouteQuery(String),
    #[error("Failed to monitor routing table: {0}")]
    Monitor(String),
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

/// Public address used to ask the OS which route internet traffic takes.
///
/// Asking for a concrete destination (instead of reading the `default` entry)
/// honors policy routing and the `0.0.0.0/1` + `128.0.0.0/1` trick most VPN
/// engines use.
pub const PUBLIC_TARGET_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));

/// Route currently used for internet-bound traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
    /// Outgoing interface name (e.g. "wgvpn", "eth0", "en0")
    pub interface: String,
    /// Next hop, if the route goes through a gateway
    pub gateway: Option<IpAddr>,
}

/// Callback invoked by a [`RouteMonitor`] on every raw routing change
pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// Read access to the live routing configuration
pub trait RouteTable: Send + Sync {
    fn default_route(&self) -> Result<DefaultRoute, PlatformError>;
}

/// Source of raw routing table change notifications
pub trait RouteMonitor: Send + Sync {
    /// Start watching in the background and return immediately.
    ///
    /// `on_change` carries no payload beyond "something changed". The watcher
    /// must terminate once `cancel` fires.
    fn spawn(
        &self,
        on_change: ChangeCallback,
        cancel: CancellationToken,
    ) -> Result<(), PlatformError>;
}

/// Get the route table reader for the current platform
pub fn get_route_table() -> Result<Arc<dyn RouteTable>, PlatformError> {
    #[cfg(target_os = "macos")]
    {
        Ok(Arc::new(mac::MacRouteTable::new()))
    }

    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(linux::LinuxRouteTable::new()))
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        Err(PlatformError::UnsupportedPlatform)
    }
}

/// Get the routing change monitor for the current platform
pub fn get_route_monitor() -> Result<Arc<dyn RouteMonitor>, PlatformError> {
    #[cfg(target_os = "macos")]
    {
        Ok(Arc::new(mac::MacRouteMonitor::new()))
    }

    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(linux::LinuxRouteMonitor::new()))
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        Err(PlatformError::UnsupportedPlatform)
    }
}
