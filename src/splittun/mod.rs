//! Split tunneling
//!
//! Selected processes bypass the VPN tunnel while the rest of the system
//! uses it. The [`SplitTunnelManager`] serializes access to a platform
//! [`SplitTunnelBackend`] which does the actual enforcement.

#[cfg(target_os = "linux")]
pub mod linux;
pub mod procfs;

use serde::{Deserialize, Serialize};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum SplitTunnelError {
    #[error("Split tunnel is not initialized")]
    NotInitialized,
    #[error("Split tunneling is not available: {0}")]
    UnsupportedPlatform(String),
    #[error("Failed to add process {pid} to split tunnel: {reason}")]
    ProcessNotAdmitted { pid: i32, reason: String },
    #[error("Failed to apply split tunnel configuration: {0}")]
    ApplyFailed(String),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// Addresses used when applying the policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigAddresses {
    /// Outbound address of the physical interface
    pub ipv4_public: Option<Ipv4Addr>,
    /// Local address inside the tunnel
    pub ipv4_tunnel: Option<Ipv4Addr>,
    pub ipv6_public: Option<Ipv6Addr>,
    pub ipv6_tunnel: Option<Ipv6Addr>,
}

impl ConfigAddresses {
    pub fn without_tunnel(self) -> Self {
        Self {
            ipv4_tunnel: None,
            ipv6_tunnel: None,
            ..self
        }
    }
}

/// Desired split tunnel policy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitTunnelConfig {
    pub enabled: bool,
    pub vpn_enabled: bool,
    pub addresses: ConfigAddresses,
    /// Executables (full path or file name) whose processes bypass the tunnel
    pub apps: Vec<String>,
}

/// A process running under the split tunnel policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningApp {
    pub pid: i32,
    pub ppid: i32,
    pub pgrp: i32,
    pub session: i32,
    pub cmdline: String,
    /// Resolved path of the executable
    pub exe: String,
}

/// Platform enforcement primitive
pub trait SplitTunnelBackend: Send {
    /// Check the platform can do split tunneling at all
    fn check_support(&mut self) -> Result<(), SplitTunnelError>;
    fn apply(&mut self, config: &SplitTunnelConfig) -> Result<(), SplitTunnelError>;
    fn add_pid(&mut self, pid: i32, command: &str) -> Result<(), SplitTunnelError>;
    fn running_apps(&self) -> Result<Vec<RunningApp>, SplitTunnelError>;
}

/// Backend for platforms without split tunnel support
pub struct UnsupportedBackend;

impl SplitTunnelBackend for UnsupportedBackend {
    fn check_support(&mut self) -> Result<(), SplitTunnelError> {
        Err(SplitTunnelError::UnsupportedPlatform(
            "not implemented for this platform".to_string(),
        ))
    }

    fn apply(&mut self, _config: &SplitTunnelConfig) -> Result<(), SplitTunnelError> {
        self.check_support()
    }

    fn add_pid(&mut self, _pid: i32, _command: &str) -> Result<(), SplitTunnelError> {
        self.check_support()
    }

    fn running_apps(&self) -> Result<Vec<RunningApp>, SplitTunnelError> {
        Ok(Vec::new())
    }
}

/// Get the split tunnel backend for the current platform
pub fn get_backend() -> Box<dyn SplitTunnelBackend> {
    #[cfg(target_os = "linux")]
    {
        Box::new(linux::LinuxSplitTunnel::new())
    }

    #[cfg(not(target_os = "linux"))]
    {
        Box::new(UnsupportedBackend)
    }
}

enum Availability {
    Unknown,
    Available,
    Unavailable(String),
}

struct ManagerState {
    backend: Box<dyn SplitTunnelBackend>,
    availability: Availability,
    applied: Option<SplitTunnelConfig>,
}

pub struct SplitTunnelManager {
    state: Mutex<ManagerState>,
}

impl SplitTunnelManager {
    pub fn new(backend: Box<dyn SplitTunnelBackend>) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                backend,
                availability: Availability::Unknown,
                applied: None,
            }),
        }
    }

    /// Check platform support. Must be called before anything else.
    pub fn initialize(&self) -> Result<(), SplitTunnelError> {
        let mut state = self.lock_state();

        info!("Initializing Split-Tunnelling");
        match state.backend.check_support() {
            Ok(()) => {
                state.availability = Availability::Available;
                Ok(())
            }
            Err(e) => {
                warn!("Split-Tunnelling not available: {}", e);
                state.availability = Availability::Unavailable(unavailable_reason(&e));
                Err(e)
            }
        }
    }

    /// The error `initialize` reported, if split tunneling is unavailable
    pub fn func_not_available_error(&self) -> Option<SplitTunnelError> {
        match &self.lock_state().availability {
            Availability::Unavailable(reason) => {
                Some(SplitTunnelError::UnsupportedPlatform(reason.clone()))
            }
            _ => None,
        }
    }

    /// Apply a new policy.
    ///
    /// With the VPN disabled the tunnel addresses are dropped before the
    /// backend sees them: there is no tunnel address to steer traffic away
    /// from.
    pub fn apply_config(
        &self,
        enabled: bool,
        vpn_enabled: bool,
        addresses: ConfigAddresses,
        apps: Vec<String>,
    ) -> Result<(), SplitTunnelError> {
        let mut state = self.lock_state();
        check_available(&state.availability)?;

        let addresses = if vpn_enabled {
            addresses
        } else {
            addresses.without_tunnel()
        };
        let config = SplitTunnelConfig {
            enabled,
            vpn_enabled,
            addresses,
            apps,
        };

        state.backend.apply(&config)?;
        info!(
            "Split tunnel configuration applied (enabled: {}, vpn: {}, apps: {})",
            config.enabled,
            config.vpn_enabled,
            config.apps.len()
        );
        state.applied = Some(config);
        Ok(())
    }

    /// Put a process into the split tunnel environment
    pub fn add_process(&self, pid: i32, command: &str) -> Result<(), SplitTunnelError> {
        let mut state = self.lock_state();
        check_available(&state.availability)?;

        info!("Adding PID:{}", pid);
        state.backend.add_pid(pid, command)
    }

    /// Processes currently bypassing the tunnel
    pub fn list_running_apps(&self) -> Result<Vec<RunningApp>, SplitTunnelError> {
        let state = self.lock_state();
        check_available(&state.availability)?;
        state.backend.running_apps()
    }

    /// Last successfully applied policy
    pub fn applied_config(&self) -> Option<SplitTunnelConfig> {
        self.lock_state().applied.clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn check_available(availability: &Availability) -> Result<(), SplitTunnelError> {
    match availability {
        Availability::Available => Ok(()),
        Availability::Unknown => Err(SplitTunnelError::NotInitialized),
        Availability::Unavailable(reason) => {
            Err(SplitTunnelError::UnsupportedPlatform(reason.clone()))
        }
    }
}

fn unavailable_reason(err: &SplitTunnelError) -> String {
    match err {
        SplitTunnelError::UnsupportedPlatform(reason) => reason.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorded {
        applied: Vec<SplitTunnelConfig>,
        pids: Vec<(i32, String)>,
    }

    struct MockBackend {
        available: bool,
        recorded: Arc<Mutex<Recorded>>,
    }

    impl SplitTunnelBackend for MockBackend {
        fn check_support(&mut self) -> Result<(), SplitTunnelError> {
            if self.available {
                Ok(())
            } else {
                Err(SplitTunnelError::UnsupportedPlatform(
                    "net_cls cgroup is not mounted".to_string(),
                ))
            }
        }

        fn apply(&mut self, config: &SplitTunnelConfig) -> Result<(), SplitTunnelError> {
            self.recorded.lock().unwrap().applied.push(config.clone());
            Ok(())
        }

        fn add_pid(&mut self, pid: i32, command: &str) -> Result<(), SplitTunnelError> {
            if pid <= 0 {
                return Err(SplitTunnelError::ProcessNotAdmitted {
                    pid,
                    reason: "invalid pid".to_string(),
                });
            }
            self.recorded
                .lock()
                .unwrap()
                .pids
                .push((pid, command.to_string()));
            Ok(())
        }

        fn running_apps(&self) -> Result<Vec<RunningApp>, SplitTunnelError> {
            Ok(self
                .recorded
                .lock()
                .unwrap()
                .pids
                .iter()
                .map(|(pid, command)| RunningApp {
                    pid: *pid,
                    ppid: 1,
                    pgrp: *pid,
                    session: *pid,
                    cmdline: command.clone(),
                    exe: format!("/usr/bin/{}", command),
                })
                .collect())
        }
    }

    fn manager(available: bool) -> (SplitTunnelManager, Arc<Mutex<Recorded>>) {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let backend = MockBackend {
            available,
            recorded: Arc::clone(&recorded),
        };
        (SplitTunnelManager::new(Box::new(backend)), recorded)
    }

    fn addresses() -> ConfigAddresses {
        ConfigAddresses {
            ipv4_public: Some("192.168.1.20".parse().unwrap()),
            ipv4_tunnel: Some("10.0.0.2".parse().unwrap()),
            ipv6_public: Some("2001:db8::20".parse().unwrap()),
            ipv6_tunnel: Some("fd00::2".parse().unwrap()),
        }
    }

    #[test]
    fn test_split_tunnel_error_display() {
        let err = SplitTunnelError::ProcessNotAdmitted {
            pid: 42,
            reason: "no such process".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to add process 42 to split tunnel: no such process"
        );
        assert_eq!(
            SplitTunnelError::UnsupportedPlatform("root required".to_string()).to_string(),
            "Split tunneling is not available: root required"
        );
    }

    #[test]
    fn test_calls_before_initialize_fail() {
        let (manager, _) = manager(true);
        assert!(matches!(
            manager.apply_config(true, true, addresses(), vec![]),
            Err(SplitTunnelError::NotInitialized)
        ));
        assert!(matches!(
            manager.list_running_apps(),
            Err(SplitTunnelError::NotInitialized)
        ));
    }

    #[test]
    fn test_unavailable_short_circuits_with_same_error() {
        let (manager, recorded) = manager(false);

        let err = manager.initialize().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Split tunneling is not available: net_cls cgroup is not mounted"
        );

        let err = manager
            .apply_config(true, true, addresses(), vec![])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Split tunneling is not available: net_cls cgroup is not mounted"
        );
        assert!(manager.add_process(100, "firefox").is_err());
        assert!(manager.func_not_available_error().is_some());
        assert!(recorded.lock().unwrap().applied.is_empty());
    }

    #[test]
    fn test_vpn_disabled_clears_tunnel_addresses() {
        let (manager, recorded) = manager(true);
        manager.initialize().unwrap();
        assert!(manager.func_not_available_error().is_none());

        manager
            .apply_config(true, false, addresses(), vec!["firefox".to_string()])
            .unwrap();

        let recorded = recorded.lock().unwrap();
        let seen = &recorded.applied[0].addresses;
        assert_eq!(seen.ipv4_tunnel, None);
        assert_eq!(seen.ipv6_tunnel, None);
        assert_eq!(seen.ipv4_public, addresses().ipv4_public);
        assert_eq!(seen.ipv6_public, addresses().ipv6_public);
    }

    #[test]
    fn test_vpn_enabled_keeps_tunnel_addresses() {
        let (manager, recorded) = manager(true);
        manager.initialize().unwrap();

        manager
            .apply_config(true, true, addresses(), vec![])
            .unwrap();

        assert_eq!(recorded.lock().unwrap().applied[0].addresses, addresses());
        assert_eq!(manager.applied_config().unwrap().addresses, addresses());
    }

    #[test]
    fn test_add_process_and_list() {
        let (manager, _) = manager(true);
        manager.initialize().unwrap();

        manager.add_process(4242, "curl").unwrap();
        assert!(matches!(
            manager.add_process(0, "bogus"),
            Err(SplitTunnelError::ProcessNotAdmitted { pid: 0, .. })
        ));

        let apps = manager.list_running_apps().unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].pid, 4242);
        assert_eq!(apps[0].exe, "/usr/bin/curl");
    }

    #[test]
    fn test_unsupported_backend() {
        let manager = SplitTunnelManager::new(Box::new(UnsupportedBackend));
        assert!(matches!(
            manager.initialize(),
            Err(SplitTunnelError::UnsupportedPlatform(_))
        ));
    }
}
