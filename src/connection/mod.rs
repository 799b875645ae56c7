//! Tunnel session lifecycle
//!
//! The [`Connection`] controller drives one session at a time:
//!
//! 1. Write the session configuration for the transport
//! 2. Point the system resolver into the tunnel
//! 3. Start the transport and report `Connected` once the link is up
//!
//! Teardown runs the same steps backwards and never stops halfway: every
//! step is attempted, failures are logged, and the session always ends up
//! `Disconnected`.

pub mod session;
pub mod transport;

use crate::dns::{DnsError, DnsManager};
use serde::Serialize;
use session::ConnectionParams;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};
use transport::{Transport, TransportError};

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to write session configuration: {0}")]
    ConfigGeneration(#[source] io::Error),
    #[error("Failed to remove session configuration: {0}")]
    ConfigRemoval(#[source] io::Error),
    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),
    #[error("Transport start failed: {0}")]
    TransportStartFailed(#[source] TransportError),
    #[error("Transport stop failed: {0}")]
    TransportStopFailed(#[source] TransportError),
    #[error("Operation not allowed while {0:?}")]
    InvalidState(ConnectionState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Paused,
}

/// State change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateInfo {
    Connecting,
    Connected { client_ip: IpAddr, host_ip: IpAddr },
    Paused,
    Disconnecting,
    Disconnected,
}

impl StateInfo {
    pub fn state(&self) -> ConnectionState {
        match self {
            StateInfo::Connecting => ConnectionState::Connecting,
            StateInfo::Connected { .. } => ConnectionState::Connected,
            StateInfo::Paused => ConnectionState::Paused,
            StateInfo::Disconnecting => ConnectionState::Disconnecting,
            StateInfo::Disconnected => ConnectionState::Disconnected,
        }
    }
}

/// How far a connect attempt got before failing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ConnectStep {
    SessionConfig,
    Dns,
    Transport,
}

struct Session {
    state: ConnectionState,
    params: Option<ConnectionParams>,
}

pub struct Connection {
    dns: Arc<DnsManager>,
    transport: Box<dyn Transport>,
    config_path: PathBuf,
    events: mpsc::UnboundedSender<StateInfo>,
    session: Mutex<Session>,
}

impl Connection {
    pub fn new(
        dns: Arc<DnsManager>,
        transport: Box<dyn Transport>,
        config_path: impl Into<PathBuf>,
        events: mpsc::UnboundedSender<StateInfo>,
    ) -> Self {
        Self {
            dns,
            transport,
            config_path: config_path.into(),
            events,
            session: Mutex::new(Session {
                state: ConnectionState::Disconnected,
                params: None,
            }),
        }
    }

    /// Path of the session configuration handed to the transport
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub async fn state(&self) -> ConnectionState {
        self.session.lock().await.state
    }

    pub async fn params(&self) -> Option<ConnectionParams> {
        self.session.lock().await.params.clone()
    }

    /// Establish a session.
    ///
    /// On failure everything done so far is undone and the session is back
    /// to `Disconnected`.
    pub async fn connect(&self, params: ConnectionParams) -> Result<(), ConnectionError> {
        let mut current = self.session.lock().await;
        if current.state != ConnectionState::Disconnected {
            return Err(ConnectionError::InvalidState(current.state));
        }

        info!(
            "Connecting: endpoint={}, tunnel ip={}",
            params.host_endpoint, params.client_tunnel_ip
        );
        self.set_state(&mut current, StateInfo::Connecting);

        if let Err((step, e)) = self.bring_up(&params).await {
            error!("Connect failed: {}", e);
            self.rollback(step).await;
            self.set_state(&mut current, StateInfo::Disconnected);
            return Err(e);
        }

        let connected = StateInfo::Connected {
            client_ip: params.client_tunnel_ip,
            host_ip: params.host_tunnel_ip,
        };
        current.params = Some(params);
        self.set_state(&mut current, connected);
        Ok(())
    }

    /// Tear the session down, whatever state it is in.
    ///
    /// All steps run even if earlier ones fail; the first failure is returned.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        let mut current = self.session.lock().await;
        info!("Disconnecting...");
        self.set_state(&mut current, StateInfo::Disconnecting);

        let mut first_error: Option<ConnectionError> = None;
        let mut record = |e: ConnectionError| {
            error!("{}", e);
            first_error.get_or_insert(e);
        };

        // Nothing to bring down without a session configuration
        if self.config_path.exists() {
            if let Err(e) = self.transport.stop(&self.config_path).await {
                record(ConnectionError::TransportStopFailed(e));
            }
        } else {
            debug!("No session configuration, transport stop skipped");
        }

        if let Err(e) = self.dns.reset().await {
            record(ConnectionError::Dns(e));
        }

        if let Err(e) = session::remove_session_config(&self.config_path) {
            record(ConnectionError::ConfigRemoval(e));
        }

        current.params = None;
        self.set_state(&mut current, StateInfo::Disconnected);

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Disconnected");
                Ok(())
            }
        }
    }

    /// Temporarily hand DNS back to the OS
    pub async fn pause(&self) -> Result<(), ConnectionError> {
        let mut current = self.session.lock().await;
        if current.state != ConnectionState::Connected {
            return Err(ConnectionError::InvalidState(current.state));
        }
        let Some(params) = current.params.clone() else {
            return Err(ConnectionError::InvalidState(current.state));
        };

        self.dns.pause().await?;

        if self.transport.supports_pause() {
            if let Err(e) = self.transport.pause().await {
                // Still connected, put the session DNS back
                if let Err(dns_err) = self.dns.resume(Some(params.session_dns())).await {
                    warn!("Failed to reapply DNS after transport pause failure: {}", dns_err);
                }
                return Err(ConnectionError::TransportStopFailed(e));
            }
        } else {
            info!("Transport has no pause support, tunnel stays up");
        }

        self.set_state(&mut current, StateInfo::Paused);
        Ok(())
    }

    /// Leave the paused state and reapply the session DNS
    pub async fn resume(&self) -> Result<(), ConnectionError> {
        let mut current = self.session.lock().await;
        if current.state != ConnectionState::Paused {
            return Err(ConnectionError::InvalidState(current.state));
        }
        let Some(params) = current.params.clone() else {
            return Err(ConnectionError::InvalidState(current.state));
        };

        if self.transport.supports_pause() {
            self.transport
                .resume()
                .await
                .map_err(ConnectionError::TransportStartFailed)?;
        }

        self.dns.resume(Some(params.session_dns())).await?;

        self.set_state(
            &mut current,
            StateInfo::Connected {
                client_ip: params.client_tunnel_ip,
                host_ip: params.host_tunnel_ip,
            },
        );
        Ok(())
    }

    async fn bring_up(&self, params: &ConnectionParams) -> Result<(), (ConnectStep, ConnectionError)> {
        session::write_session_config(&self.config_path, params)
            .map_err(|e| (ConnectStep::SessionConfig, ConnectionError::ConfigGeneration(e)))?;
        debug!("Session configuration written to {}", self.config_path.display());

        self.dns
            .set_manual(params.session_dns())
            .await
            .map_err(|e| (ConnectStep::Dns, ConnectionError::Dns(e)))?;

        self.transport
            .start(&self.config_path)
            .await
            .map_err(|e| (ConnectStep::Transport, ConnectionError::TransportStartFailed(e)))?;

        Ok(())
    }

    /// Undo a failed connect up to and including the failing step
    async fn rollback(&self, failed: ConnectStep) {
        // The transport may have come partially up before failing
        if failed >= ConnectStep::Transport {
            if let Err(e) = self.transport.stop(&self.config_path).await {
                warn!("Failed to stop transport during rollback: {}", e);
            }
        }

        // A failed set_manual may already have moved the file aside
        if failed >= ConnectStep::Dns {
            if let Err(e) = self.dns.reset().await {
                warn!("Failed to restore DNS during rollback: {}", e);
            }
        }

        if let Err(e) = session::remove_session_config(&self.config_path) {
            warn!("Failed to remove session configuration during rollback: {}", e);
        }
    }

    fn set_state(&self, current: &mut Session, info: StateInfo) {
        current.state = info.state();
        debug!("Connection state: {:?}", info);
        // The receiver may be gone during shutdown
        let _ = self.events.send(info);
    }
}
