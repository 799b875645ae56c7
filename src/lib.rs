//! vpn-guard - VPN control plane daemon
//!
//! Keeps the host's network configuration consistent with an active VPN
//! tunnel and notices when it stops being consistent.
//!
//! # Architecture
//!
//! - `config`: Configuration file handling (TOML)
//! - `platform`: Per-OS route table queries and route change monitoring
//! - `netchange`: Debounced route change detection and leak checks
//! - `dns`: resolv.conf override with backup, restore and self-healing
//! - `splittun`: Per-process tunnel exclusion
//! - `connection`: Tunnel session lifecycle (connect, disconnect, pause)
//!
//! # Usage
//!
//! ```bash
//! sudo vpn-guard run --config /etc/vpn-guard.toml
//! ```

pub mod config;
pub mod connection;
pub mod dns;
pub mod netchange;
pub mod platform;
pub mod splittun;

pub use config::Config;
pub use connection::{Connection, ConnectionState, StateInfo};
pub use dns::DnsManager;
pub use netchange::{Detector, RouteChangeEvent};
pub use splittun::SplitTunnelManager;
