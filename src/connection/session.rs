//! Session parameters and the on-disk tunnel configuration

use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

const SESSION_FILE_MODE: u32 = 0o600;

/// Endpoints and key material negotiated for one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Local address inside the tunnel
    pub client_tunnel_ip: IpAddr,
    /// Remote address inside the tunnel
    pub host_tunnel_ip: IpAddr,
    /// Address of the VPN host's own resolver
    pub host_local_ip: IpAddr,
    pub client_private_key: String,
    pub host_public_key: String,
    pub host_endpoint: SocketAddr,
    /// Resolver to use instead of `host_local_ip`
    #[serde(default)]
    pub dns: Option<IpAddr>,
    #[serde(default)]
    pub mtu: Option<u16>,
}

impl ConnectionParams {
    /// DNS server to activate for the session
    pub fn session_dns(&self) -> IpAddr {
        self.dns.unwrap_or(self.host_local_ip)
    }
}

fn host_prefix(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Render the WireGuard configuration for a session.
///
/// There is no `DNS =` line; the resolver override belongs to the DNS manager.
pub fn render_session_config(params: &ConnectionParams) -> String {
    let mut config = String::from("[Interface]\n");
    config.push_str(&format!("PrivateKey = {}\n", params.client_private_key));
    config.push_str(&format!(
        "Address = {}/{}\n",
        params.client_tunnel_ip,
        host_prefix(params.client_tunnel_ip)
    ));
    if let Some(mtu) = params.mtu {
        config.push_str(&format!("MTU = {}\n", mtu));
    }

    config.push_str("\n[Peer]\n");
    config.push_str(&format!("PublicKey = {}\n", params.host_public_key));
    config.push_str(&format!("Endpoint = {}\n", params.host_endpoint));
    config.push_str("AllowedIPs = 0.0.0.0/0\n");
    config
}

/// Write the session configuration, readable by the owner only
pub fn write_session_config(path: &Path, params: &ConnectionParams) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut options = OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    options.mode(SESSION_FILE_MODE);

    let mut file = options.open(path)?;
    // An existing file keeps its old mode on open
    #[cfg(unix)]
    file.set_permissions(fs::Permissions::from_mode(SESSION_FILE_MODE))?;
    file.write_all(render_session_config(params).as_bytes())?;
    file.sync_all()
}

/// Remove the session configuration; a missing file is not an error
pub fn remove_session_config(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
