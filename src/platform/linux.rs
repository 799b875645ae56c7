//! Linux-specific routing implementation

use super::{ChangeCallback, DefaultRoute, PlatformError, PUBLIC_TARGET_ADDR, RouteMonitor, RouteTable};
use nix::errno::Errno;
use nix::sys::socket::{
    AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType, bind, recv,
    setsockopt, socket, sockopt,
};
use nix::sys::time::{TimeVal, TimeValLike};
use std::net::IpAddr;
use std::os::fd::AsRawFd;
use std::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

// rtnetlink multicast groups (linux/rtnetlink.h)
const RTMGRP_IPV4_ROUTE: u32 = 0x40;
const RTMGRP_IPV6_ROUTE: u32 = 0x400;

const RTM_NEWROUTE: u16 = 24;
const RTM_DELROUTE: u16 = 25;

const NLMSG_HDRLEN: usize = 16;

/// How often the monitor thread wakes up to check for cancellation
const RECV_TIMEOUT_SECS: i64 = 1;

pub struct LinuxRouteTable;

impl LinuxRouteTable {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LinuxRouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable for LinuxRouteTable {
    fn default_route(&self) -> Result<DefaultRoute, PlatformError> {
        let target = PUBLIC_TARGET_ADDR.to_string();
        let output = Command::new("ip")
            .args(["route", "get", target.as_str()])
            .output()
            .map_err(|e| PlatformError::RouteQuery(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PlatformError::RouteQuery(stderr.trim().to_string()));
        }

        parse_route_get(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse the output of `ip route get <addr>`
///
/// e.g. `1.1.1.1 via 192.168.1.1 dev eth0 src 192.168.1.20 uid 0`
fn parse_route_get(output: &str) -> Result<DefaultRoute, PlatformError> {
    let line = output
        .lines()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| PlatformError::RouteQuery("empty route lookup output".to_string()))?;

    let mut interface = None;
    let mut gateway = None;
    let mut tokens = line.split_whitespace();
    while let Some(token) = tokens.next() {
        match token {
            "dev" => interface = tokens.next().map(str::to_string),
            "via" => gateway = tokens.next().and_then(|v| v.parse::<IpAddr>().ok()),
            _ => {}
        }
    }

    let interface = interface
        .ok_or_else(|| PlatformError::RouteQuery(format!("no device in route: {}", line)))?;
    Ok(DefaultRoute { interface, gateway })
}

/// Returns true if a netlink datagram carries at least one route add/delete message
fn contains_route_message(buf: &[u8]) -> bool {
    let mut offset = 0;
    while offset + NLMSG_HDRLEN <= buf.len() {
        let len = u32::from_ne_bytes([
            buf[offset],
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
        ]) as usize;
        let msg_type = u16::from_ne_bytes([buf[offset + 4], buf[offset + 5]]);

        if msg_type == RTM_NEWROUTE || msg_type == RTM_DELROUTE {
            return true;
        }
        if len < NLMSG_HDRLEN {
            break;
        }
        // NLMSG_ALIGN
        offset += (len + 3) & !3;
    }
    false
}

/// Watches rtnetlink route multicast groups
pub struct LinuxRouteMonitor;

impl LinuxRouteMonitor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LinuxRouteMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteMonitor for LinuxRouteMonitor {
    fn spawn(
        &self,
        on_change: ChangeCallback,
        cancel: CancellationToken,
    ) -> Result<(), PlatformError> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkRoute,
        )
        .map_err(|e| PlatformError::Monitor(format!("socket: {}", e)))?;

        bind(
            fd.as_raw_fd(),
            &NetlinkAddr::new(0, RTMGRP_IPV4_ROUTE | RTMGRP_IPV6_ROUTE),
        )
        .map_err(|e| PlatformError::Monitor(format!("bind: {}", e)))?;

        // Blocking reads wake up periodically so cancellation is observed
        setsockopt(
            &fd,
            sockopt::ReceiveTimeout,
            &TimeVal::seconds(RECV_TIMEOUT_SECS),
        )
        .map_err(|e| PlatformError::Monitor(format!("setsockopt: {}", e)))?;

        std::thread::Builder::new()
            .name("route-monitor".to_string())
            .spawn(move || {
                info!("Route change monitoring started");
                let mut buf = vec![0u8; 16 * 1024];
                while !cancel.is_cancelled() {
                    match recv(fd.as_raw_fd(), &mut buf, MsgFlags::empty()) {
                        Ok(n) if n > 0 => {
                            if contains_route_message(&buf[..n]) {
                                debug!("Routing table changed");
                                on_change();
                            }
                        }
                        Ok(_) => {}
                        Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
                        Err(e) => {
                            error!("Route change monitoring failed: {}", e);
                            break;
                        }
                    }
                }
                info!("Route change monitoring stopped");
            })
            .map_err(|e| PlatformError::Monitor(e.to_string()))?;

        Ok(())
    }
}
