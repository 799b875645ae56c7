//! macOS-specific routing implementation

use super::{ChangeCallback, DefaultRoute, PlatformError, PUBLIC_TARGET_ADDR, RouteMonitor, RouteTable};
use std::net::IpAddr;
use std::process::{Command, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct MacRouteTable;

impl MacRouteTable {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MacRouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable for MacRouteTable {
    fn default_route(&self) -> Result<DefaultRoute, PlatformError> {
        let target = PUBLIC_TARGET_ADDR.to_string();
        let output = Command::new("route")
            .args(["-n", "get", target.as_str()])
            .output()
            .map_err(|e| PlatformError::RouteQuery(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PlatformError::RouteQuery(stderr.trim().to_string()));
        }

        parse_route_get(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse the key/value output of `route -n get <addr>`
fn parse_route_get(output: &str) -> Result<DefaultRoute, PlatformError> {
    let mut interface = None;
    let mut gateway = None;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "interface" => interface = Some(value.trim().to_string()),
            "gateway" => gateway = value.trim().parse::<IpAddr>().ok(),
            _ => {}
        }
    }

    let interface = interface
        .ok_or_else(|| PlatformError::RouteQuery("no interface in route lookup".to_string()))?;
    Ok(DefaultRoute { interface, gateway })
}

/// Returns true for `route -n monitor` lines announcing a route table change
fn is_route_event(line: &str) -> bool {
    line.starts_with("RTM_ADD") || line.starts_with("RTM_DELETE") || line.starts_with("RTM_CHANGE")
}

/// Watches the routing socket through `route -n monitor`
pub struct MacRouteMonitor;

impl MacRouteMonitor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MacRouteMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteMonitor for MacRouteMonitor {
    fn spawn(
        &self,
        on_change: ChangeCallback,
        cancel: CancellationToken,
    ) -> Result<(), PlatformError> {
        let mut child = tokio::process::Command::new("route")
            .args(["-n", "monitor"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PlatformError::Monitor(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PlatformError::Monitor("route monitor has no stdout".to_string()))?;

        tokio::spawn(async move {
            info!("Route change monitoring started");
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if is_route_event(&line) {
                                debug!("Routing table changed: {}", line);
                                on_change();
                            }
                        }
                        Ok(None) => {
                            error!("Route change monitoring failed: route monitor exited");
                            break;
                        }
                        Err(e) => {
                            error!("Route change monitoring failed: {}", e);
                            break;
                        }
                    }
                }
            }
            let _ = child.kill().await;
            info!("Route change monitoring stopped");
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_route_get() {
        let out = "   route to: 1.1.1.1\n\
                   destination: default\n\
                          mask: default\n\
                       gateway: 192.168.1.1\n\
                     interface: en0\n\
                         flags: <UP,GATEWAY,DONE,STATIC,PRCLONING>\n";
        let route = parse_route_get(out).unwrap();
        assert_eq!(route.interface, "en0");
        assert_eq!(route.gateway, Some("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_parse_route_get_tunnel_without_gateway() {
        let out = "   route to: 1.1.1.1\ndestination: 0.0.0.0\n  interface: utun4\n";
        let route = parse_route_get(out).unwrap();
        assert_eq!(route.interface, "utun4");
        assert!(route.gateway.is_none());
    }

    #[test]
    fn test_parse_route_get_missing_interface() {
        assert!(parse_route_get("route: writing to routing socket: not in table").is_err());
    }

    #[test]
    fn test_is_route_event() {
        assert!(is_route_event("RTM_ADD: Add Route: len 132, pid: 0"));
        assert!(is_route_event("RTM_DELETE: Delete Route: len 132"));
        assert!(!is_route_event("RTM_IFINFO: iface status change"));
        assert!(!is_route_event(""));
    }
}
