//! Linux split tunnel enforcement
//!
//! Excluded processes live in a `net_cls` cgroup. Their packets get a
//! firewall mark from an iptables mangle rule, and an `ip rule` sends marked
//! packets to the main routing table before the VPN's policy rules are
//! consulted. Connections that already picked the tunnel address as source
//! are rewritten to the public address with SNAT.

use super::procfs::{self, DEFAULT_PROC_ROOT};
use super::{RunningApp, SplitTunnelBackend, SplitTunnelConfig, SplitTunnelError};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/net_cls";

const CGROUP_NAME: &str = "vpn-guard-exclude";
const NET_CLS_CLASSID: u32 = 0x0056_4701;
const FWMARK: u32 = 0x5647;
const RULE_PRIORITY: u32 = 100;

/// Runs an external command, returning stderr on failure
pub type CommandRunner = Box<dyn FnMut(&str, &[String]) -> Result<(), String> + Send>;

/// One firewall or routing rule with the arguments to add and remove it
#[derive(Debug, Clone, PartialEq, Eq)]
struct PolicyRule {
    program: &'static str,
    add: Vec<String>,
    delete: Vec<String>,
}

impl PolicyRule {
    fn iptables(program: &'static str, table: &str, chain: &str, rule_args: &[String]) -> Self {
        let with_action = |action: &str| {
            let mut args = to_args(&["-t", table, action, chain]);
            args.extend_from_slice(rule_args);
            args
        };
        Self {
            program,
            add: with_action("-A"),
            delete: with_action("-D"),
        }
    }

    fn ip_rule(ipv6: bool) -> Self {
        let with_action = |action: &str| {
            let mut args = Vec::new();
            if ipv6 {
                args.push("-6".to_string());
            }
            args.extend(
                [
                    "rule".to_string(),
                    action.to_string(),
                    "fwmark".to_string(),
                    format!("{:#x}", FWMARK),
                    "lookup".to_string(),
                    "main".to_string(),
                    "priority".to_string(),
                    RULE_PRIORITY.to_string(),
                ]
                .into_iter(),
            );
            args
        };
        Self {
            program: "ip",
            add: with_action("add"),
            delete: with_action("del"),
        }
    }

    fn describe(&self) -> String {
        format!("{} {}", self.program, self.add.join(" "))
    }
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Rules needed for a policy, in the order they are added
fn build_rules(config: &SplitTunnelConfig) -> Vec<PolicyRule> {
    if !config.enabled {
        return Vec::new();
    }

    let classid = NET_CLS_CLASSID.to_string();
    let mark = format!("{:#x}", FWMARK);
    let mark_args = to_args(&[
        "-m",
        "cgroup",
        "--cgroup",
        classid.as_str(),
        "-j",
        "MARK",
        "--set-mark",
        mark.as_str(),
    ]);

    let mut rules = vec![
        PolicyRule::iptables("iptables", "mangle", "OUTPUT", &mark_args),
        PolicyRule::iptables("ip6tables", "mangle", "OUTPUT", &mark_args),
        PolicyRule::ip_rule(false),
        PolicyRule::ip_rule(true),
    ];

    let addresses = &config.addresses;
    if let (Some(public), Some(tunnel)) = (addresses.ipv4_public, addresses.ipv4_tunnel) {
        let rule_args = snat_args(&mark, &tunnel.to_string(), &public.to_string());
        rules.push(PolicyRule::iptables("iptables", "nat", "POSTROUTING", &rule_args));
    }
    if let (Some(public), Some(tunnel)) = (addresses.ipv6_public, addresses.ipv6_tunnel) {
        let rule_args = snat_args(&mark, &tunnel.to_string(), &public.to_string());
        rules.push(PolicyRule::iptables("ip6tables", "nat", "POSTROUTING", &rule_args));
    }

    rules
}

fn snat_args(mark: &str, tunnel: &str, public: &str) -> Vec<String> {
    to_args(&[
        "-m",
        "mark",
        "--mark",
        mark,
        "-s",
        tunnel,
        "-j",
        "SNAT",
        "--to-source",
        public,
    ])
}

/// A configured app matches either the full executable path or its file name
fn app_matches(exe: &str, app: &str) -> bool {
    if app.contains('/') {
        return exe == app;
    }
    Path::new(exe)
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name == app)
}

fn run_command(program: &str, args: &[String]) -> Result<(), String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| format!("{}: {}", program, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("{} {}: {}", program, args.join(" "), stderr.trim()));
    }
    Ok(())
}

pub struct LinuxSplitTunnel {
    cgroup_root: PathBuf,
    proc_root: PathBuf,
    runner: CommandRunner,
    applied: Vec<PolicyRule>,
}

impl LinuxSplitTunnel {
    pub fn new() -> Self {
        Self::with_paths(DEFAULT_CGROUP_ROOT, DEFAULT_PROC_ROOT, Box::new(run_command))
    }

    pub fn with_paths(
        cgroup_root: impl Into<PathBuf>,
        proc_root: impl Into<PathBuf>,
        runner: CommandRunner,
    ) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            proc_root: proc_root.into(),
            runner,
            applied: Vec::new(),
        }
    }

    fn cgroup_dir(&self) -> PathBuf {
        self.cgroup_root.join(CGROUP_NAME)
    }

    fn procs_file(&self) -> PathBuf {
        self.cgroup_dir().join("cgroup.procs")
    }

    fn setup_cgroup(&self) -> io::Result<()> {
        let dir = self.cgroup_dir();
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("net_cls.classid"), NET_CLS_CLASSID.to_string())?;
        Ok(())
    }

    fn remove_applied_rules(&mut self) {
        let rules = std::mem::take(&mut self.applied);
        for rule in rules.iter().rev() {
            if let Err(e) = (self.runner)(rule.program, &rule.delete) {
                warn!("Failed to remove split tunnel rule '{}': {}", rule.describe(), e);
            }
        }
    }

    fn add_rules(&mut self, rules: Vec<PolicyRule>) -> Result<(), SplitTunnelError> {
        for (index, rule) in rules.iter().enumerate() {
            debug!("Adding split tunnel rule: {}", rule.describe());
            if let Err(e) = (self.runner)(rule.program, &rule.add) {
                for added in rules[..index].iter().rev() {
                    if let Err(e) = (self.runner)(added.program, &added.delete) {
                        warn!("Failed to roll back rule '{}': {}", added.describe(), e);
                    }
                }
                return Err(SplitTunnelError::ApplyFailed(e));
            }
        }
        self.applied = rules;
        Ok(())
    }

    fn write_pid(&self, pid: i32) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.procs_file())?;
        // The kernel takes exactly one pid per write
        file.write_all(format!("{}\n", pid).as_bytes())
    }

    /// Move running processes of the configured apps into the cgroup
    fn admit_configured_apps(&self, apps: &[String]) -> usize {
        if apps.is_empty() {
            return 0;
        }

        let pids = match procfs::list_pids(&self.proc_root) {
            Ok(pids) => pids,
            Err(e) => {
                warn!("Failed to enumerate processes: {}", e);
                return 0;
            }
        };

        let mut admitted = 0;
        for pid in pids {
            let Some(exe) = procfs::exe_path(&self.proc_root, pid) else {
                continue;
            };
            if !apps.iter().any(|app| app_matches(&exe, app)) {
                continue;
            }
            match self.write_pid(pid) {
                Ok(()) => {
                    debug!("Admitted PID:{} ({})", pid, exe);
                    admitted += 1;
                }
                Err(e) => warn!("Failed to admit PID:{} ({}): {}", pid, exe, e),
            }
        }
        admitted
    }
}

impl Default for LinuxSplitTunnel {
    fn default() -> Self {
        Self::new()
    }
}

impl SplitTunnelBackend for LinuxSplitTunnel {
    fn check_support(&mut self) -> Result<(), SplitTunnelError> {
        if !self.cgroup_root.is_dir() {
            return Err(SplitTunnelError::UnsupportedPlatform(format!(
                "net_cls cgroup is not mounted at {}",
                self.cgroup_root.display()
            )));
        }

        if !nix::unistd::Uid::effective().is_root() {
            return Err(SplitTunnelError::UnsupportedPlatform(
                "root privileges are required".to_string(),
            ));
        }

        (self.runner)("iptables", &["--version".to_string()])
            .map_err(|e| SplitTunnelError::UnsupportedPlatform(format!("iptables unavailable: {}", e)))?;

        Ok(())
    }

    fn apply(&mut self, config: &SplitTunnelConfig) -> Result<(), SplitTunnelError> {
        self.remove_applied_rules();

        if !config.enabled {
            info!("Split tunnel disabled, rules removed");
            return Ok(());
        }

        self.setup_cgroup()?;
        self.add_rules(build_rules(config))?;

        let admitted = self.admit_configured_apps(&config.apps);
        info!(
            "Split tunnel rules applied ({} rules, {} processes admitted)",
            self.applied.len(),
            admitted
        );
        Ok(())
    }

    fn add_pid(&mut self, pid: i32, command: &str) -> Result<(), SplitTunnelError> {
        if !self.proc_root.join(pid.to_string()).exists() {
            return Err(SplitTunnelError::ProcessNotAdmitted {
                pid,
                reason: "no such process".to_string(),
            });
        }

        self.setup_cgroup()
            .and_then(|_| self.write_pid(pid))
            .map_err(|e| SplitTunnelError::ProcessNotAdmitted {
                pid,
                reason: e.to_string(),
            })?;

        info!("Process {} ({}) excluded from the tunnel", pid, command);
        Ok(())
    }

    fn running_apps(&self) -> Result<Vec<RunningApp>, SplitTunnelError> {
        let content = match fs::read_to_string(self.procs_file()) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let apps = content
            .lines()
            .filter_map(|line| line.trim().parse::<i32>().ok())
            // Processes may exit between reading the list and their entries
            .filter_map(|pid| procfs::read_running_app(&self.proc_root, pid).ok())
            .collect();
        Ok(apps)
    }
}

impl Drop for LinuxSplitTunnel {
    fn drop(&mut self) {
        if !self.applied.is_empty() {
            info!("Removing split tunnel rules");
            self.remove_applied_rules();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::ConfigAddresses;
    use super::super::procfs::test_support::create_fake_process;
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records every command; fails commands containing `fail_on`
    fn recording_runner(log: &Log, fail_on: Option<&'static str>) -> CommandRunner {
        let log = Arc::clone(log);
        Box::new(move |program, args| {
            let line = format!("{} {}", program, args.join(" "));
            log.lock().unwrap().push(line.clone());
            match fail_on {
                Some(pattern) if line.contains(pattern) => Err("Operation not permitted".to_string()),
                _ => Ok(()),
            }
        })
    }

    fn backend(temp_dir: &TempDir, log: &Log, fail_on: Option<&'static str>) -> LinuxSplitTunnel {
        let cgroup_root = temp_dir.path().join("net_cls");
        let proc_root = temp_dir.path().join("proc");
        fs::create_dir_all(&cgroup_root).unwrap();
        fs::create_dir_all(&proc_root).unwrap();
        LinuxSplitTunnel::with_paths(cgroup_root, proc_root, recording_runner(log, fail_on))
    }

    fn config(apps: &[&str]) -> SplitTunnelConfig {
        SplitTunnelConfig {
            enabled: true,
            vpn_enabled: true,
            addresses: ConfigAddresses {
                ipv4_public: Some("192.168.1.20".parse().unwrap()),
                ipv4_tunnel: Some("10.8.0.2".parse().unwrap()),
                ipv6_public: None,
                ipv6_tunnel: None,
            },
            apps: apps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_build_rules_disabled() {
        let mut config = config(&[]);
        config.enabled = false;
        assert!(build_rules(&config).is_empty());
    }

    #[test]
    fn test_build_rules() {
        let rules: Vec<String> = build_rules(&config(&[])).iter().map(|r| r.describe()).collect();

        assert_eq!(
            rules,
            vec![
                "iptables -t mangle -A OUTPUT -m cgroup --cgroup 5654273 -j MARK --set-mark 0x5647",
                "ip6tables -t mangle -A OUTPUT -m cgroup --cgroup 5654273 -j MARK --set-mark 0x5647",
                "ip rule add fwmark 0x5647 lookup main priority 100",
                "ip -6 rule add fwmark 0x5647 lookup main priority 100",
                "iptables -t nat -A POSTROUTING -m mark --mark 0x5647 -s 10.8.0.2 -j SNAT --to-source 192.168.1.20",
            ]
        );
    }

    #[test]
    fn test_build_rules_without_tunnel_has_no_snat() {
        let mut config = config(&[]);
        config.addresses = config.addresses.without_tunnel();
        let rules = build_rules(&config);
        assert_eq!(rules.len(), 4);
        assert!(rules.iter().all(|r| !r.add.contains(&"SNAT".to_string())));
    }

    #[test]
    fn test_rule_delete_args() {
        let rule = PolicyRule::ip_rule(true);
        assert_eq!(
            rule.delete.join(" "),
            "-6 rule del fwmark 0x5647 lookup main priority 100"
        );
    }

    #[test]
    fn test_app_matches() {
        assert!(app_matches("/usr/lib/firefox/firefox", "firefox"));
        assert!(app_matches("/usr/bin/curl", "/usr/bin/curl"));
        assert!(!app_matches("/usr/bin/curl", "/bin/curl"));
        assert!(!app_matches("/usr/bin/firefox-esr", "firefox"));
    }

    #[test]
    fn test_apply_sets_up_cgroup_and_admits_apps() {
        let temp_dir = TempDir::new().unwrap();
        let log = Log::default();
        let mut backend = backend(&temp_dir, &log, None);
        create_fake_process(&backend.proc_root, 100, "firefox", &["firefox"], "/usr/lib/firefox/firefox");
        create_fake_process(&backend.proc_root, 200, "curl", &["curl"], "/usr/bin/curl");

        backend.apply(&config(&["firefox"])).unwrap();

        let classid = fs::read_to_string(backend.cgroup_dir().join("net_cls.classid")).unwrap();
        assert_eq!(classid, NET_CLS_CLASSID.to_string());
        assert_eq!(fs::read_to_string(backend.procs_file()).unwrap(), "100\n");
        assert_eq!(log.lock().unwrap().len(), 5);
        assert_eq!(backend.applied.len(), 5);
    }

    #[test]
    fn test_apply_removes_previous_rules_first() {
        let temp_dir = TempDir::new().unwrap();
        let log = Log::default();
        let mut backend = backend(&temp_dir, &log, None);

        backend.apply(&config(&[])).unwrap();
        log.lock().unwrap().clear();

        let mut disabled = config(&[]);
        disabled.enabled = false;
        backend.apply(&disabled).unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 5);
        assert!(log[0].starts_with("iptables -t nat -D POSTROUTING"));
        assert!(log.iter().all(|line| !line.contains(" -A ") && !line.contains(" add ")));
        assert!(backend.applied.is_empty());
    }

    #[test]
    fn test_apply_failure_rolls_back() {
        let temp_dir = TempDir::new().unwrap();
        let log = Log::default();
        let mut backend = backend(&temp_dir, &log, Some("rule add"));

        let err = backend.apply(&config(&[])).unwrap_err();
        assert!(matches!(err, SplitTunnelError::ApplyFailed(_)));

        let log = log.lock().unwrap();
        assert_eq!(
            log.as_slice(),
            [
                "iptables -t mangle -A OUTPUT -m cgroup --cgroup 5654273 -j MARK --set-mark 0x5647",
                "ip6tables -t mangle -A OUTPUT -m cgroup --cgroup 5654273 -j MARK --set-mark 0x5647",
                "ip rule add fwmark 0x5647 lookup main priority 100",
                "ip6tables -t mangle -D OUTPUT -m cgroup --cgroup 5654273 -j MARK --set-mark 0x5647",
                "iptables -t mangle -D OUTPUT -m cgroup --cgroup 5654273 -j MARK --set-mark 0x5647",
            ]
        );
        assert!(backend.applied.is_empty());
    }

    #[test]
    fn test_add_pid_and_running_apps() {
        let temp_dir = TempDir::new().unwrap();
        let log = Log::default();
        let mut backend = backend(&temp_dir, &log, None);
        create_fake_process(&backend.proc_root, 300, "curl", &["curl", "-I", "example.com"], "/usr/bin/curl");

        backend.add_pid(300, "curl -I example.com").unwrap();
        // Listed in the cgroup but already gone
        backend.write_pid(301).unwrap();

        let apps = backend.running_apps().unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].pid, 300);
        assert_eq!(apps[0].cmdline, "curl -I example.com");
        assert_eq!(apps[0].exe, "/usr/bin/curl");
    }

    #[test]
    fn test_add_missing_pid() {
        let temp_dir = TempDir::new().unwrap();
        let log = Log::default();
        let mut backend = backend(&temp_dir, &log, None);

        let err = backend.add_pid(999, "ghost").unwrap_err();
        assert!(matches!(err, SplitTunnelError::ProcessNotAdmitted { pid: 999, .. }));
    }

    #[test]
    fn test_running_apps_without_cgroup() {
        let temp_dir = TempDir::new().unwrap();
        let log = Log::default();
        let backend = backend(&temp_dir, &log, None);
        assert!(backend.running_apps().unwrap().is_empty());
    }

    #[test]
    fn test_check_support_without_cgroup_mount() {
        let temp_dir = TempDir::new().unwrap();
        let log = Log::default();
        let mut backend = LinuxSplitTunnel::with_paths(
            temp_dir.path().join("missing"),
            temp_dir.path(),
            recording_runner(&log, None),
        );

        let err = backend.check_support().unwrap_err();
        assert!(err.to_string().contains("net_cls cgroup is not mounted"));
    }
}
