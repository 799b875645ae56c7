//! Process information from procfs
//!
//! See proc(5): `/proc/<pid>/stat`, `/proc/<pid>/cmdline`, `/proc/<pid>/exe`.

use super::RunningApp;
use std::fs;
use std::io;
use std::path::Path;

pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// Snapshot one process
pub fn read_running_app(proc_root: &Path, pid: i32) -> io::Result<RunningApp> {
    let dir = proc_root.join(pid.to_string());

    let stat = fs::read_to_string(dir.join("stat"))?;
    let (ppid, pgrp, session) = parse_stat(&stat).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, format!("malformed stat for pid {}", pid))
    })?;

    let cmdline = fs::read(dir.join("cmdline"))
        .map(|raw| parse_cmdline(&raw))
        .unwrap_or_default();

    // Not readable for kernel threads or processes of other users
    let exe = fs::read_link(dir.join("exe"))
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default();

    Ok(RunningApp {
        pid,
        ppid,
        pgrp,
        session,
        cmdline,
        exe,
    })
}

/// All numeric entries under the proc root
pub fn list_pids(proc_root: &Path) -> io::Result<Vec<i32>> {
    let mut pids: Vec<i32> = fs::read_dir(proc_root)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .collect();
    pids.sort_unstable();
    Ok(pids)
}

/// Executable path of a process, if readable
pub fn exe_path(proc_root: &Path, pid: i32) -> Option<String> {
    fs::read_link(proc_root.join(pid.to_string()).join("exe"))
        .ok()
        .map(|p| p.to_string_lossy().to_string())
}

/// Extract (ppid, pgrp, session) from a stat line.
///
/// The command name is wrapped in parentheses and may itself contain spaces
/// or parentheses, so fields are counted from the last `)`.
fn parse_stat(stat: &str) -> Option<(i32, i32, i32)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    let ppid = fields.next()?.parse().ok()?;
    let pgrp = fields.next()?.parse().ok()?;
    let session = fields.next()?.parse().ok()?;
    Some((ppid, pgrp, session))
}

/// Arguments are NUL-separated (and NUL-terminated)
fn parse_cmdline(raw: &[u8]) -> String {
    raw.split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| String::from_utf8_lossy(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fake procfs entries for tests
#[cfg(test)]
pub(crate) mod test_support {
    use std::fs;
    use std::path::Path;

    pub(crate) fn create_fake_process(proc_root: &Path, pid: i32, comm: &str, cmdline: &[&str], exe: &str) {
        let dir = proc_root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("stat"),
            format!("{} ({}) S 1 {} {} 0 -1 4194560 1035 0 0 0", pid, comm, pid, pid - 1),
        )
        .unwrap();
        let mut raw = Vec::new();
        for arg in cmdline {
            raw.extend_from_slice(arg.as_bytes());
            raw.push(0);
        }
        fs::write(dir.join("cmdline"), raw).unwrap();
        std::os::unix::fs::symlink(exe, dir.join("exe")).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::create_fake_process;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_stat() {
        let stat = "4321 (firefox) S 1200 4321 1100 34816 4321 4194304 ...";
        assert_eq!(parse_stat(stat), Some((1200, 4321, 1100)));
    }

    #[test]
    fn test_parse_stat_command_with_parens_and_spaces() {
        let stat = "77 (Web Content (x)) R 70 60 50 0 -1";
        assert_eq!(parse_stat(stat), Some((70, 60, 50)));
    }

    #[test]
    fn test_parse_stat_malformed() {
        assert_eq!(parse_stat(""), None);
        assert_eq!(parse_stat("12 (bash) S"), None);
        assert_eq!(parse_stat("12 (bash) S x 1 1"), None);
    }

    #[test]
    fn test_parse_cmdline() {
        assert_eq!(
            parse_cmdline(b"/usr/bin/curl\0-s\0https://example.com\0"),
            "/usr/bin/curl -s https://example.com"
        );
        assert_eq!(parse_cmdline(b""), "");
    }

    #[test]
    fn test_read_running_app() {
        let temp_dir = TempDir::new().unwrap();
        create_fake_process(temp_dir.path(), 500, "curl", &["curl", "-I", "example.com"], "/usr/bin/curl");

        let app = read_running_app(temp_dir.path(), 500).unwrap();
        assert_eq!(app.pid, 500);
        assert_eq!(app.ppid, 1);
        assert_eq!(app.pgrp, 500);
        assert_eq!(app.session, 499);
        assert_eq!(app.cmdline, "curl -I example.com");
        assert_eq!(app.exe, "/usr/bin/curl");
        assert_eq!(exe_path(temp_dir.path(), 500).as_deref(), Some("/usr/bin/curl"));
    }

    #[test]
    fn test_read_missing_process() {
        let temp_dir = TempDir::new().unwrap();
        let err = read_running_app(temp_dir.path(), 42).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_list_pids_skips_non_numeric() {
        let temp_dir = TempDir::new().unwrap();
        for name in ["12", "3", "self", "net", "100"] {
            fs::create_dir(temp_dir.path().join(name)).unwrap();
        }
        assert_eq!(list_pids(temp_dir.path()).unwrap(), vec![3, 12, 100]);
    }
}
