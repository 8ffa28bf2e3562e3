//! Host, process and environment queries.
//!
//! Memory values come from `/proc/meminfo` and are reported in bytes. Hosts
//! without it report `NotSupported`.

pub mod env;
pub mod host;
pub mod process;

pub use env::{environ, getenv, setenv, unsetenv};
pub use host::{get_passwd, get_passwd_by_uid, homedir, hostname, tmpdir, uname, Passwd, Uname};
pub use process::{chdir, cwd, exepath, getpid, getppid, resource_usage, ResourceUsage};

use crate::error::Errno;
use std::path::Path;
use tracing::debug;

const MEMINFO: &str = "/proc/meminfo";
const CGROUP_V2_MAX: &str = "/sys/fs/cgroup/memory.max";
const CGROUP_V1_LIMIT: &str = "/sys/fs/cgroup/memory/memory.limit_in_bytes";

// cgroup v1 reports "no limit" as a page-aligned i64::MAX
const UNLIMITED_FLOOR: u64 = 0x7fff_ffff_ffff_f000;

/// Memory not in use at all (`MemFree`)
pub fn free_memory() -> Result<u64, Errno> {
    meminfo_field(Path::new(MEMINFO), "MemFree")
}

/// Memory available to new work without swapping (`MemAvailable`)
pub fn available_memory() -> Result<u64, Errno> {
    meminfo_field(Path::new(MEMINFO), "MemAvailable")
}

/// Installed memory (`MemTotal`)
pub fn total_memory() -> Result<u64, Errno> {
    meminfo_field(Path::new(MEMINFO), "MemTotal")
}

/// Memory limit imposed by the process's cgroup; 0 when unconstrained
pub fn constrained_memory() -> u64 {
    [CGROUP_V2_MAX, CGROUP_V1_LIMIT]
        .iter()
        .find_map(|path| cgroup_limit(Path::new(path)))
        .unwrap_or(0)
}

fn cgroup_limit(path: &Path) -> Option<u64> {
    let text = std::fs::read_to_string(path).ok()?;
    parse_limit(&text)
}

fn parse_limit(text: &str) -> Option<u64> {
    match text.trim() {
        "max" => Some(0),
        value => {
            let limit: u64 = value.parse().ok()?;
            Some(if limit >= UNLIMITED_FLOOR { 0 } else { limit })
        }
    }
}

/// Read one line-oriented file, logging why it is unavailable
pub(crate) fn read_source(path: &Path) -> Result<String, Errno> {
    std::fs::read_to_string(path).map_err(|err| {
        debug!(path = %path.display(), %err, "Host statistics unavailable");
        Errno::NotSupported
    })
}

fn meminfo_field(path: &Path, field: &str) -> Result<u64, Errno> {
    let text = read_source(path)?;
    parse_field(&text, field).ok_or(Errno::NotSupported)
}

fn parse_field(meminfo: &str, field: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let (name, rest) = line.split_once(':')?;
        if name.trim() != field {
            return None;
        }
        let mut parts = rest.split_whitespace();
        let value: u64 = parts.next()?.parse().ok()?;
        match parts.next() {
            Some("kB") => value.checked_mul(1024),
            None => Some(value),
            Some(_) => None,
        }
    })
}
