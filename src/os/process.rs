//! Process identity, working directory and resource usage.
//!
//! Resource usage is read from `/proc/self/stat` and `/proc/self/status`.

use super::read_source;
use crate::error::{Errno, Status};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const STAT: &str = "/proc/self/stat";
const STATUS: &str = "/proc/self/status";

// Linux exports CPU times in USER_HZ ticks, fixed at 100 for userspace
const TICKS_PER_SECOND: u64 = 100;

/// CPU time, memory and scheduling counters for the calling process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Time spent in user mode
    pub user_time: Duration,
    /// Time spent in the kernel
    pub system_time: Duration,
    /// Peak resident set size in kB
    pub max_rss: u64,
    /// Page faults served without I/O
    pub minor_faults: u64,
    /// Page faults that needed I/O
    pub major_faults: u64,
    /// Voluntary context switches
    pub voluntary_switches: u64,
    /// Involuntary context switches
    pub involuntary_switches: u64,
}

/// Id of the calling process
pub fn getpid() -> u32 {
    std::process::id()
}

/// Id of the parent process
#[cfg(unix)]
pub fn getppid() -> Result<u32, Errno> {
    Ok(std::os::unix::process::parent_id())
}

/// Id of the parent process
#[cfg(not(unix))]
pub fn getppid() -> Result<u32, Errno> {
    Err(Errno::NotSupported)
}

/// Path of the running executable
pub fn exepath() -> Result<PathBuf, Errno> {
    Ok(std::env::current_exe()?)
}

/// Current working directory
pub fn cwd() -> Result<PathBuf, Errno> {
    Ok(std::env::current_dir()?)
}

/// Change the working directory of the whole process
pub fn chdir(path: impl AsRef<Path>) -> Status {
    Ok(std::env::set_current_dir(path)?)
}

/// Usage counters for the calling process
pub fn resource_usage() -> Result<ResourceUsage, Errno> {
    let stat = read_source(Path::new(STAT))?;
    let status = read_source(Path::new(STATUS))?;
    let mut usage = parse_stat(&stat).ok_or(Errno::NotSupported)?;
    usage.max_rss = status_field(&status, "VmHWM").unwrap_or(0);
    usage.voluntary_switches = status_field(&status, "voluntary_ctxt_switches").unwrap_or(0);
    usage.involuntary_switches = status_field(&status, "nonvoluntary_ctxt_switches").unwrap_or(0);
    Ok(usage)
}

/// Real uid of the calling process
pub(crate) fn real_uid() -> Result<u64, Errno> {
    let status = read_source(Path::new(STATUS))?;
    status_field(&status, "Uid").ok_or(Errno::NotSupported)
}

fn ticks(value: &str) -> Option<Duration> {
    let ticks: u64 = value.parse().ok()?;
    let millis = ticks.checked_mul(1000)? / TICKS_PER_SECOND;
    Some(Duration::from_millis(millis))
}

fn parse_stat(stat: &str) -> Option<ResourceUsage> {
    // The command name sits in parentheses and may itself contain spaces
    let (_, rest) = stat.rsplit_once(')')?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // `fields[0]` is field 3 of proc(5)
    let field = |n: usize| fields.get(n - 3).copied();
    Some(ResourceUsage {
        minor_faults: field(10)?.parse().ok()?,
        major_faults: field(12)?.parse().ok()?,
        user_time: ticks(field(14)?)?,
        system_time: ticks(field(15)?)?,
        ..ResourceUsage::default()
    })
}

/// First number after `name:` in a `/proc/<pid>/status` style listing
fn status_field(status: &str, name: &str) -> Option<u64> {
    status.lines().find_map(|line| {
        let (key, rest) = line.split_once(':')?;
        if key.trim() != name {
            return None;
        }
        rest.split_whitespace().next()?.parse().ok()
    })
}
