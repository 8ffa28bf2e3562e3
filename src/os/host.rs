//! Host identity, well-known directories and the password database.

use super::read_source;
use crate::error::Errno;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

const HOSTNAME: &str = "/proc/sys/kernel/hostname";
const OSTYPE: &str = "/proc/sys/kernel/ostype";
const OSRELEASE: &str = "/proc/sys/kernel/osrelease";
const VERSION: &str = "/proc/sys/kernel/version";
const PASSWD: &str = "/etc/passwd";
const TMPDIR_VARS: [&str; 4] = ["TMPDIR", "TMP", "TEMP", "TEMPDIR"];

/// Operating system identification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Uname {
    /// Kernel name, e.g. `Linux`
    pub sysname: String,
    /// Kernel release
    pub release: String,
    /// Kernel build version
    pub version: String,
    /// Hardware architecture
    pub machine: String,
}

/// One password database entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passwd {
    /// Login name
    pub username: String,
    /// User id
    pub uid: u64,
    /// Primary group id
    pub gid: u64,
    /// Login shell, when the entry names one
    pub shell: Option<String>,
    /// Home directory
    pub homedir: PathBuf,
}

fn read_trimmed(path: &str) -> Result<String, Errno> {
    Ok(read_source(Path::new(path))?.trim_end().to_owned())
}

/// Kernel hostname
pub fn hostname() -> Result<String, Errno> {
    read_trimmed(HOSTNAME).or_else(|err| match std::env::var("HOSTNAME") {
        Ok(name) if !name.is_empty() => Ok(name),
        _ => Err(err),
    })
}

/// Kernel name, release, version and machine
pub fn uname() -> Result<Uname, Errno> {
    Ok(Uname {
        sysname: read_trimmed(OSTYPE)?,
        release: read_trimmed(OSRELEASE)?,
        version: read_trimmed(VERSION)?,
        machine: std::env::consts::ARCH.to_owned(),
    })
}

/// `HOME` when set, otherwise the calling user's password entry
pub fn homedir() -> Result<PathBuf, Errno> {
    match std::env::var_os("HOME") {
        Some(home) if !home.is_empty() => Ok(PathBuf::from(home)),
        _ => get_passwd().map(|entry| entry.homedir),
    }
}

/// Temporary directory from the environment, falling back to `/tmp`
pub fn tmpdir() -> PathBuf {
    let found = TMPDIR_VARS
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()));
    match found {
        Some(dir) => PathBuf::from(strip_trailing_slash(&dir)),
        None => PathBuf::from("/tmp"),
    }
}

fn strip_trailing_slash(dir: &str) -> &str {
    match dir.strip_suffix('/') {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => dir,
    }
}

/// Password entry of the calling process's real user
pub fn get_passwd() -> Result<Passwd, Errno> {
    get_passwd_by_uid(super::process::real_uid()?)
}

/// Password entry for `uid`; `NotFound` when no entry matches
pub fn get_passwd_by_uid(uid: u64) -> Result<Passwd, Errno> {
    let text = read_source(Path::new(PASSWD))?;
    parse_passwd(&text, uid).ok_or_else(|| {
        debug!(uid, "No password entry");
        Errno::NotFound
    })
}

fn parse_passwd(text: &str, uid: u64) -> Option<Passwd> {
    text.lines()
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 7 {
                return None;
            }
            let entry_uid: u64 = fields[2].parse().ok()?;
            if entry_uid != uid {
                return None;
            }
            Some(Passwd {
                username: fields[0].to_owned(),
                uid: entry_uid,
                gid: fields[3].parse().ok()?,
                shell: Some(fields[6]).filter(|s| !s.is_empty()).map(str::to_owned),
                homedir: PathBuf::from(fields[5]),
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "# local accounts\n\
                          root:x:0:0:root:/root:/bin/bash\n\
                          daemon:x:1:1:daemon:/usr/sbin:\n\
                          broken:x:notanumber:1::/:/bin/sh\n\
                          dev:x:1000:100:Dev,,,:/home/dev:/bin/zsh\n";

    #[test]
    fn test_parse_passwd_entries() {
        let dev = parse_passwd(SAMPLE, 1000).unwrap();
        assert_eq!(dev.username, "dev");
        assert_eq!(dev.gid, 100);
        assert_eq!(dev.shell.as_deref(), Some("/bin/zsh"));
        assert_eq!(dev.homedir, PathBuf::from("/home/dev"));

        let daemon = parse_passwd(SAMPLE, 1).unwrap();
        assert_eq!(daemon.shell, None);
        assert!(parse_passwd(SAMPLE, 4242).is_none());
    }

    #[test]
    fn test_trailing_slash_is_stripped_once() {
        assert_eq!(strip_trailing_slash("/var/tmp/"), "/var/tmp");
        assert_eq!(strip_trailing_slash("/var/tmp"), "/var/tmp");
        assert_eq!(strip_trailing_slash("/"), "/");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_host_identity() {
        let info = uname().unwrap();
        assert_eq!(info.sysname, "Linux");
        assert!(!info.release.is_empty());
        assert_eq!(info.machine, std::env::consts::ARCH);
        assert!(!hostname().unwrap().is_empty());
        assert!(tmpdir().is_absolute());
        assert_eq!(get_passwd_by_uid(u64::MAX), Err(Errno::NotFound));
    }
}
