//! Child processes.
//!
//! Children are spawned with null stdio. Exits are detected during poll by
//! `try_wait`; while a child runs the poll phase wakes at the configured
//! process poll interval.

use super::{Detail, HandleId, HandleKind, Loop, ACTIVE, REF};
use crate::error::Errno;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use tracing::{debug, warn};

/// Exit trampoline: `(loop, process, exit_status, term_signal)`
pub type ExitCb = fn(&Loop, HandleId, i64, i32);

/// What to spawn
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Program to run
    pub file: PathBuf,
    /// Arguments after the program name
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Working directory
    pub cwd: Option<PathBuf>,
}

impl ProcessOptions {
    /// Run `file` with no arguments
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            ..Self::default()
        }
    }

    /// Append an argument
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the working directory
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.file);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
    }
}

pub(crate) struct ProcessState {
    child: Option<Child>,
    pid: u32,
    exit_cb: Option<ExitCb>,
}

impl ProcessState {
    pub(crate) fn is_running(&self) -> bool {
        self.child.is_some()
    }
}

#[cfg(unix)]
fn exit_parts(status: std::process::ExitStatus) -> (i64, i32) {
    use std::os::unix::process::ExitStatusExt;
    (
        status.code().map(i64::from).unwrap_or(0),
        status.signal().unwrap_or(0),
    )
}

#[cfg(not(unix))]
fn exit_parts(status: std::process::ExitStatus) -> (i64, i32) {
    (status.code().map(i64::from).unwrap_or(0), 0)
}

impl Loop {
    /// Spawn a child and register its process handle
    pub fn spawn(&self, options: &ProcessOptions, exit_cb: Option<ExitCb>) -> Result<HandleId, Errno> {
        if options.file.as_os_str().is_empty() {
            return Err(Errno::InvalidArgument);
        }
        if self.handle_count() >= self.settings.max_handles {
            return Err(Errno::NoMemory);
        }
        let child = options.command().spawn().map_err(|e| {
            warn!(loop_id = %self.id, file = %options.file.display(), error = %e, "Spawn failed");
            Errno::from(e)
        })?;
        let pid = child.id();
        let id = self.register_handle(
            HandleKind::Process,
            Detail::Process(ProcessState {
                child: Some(child),
                pid,
                exit_cb,
            }),
            ACTIVE | REF,
        )?;
        debug!(loop_id = %self.id, %id, pid, "Process spawned");
        Ok(id)
    }

    /// Pid of a spawned child
    pub fn process_pid(&self, id: HandleId) -> Result<u32, Errno> {
        let st = self.state.lock();
        match st.handles.get(id.0).map(|rec| &rec.detail) {
            Some(Detail::Process(p)) => Ok(p.pid),
            _ => Err(Errno::InvalidArgument),
        }
    }

    /// Kill a running child; `NoSuchProcess` once it has exited
    pub fn process_kill(&self, id: HandleId) -> Result<(), Errno> {
        let mut st = self.state.lock();
        match st.handles.get_mut(id.0).map(|rec| &mut rec.detail) {
            Some(Detail::Process(p)) => match p.child.as_mut() {
                Some(child) => child.kill().map_err(Errno::from),
                None => Err(Errno::NoSuchProcess),
            },
            _ => Err(Errno::InvalidArgument),
        }
    }

    pub(crate) fn poll_processes(&self) -> usize {
        let exited: Vec<(HandleId, Option<ExitCb>, i64, i32)> = {
            let mut st = self.state.lock();
            let mut exited = Vec::new();
            for (key, rec) in st.handles.iter_mut() {
                let Detail::Process(p) = &mut rec.detail else {
                    continue;
                };
                let Some(child) = p.child.as_mut() else {
                    continue;
                };
                let status = match child.try_wait() {
                    Ok(Some(status)) => status,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(pid = p.pid, error = %e, "Waiting on child failed");
                        continue;
                    }
                };
                p.child = None;
                rec.flags &= !ACTIVE;
                let (code, signal) = exit_parts(status);
                exited.push((HandleId(key), p.exit_cb, code, signal));
            }
            exited
        };
        let count = exited.len();
        for (id, cb, code, signal) in exited {
            debug!(loop_id = %self.id, %id, code, signal, "Process exited");
            if let Some(cb) = cb {
                self.metrics.record_trampoline("exit");
                cb(self, id, code, signal);
            }
        }
        count
    }
}
