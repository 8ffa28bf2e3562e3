//! Child process handles.

use super::{make, recover, AsHandle, HandleCore};
use crate::callback::Callback;
use crate::engine::{self, HandleId, HandleKind, ProcessOptions};
use crate::error::{Errno, Status};
use crate::event_loop::EventLoop;
use crate::heap::Managed;
use crate::slot::Slot;
use tracing::info;

/// Exit callback: `(process, exit_status, term_signal)`
pub type ExitCb = Callback<(Managed<Process>, i64, i32)>;

/// Managed child process handle
#[derive(Debug)]
pub struct Process {
    core: HandleCore,
    exit_cb: Slot<ExitCb>,
}

impl AsHandle for Process {
    const KIND: HandleKind = HandleKind::Process;

    fn handle_core(&self) -> &HandleCore {
        &self.core
    }

    fn release_callbacks(&self) {
        self.exit_cb.clear();
    }
}

fn exit_trampoline(native: &engine::Loop, id: HandleId, status: i64, signal: i32) {
    let Some(process) = recover::<Process>(native, id) else {
        return;
    };
    let Some(cb) = process.exit_cb.retained() else {
        return;
    };
    cb.call((process, status, signal));
}

impl Process {
    /// Spawn a child on `lp`.
    ///
    /// The exit callback runs once, from the poll phase, after the child
    /// exits. The handle stays registered until closed.
    pub fn spawn(
        lp: &Managed<EventLoop>,
        options: &ProcessOptions,
        exit_cb: Option<ExitCb>,
    ) -> Result<Managed<Process>, Errno> {
        let process = make(
            lp.heap(),
            Process {
                core: HandleCore::new(),
                exit_cb: Slot::new(),
            },
        );
        process
            .core
            .register(lp, |native| native.spawn(options, Some(exit_trampoline)))?;
        if let Some(cb) = exit_cb {
            process.exit_cb.install(cb);
        }
        let (lp, id) = process.core.bound()?;
        process.mark_armed(lp.native(), id)?;
        info!(program = %options.file.display(), pid = process.pid().unwrap_or(0), "Spawned child process");
        Ok(process)
    }
}

impl Managed<Process> {
    /// Pid of the child
    pub fn pid(&self) -> Result<u32, Errno> {
        let (lp, id) = self.core.bound()?;
        lp.native().process_pid(id)
    }

    /// Kill the child; `NoSuchProcess` once it has exited
    pub fn kill(&self) -> Status {
        let (lp, id) = self.core.open()?;
        lp.native().process_kill(id)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::engine::RunMode;
    use crate::heap::Heap;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (Heap, Managed<EventLoop>) {
        let heap = Heap::instrumented();
        let config = BridgeConfig::default().with_process_poll_interval(Duration::from_millis(1));
        let lp = EventLoop::new(&heap, config).unwrap();
        (heap, lp)
    }

    #[test]
    fn test_exit_callback_and_close() {
        let (heap, lp) = setup();
        let exits = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&exits);
        let cb: ExitCb = heap.callback(move |(process, status, signal): (Managed<Process>, i64, i32)| {
            seen.lock().push((status, signal));
            process.close(None).unwrap();
        });
        let cb_id = cb.id();

        let options = ProcessOptions::new("/bin/sh").with_arg("-c").with_arg("exit 7");
        let process = Process::spawn(&lp, &options, Some(cb)).unwrap();
        let process_id = process.id();
        assert!(process.pid().unwrap() > 0);

        assert!(!lp.run(RunMode::Default));
        assert_eq!(*exits.lock(), vec![(7, 0)]);
        assert!(heap.ledger().stats(cb_id).unwrap().is_balanced());
        assert_eq!(process.kill(), Err(Errno::InvalidArgument));
        drop(process);
        assert!(heap.ledger().stats(process_id).unwrap().is_balanced());
        assert_eq!(lp.close(), Ok(()));
    }

    #[test]
    fn test_kill_running_child() {
        let (heap, lp) = setup();
        let exits = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&exits);
        let cb: ExitCb = heap.callback(move |(process, _, signal): (Managed<Process>, i64, i32)| {
            seen.lock().push(signal);
            assert_eq!(process.kill(), Err(Errno::NoSuchProcess));
            process.close(None).unwrap();
        });
        let options = ProcessOptions::new("/bin/sh").with_arg("-c").with_arg("sleep 30");
        let process = Process::spawn(&lp, &options, Some(cb)).unwrap();
        process.kill().unwrap();
        lp.run(RunMode::Default);
        assert_eq!(*exits.lock(), vec![9]);
    }

    #[test]
    fn test_spawn_failure_leaves_nothing_registered() {
        let (heap, lp) = setup();
        let cb: ExitCb = heap.callback(|_: (Managed<Process>, i64, i32)| {});
        let cb_id = cb.id();
        let err = Process::spawn(&lp, &ProcessOptions::new("/no/such/binary"), Some(cb)).unwrap_err();
        assert_eq!(err, Errno::NotFound);
        assert!(heap.ledger().stats(cb_id).unwrap().is_balanced());
        assert_eq!(lp.native().handle_count(), 0);
        assert_eq!(lp.ref_count(), 1);
    }
}
