//! Handle wrappers.
//!
//! A handle wrapper is a managed object embedding the engine's handle id
//! plus owned callback slots. The lifecycle is
//! `Unarmed -> Armed (start/stop cycles) -> Closing -> Closed`.
//!
//! Ownership rules:
//!
//! - `init` binds the wrapper to a loop and keeps an owned reference to the
//!   loop for later calls. The engine record's data slot stays empty.
//! - The first `start`-class call (or `close` on a handle that was never
//!   started) moves one owned reference to the wrapper into the engine
//!   record's data slot. That reference lingers until the close trampoline
//!   takes it out.
//! - A trampoline recovers the wrapper from the data slot by cloning it and
//!   retains the stored callback before invoking it. Both extra references
//!   are released when the invocation returns.
//! - The finalizer releases the loop reference, then any callback still
//!   stored. A handle that never reached `Closed` has its engine record
//!   discarded first.

pub mod async_handle;
pub mod phase;
pub mod pipe;
pub mod process;
pub mod timer;

pub use async_handle::{Async, AsyncCb};
pub use phase::{Check, CheckPhase, Idle, IdlePhase, Phase, PhaseHandle, Prepare, PreparePhase};
pub use pipe::{AllocCb, ConnectionCb, Pipe, ReadCb};
pub use process::{ExitCb, Process};
pub use timer::{Timer, TimerCb};

use crate::callback::CloseCb;
use crate::engine::{self, HandleId, HandleKind};
use crate::error::{Errno, Status};
use crate::event_loop::EventLoop;
use crate::heap::{Heap, Managed};
use crate::slot::Slot;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Lifecycle state of a handle wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HandleState {
    /// Created or initialised, never started
    Unarmed,
    /// Started at least once
    Armed,
    /// Close requested
    Closing,
    /// Close trampoline ran
    Closed,
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleState::Unarmed => "unarmed",
            HandleState::Armed => "armed",
            HandleState::Closing => "closing",
            HandleState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// State shared by every handle wrapper
pub struct HandleCore {
    event_loop: Slot<Managed<EventLoop>>,
    id: OnceCell<HandleId>,
    state: Mutex<HandleState>,
    close_cb: Slot<CloseCb>,
}

impl Default for HandleCore {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleCore {
    pub(crate) fn new() -> Self {
        Self {
            event_loop: Slot::new(),
            id: OnceCell::new(),
            state: Mutex::new(HandleState::Unarmed),
            close_cb: Slot::new(),
        }
    }

    pub(crate) fn state(&self) -> HandleState {
        *self.state.lock()
    }

    fn set_state(&self, state: HandleState) {
        *self.state.lock() = state;
    }

    /// Bind to `lp` with the record `register` creates
    pub(crate) fn register(
        &self,
        lp: &Managed<EventLoop>,
        register: impl FnOnce(&engine::Loop) -> Result<HandleId, Errno>,
    ) -> Status {
        if self.id.get().is_some() {
            return Err(Errno::InvalidArgument);
        }
        let id = register(lp.native())?;
        if self.id.set(id).is_err() {
            let leftover = lp.native().discard_handle(id);
            drop(leftover);
            return Err(Errno::InvalidArgument);
        }
        self.event_loop.install(lp.clone());
        Ok(())
    }

    /// Loop and id of a bound handle
    pub(crate) fn bound(&self) -> Result<(Managed<EventLoop>, HandleId), Errno> {
        let id = *self.id.get().ok_or(Errno::InvalidArgument)?;
        let lp = self.event_loop.retained().ok_or(Errno::InvalidArgument)?;
        Ok((lp, id))
    }

    /// Like [`bound`](Self::bound) but refuses closing or closed handles
    pub(crate) fn open(&self) -> Result<(Managed<EventLoop>, HandleId), Errno> {
        match self.state() {
            HandleState::Closing | HandleState::Closed => Err(Errno::InvalidArgument),
            _ => self.bound(),
        }
    }

    /// Run `f` against the engine record
    pub(crate) fn with_native<R>(&self, f: impl FnOnce(&engine::Loop, HandleId) -> R) -> Result<R, Errno> {
        let (lp, id) = self.bound()?;
        Ok(f(lp.native(), id))
    }
}

impl fmt::Debug for HandleCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleCore")
            .field("id", &self.id.get())
            .field("state", &self.state())
            .finish()
    }
}

/// Implemented by every handle wrapper
pub trait AsHandle: Send + Sync + Sized + 'static {
    /// Engine kind backing the wrapper
    const KIND: HandleKind;

    /// Shared handle state
    fn handle_core(&self) -> &HandleCore;

    /// Release kind-specific callbacks
    fn release_callbacks(&self);
}

/// Allocate a handle wrapper with the shared finalizer
pub(crate) fn make<H: AsHandle>(heap: &Heap, handle: H) -> Managed<H> {
    heap.allocate_tracked(H::KIND.name(), handle, |h: &mut H| finalize(h))
}

fn finalize<H: AsHandle>(handle: &H) {
    let core = handle.handle_core();
    let lp = core.event_loop.take();
    if let (Some(lp), Some(id)) = (&lp, core.id.get()) {
        if core.state() != HandleState::Closed {
            warn!(%id, kind = %H::KIND, "Handle released without close");
            let leftover = lp.native().discard_handle(*id);
            drop(leftover);
        }
    }
    drop(lp);
    core.close_cb.clear();
    handle.release_callbacks();
}

/// Retained wrapper stored in a handle record's data slot
pub(crate) fn recover<H: AsHandle>(native: &engine::Loop, id: HandleId) -> Option<Managed<H>> {
    native
        .with_handle_data(id, |data| {
            data.as_ref()
                .and_then(|d| d.downcast_ref::<Managed<H>>())
                .cloned()
        })
        .flatten()
}

fn close_trampoline<H: AsHandle>(native: &engine::Loop, id: HandleId) {
    let data = native.take_handle_data(id);
    let Some(handle) = data
        .and_then(|d| d.downcast::<Managed<H>>().ok())
        .map(|boxed| *boxed)
    else {
        return;
    };
    let close_cb = {
        let core = handle.handle_core();
        core.set_state(HandleState::Closed);
        core.close_cb.take()
    };
    handle.release_callbacks();
    debug!(%id, kind = %H::KIND, "Handle closed");
    drop(handle);
    if let Some(cb) = close_cb {
        cb.call(());
    }
}

impl<H: AsHandle> Managed<H> {
    /// Engine id, once initialised
    pub fn handle_id(&self) -> Option<HandleId> {
        self.handle_core().id.get().copied()
    }

    /// Loop the handle is bound to
    pub fn event_loop(&self) -> Option<Managed<EventLoop>> {
        self.handle_core().event_loop.retained()
    }

    /// Engine kind
    pub fn handle_type(&self) -> HandleKind {
        H::KIND
    }

    /// Lifecycle state
    pub fn handle_state(&self) -> HandleState {
        self.handle_core().state()
    }

    /// Whether the engine considers the handle active
    pub fn is_active(&self) -> bool {
        self.handle_core()
            .with_native(|native, id| native.is_active(id))
            .unwrap_or(false)
    }

    /// Whether close was requested
    pub fn is_closing(&self) -> bool {
        matches!(
            self.handle_state(),
            HandleState::Closing | HandleState::Closed
        )
    }

    /// Set whether the handle keeps its loop alive
    pub fn set_ref(&self, referenced: bool) -> Status {
        self.handle_core()
            .with_native(|native, id| native.set_ref(id, referenced))?
    }

    /// Whether the handle keeps its loop alive
    pub fn has_ref(&self) -> bool {
        self.handle_core()
            .with_native(|native, id| native.has_ref(id))
            .unwrap_or(false)
    }

    /// Request teardown; `close_cb` runs once the engine has let go
    pub fn close(&self, close_cb: Option<CloseCb>) -> Status {
        let core = self.handle_core();
        let (lp, id) = core.open()?;
        self.hand_to_engine(lp.native(), id)?;
        if let Some(cb) = close_cb {
            core.close_cb.install(cb);
        }
        if let Err(e) = lp.native().close_handle(id, close_trampoline::<H>) {
            core.close_cb.clear();
            return Err(e);
        }
        core.set_state(HandleState::Closing);
        Ok(())
    }

    /// Move one owned reference into the record's data slot unless one is there
    pub(crate) fn hand_to_engine(&self, native: &engine::Loop, id: HandleId) -> Status {
        let present = native
            .with_handle_data(id, |data| data.is_some())
            .ok_or(Errno::InvalidArgument)?;
        if !present {
            let previous = native.set_handle_data(id, Some(Box::new(self.clone())))?;
            drop(previous);
        }
        Ok(())
    }

    /// Record a successful start
    pub(crate) fn mark_armed(&self, native: &engine::Loop, id: HandleId) -> Status {
        self.hand_to_engine(native, id)?;
        let core = self.handle_core();
        let mut state = core.state.lock();
        if *state == HandleState::Unarmed {
            *state = HandleState::Armed;
        }
        Ok(())
    }
}
