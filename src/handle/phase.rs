//! Idle, prepare and check handles.
//!
//! The three kinds differ only in the loop phase that runs them, so one
//! generic wrapper parameterised by a [`Phase`] marker covers all of them.

use super::{make, recover, AsHandle, HandleCore};
use crate::callback::Callback;
use crate::engine::{self, HandleId, HandleKind};
use crate::error::Status;
use crate::event_loop::EventLoop;
use crate::heap::{Heap, Managed};
use crate::slot::Slot;
use std::fmt;
use std::marker::PhantomData;

/// Loop phase a [`PhaseHandle`] runs in
pub trait Phase: Send + Sync + 'static {
    /// Engine kind for the phase
    const KIND: HandleKind;
}

/// Runs every iteration, and keeps poll from blocking
#[derive(Debug)]
pub struct IdlePhase;

/// Runs right before poll
#[derive(Debug)]
pub struct PreparePhase;

/// Runs right after poll
#[derive(Debug)]
pub struct CheckPhase;

impl Phase for IdlePhase {
    const KIND: HandleKind = HandleKind::Idle;
}

impl Phase for PreparePhase {
    const KIND: HandleKind = HandleKind::Prepare;
}

impl Phase for CheckPhase {
    const KIND: HandleKind = HandleKind::Check;
}

/// Callback for a phase handle
pub type PhaseCb<P> = Callback<Managed<PhaseHandle<P>>>;

/// Managed phase handle
pub struct PhaseHandle<P: Phase> {
    core: HandleCore,
    callback: Slot<PhaseCb<P>>,
    _phase: PhantomData<P>,
}

/// Idle handle
pub type Idle = PhaseHandle<IdlePhase>;

/// Prepare handle
pub type Prepare = PhaseHandle<PreparePhase>;

/// Check handle
pub type Check = PhaseHandle<CheckPhase>;

impl<P: Phase> AsHandle for PhaseHandle<P> {
    const KIND: HandleKind = P::KIND;

    fn handle_core(&self) -> &HandleCore {
        &self.core
    }

    fn release_callbacks(&self) {
        self.callback.clear();
    }
}

impl<P: Phase> PhaseHandle<P> {
    /// Allocate an uninitialised handle
    pub fn make(heap: &Heap) -> Managed<Self> {
        make(
            heap,
            PhaseHandle {
                core: HandleCore::new(),
                callback: Slot::new(),
                _phase: PhantomData,
            },
        )
    }
}

impl<P: Phase> fmt::Debug for PhaseHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseHandle")
            .field("kind", &P::KIND)
            .field("core", &self.core)
            .finish()
    }
}

fn phase_trampoline<P: Phase>(native: &engine::Loop, id: HandleId) {
    let Some(handle) = recover::<PhaseHandle<P>>(native, id) else {
        return;
    };
    let Some(cb) = handle.callback.retained() else {
        return;
    };
    cb.call(handle);
}

impl<P: Phase> Managed<PhaseHandle<P>> {
    /// Bind the handle to `lp`
    pub fn init(&self, lp: &Managed<EventLoop>) -> Status {
        self.core.register(lp, |native| native.handle_init(P::KIND))
    }

    /// Run `cb` once per loop iteration in this handle's phase
    pub fn start(&self, cb: PhaseCb<P>) -> Status {
        let (lp, id) = self.core.open()?;
        lp.native().phase_start(id, phase_trampoline::<P>)?;
        self.callback.install(cb);
        self.mark_armed(lp.native(), id)
    }

    /// Stop running and release the callback; idempotent
    pub fn stop(&self) -> Status {
        let (lp, id) = self.core.open()?;
        lp.native().phase_stop(id)?;
        self.callback.clear();
        Ok(())
    }
}
