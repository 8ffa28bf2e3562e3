//! Managed event loop.
//!
//! [`EventLoop`] is the managed face of one engine loop. Handles and
//! requests keep an owned reference to it while they are bound, so the
//! engine loop outlives everything registered on it.

use crate::config::BridgeConfig;
use crate::engine::{self, HandleInfo, RunMode};
use crate::error::{Result, Status};
use crate::heap::{Heap, Managed};
use crate::metrics::LoopMetrics;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Managed wrapper around an engine loop
#[derive(Debug)]
pub struct EventLoop {
    native: engine::Loop,
    heap: Heap,
}

impl EventLoop {
    /// Create a loop on `heap`
    pub fn new(heap: &Heap, config: BridgeConfig) -> Result<Managed<EventLoop>> {
        let native = engine::Loop::new(config)?;
        let lp = EventLoop {
            native,
            heap: heap.clone(),
        };
        Ok(heap.allocate_tracked("loop", lp, |lp: &mut EventLoop| {
            if let Err(e) = lp.native.close() {
                warn!(loop_id = %lp.native.id(), error = %e, "Loop finalized with live resources");
            }
        }))
    }

    /// Create a loop with the default configuration
    pub fn with_defaults(heap: &Heap) -> Result<Managed<EventLoop>> {
        Self::new(heap, BridgeConfig::default())
    }

    /// The engine loop
    pub fn native(&self) -> &engine::Loop {
        &self.native
    }

    /// Heap the loop was allocated on
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Unique loop id
    pub fn loop_id(&self) -> Uuid {
        self.native.id()
    }

    /// Run the loop; returns whether it is still alive
    pub fn run(&self, mode: RunMode) -> bool {
        self.native.run(mode)
    }

    /// Make `run` return after the current iteration
    pub fn stop(&self) {
        self.native.stop()
    }

    /// Whether anything keeps the loop alive
    pub fn alive(&self) -> bool {
        self.native.alive()
    }

    /// Cached loop time in milliseconds
    pub fn now(&self) -> u64 {
        self.native.now()
    }

    /// Refresh the cached loop time
    pub fn update_time(&self) {
        self.native.update_time()
    }

    /// Advance a manual clock
    pub fn advance(&self, by: Duration) -> Status {
        self.native.advance(by)
    }

    /// Poll timeout in ms, -1 for infinite
    pub fn backend_timeout(&self) -> i64 {
        self.native.backend_timeout()
    }

    /// Visit every live handle
    pub fn walk(&self, f: impl FnMut(HandleInfo)) {
        self.native.walk(f)
    }

    /// Loop metrics
    pub fn metrics(&self) -> &LoopMetrics {
        self.native.metrics()
    }

    /// Close the engine loop; `Busy` while handles or requests remain
    pub fn close(&self) -> Status {
        let status = self.native.close();
        if status.is_ok() {
            info!(loop_id = %self.loop_id(), "Managed loop closed");
        }
        status
    }
}
