//! # Nexus Loop Bridge
//!
//! Ownership-safe handles, requests and callbacks over a single-threaded
//! event loop with a worker pool.
//!
//! ## Architecture
//!
//! ```text
//! Caller (Managed<Timer>, Managed<Write>, Callback<..>)
//!     │
//!     │ ownership moves into the engine data slot
//!     ▼
//! Bridge wrappers (handle / request / sync)
//!     │
//!     │ fn-pointer trampolines keyed by HandleId / ReqId
//!     ▼
//! Engine loop (timers, phases, pipes, processes, thread pool)
//! ```
//!
//! ## Features
//!
//! - **Reference accounting**: every managed object is tracked by a heap
//!   ledger, so leaks and double releases show up in tests
//! - **Exactly-once completions**: request callbacks are taken out of the
//!   engine before they run
//! - **Scatter/gather I/O**: byte regions stay alive until completion while
//!   the descriptor list is discarded right after submission
//! - **Shared primitives**: mutexes, locks, semaphores, barriers and threads
//!   aliasable across owners, plus one-time guards and thread-local keys
//! - **Host queries**: clocks, memory, process, environment and user data

#![deny(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buf;
pub mod callback;
pub mod config;
pub mod engine;
pub mod error;
pub mod event_loop;
pub mod handle;
pub mod heap;
pub mod key;
pub mod logging;
pub mod metrics;
pub mod once;
pub mod os;
pub mod request;
pub mod slot;
pub mod sync;
pub mod thread;
pub mod time;

// Re-export commonly used types
pub use buf::{BufRef, ByteBuf, Bytes, GatherList, IoVec};
pub use callback::{Callback, CloseCb};
pub use config::{BridgeConfig, ClockMode, ConfigError};
pub use engine::{HandleInfo, HandleKind, ProcessOptions, RequestKind, RunMode};
pub use error::{BridgeError, Errno, Status};
pub use event_loop::EventLoop;
pub use handle::{Async, Check, HandleState, Idle, Pipe, Prepare, Process, Timer};
pub use heap::{Heap, Managed, ObjectId};
pub use key::Key;
pub use metrics::{LoopMetrics, MetricsSnapshot};
pub use once::Once;
pub use request::{Connect, Fs, FsOp, GetAddrInfo, Random, Shutdown, Work, Write};
pub use sync::{Shared, SharedBarrier, SharedCond, SharedMutex, SharedRwLock, SharedSem};
pub use thread::Thread;
pub use time::{ClockId, TimeSpec, TimeVal};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
