//! Error types for the loop bridge.
//!
//! This module defines the closed set of engine status codes (`Errno`), the
//! crate-level error type and the status helpers used by every wrapper.

use serde::{Deserialize, Serialize};

/// Status codes reported by the event-loop engine.
///
/// Numeric values follow libuv on Linux: negated `errno` values, plus the
/// libuv-specific codes for end of file and address resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Errno {
    /// Resource busy or locked
    Busy,
    /// Invalid argument
    InvalidArgument,
    /// Resource temporarily unavailable
    WouldBlock,
    /// Operation not supported
    NotSupported,
    /// Not enough memory
    NoMemory,
    /// Operation canceled
    Canceled,
    /// End of file
    Eof,
    /// No such file or directory
    NotFound,
    /// File already exists
    Exists,
    /// Connection refused
    ConnectionRefused,
    /// Broken pipe
    BrokenPipe,
    /// Socket is not connected
    NotConnected,
    /// Address already in use
    AddressInUse,
    /// Connection timed out
    TimedOut,
    /// No buffer space available
    NoBufferSpace,
    /// Permission denied
    PermissionDenied,
    /// Illegal operation on a directory
    IsDirectory,
    /// Not a directory
    NotDirectory,
    /// Directory not empty
    NotEmpty,
    /// Bad file descriptor
    BadDescriptor,
    /// Operation already in progress
    AlreadyInProgress,
    /// I/O error
    Io,
    /// No such process
    NoSuchProcess,
    /// Unknown node or service
    AddrInfoNoName,
    /// Unknown error
    Unknown,
}

impl Errno {
    /// Every variant, in declaration order
    pub const ALL: [Errno; 25] = [
        Errno::Busy,
        Errno::InvalidArgument,
        Errno::WouldBlock,
        Errno::NotSupported,
        Errno::NoMemory,
        Errno::Canceled,
        Errno::Eof,
        Errno::NotFound,
        Errno::Exists,
        Errno::ConnectionRefused,
        Errno::BrokenPipe,
        Errno::NotConnected,
        Errno::AddressInUse,
        Errno::TimedOut,
        Errno::NoBufferSpace,
        Errno::PermissionDenied,
        Errno::IsDirectory,
        Errno::NotDirectory,
        Errno::NotEmpty,
        Errno::BadDescriptor,
        Errno::AlreadyInProgress,
        Errno::Io,
        Errno::NoSuchProcess,
        Errno::AddrInfoNoName,
        Errno::Unknown,
    ];

    /// Negative status code as reported by the engine
    pub fn code(self) -> i32 {
        match self {
            Errno::Busy => -16,
            Errno::InvalidArgument => -22,
            Errno::WouldBlock => -11,
            Errno::NotSupported => -95,
            Errno::NoMemory => -12,
            Errno::Canceled => -125,
            Errno::Eof => -4095,
            Errno::NotFound => -2,
            Errno::Exists => -17,
            Errno::ConnectionRefused => -111,
            Errno::BrokenPipe => -32,
            Errno::NotConnected => -107,
            Errno::AddressInUse => -98,
            Errno::TimedOut => -110,
            Errno::NoBufferSpace => -105,
            Errno::PermissionDenied => -13,
            Errno::IsDirectory => -21,
            Errno::NotDirectory => -20,
            Errno::NotEmpty => -39,
            Errno::BadDescriptor => -9,
            Errno::AlreadyInProgress => -114,
            Errno::Io => -5,
            Errno::NoSuchProcess => -3,
            Errno::AddrInfoNoName => -3008,
            Errno::Unknown => -4094,
        }
    }

    /// Map a negative status code back to its variant
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|e| e.code() == code)
    }

    /// Symbolic name, e.g. `EBUSY`
    pub fn name(self) -> &'static str {
        match self {
            Errno::Busy => "EBUSY",
            Errno::InvalidArgument => "EINVAL",
            Errno::WouldBlock => "EAGAIN",
            Errno::NotSupported => "ENOTSUP",
            Errno::NoMemory => "ENOMEM",
            Errno::Canceled => "ECANCELED",
            Errno::Eof => "EOF",
            Errno::NotFound => "ENOENT",
            Errno::Exists => "EEXIST",
            Errno::ConnectionRefused => "ECONNREFUSED",
            Errno::BrokenPipe => "EPIPE",
            Errno::NotConnected => "ENOTCONN",
            Errno::AddressInUse => "EADDRINUSE",
            Errno::TimedOut => "ETIMEDOUT",
            Errno::NoBufferSpace => "ENOBUFS",
            Errno::PermissionDenied => "EACCES",
            Errno::IsDirectory => "EISDIR",
            Errno::NotDirectory => "ENOTDIR",
            Errno::NotEmpty => "ENOTEMPTY",
            Errno::BadDescriptor => "EBADF",
            Errno::AlreadyInProgress => "EALREADY",
            Errno::Io => "EIO",
            Errno::NoSuchProcess => "ESRCH",
            Errno::AddrInfoNoName => "EAI_NONAME",
            Errno::Unknown => "UNKNOWN",
        }
    }

    /// Human-readable description (strerror)
    pub fn message(self) -> &'static str {
        match self {
            Errno::Busy => "resource busy or locked",
            Errno::InvalidArgument => "invalid argument",
            Errno::WouldBlock => "resource temporarily unavailable",
            Errno::NotSupported => "operation not supported on socket",
            Errno::NoMemory => "not enough memory",
            Errno::Canceled => "operation canceled",
            Errno::Eof => "end of file",
            Errno::NotFound => "no such file or directory",
            Errno::Exists => "file already exists",
            Errno::ConnectionRefused => "connection refused",
            Errno::BrokenPipe => "broken pipe",
            Errno::NotConnected => "socket is not connected",
            Errno::AddressInUse => "address already in use",
            Errno::TimedOut => "connection timed out",
            Errno::NoBufferSpace => "no buffer space available",
            Errno::PermissionDenied => "permission denied",
            Errno::IsDirectory => "illegal operation on a directory",
            Errno::NotDirectory => "not a directory",
            Errno::NotEmpty => "directory not empty",
            Errno::BadDescriptor => "bad file descriptor",
            Errno::AlreadyInProgress => "connection already in progress",
            Errno::Io => "i/o error",
            Errno::NoSuchProcess => "no such process",
            Errno::AddrInfoNoName => "unknown node or service",
            Errno::Unknown => "unknown error",
        }
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name(), self.message())
    }
}

impl std::error::Error for Errno {}

impl From<std::io::Error> for Errno {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;

        if let Some(raw) = e.raw_os_error() {
            if let Some(errno) = Errno::from_code(-raw) {
                return errno;
            }
        }

        match e.kind() {
            ErrorKind::NotFound => Errno::NotFound,
            ErrorKind::PermissionDenied => Errno::PermissionDenied,
            ErrorKind::AlreadyExists => Errno::Exists,
            ErrorKind::WouldBlock => Errno::WouldBlock,
            ErrorKind::InvalidInput => Errno::InvalidArgument,
            ErrorKind::TimedOut => Errno::TimedOut,
            ErrorKind::BrokenPipe => Errno::BrokenPipe,
            ErrorKind::ConnectionRefused => Errno::ConnectionRefused,
            ErrorKind::NotConnected => Errno::NotConnected,
            ErrorKind::AddrInUse => Errno::AddressInUse,
            ErrorKind::UnexpectedEof => Errno::Eof,
            ErrorKind::OutOfMemory => Errno::NoMemory,
            ErrorKind::Unsupported => Errno::NotSupported,
            _ => Errno::Io,
        }
    }
}

/// Outcome of an engine call or completion: `Ok(())` or a negative status
pub type Status = std::result::Result<(), Errno>;

/// Convert a status into the engine's integer convention (0 or negative)
pub fn status_code(status: &Status) -> i32 {
    match status {
        Ok(()) => status_codes::OK,
        Err(e) => e.code(),
    }
}

/// Main error type for crate-level operations
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Engine status
    #[error("Engine error: {0}")]
    Errno(#[from] Errno),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl BridgeError {
    /// Collapse into the engine status a caller at the binding boundary sees
    pub fn errno(&self) -> Errno {
        match self {
            BridgeError::Errno(e) => *e,
            BridgeError::Config(_) => Errno::InvalidArgument,
            BridgeError::Io(e) => Errno::from(std::io::Error::new(e.kind(), e.to_string())),
            BridgeError::InvalidState(_) => Errno::InvalidArgument,
        }
    }
}

/// Result type alias for crate-level operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Integer status constants for callers that speak the raw convention
pub mod status_codes {
    /// Success
    pub const OK: i32 = 0;
    /// Resource busy or locked
    pub const EBUSY: i32 = -16;
    /// Invalid argument
    pub const EINVAL: i32 = -22;
    /// Resource temporarily unavailable
    pub const EAGAIN: i32 = -11;
    /// Operation canceled
    pub const ECANCELED: i32 = -125;
    /// End of file
    pub const EOF: i32 = -4095;
}
