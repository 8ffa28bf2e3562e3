//! Filesystem operations.
//!
//! Files opened through the engine are tracked in a table of virtual
//! descriptors shared with pool workers. Reads and writes move bytes through
//! caller-described [`IoVec`] lists.

use crate::buf::{self, IoVec};
use crate::error::Errno;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::trace;

/// How `Open` opens a file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenFlags {
    /// Open for reading
    pub read: bool,
    /// Open for writing
    pub write: bool,
    /// Writes go to the end
    pub append: bool,
    /// Create if missing
    pub create: bool,
    /// Truncate on open
    pub truncate: bool,
    /// Fail if the file exists (with `create`)
    pub exclusive: bool,
}

impl OpenFlags {
    /// `O_RDONLY`
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    /// `O_WRONLY`
    pub fn write_only() -> Self {
        Self {
            write: true,
            ..Self::default()
        }
    }

    /// `O_RDWR`
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::default()
        }
    }

    /// Add `O_CREAT`
    pub fn with_create(mut self) -> Self {
        self.create = true;
        self
    }

    /// Add `O_TRUNC`
    pub fn with_truncate(mut self) -> Self {
        self.truncate = true;
        self
    }

    /// Add `O_APPEND`
    pub fn with_append(mut self) -> Self {
        self.append = true;
        self
    }

    /// Add `O_CREAT | O_EXCL`
    pub fn with_exclusive(mut self) -> Self {
        self.create = true;
        self.exclusive = true;
        self
    }

    fn options(&self) -> OpenOptions {
        let mut options = OpenOptions::new();
        options
            .read(self.read)
            .write(self.write)
            .append(self.append)
            .truncate(self.truncate);
        if self.exclusive {
            options.create_new(true);
        } else {
            options.create(self.create);
        }
        options
    }
}

/// Type of a filesystem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileKind {
    /// Regular file
    File,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Anything else
    Other,
}

impl From<fs::FileType> for FileKind {
    fn from(ty: fs::FileType) -> Self {
        if ty.is_symlink() {
            FileKind::Symlink
        } else if ty.is_dir() {
            FileKind::Directory
        } else if ty.is_file() {
            FileKind::File
        } else {
            FileKind::Other
        }
    }
}

/// Result of a stat call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    /// Size in bytes
    pub size: u64,
    /// Entry type
    pub kind: FileKind,
    /// Permission bits (0 where the platform has none)
    pub mode: u32,
    /// Modification time, ms since the epoch
    pub modified_ms: u64,
}

impl From<fs::Metadata> for FileStat {
    fn from(meta: fs::Metadata) -> Self {
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            meta.permissions().mode()
        };
        #[cfg(not(unix))]
        let mode = 0;

        let modified_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            size: meta.len(),
            kind: meta.file_type().into(),
            mode,
            modified_ms,
        }
    }
}

/// One entry yielded by `Scandir`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// File name
    pub name: String,
    /// Entry type
    pub kind: FileKind,
}

/// Result of a filesystem operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsOutcome {
    /// Descriptor for `Open`, byte count for `Read`/`Write`, entry count for `Scandir`, else 0
    pub result: i64,
    /// Filled by `Stat` and `Fstat`
    pub stat: Option<FileStat>,
    /// Filled by `Scandir`
    pub entries: Vec<DirEntry>,
}

impl FsOutcome {
    fn value(result: i64) -> Self {
        Self {
            result,
            ..Self::default()
        }
    }
}

/// Filesystem operation as the engine sees it
#[derive(Debug, Clone)]
pub enum NativeFsOp {
    /// Open a file, yielding a descriptor
    Open {
        /// Path
        path: PathBuf,
        /// Access flags
        flags: OpenFlags,
        /// Permission bits for a created file
        mode: u32,
    },
    /// Close a descriptor
    Close {
        /// Descriptor
        file: i64,
    },
    /// Read into `iov`; `offset` of `None` uses the file cursor
    Read {
        /// Descriptor
        file: i64,
        /// Destination regions
        iov: Vec<IoVec>,
        /// Position
        offset: Option<u64>,
    },
    /// Write from `iov`; `offset` of `None` uses the file cursor
    Write {
        /// Descriptor
        file: i64,
        /// Source regions
        iov: Vec<IoVec>,
        /// Position
        offset: Option<u64>,
    },
    /// Stat a path
    Stat {
        /// Path
        path: PathBuf,
    },
    /// Stat a descriptor
    Fstat {
        /// Descriptor
        file: i64,
    },
    /// Flush a descriptor to disk
    Fsync {
        /// Descriptor
        file: i64,
    },
    /// Remove a file
    Unlink {
        /// Path
        path: PathBuf,
    },
    /// Create a directory
    Mkdir {
        /// Path
        path: PathBuf,
        /// Permission bits
        mode: u32,
    },
    /// Remove an empty directory
    Rmdir {
        /// Path
        path: PathBuf,
    },
    /// Rename a file or directory
    Rename {
        /// Source
        from: PathBuf,
        /// Destination
        to: PathBuf,
    },
    /// List a directory, sorted by name
    Scandir {
        /// Path
        path: PathBuf,
    },
}

impl NativeFsOp {
    /// Operation name for logs
    pub fn name(&self) -> &'static str {
        match self {
            NativeFsOp::Open { .. } => "open",
            NativeFsOp::Close { .. } => "close",
            NativeFsOp::Read { .. } => "read",
            NativeFsOp::Write { .. } => "write",
            NativeFsOp::Stat { .. } => "stat",
            NativeFsOp::Fstat { .. } => "fstat",
            NativeFsOp::Fsync { .. } => "fsync",
            NativeFsOp::Unlink { .. } => "unlink",
            NativeFsOp::Mkdir { .. } => "mkdir",
            NativeFsOp::Rmdir { .. } => "rmdir",
            NativeFsOp::Rename { .. } => "rename",
            NativeFsOp::Scandir { .. } => "scandir",
        }
    }

    /// Reject malformed operations before they are queued
    pub(crate) fn validate(&self) -> Result<(), Errno> {
        let empty = |p: &PathBuf| p.as_os_str().is_empty();
        match self {
            NativeFsOp::Open { path, .. }
            | NativeFsOp::Stat { path }
            | NativeFsOp::Unlink { path }
            | NativeFsOp::Mkdir { path, .. }
            | NativeFsOp::Rmdir { path }
            | NativeFsOp::Scandir { path }
                if empty(path) =>
            {
                Err(Errno::InvalidArgument)
            }
            NativeFsOp::Rename { from, to } if empty(from) || empty(to) => {
                Err(Errno::InvalidArgument)
            }
            NativeFsOp::Read { iov, .. } | NativeFsOp::Write { iov, .. }
                if iov.iter().any(IoVec::is_poisoned) =>
            {
                Err(Errno::InvalidArgument)
            }
            _ => Ok(()),
        }
    }
}

/// Open files keyed by virtual descriptor
pub(crate) struct FdTable {
    next: i64,
    files: HashMap<i64, Arc<File>>,
}

impl Default for FdTable {
    fn default() -> Self {
        Self {
            next: 3,
            files: HashMap::new(),
        }
    }
}

fn lookup(table: &Mutex<FdTable>, file: i64) -> Result<Arc<File>, Errno> {
    table
        .lock()
        .files
        .get(&file)
        .cloned()
        .ok_or(Errno::BadDescriptor)
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, buf, offset)
}

fn open(path: PathBuf, flags: OpenFlags, mode: u32) -> std::io::Result<File> {
    let mut options = flags.options();
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    options.open(path)
}

fn mkdir(path: PathBuf, mode: u32) -> std::io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    builder.create(path)
}

/// Run one operation on the calling thread.
///
/// `Read` and `Write` dereference their `IoVec` lists; the submitter keeps
/// the described memory alive until this returns.
pub(crate) fn execute(table: &Mutex<FdTable>, op: NativeFsOp) -> Result<FsOutcome, Errno> {
    trace!(op = op.name(), "Executing fs operation");
    match op {
        NativeFsOp::Open { path, flags, mode } => {
            let file = open(path, flags, mode)?;
            let mut table = table.lock();
            let fd = table.next;
            table.next += 1;
            table.files.insert(fd, Arc::new(file));
            Ok(FsOutcome::value(fd))
        }
        NativeFsOp::Close { file } => {
            let removed = table.lock().files.remove(&file);
            removed.map(|_| FsOutcome::default()).ok_or(Errno::BadDescriptor)
        }
        NativeFsOp::Read { file, iov, offset } => {
            let file = lookup(table, file)?;
            let mut scratch = vec![0u8; iov.iter().map(IoVec::len).sum()];
            let n = match offset {
                Some(offset) => read_at(&file, &mut scratch, offset)?,
                None => (&*file).read(&mut scratch)?,
            };
            // SAFETY: the submitter keeps the destination arrays alive.
            unsafe { buf::scatter(&iov, &scratch[..n]) };
            Ok(FsOutcome::value(n as i64))
        }
        NativeFsOp::Write { file, iov, offset } => {
            let file = lookup(table, file)?;
            // SAFETY: the submitter keeps the source arrays alive.
            let data = unsafe { buf::gather(&iov) };
            let n = match offset {
                Some(offset) => write_at(&file, &data, offset)?,
                None => (&*file).write(&data)?,
            };
            Ok(FsOutcome::value(n as i64))
        }
        NativeFsOp::Stat { path } => Ok(FsOutcome {
            stat: Some(fs::metadata(path)?.into()),
            ..FsOutcome::default()
        }),
        NativeFsOp::Fstat { file } => Ok(FsOutcome {
            stat: Some(lookup(table, file)?.metadata()?.into()),
            ..FsOutcome::default()
        }),
        NativeFsOp::Fsync { file } => {
            lookup(table, file)?.sync_all()?;
            Ok(FsOutcome::default())
        }
        NativeFsOp::Unlink { path } => {
            fs::remove_file(path)?;
            Ok(FsOutcome::default())
        }
        NativeFsOp::Mkdir { path, mode } => {
            mkdir(path, mode)?;
            Ok(FsOutcome::default())
        }
        NativeFsOp::Rmdir { path } => {
            fs::remove_dir(path)?;
            Ok(FsOutcome::default())
        }
        NativeFsOp::Rename { from, to } => {
            fs::rename(from, to)?;
            Ok(FsOutcome::default())
        }
        NativeFsOp::Scandir { path } => {
            let mut entries = Vec::new();
            for entry in fs::read_dir(path)? {
                let entry = entry?;
                entries.push(DirEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    kind: entry.file_type()?.into(),
                });
            }
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(FsOutcome {
                result: entries.len() as i64,
                entries,
                ..FsOutcome::default()
            })
        }
    }
}
