//! Host backend abstraction.
//!
//! Everything above this module is written against [`Backend`] and
//! [`BackendFile`] only. A host provides exactly one implementation:
//!
//! - [`UnixBackend`]: POSIX filesystems (`O_NOFOLLOW`, `O_EXCL`, `flock`)
//! - [`MemoryBackend`]: hosts without a conventional filesystem, and tests
//!
//! # Contract
//!
//! - No primitive substitutes a different path than the one supplied.
//! - [`Backend::create_exclusive`] fails with
//!   [`ErrorKind::AlreadyExists`](crate::ErrorKind::AlreadyExists) if anything
//!   occupies the path, including a symbolic link.
//! - Hosts without links, permissions or multiple processes still implement
//!   every primitive and describe what they cannot check in
//!   [`Capabilities`].

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use strum::Display;

use crate::error::StoreResult;

pub mod memory;
#[cfg(unix)]
pub mod unix;

pub use memory::MemoryBackend;
#[cfg(unix)]
pub use unix::UnixBackend;

/// How an existing file is opened by [`Backend::open_existing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum RawAccess {
    /// Read-only.
    Read,
    /// Read and write, in place.
    ReadWrite,
}

/// Object type as reported by a link-aware probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum NodeKind {
    /// A regular file.
    Regular,
    /// A directory.
    Directory,
    /// A symbolic link (never followed).
    Symlink,
    /// Anything else: devices, FIFOs, sockets.
    Other,
}

/// Identity of a storage object, compared across the probe/open window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    /// Device the object lives on.
    pub device: u64,
    /// Object number on that device.
    pub inode: u64,
    /// Raw mode bits, including the type bits.
    pub mode: u32,
    /// Number of hard links.
    pub links: u64,
    /// Decoded object type.
    pub kind: NodeKind,
}

impl Identity {
    /// Returns `true` if `other` refers to the same object with the same
    /// mode and link count.
    #[must_use]
    pub fn same_object(&self, other: &Self) -> bool {
        self.device == other.device
            && self.inode == other.inode
            && self.mode == other.mode
            && self.links == other.links
    }

    /// Returns `true` for a regular file with exactly one hard link.
    #[must_use]
    pub fn is_plain_file(&self) -> bool {
        self.kind == NodeKind::Regular && self.links == 1
    }
}

/// Lock release semantics of a backend.
///
/// A backend picks exactly one. The choice changes safe usage: under
/// [`LockingModel::AnyCloseReleases`] keeping a secondary handle open "just in
/// case" is unsafe, since closing it drops every lock on the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum LockingModel {
    /// Locks belong to the open resource and survive the close of any
    /// other resource referring to the same object.
    LastCloseReleases,
    /// Closing any resource referring to the object releases every lock on
    /// it, including locks held through resources that are still open.
    AnyCloseReleases,
}

/// What the host can and cannot enforce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// The host has symbolic links and the backend can detect them.
    pub links: bool,
    /// The host has owner/permission bits.
    pub permissions: bool,
    /// The host stores mutable access/modification times.
    pub timestamps: bool,
    /// Lock semantics, or `None` if the host has no locking at all.
    pub locking: Option<LockingModel>,
}

/// Lock mode requested from a backend resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum LockMode {
    /// Many holders, no exclusive holder.
    Shared,
    /// A single holder.
    Exclusive,
}

/// Timestamp values applied by [`BackendFile::set_timestamps`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamps {
    /// Last access time.
    pub accessed: SystemTime,
    /// Last modification time.
    pub modified: SystemTime,
}

impl Timestamps {
    /// The sentinel applied when wiping: the Unix epoch.
    #[must_use]
    pub const fn epoch() -> Self {
        Self {
            accessed: SystemTime::UNIX_EPOCH,
            modified: SystemTime::UNIX_EPOCH,
        }
    }
}

/// Buffer sizing policy for hosts that keep file data resident in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[strum(serialize_all = "snake_case")]
pub enum CapacityPolicy {
    /// Ordinary data.
    #[default]
    Standard,
    /// Key material: pre-size so growth rarely reallocates, and scrub
    /// buffers before they are released.
    Sensitive,
}

impl CapacityPolicy {
    /// Initial buffer capacity in bytes.
    #[must_use]
    pub const fn initial_capacity(self) -> usize {
        match self {
            Self::Standard => 4096,
            // Typical private keys with certificate chains are around 2K.
            Self::Sensitive => 16 * 1024,
        }
    }

    /// Whether released buffers must be zeroized.
    #[must_use]
    pub const fn scrub_on_release(self) -> bool {
        matches!(self, Self::Sensitive)
    }
}

/// Path-level primitives of a host.
pub trait Backend: Send + Sync {
    /// Resource type produced by this backend.
    type File: BackendFile;

    /// Describes what this host can enforce.
    fn capabilities(&self) -> Capabilities;

    /// Preferred per-user location for application `app_dir`, if the host
    /// can determine one.
    fn default_root(&self, app_dir: &str) -> Option<PathBuf>;

    /// Always-present fallback location for application `app_dir`.
    fn fallback_root(&self, app_dir: &str) -> Option<PathBuf>;

    /// Returns `true` if `path` exists and is a directory.
    fn dir_exists(&self, path: &Path) -> bool;

    /// Creates `path` as an owner-only directory. Succeeds if it already
    /// exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    fn create_private_dir(&self, path: &Path) -> StoreResult<()>;

    /// Link-aware probe. `Ok(None)` means nothing exists at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error for any probe failure other than "does not exist".
    fn probe(&self, path: &Path) -> StoreResult<Option<Identity>>;

    /// Creates `path` for read-write access, atomically failing if anything
    /// already exists there. Links are never followed. New files are
    /// owner-only where the host has permissions.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::AlreadyExists`](crate::ErrorKind::AlreadyExists)
    /// if the path is occupied, or another error if creation fails.
    fn create_exclusive(&self, path: &Path, capacity: CapacityPolicy) -> StoreResult<Self::File>;

    /// Opens an existing object without following a final link.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NotFound`](crate::ErrorKind::NotFound) if the
    /// path does not exist, or another error if the open fails.
    fn open_existing(
        &self,
        path: &Path,
        access: RawAccess,
        capacity: CapacityPolicy,
    ) -> StoreResult<Self::File>;

    /// Removes the directory entry at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be removed.
    fn delete_by_path(&self, path: &Path) -> StoreResult<()>;

    /// Advisory writability check. A path that does not exist is writable.
    fn is_writable(&self, path: &Path) -> bool;
}

/// Resource-level primitives. Each call touches only its own resource.
pub trait BackendFile: Send {
    /// Identity of the opened object, without going back through the path.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot stat the resource.
    fn identity(&self) -> StoreResult<Identity>;

    /// Single read into `buf`. Returns the number of bytes read; `0` at EOF.
    ///
    /// # Errors
    ///
    /// Returns a read failure.
    fn read(&mut self, buf: &mut [u8]) -> StoreResult<usize>;

    /// Writes all of `buf` or fails.
    ///
    /// # Errors
    ///
    /// Returns a write failure, including on a short write.
    fn write(&mut self, buf: &[u8]) -> StoreResult<()>;

    /// Moves the position to `position` bytes from the start.
    ///
    /// # Errors
    ///
    /// Returns a read failure.
    fn seek(&mut self, position: u64) -> StoreResult<()>;

    /// Current position.
    ///
    /// # Errors
    ///
    /// Returns a read failure.
    fn position(&mut self) -> StoreResult<u64>;

    /// Commits written data to the backing medium, as far as the host allows.
    ///
    /// # Errors
    ///
    /// Returns a write failure.
    fn flush(&mut self) -> StoreResult<()>;

    /// Current size in bytes.
    ///
    /// # Errors
    ///
    /// Returns a read failure.
    fn current_size(&self) -> StoreResult<u64>;

    /// Truncates to `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns a write failure.
    fn truncate_at(&mut self, len: u64) -> StoreResult<()>;

    /// Applies `times` through the resource.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Unsupported`](crate::ErrorKind::Unsupported) on
    /// hosts without timestamps, or a write failure.
    fn set_timestamps(&mut self, times: Timestamps) -> StoreResult<()>;

    /// Restricts the object to its owner.
    ///
    /// # Errors
    ///
    /// Returns an error if the host refuses the change.
    fn restrict_to_owner(&mut self) -> StoreResult<()>;

    /// Requests an advisory lock.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Busy`](crate::ErrorKind::Busy) on conflict when
    /// `blocking` is `false`, or
    /// [`ErrorKind::Timeout`](crate::ErrorKind::Timeout) if a blocking wait
    /// was interrupted.
    fn lock(&mut self, mode: LockMode, blocking: bool) -> StoreResult<()>;

    /// Releases any advisory lock held through this resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the host refuses the release.
    fn unlock(&mut self) -> StoreResult<()>;

    /// Releases the resource.
    ///
    /// # Errors
    ///
    /// Returns a write failure if the host reports a deferred error at
    /// close time.
    fn close(self) -> StoreResult<()>;
}
