//! The owned unit callers hold while working with a file.

use std::path::{Path, PathBuf};

use log::{debug, warn};
use zeroize::Zeroizing;

use crate::backend::{BackendFile, CapacityPolicy, LockMode, Timestamps};
use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::lock::{LockCoordinator, LockRequest};
use crate::opener::{AccessMode, OpenOptions};

const READ_CHUNK: usize = 4096;

/// One open backend resource plus the mode it was opened with.
///
/// Created only by [`crate::SecureOpener::open`]. The resource is released
/// exactly once: by [`StreamHandle::close`], or on drop if the caller never
/// closed it. Any held lock is released first.
#[derive(Debug)]
pub struct StreamHandle<F: BackendFile> {
    file: Option<F>,
    path: PathBuf,
    access: AccessMode,
    exclusive: bool,
    capacity: CapacityPolicy,
    held_lock: Option<LockMode>,
    dirty: bool,
    last_error: Option<ErrorKind>,
}

impl<F: BackendFile> StreamHandle<F> {
    pub(crate) fn new(file: F, path: &Path, options: OpenOptions) -> Self {
        Self {
            file: Some(file),
            path: path.to_path_buf(),
            access: options.access,
            exclusive: options.exclusive,
            capacity: options.capacity(),
            held_lock: None,
            dirty: false,
            last_error: None,
        }
    }

    /// Path this handle was opened on.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Access mode this handle was opened with.
    #[must_use]
    pub const fn access(&self) -> AccessMode {
        self.access
    }

    /// Whether exclusive use was requested at open.
    #[must_use]
    pub const fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Buffer sizing policy of the underlying resource.
    #[must_use]
    pub const fn capacity(&self) -> CapacityPolicy {
        self.capacity
    }

    /// Lock currently held through this handle, if any.
    #[must_use]
    pub const fn held_lock(&self) -> Option<LockMode> {
        self.held_lock
    }

    /// Kind of the most recent failed operation on this handle.
    #[must_use]
    pub const fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    /// Single read into `buf`. Returns `0` at end of file; callers loop.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::ReadFailure`] if the host read fails.
    pub fn read(&mut self, buf: &mut [u8]) -> StoreResult<usize> {
        let result = self.file_mut().and_then(|file| file.read(buf));
        self.record(result)
    }

    /// Reads from the current position to end of file.
    ///
    /// The scratch buffer is wiped before it is released.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::ReadFailure`] if any read fails.
    pub fn read_to_end(&mut self) -> StoreResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = Zeroizing::new(vec![0u8; READ_CHUNK]);
        loop {
            let count = self.read(&mut chunk)?;
            if count == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..count]);
        }
    }

    /// Writes all of `buf` at the current position.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::PermissionDenied`] on a read-only handle and
    /// [`ErrorKind::WriteFailure`] if the write is short or fails.
    pub fn write(&mut self, buf: &[u8]) -> StoreResult<()> {
        self.require_writable("write")?;
        self.dirty = true;
        let result = self.file_mut().and_then(|file| file.write(buf));
        self.record(result)
    }

    /// Moves to absolute `position`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::ReadFailure`] if the host seek fails.
    pub fn seek(&mut self, position: u64) -> StoreResult<()> {
        let result = self.file_mut().and_then(|file| file.seek(position));
        self.record(result)
    }

    /// Current position.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::ReadFailure`] if the host cannot report it.
    pub fn position(&mut self) -> StoreResult<u64> {
        let result = self.file_mut().and_then(BackendFile::position);
        self.record(result)
    }

    /// Commits written data as far as the host allows.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::WriteFailure`] if the host reports a failure.
    pub fn flush(&mut self) -> StoreResult<()> {
        let result = self.file_mut().and_then(BackendFile::flush);
        if result.is_ok() {
            self.dirty = false;
        }
        self.record(result)
    }

    /// Current file size in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::ReadFailure`] if the host cannot stat the file.
    pub fn size(&mut self) -> StoreResult<u64> {
        let result = self.file_mut().and_then(|file| file.current_size());
        self.record(result)
    }

    /// Requests an advisory lock. See [`LockCoordinator::acquire`].
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Busy`] on conflict in non-blocking mode.
    pub fn lock(&mut self, request: LockRequest) -> StoreResult<()> {
        LockCoordinator::acquire(self, request)
    }

    /// Releases the advisory lock held through this handle, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the host refuses the release.
    pub fn unlock(&mut self) -> StoreResult<()> {
        LockCoordinator::release(self)
    }

    /// Releases the lock and the resource.
    ///
    /// Pending data is flushed first. Cleanup continues past individual
    /// failures; the first flush or close failure is reported, since either
    /// means data may not have reached the medium.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::WriteFailure`] on a durability failure.
    pub fn close(mut self) -> StoreResult<()> {
        self.release()
    }

    pub(crate) fn file_mut(&mut self) -> StoreResult<&mut F> {
        self.file
            .as_mut()
            .ok_or_else(|| StoreError::open(format!("{} already closed", self.path.display())))
    }

    pub(crate) fn truncate_at(&mut self, len: u64) -> StoreResult<()> {
        self.require_writable("truncate")?;
        let result = self.file_mut().and_then(|file| file.truncate_at(len));
        self.record(result)
    }

    pub(crate) fn set_timestamps(&mut self, times: Timestamps) -> StoreResult<()> {
        let result = self.file_mut().and_then(|file| file.set_timestamps(times));
        self.record(result)
    }

    pub(crate) fn restrict_to_owner(&mut self) -> StoreResult<()> {
        let result = self.file_mut().and_then(BackendFile::restrict_to_owner);
        self.record(result)
    }

    pub(crate) fn set_held_lock(&mut self, mode: Option<LockMode>) {
        self.held_lock = mode;
    }

    pub(crate) fn record<T>(&mut self, result: StoreResult<T>) -> StoreResult<T> {
        if let Err(err) = &result {
            self.last_error = Some(err.kind());
        }
        result
    }

    fn require_writable(&mut self, operation: &str) -> StoreResult<()> {
        if self.access.writes() {
            return Ok(());
        }
        let err = StoreError::permission_denied(format!(
            "{operation} on read-only handle for {}",
            self.path.display()
        ));
        self.record(Err(err))
    }

    fn release(&mut self) -> StoreResult<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };

        let mut outcome = Ok(());
        if self.dirty {
            if let Err(err) = file.flush() {
                warn!("flush before close of {} failed: {err}", self.path.display());
                outcome = Err(err);
            }
        }
        if self.held_lock.take().is_some() {
            if let Err(err) = file.unlock() {
                warn!("unlock before close of {} failed: {err}", self.path.display());
            }
        }
        if let Err(err) = file.close() {
            warn!("close of {} failed: {err}", self.path.display());
            if outcome.is_ok() {
                outcome = Err(err);
            }
        }
        debug!("closed {}", self.path.display());
        outcome
    }
}

impl<F: BackendFile> Drop for StreamHandle<F> {
    fn drop(&mut self) {
        if self.file.is_some() {
            if let Err(err) = self.release() {
                warn!("implicit close of {} failed: {err}", self.path.display());
            }
        }
    }
}
