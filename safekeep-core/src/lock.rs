//! Advisory locking on open handles.
//!
//! Locks are best-effort mutual exclusion between cooperating processes.
//! Which resource closes release a lock depends on the backend's
//! [`LockingModel`](crate::backend::LockingModel):
//!
//! - `LastCloseReleases` (POSIX `flock`): only closing the locking handle
//!   releases it.
//! - `AnyCloseReleases` (memory backend, POSIX record locks): closing *any*
//!   handle on the same object releases every lock on it. Do not keep a
//!   second handle open on a locked file.
//!
//! Neither model stops a process that ignores locks, and network
//! filesystems often do not implement them at all.

use std::ops::{Deref, DerefMut};

use log::{debug, warn};

use crate::backend::{BackendFile, LockMode};
use crate::error::{StoreError, StoreResult};
use crate::handle::StreamHandle;

/// A lock request: mode plus whether to wait for conflicting holders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRequest {
    /// Shared or exclusive.
    pub mode: LockMode,
    /// Wait for conflicting holders instead of failing with `Busy`.
    pub blocking: bool,
}

impl LockRequest {
    /// Blocking request for `mode`.
    #[must_use]
    pub const fn new(mode: LockMode) -> Self {
        Self {
            mode,
            blocking: true,
        }
    }

    /// Blocking shared request.
    #[must_use]
    pub const fn shared() -> Self {
        Self::new(LockMode::Shared)
    }

    /// Blocking exclusive request.
    #[must_use]
    pub const fn exclusive() -> Self {
        Self::new(LockMode::Exclusive)
    }

    /// Fail with `Busy` instead of waiting.
    #[must_use]
    pub const fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }
}

/// Requests and releases advisory locks on [`StreamHandle`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockCoordinator;

impl LockCoordinator {
    /// Acquires `request` on `handle`.
    ///
    /// Requesting the mode already held is a no-op. A handle holding the
    /// other mode must [`release`](Self::release) first: shared and
    /// exclusive locks are never converted into each other.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::Busy`](crate::ErrorKind::Busy) on conflict in
    ///   non-blocking mode.
    /// - [`ErrorKind::Timeout`](crate::ErrorKind::Timeout) if a blocking
    ///   wait was interrupted.
    /// - [`ErrorKind::InvalidInput`](crate::ErrorKind::InvalidInput) if the
    ///   handle already holds the other mode.
    pub fn acquire<F: BackendFile>(
        handle: &mut StreamHandle<F>,
        request: LockRequest,
    ) -> StoreResult<()> {
        match handle.held_lock() {
            Some(held) if held == request.mode => return Ok(()),
            Some(held) => {
                let err = StoreError::invalid_input(
                    "lock",
                    format!(
                        "handle holds a {held} lock, release it before requesting {}",
                        request.mode
                    ),
                );
                return handle.record(Err(err));
            }
            None => {}
        }

        let result = handle
            .file_mut()
            .and_then(|file| file.lock(request.mode, request.blocking));
        handle.record(result)?;
        handle.set_held_lock(Some(request.mode));
        debug!("{} lock acquired on {}", request.mode, handle.path().display());
        Ok(())
    }

    /// Releases whatever lock `handle` holds. No-op if it holds none.
    ///
    /// # Errors
    ///
    /// Returns an error if the host refuses the release.
    pub fn release<F: BackendFile>(handle: &mut StreamHandle<F>) -> StoreResult<()> {
        let Some(held) = handle.held_lock() else {
            return Ok(());
        };
        let result = handle.file_mut().and_then(BackendFile::unlock);
        handle.record(result)?;
        handle.set_held_lock(None);
        debug!("{held} lock released on {}", handle.path().display());
        Ok(())
    }

    /// Acquires `request` and returns a guard that releases it on drop.
    ///
    /// # Errors
    ///
    /// Same as [`acquire`](Self::acquire).
    pub fn guard<F: BackendFile>(
        handle: &mut StreamHandle<F>,
        request: LockRequest,
    ) -> StoreResult<LockGuard<'_, F>> {
        Self::acquire(handle, request)?;
        Ok(LockGuard { handle })
    }
}

/// Holds a lock on a borrowed handle for the guard's lifetime.
#[derive(Debug)]
pub struct LockGuard<'h, F: BackendFile> {
    handle: &'h mut StreamHandle<F>,
}

impl<F: BackendFile> Deref for LockGuard<'_, F> {
    type Target = StreamHandle<F>;

    fn deref(&self) -> &Self::Target {
        &*self.handle
    }
}

impl<F: BackendFile> DerefMut for LockGuard<'_, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.handle
    }
}

impl<F: BackendFile> Drop for LockGuard<'_, F> {
    fn drop(&mut self) {
        if let Err(err) = LockCoordinator::release(self.handle) {
            warn!("lock release on {} failed: {err}", self.handle.path().display());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::StoreConfig;
    use crate::error::ErrorKind;
    use crate::opener::{OpenOptions, SecureOpener};

    const KEY: &str = "/memory/safekeep/key.p15";

    /// Handles start without a lock so the tests drive locking themselves.
    fn manual_locking() -> StoreConfig {
        StoreConfig::default().with_lock_on_open(false)
    }

    #[test]
    fn test_lock_is_exclusive() {
        let backend = MemoryBackend::new();
        backend.insert_file(KEY, b"data");
        let config = manual_locking();
        let opener = SecureOpener::new(&backend, &config);

        let mut a = opener.open(Path::new(KEY), OpenOptions::read()).expect("open a");
        let mut b = opener.open(Path::new(KEY), OpenOptions::read()).expect("open b");

        a.lock(LockRequest::exclusive().non_blocking()).expect("lock a");
        let err = b
            .lock(LockRequest::exclusive().non_blocking())
            .expect_err("second exclusive");
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert_eq!(b.held_lock(), None);
        assert_eq!(b.last_error(), Some(ErrorKind::Busy));

        a.unlock().expect("unlock");
        b.lock(LockRequest::exclusive().non_blocking())
            .expect("lock b after release");
    }

    #[test]
    fn test_same_mode_is_noop_and_no_silent_conversion() {
        let backend = MemoryBackend::new();
        backend.insert_file(KEY, b"data");
        let config = manual_locking();
        let mut handle = SecureOpener::new(&backend, &config)
            .open(Path::new(KEY), OpenOptions::read())
            .expect("open");

        handle.lock(LockRequest::shared()).expect("shared");
        handle.lock(LockRequest::shared()).expect("again");
        let err = handle
            .lock(LockRequest::exclusive())
            .expect_err("conversion refused");
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(handle.held_lock(), Some(LockMode::Shared));

        handle.unlock().expect("unlock");
        handle.lock(LockRequest::exclusive()).expect("exclusive");
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let backend = MemoryBackend::new();
        backend.insert_file(KEY, b"data");
        let config = manual_locking();
        let opener = SecureOpener::new(&backend, &config);
        let mut a = opener.open(Path::new(KEY), OpenOptions::read()).expect("open a");
        let mut b = opener.open(Path::new(KEY), OpenOptions::read()).expect("open b");

        {
            let mut guard =
                LockCoordinator::guard(&mut a, LockRequest::exclusive()).expect("guard");
            assert_eq!(guard.read_to_end().expect("read"), b"data");
            let err = b
                .lock(LockRequest::shared().non_blocking())
                .expect_err("held by guard");
            assert_eq!(err.kind(), ErrorKind::Busy);
        }

        assert_eq!(a.held_lock(), None);
        b.lock(LockRequest::shared().non_blocking())
            .expect("free after guard");
    }

    #[cfg(unix)]
    #[test]
    fn test_lock_serializes_across_threads() {
        use crate::backend::UnixBackend;
        use crate::tests_utils::temp_dir;

        let dir = temp_dir();
        let path = dir.path().join("shared.p15");
        let backend = UnixBackend::new();
        let config = manual_locking();
        SecureOpener::new(&backend, &config)
            .open(&path, OpenOptions::write())
            .expect("create")
            .close()
            .expect("close");

        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let (released_tx, released_rx) = std::sync::mpsc::channel();

        let thread_path = path.clone();
        let thread_a = std::thread::spawn(move || {
            let backend = UnixBackend::new();
            let config = manual_locking();
            let mut handle = SecureOpener::new(&backend, &config)
                .open(&thread_path, OpenOptions::read())
                .expect("open in thread");
            handle.lock(LockRequest::exclusive()).expect("lock in thread");
            locked_tx.send(()).expect("signal locked");
            release_rx.recv().expect("wait release");
            handle.close().expect("close in thread");
            released_tx.send(()).expect("signal released");
        });

        locked_rx.recv().expect("wait locked");
        let mut handle = SecureOpener::new(&backend, &config)
            .open(&path, OpenOptions::read())
            .expect("open");
        let err = handle
            .lock(LockRequest::exclusive().non_blocking())
            .expect_err("held by thread");
        assert_eq!(err.kind(), ErrorKind::Busy);

        release_tx.send(()).expect("release");
        released_rx.recv().expect("wait released");

        handle
            .lock(LockRequest::exclusive().non_blocking())
            .expect("lock after thread closed");
        thread_a.join().expect("thread join");
    }
}
