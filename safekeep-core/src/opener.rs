//! Race-resistant opening of key files.
//!
//! Opening for [`AccessMode::Write`] guarantees that, when the first byte
//! is written, the handle refers to a regular file with a single hard link
//! that was either just created by us or was the very object probed a
//! moment earlier.
//!
//! ```text
//!   probe(path) ── none ──────────▶ create_exclusive ─── exists ──▶ AlreadyExists
//!        │
//!        └── plain file ──▶ open_existing ──▶ identity == probe? ──no──▶ InternalInconsistency
//!                                                      │
//!                                                      └─yes──▶ lock, truncate to 0
//! ```

use std::path::Path;

use log::{debug, warn};
use strum::Display;

use crate::backend::{Backend, BackendFile, CapacityPolicy, Identity, LockMode, RawAccess};
use crate::config::StoreConfig;
use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::handle::StreamHandle;
use crate::lock::{LockCoordinator, LockRequest};

/// How a file is to be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum AccessMode {
    /// Existing file, read-only.
    Read,
    /// Fresh contents: create securely, or truncate a verified existing file.
    Write,
    /// Existing file, read and modify in place.
    ReadWrite,
}

impl AccessMode {
    /// Whether handles in this mode may write.
    #[must_use]
    pub const fn writes(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// Flags for [`SecureOpener::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    pub(crate) access: AccessMode,
    pub(crate) exclusive: bool,
    pub(crate) private: bool,
    pub(crate) sensitive: bool,
}

impl OpenOptions {
    const fn with_access(access: AccessMode) -> Self {
        Self {
            access,
            exclusive: false,
            private: false,
            sensitive: false,
        }
    }

    /// Read an existing file.
    #[must_use]
    pub const fn read() -> Self {
        Self::with_access(AccessMode::Read)
    }

    /// Write fresh contents.
    #[must_use]
    pub const fn write() -> Self {
        Self::with_access(AccessMode::Write)
    }

    /// Modify an existing file in place.
    #[must_use]
    pub const fn read_write() -> Self {
        Self::with_access(AccessMode::ReadWrite)
    }

    /// Request exclusive use: a non-blocking exclusive lock is taken at open
    /// instead of the shared one every other handle takes.
    #[must_use]
    pub const fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Force owner-only permissions on the opened file.
    #[must_use]
    pub const fn private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    /// Mark the contents as key material.
    #[must_use]
    pub const fn sensitive(mut self, sensitive: bool) -> Self {
        self.sensitive = sensitive;
        self
    }

    /// Requested access mode.
    #[must_use]
    pub const fn access(&self) -> AccessMode {
        self.access
    }

    /// Buffer policy derived from the sensitivity flag.
    #[must_use]
    pub const fn capacity(&self) -> CapacityPolicy {
        if self.sensitive {
            CapacityPolicy::Sensitive
        } else {
            CapacityPolicy::Standard
        }
    }
}

/// Opens paths produced by [`crate::PathBuilder`].
#[derive(Debug)]
pub struct SecureOpener<'a, B: Backend> {
    backend: &'a B,
    config: &'a StoreConfig,
}

impl<'a, B: Backend> SecureOpener<'a, B> {
    /// Creates an opener over `backend`.
    #[must_use]
    pub const fn new(backend: &'a B, config: &'a StoreConfig) -> Self {
        Self { backend, config }
    }

    /// Opens `path` according to `options`.
    ///
    /// Any resource acquired before a failing step is released before the
    /// error is returned.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::PermissionDenied`] if a writing mode is requested on a
    ///   path the host reports as not writable.
    /// - [`ErrorKind::AlreadyExists`] if exclusive creation lost a race.
    /// - [`ErrorKind::Open`] if the target is a link, not a regular file, has
    ///   several hard links, or cannot be opened.
    /// - [`ErrorKind::InternalInconsistency`] if the opened object is not the
    ///   probed one.
    /// - [`ErrorKind::Busy`] if the open lock conflicts with another holder:
    ///   any open handle for an exclusive open, an exclusive holder otherwise.
    ///   An existing file opened for [`AccessMode::Write`] is left untouched.
    /// - [`ErrorKind::NotFound`] when reading a file that does not exist.
    pub fn open(&self, path: &Path, options: OpenOptions) -> StoreResult<StreamHandle<B::File>> {
        let capacity = options.capacity();
        if options.access.writes() && !self.backend.is_writable(path) {
            return Err(StoreError::permission_denied(format!(
                "{} is not writable",
                path.display()
            )));
        }

        let (file, truncate) = match options.access {
            AccessMode::Read => (
                self.backend.open_existing(path, RawAccess::Read, capacity)?,
                false,
            ),
            AccessMode::ReadWrite => (
                self.backend
                    .open_existing(path, RawAccess::ReadWrite, capacity)?,
                false,
            ),
            AccessMode::Write => self.open_for_write(path, capacity)?,
        };
        debug!("opened {} for {}", path.display(), options.access);

        let mut handle = StreamHandle::new(file, path, options);
        if let Err(err) = self.finish_open(&mut handle, options, truncate) {
            discard_handle(handle);
            return Err(err);
        }
        Ok(handle)
    }

    /// Permissions, the open lock, then truncation of a verified existing
    /// file. A failed lock leaves the contents untouched.
    fn finish_open(
        &self,
        handle: &mut StreamHandle<B::File>,
        options: OpenOptions,
        truncate: bool,
    ) -> StoreResult<()> {
        let capabilities = self.backend.capabilities();
        let owner_only = options.private || (options.access.writes() && self.config.owner_only_files);
        if owner_only && capabilities.permissions {
            handle.restrict_to_owner()?;
        }

        if self.config.lock_on_open {
            if capabilities.locking.is_none() {
                debug!("host has no locking, {} opened without a lock", handle.path().display());
            } else {
                let mode = if options.exclusive {
                    LockMode::Exclusive
                } else {
                    LockMode::Shared
                };
                LockCoordinator::acquire(handle, LockRequest::new(mode).non_blocking())?;
            }
        }

        if truncate {
            handle.truncate_at(0)?;
        }
        Ok(())
    }

    /// Returns the file and whether it existed before, in which case the
    /// caller still has to truncate it.
    fn open_for_write(
        &self,
        path: &Path,
        capacity: CapacityPolicy,
    ) -> StoreResult<(B::File, bool)> {
        if !self.backend.capabilities().links {
            debug!(
                "host cannot report links, open of {} relies on exclusive creation only",
                path.display()
            );
        }

        let probed = self.backend.probe(path).map_err(|err| match err {
            StoreError::Open { .. } => err,
            other => StoreError::open(format!("probe {}: {other}", path.display())),
        })?;

        match probed {
            None => self
                .backend
                .create_exclusive(path, capacity)
                .map(|file| (file, false))
                .map_err(|err| {
                    if err.kind() == ErrorKind::AlreadyExists {
                        warn!("creation race on {}: object appeared after probe", path.display());
                    }
                    err
                }),
            Some(identity) => self
                .reopen_verified(path, identity, capacity)
                .map(|file| (file, true)),
        }
    }

    fn reopen_verified(
        &self,
        path: &Path,
        probed: Identity,
        capacity: CapacityPolicy,
    ) -> StoreResult<B::File> {
        if !probed.is_plain_file() {
            warn!(
                "refusing to write {}: {} with {} links",
                path.display(),
                probed.kind,
                probed.links
            );
            return Err(StoreError::open(format!(
                "{} is a {} with {} links, expected a plain file",
                path.display(),
                probed.kind,
                probed.links
            )));
        }

        let file = self
            .backend
            .open_existing(path, RawAccess::ReadWrite, capacity)?;

        let opened = match file.identity() {
            Ok(identity) => identity,
            Err(err) => {
                discard_file(file, path);
                return Err(err);
            }
        };
        if !probed.same_object(&opened) || !opened.is_plain_file() {
            warn!(
                "object at {} changed between probe and open (inode {} -> {}, links {} -> {})",
                path.display(),
                probed.inode,
                opened.inode,
                probed.links,
                opened.links
            );
            discard_file(file, path);
            return Err(StoreError::inconsistency(format!(
                "{} was replaced while being opened",
                path.display()
            )));
        }
        Ok(file)
    }
}

fn discard_file<F: BackendFile>(file: F, path: &Path) {
    if let Err(err) = file.close() {
        debug!("release of {} after failed open: {err}", path.display());
    }
}

fn discard_handle<F: BackendFile>(handle: StreamHandle<F>) {
    let path = handle.path().to_path_buf();
    if let Err(err) = handle.close() {
        debug!("release of {} after failed open: {err}", path.display());
    }
}
