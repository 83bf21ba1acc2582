//! Destruction of file contents.
//!
//! The data is overwritten with fresh random bytes for every chunk, flushed,
//! and the file truncated. Path erase also resets the timestamps and deletes
//! the directory entry.
//!
//! This is not a guarantee against wear-levelled flash, log-structured or
//! journalling filesystems, or snapshots: the overwrite may land on different
//! physical blocks than the original data.

use std::path::Path;

use log::{debug, warn};
use zeroize::Zeroizing;

use crate::backend::{Backend, Timestamps};
use crate::config::StoreConfig;
use crate::entropy::EntropySource;
use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::handle::StreamHandle;
use crate::opener::{OpenOptions, SecureOpener};

/// Overwrites, truncates and deletes files.
pub struct SecureEraser<'a, B: Backend> {
    backend: &'a B,
    config: &'a StoreConfig,
    entropy: &'a dyn EntropySource,
}

impl<'a, B: Backend> SecureEraser<'a, B> {
    /// Creates an eraser drawing fill bytes from `entropy`.
    #[must_use]
    pub fn new(backend: &'a B, config: &'a StoreConfig, entropy: &'a dyn EntropySource) -> Self {
        Self {
            backend,
            config,
            entropy,
        }
    }

    /// Overwrites `[position, EOF)` and truncates the file to `position`.
    ///
    /// Nothing happens if the file is not longer than `position`. The handle
    /// is left positioned at `position`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidInput`] for a zero wipe chunk size,
    /// before anything is touched. Otherwise returns the first failure;
    /// truncation is still attempted after a failed overwrite.
    pub fn erase_to_eof(
        &self,
        handle: &mut StreamHandle<B::File>,
        position: u64,
    ) -> StoreResult<()> {
        let chunk_size = self.chunk_size()?;
        let size = handle.size()?;
        if size <= position {
            return Ok(());
        }

        let wiped = self.overwrite(handle, position, size - position, chunk_size);
        let truncated = handle
            .truncate_at(position)
            .and_then(|()| handle.seek(position));
        wiped?;
        truncated
    }

    /// Destroys the file at `path`: overwrite, truncate, reset timestamps,
    /// close, delete.
    ///
    /// A missing file is a no-op. When the file cannot be opened for any
    /// other reason the directory entry is still removed, best effort, and
    /// the open error returned. The delete step never fails the call.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidInput`] for a zero wipe chunk size, with
    /// the file left in place. Otherwise returns the open error, or the
    /// overwrite or close failure. Even then the directory entry has been
    /// removed where the host allowed it.
    pub fn erase(&self, path: &Path) -> StoreResult<()> {
        self.chunk_size()?;
        debug!("erasing {}", path.display());

        match self.backend.probe(path) {
            Ok(Some(identity)) if !identity.is_plain_file() => {
                // Overwriting through a link or a shared inode would destroy
                // data belonging to another name.
                warn!(
                    "not overwriting {}: {} with {} links, removing the entry only",
                    path.display(),
                    identity.kind,
                    identity.links
                );
                self.delete_best_effort(path);
                return Err(StoreError::open(format!(
                    "{} is not a plain file, contents not wiped",
                    path.display()
                )));
            }
            Ok(_) | Err(_) => {}
        }

        let opener = SecureOpener::new(self.backend, self.config);
        let mut handle = match opener.open(path, OpenOptions::read_write().exclusive(true)) {
            Ok(handle) => handle,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.delete_best_effort(path);
                return Ok(());
            }
            Err(err) => {
                warn!("cannot open {} for erase: {err}", path.display());
                self.delete_best_effort(path);
                return Err(err);
            }
        };

        let wiped = self.erase_to_eof(&mut handle, 0);
        if self.backend.capabilities().timestamps {
            if let Err(err) = handle.set_timestamps(Timestamps::epoch()) {
                debug!("timestamp reset on {} failed: {err}", path.display());
            }
        }
        let closed = handle.close();
        self.delete_best_effort(path);

        wiped?;
        closed
    }

    fn overwrite(
        &self,
        handle: &mut StreamHandle<B::File>,
        position: u64,
        length: u64,
        chunk_size: usize,
    ) -> StoreResult<()> {
        handle.seek(position)?;

        let mut scratch = Zeroizing::new(vec![0u8; chunk_size]);
        let mut remaining = length;
        while remaining > 0 {
            let count = usize::try_from(remaining).map_or(chunk_size, |left| left.min(chunk_size));
            let chunk = &mut scratch[..count];
            self.entropy.fill(chunk)?;
            handle.write(chunk)?;
            remaining -= count as u64;
        }
        handle.flush()
    }

    /// The configured chunk size. The eraser can be built from a config
    /// that never went through [`StoreConfig::validate`].
    fn chunk_size(&self) -> StoreResult<usize> {
        match self.config.wipe_chunk_size {
            0 => Err(StoreError::invalid_input("wipe_chunk_size", "must be non-zero")),
            size => Ok(size),
        }
    }

    fn delete_best_effort(&self, path: &Path) {
        match self.backend.delete_by_path(path) {
            Ok(()) => debug!("deleted {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("delete of {} failed: {err}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::backend::MemoryBackend;
    use crate::tests_utils::CountingEntropy;

    const KEY: &str = "/memory/safekeep/key.p15";

    fn setup(contents: &[u8]) -> (MemoryBackend, StoreConfig, PathBuf) {
        let backend = MemoryBackend::new();
        backend.insert_file(KEY, contents);
        (
            backend,
            StoreConfig::default().with_wipe_chunk_size(4),
            PathBuf::from(KEY),
        )
    }

    #[test]
    fn test_erase_to_eof_refills_every_chunk() {
        let (backend, config, path) = setup(b"header:secret-bytes");
        let entropy = CountingEntropy::default();
        let eraser = SecureEraser::new(&backend, &config, &entropy);
        let mut handle = SecureOpener::new(&backend, &config)
            .open(&path, OpenOptions::read_write())
            .expect("open");

        eraser.erase_to_eof(&mut handle, 7).expect("erase tail");
        assert_eq!(backend.contents(&path).expect("contents"), b"header:");
        assert_eq!(handle.position().expect("position"), 7);
        // 12 bytes in chunks of 4
        assert_eq!(entropy.fills(), 3);
        assert_eq!(backend.write_count(), 3);
    }

    #[test]
    fn test_erase_to_eof_past_end_is_noop() {
        let (backend, config, path) = setup(b"short");
        let entropy = CountingEntropy::default();
        let mut handle = SecureOpener::new(&backend, &config)
            .open(&path, OpenOptions::read_write())
            .expect("open");
        SecureEraser::new(&backend, &config, &entropy)
            .erase_to_eof(&mut handle, 5)
            .expect("noop");
        assert_eq!(backend.write_count(), 0);
        assert_eq!(backend.contents(&path).expect("contents"), b"short");
    }

    #[test]
    fn test_erase_removes_file() {
        let (backend, config, path) = setup(b"private key material");
        let entropy = CountingEntropy::default();
        SecureEraser::new(&backend, &config, &entropy)
            .erase(&path)
            .expect("erase");
        assert!(backend.contents(&path).is_none());
        assert_eq!(backend.object_count(), 0);
        assert_eq!(backend.write_count(), 5);
    }

    #[test]
    fn test_erase_missing_is_noop_without_writes() {
        let backend = MemoryBackend::new();
        let config = StoreConfig::default();
        let entropy = CountingEntropy::default();
        SecureEraser::new(&backend, &config, &entropy)
            .erase(Path::new(KEY))
            .expect("missing is fine");
        assert_eq!(backend.write_count(), 0);
        assert_eq!(entropy.fills(), 0);
    }

    #[test]
    fn test_erase_write_failure_still_deletes() {
        let (backend, config, path) = setup(b"secret");
        backend.set_fail_writes(true);
        let entropy = CountingEntropy::default();
        let err = SecureEraser::new(&backend, &config, &entropy)
            .erase(&path)
            .expect_err("write failure surfaces");
        assert_eq!(err.kind(), ErrorKind::WriteFailure);
        assert!(backend.contents(&path).is_none());
    }

    #[test]
    fn test_erase_busy_file_is_unlinked_and_reported() {
        let (backend, config, path) = setup(b"secret");
        let holder = SecureOpener::new(&backend, &config)
            .open(&path, OpenOptions::read().exclusive(true))
            .expect("holder");
        let entropy = CountingEntropy::default();
        let err = SecureEraser::new(&backend, &config, &entropy)
            .erase(&path)
            .expect_err("busy");
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert!(backend.probe(&path).expect("probe").is_none());
        drop(holder);
    }

    #[test]
    fn test_zero_chunk_is_rejected_before_touching_file() {
        let (backend, _, path) = setup(b"secret");
        let config = StoreConfig::default().with_wipe_chunk_size(0);
        let entropy = CountingEntropy::default();
        let eraser = SecureEraser::new(&backend, &config, &entropy);

        let err = eraser.erase(&path).expect_err("zero chunk");
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(backend.contents(&path).expect("still there"), b"secret");

        let mut handle = SecureOpener::new(&backend, &config)
            .open(&path, OpenOptions::read_write())
            .expect("open");
        let err = eraser.erase_to_eof(&mut handle, 0).expect_err("zero chunk");
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(backend.contents(&path).expect("contents"), b"secret");
        assert_eq!(backend.write_count(), 0);
        assert_eq!(entropy.fills(), 0);
    }
}
