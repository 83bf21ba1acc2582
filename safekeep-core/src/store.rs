//! Entry point tying one backend to the path, open, lock and erase logic.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::{Backend, Capabilities};
use crate::config::StoreConfig;
use crate::entropy::{EntropySource, OsEntropy};
use crate::error::StoreResult;
use crate::eraser::SecureEraser;
use crate::handle::StreamHandle;
use crate::opener::{OpenOptions, SecureOpener};
use crate::paths::{PathBuildOption, PathBuilder};

/// Secure file store over a single injected backend.
///
/// # Example
///
/// ```
/// use safekeep_core::backend::MemoryBackend;
/// use safekeep_core::{OpenOptions, PathBuildOption, SecureStore, StoreConfig};
///
/// let store = SecureStore::new(MemoryBackend::new(), StoreConfig::default()).unwrap();
/// let path = store.build_path(PathBuildOption::CreateNamed("userkey")).unwrap();
///
/// let mut handle = store.open(&path, OpenOptions::write().sensitive(true)).unwrap();
/// handle.write(b"key material").unwrap();
/// handle.close().unwrap();
///
/// store.erase(&path).unwrap();
/// ```
pub struct SecureStore<B: Backend> {
    backend: B,
    config: StoreConfig,
    entropy: Arc<dyn EntropySource>,
}

impl<B: Backend> SecureStore<B> {
    /// Creates a store over `backend` using OS randomness for wipes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::InvalidInput`] if `config` is invalid.
    pub fn new(backend: B, config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            config,
            entropy: Arc::new(OsEntropy),
        })
    }

    /// Replaces the source of wipe fill bytes.
    #[must_use]
    pub fn with_entropy(mut self, entropy: Arc<dyn EntropySource>) -> Self {
        self.entropy = entropy;
        self
    }

    /// The injected backend.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// What the backend can enforce, including its locking model.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.backend.capabilities()
    }

    /// Path builder over this store's backend.
    #[must_use]
    pub const fn paths(&self) -> PathBuilder<'_, B> {
        PathBuilder::new(&self.backend, &self.config)
    }

    /// Opener over this store's backend.
    #[must_use]
    pub const fn opener(&self) -> SecureOpener<'_, B> {
        SecureOpener::new(&self.backend, &self.config)
    }

    /// Eraser over this store's backend.
    #[must_use]
    pub fn eraser(&self) -> SecureEraser<'_, B> {
        SecureEraser::new(&self.backend, &self.config, self.entropy.as_ref())
    }

    /// See [`PathBuilder::build`].
    ///
    /// # Errors
    ///
    /// Returns `Overflow`, `Open` or `InvalidInput`.
    pub fn build_path(&self, option: PathBuildOption<'_>) -> StoreResult<PathBuf> {
        self.paths().build(option)
    }

    /// See [`SecureOpener::open`].
    ///
    /// # Errors
    ///
    /// See [`SecureOpener::open`].
    pub fn open(&self, path: &Path, options: OpenOptions) -> StoreResult<StreamHandle<B::File>> {
        self.opener().open(path, options)
    }

    /// Advisory writability check. The answer may be stale by the time the
    /// path is opened.
    #[must_use]
    pub fn is_writable(&self, path: &Path) -> bool {
        self.backend.is_writable(path)
    }

    /// See [`SecureEraser::erase_to_eof`].
    ///
    /// # Errors
    ///
    /// Returns the first overwrite or truncate failure.
    pub fn erase_to_eof(&self, handle: &mut StreamHandle<B::File>, position: u64) -> StoreResult<()> {
        self.eraser().erase_to_eof(handle, position)
    }

    /// See [`SecureEraser::erase`].
    ///
    /// # Errors
    ///
    /// Returns the open, overwrite or close failure.
    pub fn erase(&self, path: &Path) -> StoreResult<()> {
        self.eraser().erase(path)
    }
}

#[cfg(unix)]
impl SecureStore<crate::backend::UnixBackend> {
    /// Creates a store over the POSIX filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::InvalidInput`] if `config` is invalid.
    pub fn native(config: StoreConfig) -> StoreResult<Self> {
        Self::new(crate::backend::UnixBackend::new(), config)
    }
}
