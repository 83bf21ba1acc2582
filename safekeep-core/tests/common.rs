//! Common test utilities shared across integration tests.

#![allow(missing_docs, reason = "shared test helpers")]

use std::path::{Path, PathBuf};

use safekeep_core::backend::{
    Backend, Capabilities, CapacityPolicy, Identity, MemoryBackend, RawAccess,
};
use safekeep_core::{SecureStore, StoreConfig, StoreResult};
use uuid::Uuid;

type Hook = Box<dyn Fn(&Path) + Send + Sync>;

/// Wraps a backend and runs a hook just before a primitive reaches it.
///
/// Simulates an attacker winning the window between probe and open, or
/// observes the file right before it is deleted.
#[allow(dead_code, reason = "used in tests")]
pub struct HookedBackend<B> {
    inner: B,
    before_open: Option<Hook>,
    before_create: Option<Hook>,
    before_delete: Option<Hook>,
}

#[allow(dead_code, reason = "used in tests")]
impl<B: Backend> HookedBackend<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            before_open: None,
            before_create: None,
            before_delete: None,
        }
    }

    pub fn before_open(mut self, hook: impl Fn(&Path) + Send + Sync + 'static) -> Self {
        self.before_open = Some(Box::new(hook));
        self
    }

    pub fn before_create(mut self, hook: impl Fn(&Path) + Send + Sync + 'static) -> Self {
        self.before_create = Some(Box::new(hook));
        self
    }

    pub fn before_delete(mut self, hook: impl Fn(&Path) + Send + Sync + 'static) -> Self {
        self.before_delete = Some(Box::new(hook));
        self
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }
}

impl<B: Backend> Backend for HookedBackend<B> {
    type File = B::File;

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn default_root(&self, app_dir: &str) -> Option<PathBuf> {
        self.inner.default_root(app_dir)
    }

    fn fallback_root(&self, app_dir: &str) -> Option<PathBuf> {
        self.inner.fallback_root(app_dir)
    }

    fn dir_exists(&self, path: &Path) -> bool {
        self.inner.dir_exists(path)
    }

    fn create_private_dir(&self, path: &Path) -> StoreResult<()> {
        self.inner.create_private_dir(path)
    }

    fn probe(&self, path: &Path) -> StoreResult<Option<Identity>> {
        self.inner.probe(path)
    }

    fn create_exclusive(&self, path: &Path, capacity: CapacityPolicy) -> StoreResult<B::File> {
        if let Some(hook) = &self.before_create {
            hook(path);
        }
        self.inner.create_exclusive(path, capacity)
    }

    fn open_existing(
        &self,
        path: &Path,
        access: RawAccess,
        capacity: CapacityPolicy,
    ) -> StoreResult<B::File> {
        if let Some(hook) = &self.before_open {
            hook(path);
        }
        self.inner.open_existing(path, access, capacity)
    }

    fn delete_by_path(&self, path: &Path) -> StoreResult<()> {
        if let Some(hook) = &self.before_delete {
            hook(path);
        }
        self.inner.delete_by_path(path)
    }

    fn is_writable(&self, path: &Path) -> bool {
        self.inner.is_writable(path)
    }
}

#[allow(dead_code, reason = "used in tests")]
pub fn temp_root() -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("safekeep-test-{}", Uuid::new_v4()));
    path
}

#[allow(dead_code, reason = "used in tests")]
pub fn cleanup_root(root: &Path) {
    let _ = std::fs::remove_dir_all(root);
}

#[allow(dead_code, reason = "used in tests")]
pub fn memory_store() -> SecureStore<MemoryBackend> {
    SecureStore::new(MemoryBackend::new(), StoreConfig::default()).expect("memory store")
}

#[cfg(unix)]
#[allow(dead_code, reason = "used in tests")]
pub fn unix_store(root: &Path) -> SecureStore<safekeep_core::backend::UnixBackend> {
    SecureStore::native(StoreConfig::default().with_base_dir(root)).expect("unix store")
}

#[allow(dead_code, reason = "used in tests")]
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
