//! In-memory backend.
//!
//! Serves hosts without a conventional filesystem and doubles as the test
//! backend. File data lives in process memory; every object has a stable
//! identity so the probe/open checks behave as they do on disk.
//!
//! Locks follow [`LockingModel::AnyCloseReleases`]: closing any resource on
//! an object drops every lock held on it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use log::warn;
use zeroize::Zeroize;

use super::{
    Backend, BackendFile, Capabilities, CapacityPolicy, Identity, LockMode, LockingModel,
    NodeKind, RawAccess, Timestamps,
};
use crate::error::{StoreError, StoreResult};

const MEMORY_DEVICE: u64 = 1;
const REGULAR_MODE: u32 = 0o100_600;
const DIRECTORY_MODE: u32 = 0o040_700;
const DEFAULT_ROOT: &str = "/memory";
/// Largest object the backend holds. Writes or truncations past it fail
/// with `Overflow` instead of exhausting memory.
pub const MAX_OBJECT_LEN: usize = 1 << 30;

// =============================================================================
// Objects and lock tables
// =============================================================================

#[derive(Debug)]
struct Object {
    bytes: Vec<u8>,
    times: Timestamps,
    policy: CapacityPolicy,
    linked: bool,
    open: usize,
}

impl Object {
    fn new(policy: CapacityPolicy, bytes: &[u8]) -> Self {
        let now = SystemTime::now();
        let mut object = Self {
            bytes: Vec::with_capacity(policy.initial_capacity()),
            times: Timestamps {
                accessed: now,
                modified: now,
            },
            policy,
            linked: true,
            open: 0,
        };
        object.bytes.extend_from_slice(bytes);
        object
    }

    /// Grows the buffer so `end` bytes fit. Sensitive buffers are moved
    /// into a fresh allocation and the old one is scrubbed, so no stale copy
    /// is left behind by the allocator.
    fn reserve_for(&mut self, end: usize) {
        if end <= self.bytes.capacity() {
            return;
        }
        if self.policy.scrub_on_release() {
            let mut grown = Vec::with_capacity(end.max(self.bytes.capacity() * 2));
            grown.extend_from_slice(&self.bytes);
            let mut old = std::mem::replace(&mut self.bytes, grown);
            old.zeroize();
        } else {
            self.bytes.reserve(end - self.bytes.len());
        }
    }

    fn write_at(&mut self, offset: usize, data: &[u8]) -> StoreResult<()> {
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= MAX_OBJECT_LEN)
            .ok_or_else(|| {
                StoreError::overflow(
                    "memory object write",
                    offset.saturating_add(data.len()),
                    MAX_OBJECT_LEN,
                )
            })?;
        self.reserve_for(end);
        if end > self.bytes.len() {
            self.bytes.resize(end, 0);
        }
        self.bytes[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn truncate(&mut self, len: usize) -> StoreResult<()> {
        if len > MAX_OBJECT_LEN {
            return Err(StoreError::overflow("memory object length", len, MAX_OBJECT_LEN));
        }
        if len < self.bytes.len() {
            if self.policy.scrub_on_release() {
                self.bytes[len..].zeroize();
            }
            self.bytes.truncate(len);
        } else {
            self.reserve_for(len);
            self.bytes.resize(len, 0);
        }
        Ok(())
    }

    fn scrub(&mut self) {
        if self.policy.scrub_on_release() {
            self.bytes.zeroize();
        }
    }

    fn identity(&self, inode: u64) -> Identity {
        Identity {
            device: MEMORY_DEVICE,
            inode,
            mode: REGULAR_MODE,
            links: u64::from(self.linked),
            kind: NodeKind::Regular,
        }
    }
}

#[derive(Debug, Default)]
struct LockTable {
    shared: HashSet<u64>,
    exclusive: Option<u64>,
}

impl LockTable {
    fn admits(&self, resource: u64, mode: LockMode) -> bool {
        let exclusive_ok = self.exclusive.is_none_or(|holder| holder == resource);
        match mode {
            LockMode::Shared => exclusive_ok,
            LockMode::Exclusive => {
                exclusive_ok && self.shared.iter().all(|holder| *holder == resource)
            }
        }
    }

    fn grant(&mut self, resource: u64, mode: LockMode) {
        self.remove(resource);
        match mode {
            LockMode::Shared => {
                self.shared.insert(resource);
            }
            LockMode::Exclusive => self.exclusive = Some(resource),
        }
    }

    fn remove(&mut self, resource: u64) {
        self.shared.remove(&resource);
        if self.exclusive == Some(resource) {
            self.exclusive = None;
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<PathBuf, u64>,
    objects: HashMap<u64, Object>,
    dirs: HashSet<PathBuf>,
    readonly: HashSet<PathBuf>,
    locks: HashMap<u64, LockTable>,
    next_id: u64,
    writes: u64,
    fail_writes: bool,
}

impl MemoryState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn insert_object(&mut self, path: &Path, object: Object) -> u64 {
        let inode = self.allocate_id();
        self.objects.insert(inode, object);
        if let Some(previous) = self.entries.insert(path.to_path_buf(), inode) {
            self.unlink(previous);
        }
        inode
    }

    fn unlink(&mut self, inode: u64) {
        if let Some(object) = self.objects.get_mut(&inode) {
            object.linked = false;
        }
        self.release_if_orphaned(inode);
    }

    /// Frees an object once it has no name and no open resource.
    fn release_if_orphaned(&mut self, inode: u64) {
        let orphaned = self
            .objects
            .get(&inode)
            .is_some_and(|object| !object.linked && object.open == 0);
        if orphaned {
            if let Some(mut object) = self.objects.remove(&inode) {
                object.scrub();
            }
            self.locks.remove(&inode);
        }
    }

    fn add_dir_with_parents(&mut self, path: &Path) {
        for ancestor in path.ancestors() {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            self.dirs.insert(ancestor.to_path_buf());
        }
    }

    fn open_resource(&mut self, inode: u64) -> u64 {
        if let Some(object) = self.objects.get_mut(&inode) {
            object.open += 1;
        }
        self.allocate_id()
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<MemoryState>,
    released: Condvar,
}

impl Shared {
    fn lock_state(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| StoreError::open("memory backend state poisoned"))
    }

    /// Helper access for diagnostics, which never fails.
    fn inspect(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_offset(value: u64, context: &str) -> StoreResult<usize> {
    usize::try_from(value).map_err(|_| {
        StoreError::overflow(context, usize::MAX, usize::MAX)
    })
}

// =============================================================================
// Memory Backend
// =============================================================================

/// Backend that keeps every file in process memory.
///
/// Clones share the same namespace.
///
/// # Example
///
/// ```
/// use safekeep_core::backend::{Backend, MemoryBackend};
///
/// let backend = MemoryBackend::new();
/// backend.insert_file("/memory/safekeep/key.p15", b"secret");
/// assert!(backend.probe("/memory/safekeep/key.p15".as_ref()).unwrap().is_some());
/// ```
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
    root: PathBuf,
    default_root_available: bool,
    fallback_root_available: bool,
}

impl MemoryBackend {
    /// Creates an empty backend rooted at `/memory`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_root(DEFAULT_ROOT)
    }

    /// Creates an empty backend rooted at `root`.
    #[must_use]
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let backend = Self {
            shared: Arc::new(Shared::default()),
            root: root.as_ref().to_path_buf(),
            default_root_available: true,
            fallback_root_available: true,
        };
        backend.shared.inspect().add_dir_with_parents(&backend.root);
        backend
    }

    /// Simulates a host with no per-user location.
    #[must_use]
    pub const fn without_default_root(mut self) -> Self {
        self.default_root_available = false;
        self
    }

    /// Simulates a host with no fallback location either.
    #[must_use]
    pub const fn without_fallback_root(mut self) -> Self {
        self.fallback_root_available = false;
        self
    }

    /// Binds `path` to a new object holding `bytes`, creating parent
    /// directories as needed. An object previously bound to `path` loses
    /// its name, so open resources on it keep the old identity.
    pub fn insert_file(&self, path: impl AsRef<Path>, bytes: &[u8]) {
        let path = path.as_ref();
        let mut state = self.shared.inspect();
        if let Some(parent) = path.parent() {
            state.add_dir_with_parents(parent);
        }
        state.insert_object(path, Object::new(CapacityPolicy::Standard, bytes));
    }

    /// Current contents of the object bound to `path`.
    #[must_use]
    pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        let state = self.shared.inspect();
        let inode = state.entries.get(path.as_ref())?;
        state.objects.get(inode).map(|object| object.bytes.clone())
    }

    /// Timestamps of the object bound to `path`.
    #[must_use]
    pub fn timestamps(&self, path: impl AsRef<Path>) -> Option<Timestamps> {
        let state = self.shared.inspect();
        let inode = state.entries.get(path.as_ref())?;
        state.objects.get(inode).map(|object| object.times)
    }

    /// Number of successful write calls across all resources.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.shared.inspect().writes
    }

    /// Number of live objects, named or still open.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.shared.inspect().objects.len()
    }

    /// Marks `path` as read-only for subsequent opens.
    pub fn set_readonly(&self, path: impl AsRef<Path>, readonly: bool) {
        let mut state = self.shared.inspect();
        if readonly {
            state.readonly.insert(path.as_ref().to_path_buf());
        } else {
            state.readonly.remove(path.as_ref());
        }
    }

    /// Makes every subsequent write fail, to exercise error paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.shared.inspect().fail_writes = fail;
    }

    fn file(&self, path: &Path, inode: u64, resource: u64, writable: bool) -> MemoryFile {
        MemoryFile {
            shared: Arc::clone(&self.shared),
            path: path.to_path_buf(),
            inode,
            resource,
            position: 0,
            writable,
            closed: false,
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    type File = MemoryFile;

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            links: false,
            permissions: false,
            timestamps: true,
            locking: Some(LockingModel::AnyCloseReleases),
        }
    }

    fn default_root(&self, app_dir: &str) -> Option<PathBuf> {
        self.default_root_available
            .then(|| self.root.join(app_dir))
    }

    fn fallback_root(&self, app_dir: &str) -> Option<PathBuf> {
        self.fallback_root_available
            .then(|| self.root.join("tmp").join(app_dir))
    }

    fn dir_exists(&self, path: &Path) -> bool {
        self.shared.inspect().dirs.contains(path)
    }

    fn create_private_dir(&self, path: &Path) -> StoreResult<()> {
        let mut state = self.shared.lock_state()?;
        if state.entries.contains_key(path) {
            return Err(StoreError::open(format!(
                "{} exists and is not a directory",
                path.display()
            )));
        }
        state.add_dir_with_parents(path);
        Ok(())
    }

    fn probe(&self, path: &Path) -> StoreResult<Option<Identity>> {
        let state = self.shared.lock_state()?;
        if let Some(inode) = state.entries.get(path) {
            return Ok(state
                .objects
                .get(inode)
                .map(|object| object.identity(*inode)));
        }
        if state.dirs.contains(path) {
            return Ok(Some(Identity {
                device: MEMORY_DEVICE,
                inode: 0,
                mode: DIRECTORY_MODE,
                links: 2,
                kind: NodeKind::Directory,
            }));
        }
        Ok(None)
    }

    fn create_exclusive(&self, path: &Path, capacity: CapacityPolicy) -> StoreResult<MemoryFile> {
        let mut state = self.shared.lock_state()?;
        if state.entries.contains_key(path) || state.dirs.contains(path) {
            return Err(StoreError::already_exists(path));
        }
        if !path.parent().is_some_and(|parent| state.dirs.contains(parent)) {
            return Err(StoreError::not_found(format!(
                "parent directory of {}",
                path.display()
            )));
        }
        let inode = state.insert_object(path, Object::new(capacity, &[]));
        let resource = state.open_resource(inode);
        drop(state);
        Ok(self.file(path, inode, resource, true))
    }

    fn open_existing(
        &self,
        path: &Path,
        access: RawAccess,
        _capacity: CapacityPolicy,
    ) -> StoreResult<MemoryFile> {
        let mut state = self.shared.lock_state()?;
        let Some(&inode) = state.entries.get(path) else {
            if state.dirs.contains(path) {
                return Err(StoreError::open(format!("{} is a directory", path.display())));
            }
            return Err(StoreError::not_found(path.display().to_string()));
        };
        let writable = access == RawAccess::ReadWrite;
        if writable && state.readonly.contains(path) {
            return Err(StoreError::permission_denied(path.display().to_string()));
        }
        let resource = state.open_resource(inode);
        drop(state);
        Ok(self.file(path, inode, resource, writable))
    }

    fn delete_by_path(&self, path: &Path) -> StoreResult<()> {
        let mut state = self.shared.lock_state()?;
        let inode = state
            .entries
            .remove(path)
            .ok_or_else(|| StoreError::not_found(path.display().to_string()))?;
        state.readonly.remove(path);
        state.unlink(inode);
        Ok(())
    }

    fn is_writable(&self, path: &Path) -> bool {
        !self.shared.inspect().readonly.contains(path)
    }
}

// =============================================================================
// Memory File
// =============================================================================

/// An open resource on a [`MemoryBackend`] object.
#[derive(Debug)]
pub struct MemoryFile {
    shared: Arc<Shared>,
    path: PathBuf,
    inode: u64,
    resource: u64,
    position: u64,
    writable: bool,
    closed: bool,
}

impl MemoryFile {
    fn require_writable(&self, operation: &str) -> StoreResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(StoreError::permission_denied(format!(
                "{operation} {} opened read-only",
                self.path.display()
            )))
        }
    }

    fn missing_object(&self) -> StoreError {
        StoreError::inconsistency(format!("object behind {} vanished", self.path.display()))
    }

    fn release(&mut self) -> StoreResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut state = self.shared.lock_state()?;
        // Any close drops every lock on the object.
        state.locks.remove(&self.inode);
        if let Some(object) = state.objects.get_mut(&self.inode) {
            object.open = object.open.saturating_sub(1);
        }
        state.release_if_orphaned(self.inode);
        drop(state);
        self.shared.released.notify_all();
        Ok(())
    }
}

impl BackendFile for MemoryFile {
    fn identity(&self) -> StoreResult<Identity> {
        let state = self.shared.lock_state()?;
        state
            .objects
            .get(&self.inode)
            .map(|object| object.identity(self.inode))
            .ok_or_else(|| self.missing_object())
    }

    fn read(&mut self, buf: &mut [u8]) -> StoreResult<usize> {
        let start = to_offset(self.position, "read position")?;
        let state = self.shared.lock_state()?;
        let object = state
            .objects
            .get(&self.inode)
            .ok_or_else(|| self.missing_object())?;
        if start >= object.bytes.len() {
            return Ok(0);
        }
        let count = buf.len().min(object.bytes.len() - start);
        buf[..count].copy_from_slice(&object.bytes[start..start + count]);
        drop(state);
        self.position += count as u64;
        Ok(count)
    }

    fn write(&mut self, buf: &[u8]) -> StoreResult<()> {
        self.require_writable("write")?;
        let offset = to_offset(self.position, "write position")?;
        let mut state = self.shared.lock_state()?;
        if state.fail_writes {
            return Err(StoreError::write(format!(
                "write {} (injected failure)",
                self.path.display()
            )));
        }
        let object = state
            .objects
            .get_mut(&self.inode)
            .ok_or_else(|| self.missing_object())?;
        object.write_at(offset, buf)?;
        object.times.modified = SystemTime::now();
        state.writes += 1;
        drop(state);
        self.position += buf.len() as u64;
        Ok(())
    }

    fn seek(&mut self, position: u64) -> StoreResult<()> {
        self.position = position;
        Ok(())
    }

    fn position(&mut self) -> StoreResult<u64> {
        Ok(self.position)
    }

    fn flush(&mut self) -> StoreResult<()> {
        let state = self.shared.lock_state()?;
        if state.fail_writes {
            return Err(StoreError::write(format!(
                "flush {} (injected failure)",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn current_size(&self) -> StoreResult<u64> {
        let state = self.shared.lock_state()?;
        state
            .objects
            .get(&self.inode)
            .map(|object| object.bytes.len() as u64)
            .ok_or_else(|| self.missing_object())
    }

    fn truncate_at(&mut self, len: u64) -> StoreResult<()> {
        self.require_writable("truncate")?;
        let len = to_offset(len, "truncate length")?;
        let mut state = self.shared.lock_state()?;
        let object = state
            .objects
            .get_mut(&self.inode)
            .ok_or_else(|| self.missing_object())?;
        object.truncate(len)?;
        object.times.modified = SystemTime::now();
        Ok(())
    }

    fn set_timestamps(&mut self, times: Timestamps) -> StoreResult<()> {
        self.require_writable("set timestamps on")?;
        let mut state = self.shared.lock_state()?;
        let object = state
            .objects
            .get_mut(&self.inode)
            .ok_or_else(|| self.missing_object())?;
        object.times = times;
        Ok(())
    }

    fn restrict_to_owner(&mut self) -> StoreResult<()> {
        Ok(())
    }

    fn lock(&mut self, mode: LockMode, blocking: bool) -> StoreResult<()> {
        let mut state = self.shared.lock_state()?;
        loop {
            let table = state.locks.entry(self.inode).or_default();
            if table.admits(self.resource, mode) {
                table.grant(self.resource, mode);
                return Ok(());
            }
            if !blocking {
                return Err(StoreError::busy(format!(
                    "{mode} lock on {}",
                    self.path.display()
                )));
            }
            state = self
                .shared
                .released
                .wait(state)
                .map_err(|_| StoreError::timeout(format!("lock wait on {}", self.path.display())))?;
        }
    }

    fn unlock(&mut self) -> StoreResult<()> {
        let mut state = self.shared.lock_state()?;
        if let Some(table) = state.locks.get_mut(&self.inode) {
            table.remove(self.resource);
        }
        drop(state);
        self.shared.released.notify_all();
        Ok(())
    }

    fn close(mut self) -> StoreResult<()> {
        self.release()
    }
}

impl Drop for MemoryFile {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!("implicit release of {} failed: {err}", self.path.display());
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::error::ErrorKind;

    fn key_path() -> PathBuf {
        PathBuf::from("/memory/safekeep/key.p15")
    }

    fn backend_with_dir() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend
            .create_private_dir(Path::new("/memory/safekeep"))
            .unwrap();
        backend
    }

    #[test]
    fn test_create_write_read_back() {
        let backend = backend_with_dir();
        let mut file = backend
            .create_exclusive(&key_path(), CapacityPolicy::Sensitive)
            .unwrap();
        file.write(b"hello").unwrap();
        file.write(b" world").unwrap();
        file.close().unwrap();

        let mut file = backend
            .open_existing(&key_path(), RawAccess::Read, CapacityPolicy::Standard)
            .unwrap();
        let mut buf = [0u8; 32];
        let read = file.read(&mut buf).unwrap();
        assert_eq!(&buf[..read], b"hello world");
        assert_eq!(file.read(&mut buf).unwrap(), 0);
        assert_eq!(backend.write_count(), 2);
    }

    #[test]
    fn test_create_requires_parent_and_free_path() {
        let backend = MemoryBackend::new();
        let err = backend
            .create_exclusive(&key_path(), CapacityPolicy::Standard)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        backend.insert_file(key_path(), b"x");
        let err = backend
            .create_exclusive(&key_path(), CapacityPolicy::Standard)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_read_only_handle_cannot_write() {
        let backend = MemoryBackend::new();
        backend.insert_file(key_path(), b"data");
        let mut file = backend
            .open_existing(&key_path(), RawAccess::Read, CapacityPolicy::Standard)
            .unwrap();
        let err = file.write(b"x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_substitution_changes_identity() {
        let backend = MemoryBackend::new();
        backend.insert_file(key_path(), b"original");
        let before = backend.probe(&key_path()).unwrap().unwrap();
        let file = backend
            .open_existing(&key_path(), RawAccess::Read, CapacityPolicy::Standard)
            .unwrap();

        backend.insert_file(key_path(), b"replacement");
        let after = backend.probe(&key_path()).unwrap().unwrap();
        assert!(!before.same_object(&after));

        // The open resource still refers to the unlinked original.
        let held = file.identity().unwrap();
        assert_eq!(held.inode, before.inode);
        assert_eq!(held.links, 0);
        assert_eq!(backend.object_count(), 2);

        drop(file);
        assert_eq!(backend.object_count(), 1);
    }

    #[test]
    fn test_delete_while_open_keeps_object_until_close() {
        let backend = MemoryBackend::new();
        backend.insert_file(key_path(), b"data");
        let mut file = backend
            .open_existing(&key_path(), RawAccess::ReadWrite, CapacityPolicy::Standard)
            .unwrap();
        backend.delete_by_path(&key_path()).unwrap();
        assert!(backend.probe(&key_path()).unwrap().is_none());
        assert_eq!(file.current_size().unwrap(), 4);
        file.close().unwrap();
        assert_eq!(backend.object_count(), 0);

        let err = backend.delete_by_path(&key_path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_truncate_and_sparse_write() {
        let backend = MemoryBackend::new();
        backend.insert_file(key_path(), b"0123456789");
        let mut file = backend
            .open_existing(&key_path(), RawAccess::ReadWrite, CapacityPolicy::Sensitive)
            .unwrap();
        file.truncate_at(4).unwrap();
        assert_eq!(backend.contents(key_path()).unwrap(), b"0123");
        file.seek(6).unwrap();
        file.write(b"x").unwrap();
        assert_eq!(backend.contents(key_path()).unwrap(), b"0123\0\0x");
    }

    #[test]
    fn test_write_past_limit_is_overflow() {
        let backend = MemoryBackend::new();
        backend.insert_file(key_path(), b"data");
        let mut file = backend
            .open_existing(&key_path(), RawAccess::ReadWrite, CapacityPolicy::Sensitive)
            .unwrap();

        file.seek(u64::MAX - 1).unwrap();
        let err = file.write(b"xyz").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Overflow);

        file.seek(MAX_OBJECT_LEN as u64).unwrap();
        assert_eq!(file.write(b"x").unwrap_err().kind(), ErrorKind::Overflow);

        let err = file.truncate_at(MAX_OBJECT_LEN as u64 + 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Overflow);

        assert_eq!(backend.contents(key_path()).unwrap(), b"data");
        assert_eq!(backend.write_count(), 0);
    }

    #[test]
    fn test_any_close_releases_locks() {
        let backend = MemoryBackend::new();
        backend.insert_file(key_path(), b"data");
        let mut holder = backend
            .open_existing(&key_path(), RawAccess::ReadWrite, CapacityPolicy::Standard)
            .unwrap();
        let bystander = backend
            .open_existing(&key_path(), RawAccess::Read, CapacityPolicy::Standard)
            .unwrap();
        let mut contender = backend
            .open_existing(&key_path(), RawAccess::Read, CapacityPolicy::Standard)
            .unwrap();

        holder.lock(LockMode::Exclusive, false).unwrap();
        assert_eq!(
            contender.lock(LockMode::Shared, false).unwrap_err().kind(),
            ErrorKind::Busy
        );

        // Closing an unrelated resource on the same object drops the lock.
        bystander.close().unwrap();
        contender.lock(LockMode::Shared, false).unwrap();
        holder.close().unwrap();
        contender.close().unwrap();
    }

    #[test]
    fn test_shared_locks_coexist_and_block_exclusive() {
        let backend = MemoryBackend::new();
        backend.insert_file(key_path(), b"data");
        let mut first = backend
            .open_existing(&key_path(), RawAccess::Read, CapacityPolicy::Standard)
            .unwrap();
        let mut second = backend
            .open_existing(&key_path(), RawAccess::Read, CapacityPolicy::Standard)
            .unwrap();
        first.lock(LockMode::Shared, false).unwrap();
        second.lock(LockMode::Shared, false).unwrap();
        assert_eq!(
            second.lock(LockMode::Exclusive, false).unwrap_err().kind(),
            ErrorKind::Busy
        );
        first.unlock().unwrap();
        second.lock(LockMode::Exclusive, false).unwrap();
    }

    #[test]
    fn test_blocking_lock_waits_for_release() {
        let backend = MemoryBackend::new();
        backend.insert_file(key_path(), b"data");
        let mut holder = backend
            .open_existing(&key_path(), RawAccess::ReadWrite, CapacityPolicy::Standard)
            .unwrap();
        holder.lock(LockMode::Exclusive, false).unwrap();

        let waiter_backend = backend.clone();
        let waiter = thread::spawn(move || {
            let mut file = waiter_backend
                .open_existing(&key_path(), RawAccess::Read, CapacityPolicy::Standard)
                .unwrap();
            file.lock(LockMode::Exclusive, true).unwrap();
            file.close().unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        holder.unlock().unwrap();
        waiter.join().unwrap();
        holder.close().unwrap();
    }

    #[test]
    fn test_readonly_and_injected_failures() {
        let backend = MemoryBackend::new();
        backend.insert_file(key_path(), b"data");
        backend.set_readonly(key_path(), true);
        assert!(!backend.is_writable(&key_path()));
        let err = backend
            .open_existing(&key_path(), RawAccess::ReadWrite, CapacityPolicy::Standard)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        backend.set_readonly(key_path(), false);

        backend.set_fail_writes(true);
        let mut file = backend
            .open_existing(&key_path(), RawAccess::ReadWrite, CapacityPolicy::Standard)
            .unwrap();
        assert_eq!(file.write(b"x").unwrap_err().kind(), ErrorKind::WriteFailure);
        assert_eq!(backend.write_count(), 0);
    }

    #[test]
    fn test_fallback_roots() {
        let backend = MemoryBackend::new();
        assert_eq!(
            backend.default_root("safekeep"),
            Some(PathBuf::from("/memory/safekeep"))
        );
        let backend = backend.without_default_root();
        assert!(backend.default_root("safekeep").is_none());
        assert_eq!(
            backend.fallback_root("safekeep"),
            Some(PathBuf::from("/memory/tmp/safekeep"))
        );
        assert!(backend.without_fallback_root().fallback_root("safekeep").is_none());
    }
}
