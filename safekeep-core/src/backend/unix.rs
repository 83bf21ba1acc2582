//! POSIX backend.
//!
//! - Opens never follow a final symbolic link (`O_NOFOLLOW`) and never leak
//!   into children (`O_CLOEXEC`).
//! - Creation is `O_CREAT | O_EXCL` with mode `0600`.
//! - A descriptor that lands on 0, 1 or 2 is moved above the stdio range and
//!   the low slot is pinned to `/dev/null`, so private data can never reach an
//!   inherited stdin/stdout/stderr slot.
//! - Locks are BSD `flock` locks: they belong to the open file description,
//!   which gives [`LockingModel::LastCloseReleases`].
//!
//! # Caveats
//!
//! - `flock` is advisory and frequently a no-op on NFS and AFS mounts.
//! - Even mandatory locks can be bypassed by copy, unlink, rename.
//! - `fsync` only reaches what the drive and any glue layer honour.

use std::ffi::CString;
use std::fs::{self, DirBuilder, File, FileTimes, OpenOptions, Permissions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};
use std::path::{Path, PathBuf};

use directories::BaseDirs;

use super::{
    Backend, BackendFile, Capabilities, CapacityPolicy, Identity, LockMode, LockingModel,
    NodeKind, RawAccess, Timestamps,
};
use crate::error::{StoreError, StoreResult};

const OWNER_ONLY_FILE: u32 = 0o600;
const OWNER_ONLY_DIR: u32 = 0o700;
const HIGHEST_STDIO_FD: libc::c_int = 2;
const DEV_NULL: &str = "/dev/null";

/// Backend for POSIX filesystems.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixBackend;

impl UnixBackend {
    /// Creates the backend.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// An open descriptor on a POSIX filesystem.
#[derive(Debug)]
pub struct UnixFile {
    file: File,
    path: PathBuf,
}

fn identity_of(meta: &fs::Metadata) -> Identity {
    let file_type = meta.file_type();
    let kind = if file_type.is_symlink() {
        NodeKind::Symlink
    } else if file_type.is_file() {
        NodeKind::Regular
    } else if file_type.is_dir() {
        NodeKind::Directory
    } else {
        NodeKind::Other
    };
    Identity {
        device: meta.dev(),
        inode: meta.ino(),
        mode: meta.mode(),
        links: meta.nlink(),
        kind,
    }
}

fn open_flags() -> libc::c_int {
    libc::O_NOFOLLOW | libc::O_CLOEXEC
}

/// Moves `file` off the stdio descriptors if it landed there.
///
/// A process started with stdin/stdout/stderr closed hands those numbers to
/// the next `open`. The low slot is re-pointed at `/dev/null` and left open so
/// the next open cannot land there either.
fn move_above_stdio(file: File) -> io::Result<File> {
    let fd = file.as_raw_fd();
    if fd > HIGHEST_STDIO_FD {
        return Ok(file);
    }

    // SAFETY: `fd` is a valid descriptor owned by `file`.
    let moved = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, HIGHEST_STDIO_FD + 1) };
    if moved < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `moved` was just returned by fcntl and is owned by nobody else.
    let moved = unsafe { File::from_raw_fd(moved) };

    let null = OpenOptions::new().read(true).write(true).open(DEV_NULL)?;
    // SAFETY: both descriptors are valid; dup2 atomically replaces `fd`.
    if unsafe { libc::dup2(null.as_raw_fd(), fd) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // `fd` now refers to /dev/null and stays open for the life of the process.
    let _pinned = file.into_raw_fd();

    Ok(moved)
}

fn path_cstring(path: &Path) -> Option<CString> {
    CString::new(path.as_os_str().as_bytes()).ok()
}

impl Backend for UnixBackend {
    type File = UnixFile;

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            links: true,
            permissions: true,
            timestamps: true,
            locking: Some(LockingModel::LastCloseReleases),
        }
    }

    fn default_root(&self, app_dir: &str) -> Option<PathBuf> {
        let home = BaseDirs::new()?.home_dir().to_path_buf();
        if cfg!(target_os = "macos") {
            Some(home.join("Library").join("Preferences").join(app_dir))
        } else {
            Some(home.join(format!(".{app_dir}")))
        }
    }

    fn fallback_root(&self, app_dir: &str) -> Option<PathBuf> {
        // SAFETY: getuid has no preconditions and cannot fail.
        let uid = unsafe { libc::getuid() };
        Some(std::env::temp_dir().join(format!("{app_dir}-{uid}")))
    }

    fn dir_exists(&self, path: &Path) -> bool {
        fs::metadata(path).is_ok_and(|meta| meta.is_dir())
    }

    fn create_private_dir(&self, path: &Path) -> StoreResult<()> {
        match DirBuilder::new()
            .recursive(true)
            .mode(OWNER_ONLY_DIR)
            .create(path)
        {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists && self.dir_exists(path) => {
                Ok(())
            }
            Err(err) => Err(StoreError::io_open(path, err)),
        }
    }

    fn probe(&self, path: &Path) -> StoreResult<Option<Identity>> {
        match fs::symlink_metadata(path) {
            Ok(meta) => Ok(Some(identity_of(&meta))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Open {
                context: format!("probe {}", path.display()),
                source: Some(err),
            }),
        }
    }

    fn create_exclusive(&self, path: &Path, _capacity: CapacityPolicy) -> StoreResult<UnixFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(OWNER_ONLY_FILE)
            .custom_flags(open_flags())
            .open(path)
            .map_err(|err| {
                if err.kind() == io::ErrorKind::AlreadyExists {
                    StoreError::already_exists(path)
                } else {
                    StoreError::io_open(path, err)
                }
            })?;
        let file = move_above_stdio(file).map_err(|err| StoreError::io_open(path, err))?;
        Ok(UnixFile {
            file,
            path: path.to_path_buf(),
        })
    }

    fn open_existing(
        &self,
        path: &Path,
        access: RawAccess,
        _capacity: CapacityPolicy,
    ) -> StoreResult<UnixFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(access == RawAccess::ReadWrite)
            .custom_flags(open_flags())
            .open(path)
            .map_err(|err| {
                if err.raw_os_error() == Some(libc::ELOOP) {
                    StoreError::open(format!(
                        "refusing to follow symbolic link at {}",
                        path.display()
                    ))
                } else {
                    StoreError::io_open(path, err)
                }
            })?;
        let file = move_above_stdio(file).map_err(|err| StoreError::io_open(path, err))?;
        Ok(UnixFile {
            file,
            path: path.to_path_buf(),
        })
    }

    fn delete_by_path(&self, path: &Path) -> StoreResult<()> {
        fs::remove_file(path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => StoreError::not_found(path.display().to_string()),
            io::ErrorKind::PermissionDenied => {
                StoreError::permission_denied(path.display().to_string())
            }
            _ => StoreError::io_write(format!("unlink {}", path.display()), err),
        })
    }

    fn is_writable(&self, path: &Path) -> bool {
        let Some(c_path) = path_cstring(path) else {
            return false;
        };
        // SAFETY: `c_path` is a valid NUL-terminated string for the call.
        if unsafe { libc::access(c_path.as_ptr(), libc::W_OK) } == 0 {
            return true;
        }
        io::Error::last_os_error().raw_os_error() == Some(libc::ENOENT)
    }
}

impl UnixFile {
    fn describe(&self, operation: &str) -> String {
        format!("{operation} {}", self.path.display())
    }
}

impl BackendFile for UnixFile {
    fn identity(&self) -> StoreResult<Identity> {
        self.file
            .metadata()
            .map(|meta| identity_of(&meta))
            .map_err(|err| StoreError::Open {
                context: self.describe("fstat"),
                source: Some(err),
            })
    }

    fn read(&mut self, buf: &mut [u8]) -> StoreResult<usize> {
        self.file
            .read(buf)
            .map_err(|err| StoreError::io_read(self.describe("read"), err))
    }

    fn write(&mut self, buf: &[u8]) -> StoreResult<()> {
        self.file
            .write_all(buf)
            .map_err(|err| StoreError::io_write(self.describe("write"), err))
    }

    fn seek(&mut self, position: u64) -> StoreResult<()> {
        self.file
            .seek(SeekFrom::Start(position))
            .map(|_| ())
            .map_err(|err| StoreError::io_read(self.describe("seek"), err))
    }

    fn position(&mut self) -> StoreResult<u64> {
        self.file
            .stream_position()
            .map_err(|err| StoreError::io_read(self.describe("tell"), err))
    }

    fn flush(&mut self) -> StoreResult<()> {
        self.file
            .sync_all()
            .map_err(|err| StoreError::io_write(self.describe("fsync"), err))
    }

    fn current_size(&self) -> StoreResult<u64> {
        self.file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| StoreError::io_read(self.describe("fstat"), err))
    }

    fn truncate_at(&mut self, len: u64) -> StoreResult<()> {
        self.file
            .set_len(len)
            .map_err(|err| StoreError::io_write(self.describe("ftruncate"), err))
    }

    fn set_timestamps(&mut self, times: Timestamps) -> StoreResult<()> {
        let file_times = FileTimes::new()
            .set_accessed(times.accessed)
            .set_modified(times.modified);
        self.file
            .set_times(file_times)
            .map_err(|err| StoreError::io_write(self.describe("futimens"), err))
    }

    fn restrict_to_owner(&mut self) -> StoreResult<()> {
        self.file
            .set_permissions(Permissions::from_mode(OWNER_ONLY_FILE))
            .map_err(|err| match err.kind() {
                io::ErrorKind::PermissionDenied => {
                    StoreError::permission_denied(self.describe("fchmod"))
                }
                _ => StoreError::io_write(self.describe("fchmod"), err),
            })
    }

    fn lock(&mut self, mode: LockMode, blocking: bool) -> StoreResult<()> {
        let mut operation = match mode {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        };
        if !blocking {
            operation |= libc::LOCK_NB;
        }

        // SAFETY: the descriptor is owned by `self.file` and open.
        if unsafe { libc::flock(self.file.as_raw_fd(), operation) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EWOULDBLOCK => {
                Err(StoreError::busy(self.describe(&format!("{mode} lock"))))
            }
            Some(libc::EINTR) => Err(StoreError::timeout(self.describe("lock wait"))),
            Some(libc::ENOLCK | libc::EOPNOTSUPP | libc::EINVAL) => Err(StoreError::unsupported(
                format!("flock on {} ({err})", self.path.display()),
            )),
            _ => Err(StoreError::permission_denied(format!(
                "{}: {err}",
                self.describe("lock")
            ))),
        }
    }

    fn unlock(&mut self) -> StoreResult<()> {
        // SAFETY: the descriptor is owned by `self.file` and open.
        if unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) } == 0 {
            Ok(())
        } else {
            Err(StoreError::io_write(
                self.describe("unlock"),
                io::Error::last_os_error(),
            ))
        }
    }

    fn close(self) -> StoreResult<()> {
        let Self { file, path } = self;
        let fd = file.into_raw_fd();
        // SAFETY: `fd` came from `into_raw_fd` and is closed exactly once here.
        // NFS and quota-managed filesystems can report deferred write errors
        // at this point, so the result is not ignored.
        if unsafe { libc::close(fd) } == 0 {
            Ok(())
        } else {
            Err(StoreError::io_write(
                format!("close {}", path.display()),
                io::Error::last_os_error(),
            ))
        }
    }
}
