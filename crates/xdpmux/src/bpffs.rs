//! Locating the bpf filesystem and serializing installers across processes.
//!
//! Pins live under a managed `xdp/` sub-directory of the bpf filesystem
//! mount. Installation is serialized across all processes using this
//! library by an exclusive advisory `flock` on that directory; see
//! [`BpfFs::lock`].

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Environment variable overriding the bpf filesystem mount point.
pub const XDP_BPFFS_ENVVAR: &str = "XDP_BPFFS";

/// Default bpf filesystem mount point.
pub const BPFFS_DEFAULT_MOUNT: &str = "/sys/fs/bpf";

/// `statfs` magic of the bpf filesystem.
const BPFFS_MAGIC: u64 = 0xcafe_4a11;

/// Name of the managed sub-directory under the mount.
const MANAGED_SUBDIR: &str = "xdp";

/// A validated bpf filesystem mount and its managed sub-directory.
#[derive(Debug)]
pub struct BpfFs {
    root: PathBuf,
    managed: OnceLock<PathBuf>,
}

impl BpfFs {
    /// Locates the bpf filesystem mount.
    ///
    /// Checks the [`XDP_BPFFS_ENVVAR`] override, falling back to
    /// [`BPFFS_DEFAULT_MOUNT`], and validates the candidate by its
    /// filesystem magic.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BpffsNotFound`] if the candidate does not validate.
    pub fn discover() -> Result<Self> {
        let candidate = std::env::var_os(XDP_BPFFS_ENVVAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(BPFFS_DEFAULT_MOUNT));

        if !is_bpffs(&candidate) {
            warn!(path = %candidate.display(), "no bpffs found");
            return Err(Error::BpffsNotFound { path: candidate });
        }

        debug!(path = %candidate.display(), "using bpffs mount");
        Ok(Self::at(candidate))
    }

    /// Uses an explicitly supplied mount point, skipping the magic check.
    ///
    /// Intended for callers that manage their own mount (and for tests).
    #[must_use]
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            managed: OnceLock::new(),
        }
    }

    /// The process-wide instance, discovered once and memoized.
    ///
    /// Discovery failures are not memoized; a later call retries after the
    /// mount appears.
    ///
    /// # Errors
    ///
    /// Propagates [`BpfFs::discover`] failures.
    pub fn system() -> Result<&'static Self> {
        static SYSTEM: OnceLock<BpfFs> = OnceLock::new();
        if let Some(bpffs) = SYSTEM.get() {
            return Ok(bpffs);
        }
        let discovered = Self::discover()?;
        Ok(SYSTEM.get_or_init(|| discovered))
    }

    /// The mount point.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The managed sub-directory, created with owner-only permissions on
    /// first use. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the directory cannot be created.
    pub fn managed_dir(&self) -> Result<&Path> {
        if let Some(dir) = self.managed.get() {
            return Ok(dir);
        }
        let dir = self.root.join(MANAGED_SUBDIR);
        create_dir_owner_only(&dir)?;
        Ok(self.managed.get_or_init(|| dir))
    }

    /// Acquires the exclusive cross-process installation lock, blocking
    /// until it is available.
    ///
    /// The lock is an advisory whole-file `flock` on the managed directory.
    /// Exactly one holder exists at a time across all processes; callers
    /// must not nest acquisitions. Dropping the guard releases the lock and
    /// closes the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the directory cannot be opened or locked.
    pub fn lock(&self) -> Result<LockGuard> {
        let dir = self.managed_dir()?;
        let file = File::open(dir)
            .map_err(|e| Error::io(format!("open lock directory {}", dir.display()), e))?;
        flock_exclusive_blocking(&file)?;
        debug!(dir = %dir.display(), fd = file.as_raw_fd(), "acquired bpffs lock");
        Ok(LockGuard { file })
    }
}

/// Owning guard for the cross-process installation lock.
///
/// Dropping the guard releases the `flock` and closes the descriptor.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        // SAFETY: `fd` comes from the open `File` we still own; `LOCK_UN`
        // is a valid flock operation.
        let rc = unsafe { libc::flock(fd, libc::LOCK_UN) };
        if rc == 0 {
            debug!(fd, "released bpffs lock");
        } else {
            warn!(fd, error = %io::Error::last_os_error(), "failed to release bpffs lock");
        }
    }
}

/// Acquires an exclusive blocking `flock` on the given file.
#[allow(unsafe_code)]
fn flock_exclusive_blocking(file: &File) -> Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: `fd` is a valid descriptor from an open `File` that outlives
    // this call; `LOCK_EX` is a valid flock operation.
    let rc = unsafe { libc::flock(fd, libc::LOCK_EX) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    warn!(fd, error = %err, "failed to flock managed directory");
    Err(Error::io("flock on managed directory", err))
}

/// Whether the path is a mounted bpf filesystem.
fn is_bpffs(path: &Path) -> bool {
    match nix::sys::statfs::statfs(path) {
        Ok(st) => st.filesystem_type().0 as u64 == BPFFS_MAGIC,
        Err(_) => false,
    }
}

/// Creates a directory with mode 0700, tolerating an existing one.
pub(crate) fn create_dir_owner_only(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    match std::fs::DirBuilder::new().mode(0o700).create(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(Error::io(format!("create directory {}", dir.display()), e)),
    }
}
