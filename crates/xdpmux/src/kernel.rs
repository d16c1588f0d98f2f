//! External collaborator contracts: the kernel program loader/verifier and
//! opened object handles.
//!
//! The library does not load or verify programs itself. Everything it needs
//! from the loader is captured by [`Kernel`] (kernel object calls) and
//! [`ProgramObject`] (an opened, possibly not yet loaded, object file).
//! Production deployments back these with a libbpf-style loader; tests use
//! an in-process fake.
//!
//! # Lifecycle
//!
//! 1. Open an object via [`Kernel::open_object_file`] or
//!    [`Kernel::open_object_buffer`].
//! 2. Optionally patch the object (rodata, attach targets, program type).
//! 3. [`ProgramObject::load`] the object, then hand out program fds.
//! 4. Attach, pin, and query through the remaining [`Kernel`] calls.

use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitflags::bitflags;

use crate::btf::TypeCatalog;
use crate::error::{Error, Result};

/// Size of the kernel's program content digest.
pub const BPF_TAG_SIZE: usize = 8;

/// Environment variable overriding the search path for shipped object files.
pub const XDP_OBJECT_PATH_ENVVAR: &str = "XDP_OBJECT_PATH";

/// Default directories searched for shipped object files.
const OBJECT_SEARCH_DIRS: &[&str] = &["/usr/lib/bpf", "/usr/local/lib/bpf"];

bitflags! {
    /// Kernel flag word for the interface XDP attach call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct XdpFlags: u32 {
        /// Fail with `EEXIST` instead of replacing an attached program.
        const UPDATE_IF_NOEXIST = 1 << 0;
        /// Generic (skb) mode.
        const SKB_MODE = 1 << 1;
        /// Native driver mode.
        const DRV_MODE = 1 << 2;
        /// Hardware offload mode.
        const HW_MODE = 1 << 3;
        /// All mode bits.
        const MODES = Self::SKB_MODE.bits() | Self::DRV_MODE.bits() | Self::HW_MODE.bits();
    }
}

/// Requested attach mode for the interface hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachMode {
    /// Let the kernel pick; no mode flag is sent.
    #[default]
    Unspec,
    /// Generic mode, after skb allocation. Works everywhere, slower.
    Skb,
    /// Native driver mode.
    Native,
    /// Hardware offload.
    Hw,
}

impl AttachMode {
    /// The kernel flag bits for this mode.
    #[must_use]
    pub const fn flags(self) -> XdpFlags {
        match self {
            Self::Unspec => XdpFlags::empty(),
            Self::Skb => XdpFlags::SKB_MODE,
            Self::Native => XdpFlags::DRV_MODE,
            Self::Hw => XdpFlags::HW_MODE,
        }
    }
}

/// Identity the kernel reports for a loaded program.
#[derive(Debug, Clone)]
pub struct ProgInfo {
    /// Kernel program id.
    pub id: u32,
    /// Program name as declared in the object.
    pub name: String,
    /// Content digest.
    pub tag: [u8; BPF_TAG_SIZE],
    /// Monotonic load timestamp.
    pub load_time: u64,
    /// Id of the program's type metadata, when the kernel kept it.
    pub btf_id: Option<u32>,
}

/// State of the XDP hook on one interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct XdpLinkInfo {
    /// Mode the current program is attached in.
    pub attach_mode: AttachMode,
    /// Program id attached in native driver mode.
    pub drv_prog_id: Option<u32>,
    /// Program id attached in generic mode.
    pub skb_prog_id: Option<u32>,
}

impl XdpLinkInfo {
    /// The installed program id, preferring the driver-mode slot.
    #[must_use]
    pub const fn prog_id(&self) -> Option<u32> {
        match self.attach_mode {
            AttachMode::Skb => self.skb_prog_id,
            _ => self.drv_prog_id,
        }
    }
}

/// Options forwarded to the loader when opening an object.
#[derive(Debug, Clone, Default)]
pub struct OpenOpts {
    /// Root path for automatic map pinning.
    pub pin_root_path: Option<PathBuf>,
    /// Path to a custom metadata blob to use instead of the object's own.
    pub btf_custom_path: Option<PathBuf>,
}

/// An opened program object, possibly not yet loaded into the kernel.
///
/// Methods take `&self`: an implementation is a handle over loader-held
/// state, mutated behind the handle the way a `bpf_object *` would be.
pub trait ProgramObject: Send + Sync {
    /// Name of the first program declared in the object.
    fn first_program(&self) -> Option<String>;

    /// Whether the object declares a program with the given symbol.
    fn has_program(&self, name: &str) -> bool;

    /// The object's resolved type metadata, if it carries any.
    fn type_metadata(&self) -> Option<Arc<TypeCatalog>>;

    /// A copy of the read-only data section.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoRodata`] if the object has no such section.
    fn rodata(&self) -> Result<Vec<u8>>;

    /// Replaces the read-only data section before load.
    ///
    /// # Errors
    ///
    /// Fails if the object has no such section, is already loaded, or the
    /// replacement's size differs from the section's.
    fn set_rodata(&self, data: &[u8]) -> Result<()>;

    /// Sets the named program's attach target to a symbol within the program
    /// behind `target`.
    ///
    /// # Errors
    ///
    /// Fails if the program does not exist or the object is already loaded.
    fn set_attach_target(&self, prog: &str, target: BorrowedFd<'_>, symbol: &str) -> Result<()>;

    /// Marks the named program as a function-replacement extension.
    ///
    /// # Errors
    ///
    /// Fails if the program does not exist or the object is already loaded.
    fn set_extension_type(&self, prog: &str) -> Result<()>;

    /// Loads every program in the object through the verifier.
    ///
    /// # Errors
    ///
    /// Surfaces the loader's error; the object stays unloaded on failure.
    fn load(&self) -> Result<()>;

    /// A duplicated, owned fd for the named loaded program.
    ///
    /// # Errors
    ///
    /// Fails if the object is not loaded or the program does not exist.
    fn program_fd(&self, prog: &str) -> Result<OwnedFd>;

    /// Instruction byte-size of the named program, when known.
    fn program_size(&self, prog: &str) -> Option<usize>;
}

/// The kernel's program loader, verifier, and link surface.
pub trait Kernel: Send + Sync {
    /// Opens an object file from disk.
    fn open_object_file(&self, path: &Path, opts: &OpenOpts) -> Result<Arc<dyn ProgramObject>>;

    /// Opens an object from an in-memory buffer.
    fn open_object_buffer(&self, bytes: &[u8], opts: &OpenOpts)
        -> Result<Arc<dyn ProgramObject>>;

    /// Resolves a kernel program id to an owned fd.
    fn prog_fd_by_id(&self, id: u32) -> Result<OwnedFd>;

    /// Queries identity for a loaded program.
    fn prog_info(&self, fd: BorrowedFd<'_>) -> Result<ProgInfo>;

    /// Fetches kernel-preserved type metadata by id.
    fn btf_by_id(&self, id: u32) -> Result<Arc<TypeCatalog>>;

    /// Opens the lightweight attachment that materializes an extension
    /// binding. The binding holds as long as the returned fd is open.
    fn attach_extension(&self, prog_fd: BorrowedFd<'_>) -> Result<OwnedFd>;

    /// Pins an fd to a path on the bpf filesystem.
    fn pin(&self, fd: BorrowedFd<'_>, path: &Path) -> Result<()>;

    /// Queries the XDP hook state for an interface.
    fn query_xdp(&self, ifindex: u32) -> Result<XdpLinkInfo>;

    /// Sets or clears (`prog = None`) the interface's XDP program.
    fn set_xdp(&self, ifindex: u32, prog: Option<BorrowedFd<'_>>, flags: XdpFlags) -> Result<()>;

    /// Locates a shipped object file by name.
    ///
    /// The default implementation searches the [`XDP_OBJECT_PATH_ENVVAR`]
    /// override first, then the compile-time directories.
    fn find_object_file(&self, name: &str) -> Result<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(dir) = std::env::var_os(XDP_OBJECT_PATH_ENVVAR) {
            candidates.push(PathBuf::from(dir));
        }
        candidates.extend(OBJECT_SEARCH_DIRS.iter().copied().map(PathBuf::from));

        for dir in candidates {
            let path = dir.join(name);
            if path.exists() {
                return Ok(path);
            }
        }
        Err(Error::ObjectFileNotFound {
            name: name.to_string(),
        })
    }
}
