//! The program handle: one component XDP program and its kernel state.
//!
//! A handle is usable when it refers to a program either through an opened
//! object (not yet loaded) or through a kernel program fd (already loaded);
//! after [`XdpProgram::load`] both are present. The handle owns its
//! descriptors and closes them exactly once when dropped.

use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::action::{ChainCallActions, XdpAction};
use crate::btf::{self, TypeCatalog};
use crate::error::{Error, Result};
use crate::kernel::{Kernel, OpenOpts, ProgramObject, BPF_TAG_SIZE};

/// Run priority assigned to programs that declare none.
pub const DEFAULT_RUN_PRIO: u32 = 50;

/// One component XDP program.
pub struct XdpProgram {
    name: String,
    // Field order is drop order: the slot attachment must release before
    // the program fd, and both before the object handle.
    link_fd: Option<OwnedFd>,
    prog_fd: Option<OwnedFd>,
    object: Option<Arc<dyn ProgramObject>>,
    btf: Option<Arc<TypeCatalog>>,
    link_pin_path: Option<PathBuf>,
    tag: [u8; BPF_TAG_SIZE],
    load_time: u64,
    run_prio: u32,
    chain_call_actions: ChainCallActions,
}

impl XdpProgram {
    fn new() -> Self {
        Self {
            name: String::new(),
            link_fd: None,
            prog_fd: None,
            object: None,
            btf: None,
            link_pin_path: None,
            tag: [0; BPF_TAG_SIZE],
            load_time: 0,
            run_prio: DEFAULT_RUN_PRIO,
            chain_call_actions: ChainCallActions::DEFAULT,
        }
    }

    /// Binds a handle to a program inside a caller-supplied object.
    ///
    /// The object is shared: the caller keeps its own reference and the
    /// handle holds another. With `prog_name = None` the first declared
    /// program is picked.
    ///
    /// A missing run configuration is tolerated; the handle keeps the
    /// default priority and chain-call policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProgramNotFound`] or [`Error::EmptyObject`] if no
    /// matching program exists, and any non-tolerated run-config parse
    /// failure.
    pub fn from_object(object: Arc<dyn ProgramObject>, prog_name: Option<&str>) -> Result<Self> {
        let mut prog = Self::new();
        prog.fill_from_object(object, prog_name)?;
        Ok(prog)
    }

    /// Opens an object file through the loader and binds to a program in it.
    ///
    /// The handle owns the sole reference to the opened object.
    ///
    /// # Errors
    ///
    /// Propagates loader open failures and [`Self::from_object`] errors.
    pub fn open_file(
        kernel: &dyn Kernel,
        path: &Path,
        prog_name: Option<&str>,
        opts: &OpenOpts,
    ) -> Result<Self> {
        let object = kernel.open_object_file(path, opts)?;
        Self::from_object(object, prog_name)
    }

    /// Recovers a handle for an already-loaded program by kernel id.
    ///
    /// Queries the kernel for name, tag, load time, and metadata id, fetches
    /// the preserved metadata when available, then re-reads the run
    /// configuration from it. A missing run configuration is tolerated.
    ///
    /// # Errors
    ///
    /// Propagates id resolution and info query failures, and any
    /// non-tolerated run-config parse failure.
    pub fn from_id(kernel: &dyn Kernel, id: u32) -> Result<Self> {
        let fd = kernel.prog_fd_by_id(id)?;
        let mut prog = Self::new();
        prog.fill_from_fd(kernel, fd)?;
        prog.apply_run_config_tolerant()?;
        Ok(prog)
    }

    fn fill_from_object(
        &mut self,
        object: Arc<dyn ProgramObject>,
        prog_name: Option<&str>,
    ) -> Result<()> {
        let name = match prog_name {
            Some(requested) if !requested.is_empty() => {
                if !object.has_program(requested) {
                    return Err(Error::ProgramNotFound {
                        name: requested.to_string(),
                    });
                }
                requested.to_string()
            },
            _ => object.first_program().ok_or(Error::EmptyObject)?,
        };

        self.name = name;
        self.btf = object.type_metadata();
        self.object = Some(object);
        self.apply_run_config_tolerant()
    }

    /// Refreshes identity from the kernel and adopts the fd.
    fn fill_from_fd(&mut self, kernel: &dyn Kernel, fd: OwnedFd) -> Result<()> {
        let info = kernel.prog_info(fd.as_fd())?;

        if self.name.is_empty() {
            self.name = info.name;
        }
        if self.btf.is_none() {
            if let Some(btf_id) = info.btf_id {
                self.btf = Some(kernel.btf_by_id(btf_id)?);
            }
        }
        self.tag = info.tag;
        self.load_time = info.load_time;
        self.prog_fd = Some(fd);
        Ok(())
    }

    /// Applies the declared run configuration, tolerating its absence.
    fn apply_run_config_tolerant(&mut self) -> Result<()> {
        let Some(catalog) = self.btf.clone() else {
            debug!(prog = %self.name, "no type metadata for program");
            return Ok(());
        };
        match btf::parse_run_config(&catalog, &self.name) {
            Ok(config) => {
                if let Some(priority) = config.priority {
                    self.run_prio = priority;
                }
                for (action, enabled) in config.chain_call {
                    self.chain_call_actions = self.chain_call_actions.with(action, enabled);
                }
                Ok(())
            },
            Err(Error::NoRunConfig { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Loads the program through the verifier and refreshes identity from
    /// the kernel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyLoaded`] if a program fd is already held and
    /// [`Error::NoObject`] if there is nothing to load from.
    pub fn load(&mut self, kernel: &dyn Kernel) -> Result<()> {
        if self.prog_fd.is_some() {
            return Err(Error::AlreadyLoaded {
                name: self.name.clone(),
            });
        }
        let Some(object) = self.object.clone() else {
            return Err(Error::NoObject {
                name: self.name.clone(),
            });
        };

        object.load()?;
        let fd = object.program_fd(&self.name)?;
        debug!(prog = %self.name, fd = fd.as_raw_fd(), "loaded XDP program");
        self.fill_from_fd(kernel, fd)
    }

    /// The program's symbol name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The run priority used for chain ordering.
    #[must_use]
    pub const fn run_priority(&self) -> u32 {
        self.run_prio
    }

    /// Overrides the run priority.
    pub fn set_run_priority(&mut self, priority: u32) {
        self.run_prio = priority;
    }

    /// Whether the chain continues when this program returns `action`.
    #[must_use]
    pub const fn chain_call_enabled(&self, action: XdpAction) -> bool {
        self.chain_call_actions.contains(action)
    }

    /// Enables or disables chain continuation for one action.
    pub fn set_chain_call_enabled(&mut self, action: XdpAction, enabled: bool) {
        self.chain_call_actions = self.chain_call_actions.with(action, enabled);
    }

    /// The full chain-call policy.
    #[must_use]
    pub const fn chain_call_actions(&self) -> ChainCallActions {
        self.chain_call_actions
    }

    /// The kernel's content digest, all zero until loaded.
    #[must_use]
    pub const fn tag(&self) -> &[u8; BPF_TAG_SIZE] {
        &self.tag
    }

    /// The kernel's load timestamp, zero until loaded.
    #[must_use]
    pub const fn load_time(&self) -> u64 {
        self.load_time
    }

    /// Whether the handle holds a loaded program fd.
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        self.prog_fd.is_some()
    }

    /// The loaded program's fd, if any.
    #[must_use]
    pub fn prog_fd(&self) -> Option<BorrowedFd<'_>> {
        self.prog_fd.as_ref().map(AsFd::as_fd)
    }

    /// The dispatcher-slot attachment fd, if composed.
    #[must_use]
    pub fn link_fd(&self) -> Option<BorrowedFd<'_>> {
        self.link_fd.as_ref().map(AsFd::as_fd)
    }

    /// Where the attachment fd is pinned, if it is.
    #[must_use]
    pub fn link_pin_path(&self) -> Option<&Path> {
        self.link_pin_path.as_deref()
    }

    /// The program's type metadata, if any.
    #[must_use]
    pub fn type_metadata(&self) -> Option<&Arc<TypeCatalog>> {
        self.btf.as_ref()
    }

    pub(crate) fn object(&self) -> Option<&Arc<dyn ProgramObject>> {
        self.object.as_ref()
    }

    pub(crate) fn object_program_size(&self) -> Option<usize> {
        self.object.as_ref()?.program_size(&self.name)
    }

    pub(crate) fn prog_fd_required(&self) -> Result<BorrowedFd<'_>> {
        self.prog_fd().ok_or_else(|| Error::NotLoaded {
            name: self.name.clone(),
        })
    }

    pub(crate) fn set_link_fd(&mut self, fd: OwnedFd) {
        self.link_fd = Some(fd);
    }

    pub(crate) fn set_link_pin_path(&mut self, path: PathBuf) {
        self.link_pin_path = Some(path);
    }

    pub(crate) fn take_link_pin_path(&mut self) -> Option<PathBuf> {
        self.link_pin_path.take()
    }
}

impl fmt::Debug for XdpProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XdpProgram")
            .field("name", &self.name)
            .field("prog_fd", &self.prog_fd.as_ref().map(AsRawFd::as_raw_fd))
            .field("link_fd", &self.link_fd.as_ref().map(AsRawFd::as_raw_fd))
            .field("run_prio", &self.run_prio)
            .field("chain_call_actions", &self.chain_call_actions)
            .finish_non_exhaustive()
    }
}
