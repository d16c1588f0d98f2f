//! In-process stand-in for the kernel loader contract.
//!
//! `FakeKernel` simulates the loader deterministically: objects are
//! registered templates, loading allocates program ids, and every program
//! fd is a real descriptor over a scratch backing file. Real fds keep
//! close/dup semantics honest, so descriptor-leak and ownership tests mean
//! what they say; fds are resolved back to programs through the backing
//! file's inode, which survives duplication.

// Not every test file uses every helper.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use xdpmux::btf::{Member, SectionVar, TypeCatalog, TypeEntry, VarLinkage, RUN_CONFIG_SECTION};
use xdpmux::{
    AttachMode, DispatcherConfig, Error, Kernel, OpenOpts, ProgInfo, ProgramObject, Result,
    XdpAction, XdpFlags, XdpLinkInfo, XdpProgram,
};

// =============================================================================
// FakeKernel
// =============================================================================

/// Deterministic fake of the [`Kernel`] contract.
#[derive(Clone)]
pub struct FakeKernel {
    inner: Arc<Inner>,
}

struct Inner {
    dir: TempDir,
    state: Mutex<KernelState>,
}

#[derive(Default)]
struct KernelState {
    templates: HashMap<String, ObjectTemplate>,
    progs: HashMap<u32, ProgRecord>,
    inodes: HashMap<u64, u32>,
    links: HashMap<u32, LinkState>,
    btfs: HashMap<u32, Arc<TypeCatalog>>,
    next_prog_id: u32,
    next_btf_id: u32,
    clock: u64,
}

struct ProgRecord {
    name: String,
    tag: [u8; 8],
    load_time: u64,
    btf_id: Option<u32>,
    path: PathBuf,
}

#[derive(Clone, Copy)]
struct LinkState {
    prog_id: u32,
    mode: AttachMode,
}

/// Blueprint for objects handed out by `open_object_*`.
#[derive(Clone)]
pub struct ObjectTemplate {
    /// Declared programs as `(name, byte size)`.
    pub programs: Vec<(String, usize)>,
    /// Type metadata carried by the object.
    pub btf: Option<Arc<TypeCatalog>>,
    /// Read-only data section contents.
    pub rodata: Option<Vec<u8>>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                dir: tempfile::tempdir().expect("create scratch dir"),
                state: Mutex::default(),
            }),
        }
    }

    /// Registers an object template under a file name.
    pub fn register_object(&self, file_name: &str, template: ObjectTemplate) {
        let mut state = self.inner.state.lock().unwrap();
        state.templates.insert(file_name.to_string(), template);
    }

    /// Registers the standard dispatcher template.
    pub fn register_dispatcher_template(&self) {
        self.register_object(
            "xdp-dispatcher.o",
            ObjectTemplate {
                programs: vec![("xdp_dispatcher".to_string(), 1024)],
                btf: None,
                rodata: Some(vec![0; DispatcherConfig::SIZE]),
            },
        );
    }

    /// The program attached to an interface, if any.
    pub fn attached(&self, ifindex: u32) -> Option<(u32, AttachMode)> {
        let state = self.inner.state.lock().unwrap();
        state
            .links
            .get(&ifindex)
            .map(|link| (link.prog_id, link.mode))
    }

    /// The declared name of a registered program.
    pub fn prog_name(&self, id: u32) -> Option<String> {
        let state = self.inner.state.lock().unwrap();
        state.progs.get(&id).map(|rec| rec.name.clone())
    }
}

impl Inner {
    fn register_prog(&self, name: &str, btf: Option<Arc<TypeCatalog>>) -> Result<(u32, OwnedFd)> {
        let mut state = self.state.lock().unwrap();
        state.next_prog_id += 1;
        let id = state.next_prog_id;
        state.clock += 1;
        let load_time = state.clock;

        let btf_id = btf.map(|catalog| {
            state.next_btf_id += 1;
            let bid = state.next_btf_id;
            state.btfs.insert(bid, catalog);
            bid
        });

        let path = self.dir.path().join(format!("prog-{id}"));
        let file =
            File::create(&path).map_err(|e| Error::io("create program backing file", e))?;
        let ino = file
            .metadata()
            .map_err(|e| Error::io("stat program backing file", e))?
            .ino();

        let tag = u64::from(id)
            .wrapping_mul(0x9e37_79b9_97f4_a7c1)
            .to_ne_bytes();
        state.inodes.insert(ino, id);
        state.progs.insert(
            id,
            ProgRecord {
                name: name.to_string(),
                tag,
                load_time,
                btf_id,
                path,
            },
        );
        Ok((id, OwnedFd::from(file)))
    }

    /// Maps a (possibly duplicated) fd back to the program it refers to.
    fn resolve_fd(&self, fd: BorrowedFd<'_>) -> Result<u32> {
        let ino = inode_of(fd)?;
        let state = self.state.lock().unwrap();
        state
            .inodes
            .get(&ino)
            .copied()
            .ok_or_else(|| Error::InvalidArgument {
                reason: "fd does not refer to a known program".into(),
            })
    }

}

fn instantiate(inner: &Arc<Inner>, template: &ObjectTemplate) -> Arc<dyn ProgramObject> {
    Arc::new(FakeObject {
        inner: Arc::clone(inner),
        programs: template.programs.clone(),
        btf: template.btf.clone(),
        state: Mutex::new(ObjectState {
            rodata: template.rodata.clone(),
            ..ObjectState::default()
        }),
    })
}

impl Kernel for FakeKernel {
    fn open_object_file(&self, path: &Path, _opts: &OpenOpts) -> Result<Arc<dyn ProgramObject>> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidArgument {
                reason: format!("bad object path: {}", path.display()),
            })?;
        let state = self.inner.state.lock().unwrap();
        let template = state
            .templates
            .get(name)
            .ok_or_else(|| Error::ObjectFileNotFound {
                name: name.to_string(),
            })?;
        Ok(instantiate(&self.inner, template))
    }

    fn open_object_buffer(
        &self,
        bytes: &[u8],
        _opts: &OpenOpts,
    ) -> Result<Arc<dyn ProgramObject>> {
        // Buffers are template names in this fake.
        let name = std::str::from_utf8(bytes).map_err(|_| Error::InvalidArgument {
            reason: "unrecognized object buffer".into(),
        })?;
        let state = self.inner.state.lock().unwrap();
        let template = state
            .templates
            .get(name)
            .ok_or_else(|| Error::ObjectFileNotFound {
                name: name.to_string(),
            })?;
        Ok(instantiate(&self.inner, template))
    }

    fn prog_fd_by_id(&self, id: u32) -> Result<OwnedFd> {
        let path = {
            let state = self.inner.state.lock().unwrap();
            state.progs.get(&id).map(|rec| rec.path.clone())
        };
        let path = path.ok_or_else(|| {
            Error::io("get program fd by id", io::Error::from_raw_os_error(libc::ENOENT))
        })?;
        let file = File::open(path).map_err(|e| Error::io("open program backing file", e))?;
        Ok(OwnedFd::from(file))
    }

    fn prog_info(&self, fd: BorrowedFd<'_>) -> Result<ProgInfo> {
        let id = self.inner.resolve_fd(fd)?;
        let state = self.inner.state.lock().unwrap();
        let rec = state.progs.get(&id).ok_or_else(|| {
            Error::io("get program info", io::Error::from_raw_os_error(libc::ENOENT))
        })?;
        Ok(ProgInfo {
            id,
            name: rec.name.clone(),
            tag: rec.tag,
            load_time: rec.load_time,
            btf_id: rec.btf_id,
        })
    }

    fn btf_by_id(&self, id: u32) -> Result<Arc<TypeCatalog>> {
        let state = self.inner.state.lock().unwrap();
        state.btfs.get(&id).cloned().ok_or_else(|| {
            Error::io("get btf by id", io::Error::from_raw_os_error(libc::ENOENT))
        })
    }

    fn attach_extension(&self, prog_fd: BorrowedFd<'_>) -> Result<OwnedFd> {
        self.inner.resolve_fd(prog_fd)?;
        let file = File::open("/dev/null").map_err(|e| Error::io("open attachment fd", e))?;
        Ok(OwnedFd::from(file))
    }

    fn pin(&self, _fd: BorrowedFd<'_>, path: &Path) -> Result<()> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map(|_| ())
            .map_err(|e| Error::io(format!("pin object at {}", path.display()), e))
    }

    fn query_xdp(&self, ifindex: u32) -> Result<XdpLinkInfo> {
        let state = self.inner.state.lock().unwrap();
        Ok(match state.links.get(&ifindex) {
            Some(link) => {
                let mut info = XdpLinkInfo {
                    attach_mode: link.mode,
                    ..XdpLinkInfo::default()
                };
                match link.mode {
                    AttachMode::Skb => info.skb_prog_id = Some(link.prog_id),
                    _ => info.drv_prog_id = Some(link.prog_id),
                }
                info
            },
            None => XdpLinkInfo::default(),
        })
    }

    fn set_xdp(&self, ifindex: u32, prog: Option<BorrowedFd<'_>>, flags: XdpFlags) -> Result<()> {
        let mode = mode_from_flags(flags);
        match prog {
            Some(fd) => {
                let id = self.inner.resolve_fd(fd)?;
                let mut state = self.inner.state.lock().unwrap();
                if let Some(existing) = state.links.get(&ifindex) {
                    if flags.contains(XdpFlags::UPDATE_IF_NOEXIST) {
                        return Err(eexist("interface already has an XDP program"));
                    }
                    // The kernel refuses to replace across generic/native
                    // modes in one call.
                    if existing.mode != mode {
                        return Err(eexist("attached program uses a different mode"));
                    }
                }
                state.links.insert(ifindex, LinkState { prog_id: id, mode });
                Ok(())
            },
            None => {
                let mut state = self.inner.state.lock().unwrap();
                if let Some(existing) = state.links.get(&ifindex).copied() {
                    if mode == AttachMode::Unspec || existing.mode == mode {
                        state.links.remove(&ifindex);
                    }
                }
                Ok(())
            },
        }
    }

    fn find_object_file(&self, name: &str) -> Result<PathBuf> {
        let state = self.inner.state.lock().unwrap();
        if state.templates.contains_key(name) {
            Ok(PathBuf::from(format!("/fake/{name}")))
        } else {
            Err(Error::ObjectFileNotFound {
                name: name.to_string(),
            })
        }
    }
}

fn eexist(context: &str) -> Error {
    Error::io(context, io::Error::from_raw_os_error(libc::EEXIST))
}

fn mode_from_flags(flags: XdpFlags) -> AttachMode {
    if flags.contains(XdpFlags::SKB_MODE) {
        AttachMode::Skb
    } else if flags.contains(XdpFlags::DRV_MODE) {
        AttachMode::Native
    } else if flags.contains(XdpFlags::HW_MODE) {
        AttachMode::Hw
    } else {
        AttachMode::Unspec
    }
}

fn inode_of(fd: BorrowedFd<'_>) -> Result<u64> {
    let st = nix::sys::stat::fstat(fd.as_raw_fd())
        .map_err(|e| Error::io("fstat backing file", io::Error::from(e)))?;
    Ok(st.st_ino)
}

// =============================================================================
// FakeObject
// =============================================================================

struct FakeObject {
    inner: Arc<Inner>,
    programs: Vec<(String, usize)>,
    btf: Option<Arc<TypeCatalog>>,
    state: Mutex<ObjectState>,
}

#[derive(Default)]
struct ObjectState {
    rodata: Option<Vec<u8>>,
    loaded: bool,
    attach_targets: HashMap<String, (u32, String)>,
    extensions: HashSet<String>,
    fds: HashMap<String, OwnedFd>,
}

impl ProgramObject for FakeObject {
    fn first_program(&self) -> Option<String> {
        self.programs.first().map(|(name, _)| name.clone())
    }

    fn has_program(&self, name: &str) -> bool {
        self.programs.iter().any(|(n, _)| n == name)
    }

    fn type_metadata(&self) -> Option<Arc<TypeCatalog>> {
        self.btf.clone()
    }

    fn rodata(&self) -> Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state.rodata.clone().ok_or(Error::NoRodata)
    }

    fn set_rodata(&self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.loaded {
            return Err(Error::InvalidArgument {
                reason: "object is already loaded".into(),
            });
        }
        match state.rodata.as_mut() {
            Some(existing) if existing.len() == data.len() => {
                existing.copy_from_slice(data);
                Ok(())
            },
            Some(existing) => Err(Error::DispatcherConfigSize {
                size: data.len(),
                expected: existing.len(),
            }),
            None => Err(Error::NoRodata),
        }
    }

    fn set_attach_target(&self, prog: &str, target: BorrowedFd<'_>, symbol: &str) -> Result<()> {
        if !self.has_program(prog) {
            return Err(Error::ProgramNotFound {
                name: prog.to_string(),
            });
        }
        let target_id = self.inner.resolve_fd(target)?;
        let mut state = self.state.lock().unwrap();
        if state.loaded {
            return Err(Error::InvalidArgument {
                reason: "object is already loaded".into(),
            });
        }
        state
            .attach_targets
            .insert(prog.to_string(), (target_id, symbol.to_string()));
        Ok(())
    }

    fn set_extension_type(&self, prog: &str) -> Result<()> {
        if !self.has_program(prog) {
            return Err(Error::ProgramNotFound {
                name: prog.to_string(),
            });
        }
        let mut state = self.state.lock().unwrap();
        if state.loaded {
            return Err(Error::InvalidArgument {
                reason: "object is already loaded".into(),
            });
        }
        state.extensions.insert(prog.to_string());
        Ok(())
    }

    fn load(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.loaded {
            return Err(Error::InvalidArgument {
                reason: "object is already loaded".into(),
            });
        }
        for (name, _) in &self.programs {
            if state.extensions.contains(name) && !state.attach_targets.contains_key(name) {
                return Err(Error::InvalidArgument {
                    reason: format!("extension program '{name}' has no attach target"),
                });
            }
            let (_, fd) = self.inner.register_prog(name, self.btf.clone())?;
            state.fds.insert(name.clone(), fd);
        }
        state.loaded = true;
        Ok(())
    }

    fn program_fd(&self, prog: &str) -> Result<OwnedFd> {
        let state = self.state.lock().unwrap();
        if !state.loaded {
            return Err(Error::NotLoaded {
                name: prog.to_string(),
            });
        }
        let fd = state.fds.get(prog).ok_or_else(|| Error::ProgramNotFound {
            name: prog.to_string(),
        })?;
        fd.try_clone()
            .map_err(|e| Error::io("duplicate program fd", e))
    }

    fn program_size(&self, prog: &str) -> Option<usize> {
        self.programs
            .iter()
            .find(|(n, _)| n == prog)
            .map(|(_, size)| *size)
    }
}

// =============================================================================
// Test data builders
// =============================================================================

/// Builds a catalog encoding `{priority = K, <action> = 0|1, ...}` for the
/// named program.
pub fn run_config_catalog(
    prog_name: &str,
    priority: Option<u32>,
    chain: &[(XdpAction, bool)],
) -> TypeCatalog {
    let mut catalog = TypeCatalog::new();
    let int_id = catalog.push(TypeEntry::Int {
        name: "int".into(),
        size: 4,
    });

    let mut members = Vec::new();
    let mut uint_member = |catalog: &mut TypeCatalog, name: &str, value: u32| {
        let arr = catalog.push(TypeEntry::Array {
            element: int_id,
            count: value,
        });
        let ptr = catalog.push(TypeEntry::Ptr { pointee: arr });
        members.push(Member {
            name: name.into(),
            type_id: ptr,
        });
    };
    if let Some(priority) = priority {
        uint_member(&mut catalog, "priority", priority);
    }
    for (action, enabled) in chain {
        uint_member(&mut catalog, action.name(), u32::from(*enabled));
    }

    let size = 8 * members.len() as u32;
    let struct_id = catalog.push(TypeEntry::Struct {
        name: String::new(),
        size,
        members,
    });
    let var_id = catalog.push(TypeEntry::Var {
        name: format!("_{prog_name}"),
        type_id: struct_id,
        linkage: VarLinkage::GlobalAllocated,
    });
    catalog.push(TypeEntry::DataSec {
        name: RUN_CONFIG_SECTION.into(),
        vars: vec![SectionVar {
            type_id: var_id,
            offset: 0,
            size,
        }],
    });
    catalog
}

/// Template for a component object declaring one program with a run config.
pub fn component_template(
    prog_name: &str,
    size: usize,
    priority: u32,
    chain: &[(XdpAction, bool)],
) -> ObjectTemplate {
    ObjectTemplate {
        programs: vec![(prog_name.to_string(), size)],
        btf: Some(Arc::new(run_config_catalog(prog_name, Some(priority), chain))),
        rodata: None,
    }
}

/// Template for a component object without any run config.
pub fn plain_template(prog_name: &str, size: usize) -> ObjectTemplate {
    ObjectTemplate {
        programs: vec![(prog_name.to_string(), size)],
        btf: None,
        rodata: None,
    }
}

/// Registers a component template and opens a handle for it.
pub fn open_component(kernel: &FakeKernel, file_name: &str, template: ObjectTemplate) -> XdpProgram {
    kernel.register_object(file_name, template);
    XdpProgram::open_file(
        kernel,
        Path::new(&format!("/fake/{file_name}")),
        None,
        &OpenOpts::default(),
    )
    .expect("open component")
}
