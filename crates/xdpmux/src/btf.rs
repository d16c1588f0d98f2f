//! Self-describing type metadata and the declarative run-config reader.
//!
//! A component program can declare its run configuration in the object's
//! type metadata, in a format similar to how BTF-defined maps are declared:
//!
//! ```c
//! struct {
//!     __uint(priority, 10);
//!     __uint(XDP_PASS, 1);
//! } XDP_RUN_CONFIG(FUNCNAME);
//! ```
//!
//! which the compiler lowers to a variable named `_FUNCNAME` in the
//! `.xdp_run_config` data section, each member a pointer to an array whose
//! element count carries the value. The priority sorts programs as they are
//! attached; a non-zero value for an action name means execution continues
//! to the next program in the chain when that action is returned.
//!
//! Because this encoding becomes part of the object's metadata, it survives
//! loading into the kernel and can be recovered for already-loaded programs.
//!
//! The metadata parser itself is an external collaborator; its resolved
//! output is modeled here as a [`TypeCatalog`].

use tracing::{debug, warn};

use crate::action::XdpAction;
use crate::error::{Error, Result};

/// Name of the data section holding run-config variables.
pub const RUN_CONFIG_SECTION: &str = ".xdp_run_config";

/// Identifier of a type within a [`TypeCatalog`]. Id 0 is `void`.
pub type TypeId = u32;

/// Linkage of a metadata variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarLinkage {
    /// File-local variable.
    Static,
    /// Global variable with allocated storage.
    GlobalAllocated,
    /// Extern declaration without storage.
    Extern,
}

/// One member of a struct type.
#[derive(Debug, Clone)]
pub struct Member {
    /// Member name.
    pub name: String,
    /// Member type.
    pub type_id: TypeId,
}

/// Placement of a variable within a data section.
#[derive(Debug, Clone)]
pub struct SectionVar {
    /// The `Var` entry describing the variable.
    pub type_id: TypeId,
    /// Byte offset within the section.
    pub offset: u32,
    /// Size reserved for the variable in the section.
    pub size: u32,
}

/// A resolved type-metadata entry.
#[derive(Debug, Clone)]
pub enum TypeEntry {
    /// Integer type.
    Int {
        /// Type name.
        name: String,
        /// Size in bytes.
        size: u32,
    },
    /// Pointer to another type.
    Ptr {
        /// The pointed-to type.
        pointee: TypeId,
    },
    /// Fixed-size array.
    Array {
        /// Element type.
        element: TypeId,
        /// Element count.
        count: u32,
    },
    /// Struct type.
    Struct {
        /// Type name; empty for anonymous structs.
        name: String,
        /// Declared size in bytes.
        size: u32,
        /// Ordered members.
        members: Vec<Member>,
    },
    /// Type alias.
    Typedef {
        /// Alias name.
        name: String,
        /// The aliased type.
        aliased: TypeId,
    },
    /// `const` modifier.
    Const {
        /// The modified type.
        inner: TypeId,
    },
    /// `volatile` modifier.
    Volatile {
        /// The modified type.
        inner: TypeId,
    },
    /// `restrict` modifier.
    Restrict {
        /// The modified type.
        inner: TypeId,
    },
    /// Variable declaration.
    Var {
        /// Variable name.
        name: String,
        /// The variable's type.
        type_id: TypeId,
        /// Linkage class.
        linkage: VarLinkage,
    },
    /// Data section with its variable placements.
    DataSec {
        /// Section name.
        name: String,
        /// Variables placed in the section.
        vars: Vec<SectionVar>,
    },
}

/// Resolved type metadata for one program object, as produced by the
/// external metadata parser.
///
/// Ids are 1-based; id 0 is reserved for `void` and never resolves.
#[derive(Debug, Clone, Default)]
pub struct TypeCatalog {
    types: Vec<TypeEntry>,
}

impl TypeCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry and returns its id.
    pub fn push(&mut self, entry: TypeEntry) -> TypeId {
        self.types.push(entry);
        self.types.len() as TypeId
    }

    /// Looks up an entry by id.
    #[must_use]
    pub fn get(&self, id: TypeId) -> Option<&TypeEntry> {
        if id == 0 {
            return None;
        }
        self.types.get(id as usize - 1)
    }

    /// Iterates over all entries with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &TypeEntry)> {
        self.types
            .iter()
            .enumerate()
            .map(|(i, t)| (i as TypeId + 1, t))
    }

    /// Resolves through modifiers and typedefs to the underlying type.
    #[must_use]
    pub fn resolve(&self, mut id: TypeId) -> Option<&TypeEntry> {
        loop {
            match self.get(id)? {
                TypeEntry::Typedef { aliased: next, .. }
                | TypeEntry::Const { inner: next }
                | TypeEntry::Volatile { inner: next }
                | TypeEntry::Restrict { inner: next } => id = *next,
                other => return Some(other),
            }
        }
    }
}

/// Run configuration recovered from a program's type metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunConfig {
    /// Declared run priority, if the struct carries one.
    pub priority: Option<u32>,
    /// Per-action continuation settings, in declaration order.
    pub chain_call: Vec<(XdpAction, bool)>,
}

/// Parses the run configuration attached to the named program.
///
/// Scans the catalog for the [`RUN_CONFIG_SECTION`] data section and, within
/// it, the variable named `_<prog_name>`. The variable's type (after
/// stripping modifiers and aliases) must be a struct whose declared size
/// fits the section placement; each member must be either `priority` or an
/// action name, encoded as a pointer to an array whose element count carries
/// the value.
///
/// # Errors
///
/// - [`Error::NoRunConfig`] if the section or the variable is absent.
/// - [`Error::MalformedRunConfig`] if the shape contract is violated.
/// - [`Error::NotSupported`] for a member name that is neither `priority`
///   nor a known action.
pub fn parse_run_config(catalog: &TypeCatalog, prog_name: &str) -> Result<RunConfig> {
    let var_name = format!("_{prog_name}");

    let section = catalog.iter().find_map(|(_, entry)| match entry {
        TypeEntry::DataSec { name, vars } if name == RUN_CONFIG_SECTION => Some(vars),
        _ => None,
    });
    let Some(vars) = section else {
        debug!(section = RUN_CONFIG_SECTION, "run config section not found");
        return Err(Error::NoRunConfig {
            name: prog_name.to_string(),
        });
    };

    for placement in vars {
        let Some(TypeEntry::Var {
            name,
            type_id,
            linkage,
        }) = catalog.get(placement.type_id)
        else {
            warn!(type_id = placement.type_id, "section entry is not a variable");
            return Err(malformed(prog_name, "section entry is not a variable"));
        };
        if name != &var_name {
            continue;
        }

        if !matches!(linkage, VarLinkage::GlobalAllocated | VarLinkage::Static) {
            warn!(var = %name, ?linkage, "unsupported run config variable linkage");
            return Err(malformed(prog_name, "unsupported variable linkage"));
        }

        let Some(TypeEntry::Struct { size, members, .. }) = catalog.resolve(*type_id) else {
            warn!(var = %name, "run config variable is not a struct");
            return Err(malformed(prog_name, "variable type is not a struct"));
        };
        if *size > placement.size {
            warn!(var = %name, size, placement = placement.size, "struct overflows its section slot");
            return Err(malformed(prog_name, "struct size exceeds section slot"));
        }

        let mut config = RunConfig::default();
        for member in members {
            let value = field_int(catalog, prog_name, member)?;
            if member.name == "priority" {
                config.priority = Some(value);
            } else if let Ok(action) = member.name.parse::<XdpAction>() {
                config.chain_call.push((action, value != 0));
            } else {
                warn!(member = %member.name, "unrecognized run config member");
                return Err(Error::NotSupported {
                    reason: format!("unrecognized run config member: {}", member.name),
                });
            }
        }
        return Ok(config);
    }

    debug!(var = %var_name, "run config variable not found");
    Err(Error::NoRunConfig {
        name: prog_name.to_string(),
    })
}

/// Decodes a pointer-to-array member into the array's element count.
fn field_int(catalog: &TypeCatalog, prog_name: &str, member: &Member) -> Result<u32> {
    let Some(TypeEntry::Ptr { pointee }) = catalog.resolve(member.type_id) else {
        warn!(member = %member.name, "expected pointer member");
        return Err(malformed(
            prog_name,
            format!("member '{}' is not a pointer", member.name),
        ));
    };
    let Some(TypeEntry::Array { count, .. }) = catalog.get(*pointee) else {
        warn!(member = %member.name, "expected pointer to array");
        return Err(malformed(
            prog_name,
            format!("member '{}' does not point to an array", member.name),
        ));
    };
    Ok(*count)
}

fn malformed(prog_name: &str, reason: impl Into<String>) -> Error {
    Error::MalformedRunConfig {
        name: prog_name.to_string(),
        reason: reason.into(),
    }
}
