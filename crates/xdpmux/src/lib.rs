//! Compose and install multiple XDP programs on a single interface hook.
//!
//! The kernel exposes exactly one XDP attachment point per network interface.
//! To let independent packet-processing programs coexist there, this library
//! synthesizes a *dispatcher* program that calls a sorted chain of component
//! programs and decides, per component return code, whether to continue the
//! chain or short-circuit with the last action.
//!
//! # Architecture
//!
//! ```text
//! XdpProgram          one component program: object, fds, run config
//!     |
//! Dispatcher::compose sort the chain, patch the dispatcher template,
//!     |               graft components as freplace extensions
//! Installer           pin the slot attachments under the bpffs, swap the
//!     |               interface program atomically
//! BpfFs               bpffs discovery, managed directory, cross-process lock
//! ```
//!
//! Each component may declare a *run configuration* (priority plus a
//! per-action chain-call policy) in its type metadata section. Because the
//! kernel preserves that metadata across loading, the chain policy can be
//! recovered from programs loaded by a different process; see [`btf`].
//!
//! The kernel program loader/verifier and the metadata parser are external
//! collaborators behind the [`kernel::Kernel`] and [`kernel::ProgramObject`]
//! traits, which keeps the composition and installation logic testable
//! without a live kernel.

pub mod action;
pub mod bpffs;
pub mod btf;
pub mod dispatcher;
pub mod error;
pub mod installer;
pub mod kernel;
pub mod program;

pub use action::{ChainCallActions, XdpAction};
pub use bpffs::{BpfFs, LockGuard};
pub use dispatcher::{
    compare_programs, Dispatcher, DispatcherConfig, DISPATCHER_OBJECT_FILE,
    DISPATCHER_PROGRAM_NAME, MAX_DISPATCHER_PROGS,
};
pub use error::{Error, ErrorKind, Result};
pub use installer::Installer;
pub use kernel::{
    AttachMode, Kernel, OpenOpts, ProgInfo, ProgramObject, XdpFlags, XdpLinkInfo, BPF_TAG_SIZE,
};
pub use program::{XdpProgram, DEFAULT_RUN_PRIO};
