//! Sorting component chains and synthesizing the dispatcher.
//!
//! The dispatcher is built from a shipped template object that carries one
//! placeholder function per slot (`prog0`..`prog9`) and a read-only
//! configuration section. Composition patches the configuration with the
//! chain length and per-slot chain-call masks, loads the template, then
//! grafts each component onto its slot as a function-replacement extension.

use std::cmp::Ordering;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::kernel::{Kernel, OpenOpts, ProgramObject};
use crate::program::XdpProgram;

/// Number of component slots in the dispatcher template.
pub const MAX_DISPATCHER_PROGS: usize = 10;

/// Entry symbol of the dispatcher template.
pub const DISPATCHER_PROGRAM_NAME: &str = "xdp_dispatcher";

/// File name of the dispatcher template object.
pub const DISPATCHER_OBJECT_FILE: &str = "xdp-dispatcher.o";

/// Canonical chain order.
///
/// Programs compare by run priority, then name, then loadedness (loaded
/// first), then object program size for two unloaded programs, then tag,
/// then load time. The comparison is deterministic for fixed inputs; ties
/// beyond the last key are permitted.
#[must_use]
pub fn compare_programs(a: &XdpProgram, b: &XdpProgram) -> Ordering {
    a.run_priority()
        .cmp(&b.run_priority())
        .then_with(|| a.name().as_bytes().cmp(b.name().as_bytes()))
        .then_with(|| b.is_loaded().cmp(&a.is_loaded()))
        .then_with(|| {
            if a.is_loaded() || b.is_loaded() {
                return Ordering::Equal;
            }
            match (a.object_program_size(), b.object_program_size()) {
                (Some(size_a), Some(size_b)) => size_a.cmp(&size_b),
                _ => Ordering::Equal,
            }
        })
        .then_with(|| a.tag().cmp(b.tag()))
        .then_with(|| a.load_time().cmp(&b.load_time()))
}

/// The dispatcher template's read-only configuration section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatcherConfig {
    /// Number of active slots.
    pub num_progs_enabled: u32,
    /// Chain-call mask per slot, indexed by chain position.
    pub chain_call_actions: [u32; MAX_DISPATCHER_PROGS],
}

impl DispatcherConfig {
    /// Byte size of the section.
    pub const SIZE: usize = 4 + 4 * MAX_DISPATCHER_PROGS;

    /// Encodes the section in the kernel's native byte order.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..4].copy_from_slice(&self.num_progs_enabled.to_ne_bytes());
        for (i, mask) in self.chain_call_actions.iter().enumerate() {
            let offset = 4 + i * 4;
            buf[offset..offset + 4].copy_from_slice(&mask.to_ne_bytes());
        }
        buf
    }

    /// Decodes the section, validating its exact size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DispatcherConfigSize`] on a size mismatch.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(Error::DispatcherConfigSize {
                size: bytes.len(),
                expected: Self::SIZE,
            });
        }
        let mut config = Self {
            num_progs_enabled: read_u32(bytes, 0),
            ..Self::default()
        };
        for i in 0..MAX_DISPATCHER_PROGS {
            config.chain_call_actions[i] = read_u32(bytes, 4 + i * 4);
        }
        Ok(config)
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_ne_bytes(word)
}

/// A synthesized multi-program dispatcher.
///
/// Owns the dispatcher's program fd and keeps the loaded template object
/// alive. Dropping it after the interface attach is safe; the kernel holds
/// its own references from the link and the pinned slot attachments.
pub struct Dispatcher {
    fd: OwnedFd,
    object: Arc<dyn ProgramObject>,
}

impl Dispatcher {
    /// Sorts the chain canonically and synthesizes a dispatcher for it.
    ///
    /// On return every component is loaded as a function-replacement
    /// extension anchored to its slot, with the attachment fd stored on the
    /// handle. Nothing is rolled back on failure: partially loaded
    /// components keep their descriptors and release them when the handles
    /// drop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an empty or oversized chain,
    /// [`Error::DispatcherConfigSize`] if the template's configuration
    /// section does not match the schema, and any loader failure.
    pub fn compose(kernel: &dyn Kernel, progs: &mut [XdpProgram]) -> Result<Self> {
        let num_progs = progs.len();
        if num_progs == 0 || num_progs > MAX_DISPATCHER_PROGS {
            return Err(Error::InvalidArgument {
                reason: format!("chain length {num_progs} outside 1..={MAX_DISPATCHER_PROGS}"),
            });
        }

        progs.sort_by(compare_programs);
        debug!(num_progs, "generating multi-program dispatcher");

        let path = kernel.find_object_file(DISPATCHER_OBJECT_FILE)?;
        let object = kernel.open_object_file(&path, &OpenOpts::default())?;

        let mut config = DispatcherConfig::from_bytes(&object.rodata()?)?;
        config.num_progs_enabled = num_progs as u32;
        for (i, prog) in progs.iter().enumerate() {
            config.chain_call_actions[i] = prog.chain_call_actions().bits();
        }
        object.set_rodata(&config.to_bytes())?;

        object.load()?;
        let dispatcher_fd = object.program_fd(DISPATCHER_PROGRAM_NAME)?;

        for (i, prog) in progs.iter_mut().enumerate() {
            let slot = format!("prog{i}");
            let component = prog.object().cloned().ok_or_else(|| Error::NoObject {
                name: prog.name().to_string(),
            })?;

            // Components must not be loaded yet: the kernel only accepts an
            // extension's attach target at load time.
            component.set_attach_target(prog.name(), dispatcher_fd.as_fd(), &slot)?;
            component.set_extension_type(prog.name())?;
            prog.load(kernel)?;

            let link = kernel.attach_extension(prog.prog_fd_required()?)?;
            debug!(
                prog = %prog.name(),
                prio = prog.run_priority(),
                slot = %slot,
                link_fd = link.as_raw_fd(),
                "attached program to dispatcher slot"
            );
            prog.set_link_fd(link);
        }

        Ok(Self {
            fd: dispatcher_fd,
            object,
        })
    }

    /// The dispatcher program's fd.
    #[must_use]
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Consumes the dispatcher, returning the program fd and releasing the
    /// template object handle.
    #[must_use]
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }

    /// The loaded template object.
    #[must_use]
    pub fn object(&self) -> &Arc<dyn ProgramObject> {
        &self.object
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("fd", &self.fd.as_raw_fd())
            .finish_non_exhaustive()
    }
}
