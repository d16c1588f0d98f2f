//! Installing composed chains on an interface and pinning the slot
//! attachments.
//!
//! Installation is serialized across processes by the bpffs lock. The slot
//! attachment fds are pinned under
//! `<managed>/dispatch-<dispatcher-id>/link-prog<i>` so the extension
//! bindings survive the installing process; whichever process later calls
//! [`Installer::detach`] owns their removal.

use std::fs;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;

use tracing::{debug, warn};

use crate::bpffs::{create_dir_owner_only, BpfFs};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, ErrorKind, Result};
use crate::kernel::{AttachMode, Kernel, XdpFlags};
use crate::program::XdpProgram;

/// Installs program chains on interfaces.
pub struct Installer<'a> {
    kernel: &'a dyn Kernel,
    bpffs: &'a BpfFs,
}

impl<'a> Installer<'a> {
    /// Creates an installer over the given kernel and bpf filesystem.
    #[must_use]
    pub const fn new(kernel: &'a dyn Kernel, bpffs: &'a BpfFs) -> Self {
        Self { kernel, bpffs }
    }

    /// Installs the given programs on an interface.
    ///
    /// A single program attaches directly (loading it first if needed); a
    /// longer chain is sorted, composed into a dispatcher, and its slot
    /// attachments pinned before the interface is touched. Without `force`
    /// an existing program is never replaced. With `force`, an existing
    /// program attached in the incompatible generic/native mode is detached
    /// and the attach retried.
    ///
    /// Returns an owned fd for the program now attached (the dispatcher for
    /// a multi-program chain), usable with [`Installer::detach`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an empty chain, pin failures
    /// before the interface is modified, and the kernel's attach error
    /// otherwise.
    pub fn attach(
        &self,
        progs: &mut [XdpProgram],
        ifindex: u32,
        force: bool,
        mode: AttachMode,
    ) -> Result<OwnedFd> {
        if progs.is_empty() {
            return Err(Error::InvalidArgument {
                reason: "empty program chain".into(),
            });
        }

        let prog_fd: OwnedFd = if progs.len() > 1 {
            let dispatcher = Dispatcher::compose(self.kernel, progs)?;
            self.pin(dispatcher.fd(), progs)?;
            dispatcher.into_fd()
        } else {
            let prog = &mut progs[0];
            if !prog.is_loaded() {
                prog.load(self.kernel)?;
            }
            prog.prog_fd_required()?
                .try_clone_to_owned()
                .map_err(|e| Error::io("duplicate program fd", e))?
        };

        debug!(fd = prog_fd.as_raw_fd(), ifindex, "loading XDP fd onto interface");

        let mut flags = mode.flags();
        if !force {
            flags |= XdpFlags::UPDATE_IF_NOEXIST;
        }

        let mut outcome = self.kernel.set_xdp(ifindex, Some(prog_fd.as_fd()), flags);
        let incompatible_mode = matches!(
            &outcome,
            Err(err) if err.errno() == libc::EEXIST && !flags.contains(XdpFlags::UPDATE_IF_NOEXIST)
        );
        if incompatible_mode {
            // Replace didn't work, probably because a program of the
            // opposite mode is attached. Detach that one and try again.
            let mut flipped = flags;
            flipped.remove(XdpFlags::MODES);
            flipped |= if mode == AttachMode::Skb {
                XdpFlags::DRV_MODE
            } else {
                XdpFlags::SKB_MODE
            };
            debug!(ifindex, "retrying attach after detaching opposite-mode program");
            outcome = self
                .kernel
                .set_xdp(ifindex, None, flipped)
                .and_then(|()| self.kernel.set_xdp(ifindex, Some(prog_fd.as_fd()), flags));
        }

        if let Err(err) = outcome {
            warn!(ifindex, error = %err, "Error attaching XDP program");
            match err.kind() {
                ErrorKind::AlreadyExists => {
                    warn!("XDP program already loaded on device; use force to replace");
                },
                ErrorKind::NotSupported => {
                    warn!("Native XDP not supported; try SKB mode");
                },
                _ => {},
            }
            return Err(err);
        }

        debug!(num_progs = progs.len(), ifindex, ?mode, "attached XDP programs");
        Ok(prog_fd)
    }

    /// Pins each program's slot attachment under the dispatcher's pin
    /// directory.
    ///
    /// Takes the cross-process lock, creates
    /// `<managed>/dispatch-<dispatcher-id>` (tolerating an existing
    /// directory), and pins `link-prog<i>` for each program in chain order.
    /// On any per-program failure every pin created so far is unlinked,
    /// walking backwards; the directory itself is left for
    /// [`Installer::detach`]'s final removal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotLinked`] for a program without a slot attachment
    /// and [`Error::Io`] for filesystem or kernel pin failures.
    pub fn pin(&self, dispatcher_fd: BorrowedFd<'_>, progs: &mut [XdpProgram]) -> Result<()> {
        let managed = self.bpffs.managed_dir()?.to_path_buf();
        let info = self.kernel.prog_info(dispatcher_fd)?;
        let _lock = self.bpffs.lock()?;

        let pin_dir = managed.join(format!("dispatch-{}", info.id));
        debug!(
            fd = dispatcher_fd.as_raw_fd(),
            dir = %pin_dir.display(),
            "pinning multiprog attachments"
        );
        create_dir_owner_only(&pin_dir)?;

        for i in 0..progs.len() {
            let link_path = pin_dir.join(format!("link-prog{i}"));
            match self.pin_one(&progs[i], &link_path) {
                Ok(()) => {
                    debug!(prog = %progs[i].name(), path = %link_path.display(), "pinned slot attachment");
                    progs[i].set_link_pin_path(link_path);
                },
                Err(err) => {
                    self.rollback_pins(&mut progs[..i]);
                    return Err(err);
                },
            }
        }
        Ok(())
    }

    fn pin_one(&self, prog: &XdpProgram, link_path: &Path) -> Result<()> {
        let Some(link_fd) = prog.link_fd() else {
            warn!(prog = %prog.name(), "program is not attached to a dispatcher slot");
            return Err(Error::NotLinked {
                name: prog.name().to_string(),
            });
        };
        self.kernel.pin(link_fd, link_path)
    }

    /// Unlinks the pins recorded so far, newest first.
    fn rollback_pins(&self, pinned: &mut [XdpProgram]) {
        for prog in pinned.iter_mut().rev() {
            if let Some(path) = prog.take_link_pin_path() {
                if let Err(err) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %err, "failed to unlink pin during rollback");
                }
            }
        }
    }

    /// Removes the pin directory of an installed dispatcher.
    ///
    /// Takes the cross-process lock, unlinks every entry in
    /// `<managed>/dispatch-<dispatcher-id>`, then removes the directory.
    /// Once the pins are gone the kernel drops the extension bindings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PinNotFound`] if the directory does not exist and
    /// [`Error::Io`] for other filesystem failures.
    pub fn detach(&self, dispatcher_fd: BorrowedFd<'_>) -> Result<()> {
        let managed = self.bpffs.managed_dir()?.to_path_buf();
        let info = self.kernel.prog_info(dispatcher_fd)?;
        let _lock = self.bpffs.lock()?;

        let pin_dir = managed.join(format!("dispatch-{}", info.id));
        debug!(
            fd = dispatcher_fd.as_raw_fd(),
            dir = %pin_dir.display(),
            "unpinning multiprog attachments"
        );

        let entries = fs::read_dir(&pin_dir).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::PinNotFound {
                    path: pin_dir.clone(),
                }
            } else {
                Error::io(format!("open pin directory {}", pin_dir.display()), e)
            }
        })?;

        for entry in entries {
            let entry =
                entry.map_err(|e| Error::io("read pin directory entry", e))?;
            let path = entry.path();
            fs::remove_file(&path).map_err(|e| {
                warn!(path = %path.display(), error = %e, "failed to unlink pin");
                Error::io(format!("unlink pin {}", path.display()), e)
            })?;
        }

        fs::remove_dir(&pin_dir)
            .map_err(|e| Error::io(format!("remove pin directory {}", pin_dir.display()), e))
    }

    /// Recovers handles for the programs installed on an interface.
    ///
    /// Prefers the driver-mode program id over the generic-mode one.
    /// Currently returns a single handle even when the attached program is
    /// a dispatcher; recovering the component chain from an installed
    /// dispatcher is future work, and the `Vec` return shape anticipates it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoAttachedProgram`] when the hook is empty and
    /// propagates handle recovery failures.
    pub fn query(&self, ifindex: u32) -> Result<Vec<XdpProgram>> {
        let link = self.kernel.query_xdp(ifindex)?;
        let Some(id) = link.prog_id() else {
            return Err(Error::NoAttachedProgram { ifindex });
        };
        let prog = XdpProgram::from_id(self.kernel, id)?;
        Ok(vec![prog])
    }

    /// Installs a single program next to whatever is already attached.
    ///
    /// With `replace = true` the existing installation is dropped and the
    /// program installed alone. Splicing into an existing chain needs
    /// kernel support for re-attaching loaded extensions that does not
    /// exist yet, so that path reports [`Error::NotSupported`].
    ///
    /// # Errors
    ///
    /// [`Error::NotSupported`] when an installation exists and `replace` is
    /// false; otherwise the errors of [`Installer::attach`].
    pub fn insert(
        &self,
        prog: &mut XdpProgram,
        ifindex: u32,
        replace: bool,
        mode: AttachMode,
    ) -> Result<OwnedFd> {
        let occupied = match self.query(ifindex) {
            Ok(existing) => !existing.is_empty(),
            Err(err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => return Err(err),
        };

        if occupied && !replace {
            return Err(Error::NotSupported {
                reason: "inserting into an existing chain requires kernel re-attach support"
                    .into(),
            });
        }

        self.attach(std::slice::from_mut(prog), ifindex, true, mode)
    }
}
