//! Error type for XDP program management.
//!
//! Every fallible operation in this crate returns [`Error`]. Variants carry
//! enough context to act on; [`Error::kind`] collapses them into the coarse
//! taxonomy callers branch on, and [`Error::errno`] maps each error to the
//! POSIX numeral a C caller would have seen.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification.
///
/// `kind()` is the stable branching surface; the variant set of [`Error`]
/// itself may grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A mount point, program, object file, or pin was not found.
    NotFound,
    /// The caller passed an argument outside the accepted domain.
    InvalidArg,
    /// The operation is not valid for the handle's current state.
    InvalidState,
    /// Embedded metadata or an object section violates its schema.
    Malformed,
    /// The target already exists (e.g. replace without force).
    AlreadyExists,
    /// The operation is not supported by the kernel or the metadata.
    NotSupported,
    /// Memory allocation failed.
    NoMemory,
    /// An unclassified filesystem or kernel call failure.
    Io,
}

/// Errors produced while composing and installing XDP programs.
#[derive(Debug, Error)]
pub enum Error {
    /// No bpf filesystem is mounted at the searched location.
    #[error("no bpf filesystem mounted at {}", path.display())]
    BpffsNotFound {
        /// The candidate mount point that failed validation.
        path: PathBuf,
    },

    /// The requested program symbol does not exist in the object.
    #[error("program not found: {name}")]
    ProgramNotFound {
        /// The program symbol that was looked up.
        name: String,
    },

    /// The object declares no programs at all.
    #[error("object contains no programs")]
    EmptyObject,

    /// A shipped object file could not be located on the search path.
    #[error("object file not found: {name}")]
    ObjectFileNotFound {
        /// The file name that was searched for.
        name: String,
    },

    /// The pin directory for a dispatcher does not exist.
    #[error("pin directory not found: {}", path.display())]
    PinNotFound {
        /// The directory that was expected to hold the pins.
        path: PathBuf,
    },

    /// No XDP program is attached to the interface.
    #[error("no XDP program attached to ifindex {ifindex}")]
    NoAttachedProgram {
        /// The queried interface index.
        ifindex: u32,
    },

    /// The program carries no run configuration.
    ///
    /// Constructors tolerate this and fall back to the defaults.
    #[error("program '{name}' carries no run config")]
    NoRunConfig {
        /// The program whose metadata was searched.
        name: String,
    },

    /// The run configuration is present but violates the encoding contract.
    #[error("run config for '{name}' is malformed: {reason}")]
    MalformedRunConfig {
        /// The program whose metadata was parsed.
        name: String,
        /// What part of the shape was violated.
        reason: String,
    },

    /// The dispatcher template's data section does not match the schema.
    #[error("dispatcher config section is {size} bytes, expected {expected}")]
    DispatcherConfigSize {
        /// Actual section size in bytes.
        size: usize,
        /// Expected section size in bytes.
        expected: usize,
    },

    /// The object has no read-only data section.
    #[error("object has no read-only data section")]
    NoRodata,

    /// The caller passed an argument outside the accepted domain.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// Why the argument was rejected.
        reason: String,
    },

    /// `load` was called on a handle that already holds a program fd.
    #[error("program '{name}' is already loaded")]
    AlreadyLoaded {
        /// The program that was asked to load again.
        name: String,
    },

    /// The handle has no object to load from.
    #[error("program '{name}' has no object to load from")]
    NoObject {
        /// The program missing its object.
        name: String,
    },

    /// The handle is expected to be loaded but is not.
    #[error("program '{name}' is not loaded")]
    NotLoaded {
        /// The program missing its program fd.
        name: String,
    },

    /// The handle is not attached to a dispatcher slot.
    #[error("program '{name}' is not attached to a dispatcher slot")]
    NotLinked {
        /// The program missing its attachment fd.
        name: String,
    },

    /// The operation requires kernel or metadata support that is absent.
    #[error("not supported: {reason}")]
    NotSupported {
        /// What support is missing.
        reason: String,
    },

    /// Memory allocation failed.
    #[error("out of memory: {context}")]
    NoMemory {
        /// The allocation that failed.
        context: String,
    },

    /// A filesystem or kernel call failed.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// The operation that failed.
        context: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Builds an [`Error::Io`] with context. Also the constructor for
    /// [`Kernel`](crate::kernel::Kernel) implementations surfacing raw
    /// kernel error codes.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Returns the coarse classification for this error.
    ///
    /// Raw I/O errors are promoted to the matching kind when their OS code
    /// has one (`EEXIST`/`EBUSY`, `ENOENT`, `EOPNOTSUPP`, `ENOMEM`), so
    /// kernel-reported conditions branch the same way as library-detected
    /// ones.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BpffsNotFound { .. }
            | Self::ProgramNotFound { .. }
            | Self::EmptyObject
            | Self::ObjectFileNotFound { .. }
            | Self::PinNotFound { .. }
            | Self::NoAttachedProgram { .. }
            | Self::NoRunConfig { .. }
            | Self::NoRodata => ErrorKind::NotFound,
            Self::MalformedRunConfig { .. } | Self::DispatcherConfigSize { .. } => {
                ErrorKind::Malformed
            },
            Self::InvalidArgument { .. } => ErrorKind::InvalidArg,
            Self::AlreadyLoaded { .. }
            | Self::NoObject { .. }
            | Self::NotLoaded { .. }
            | Self::NotLinked { .. } => ErrorKind::InvalidState,
            Self::NotSupported { .. } => ErrorKind::NotSupported,
            Self::NoMemory { .. } => ErrorKind::NoMemory,
            Self::Io { source, .. } => match source.raw_os_error() {
                Some(libc::EEXIST) | Some(libc::EBUSY) => ErrorKind::AlreadyExists,
                Some(libc::ENOENT) => ErrorKind::NotFound,
                Some(libc::EOPNOTSUPP) => ErrorKind::NotSupported,
                Some(libc::ENOMEM) => ErrorKind::NoMemory,
                _ => ErrorKind::Io,
            },
        }
    }

    /// Returns the POSIX error numeral for this error.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::BpffsNotFound { .. }
            | Self::ProgramNotFound { .. }
            | Self::EmptyObject
            | Self::ObjectFileNotFound { .. }
            | Self::PinNotFound { .. }
            | Self::NoAttachedProgram { .. }
            | Self::NoRunConfig { .. }
            | Self::NoRodata => libc::ENOENT,
            Self::MalformedRunConfig { .. }
            | Self::DispatcherConfigSize { .. }
            | Self::InvalidArgument { .. }
            | Self::NoObject { .. }
            | Self::NotLoaded { .. }
            | Self::NotLinked { .. } => libc::EINVAL,
            Self::AlreadyLoaded { .. } => libc::EEXIST,
            Self::NotSupported { .. } => libc::EOPNOTSUPP,
            Self::NoMemory { .. } => libc::ENOMEM,
            Self::Io { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
