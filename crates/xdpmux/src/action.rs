//! XDP action values and the per-program chain-call policy bitmap.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Verdict returned by an XDP program.
///
/// The discriminants are the kernel's return codes and must not change; the
/// chain-call bitmap and the dispatcher's slot configuration are indexed by
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum XdpAction {
    /// Internal error in the program; packet is dropped.
    Aborted = 0,
    /// Drop the packet.
    Drop = 1,
    /// Pass the packet up the stack.
    Pass = 2,
    /// Bounce the packet out the same interface.
    Tx = 3,
    /// Redirect to another interface or CPU.
    Redirect = 4,
}

impl XdpAction {
    /// All actions in discriminant order.
    pub const ALL: [Self; 5] = [
        Self::Aborted,
        Self::Drop,
        Self::Pass,
        Self::Tx,
        Self::Redirect,
    ];

    /// The action's textual name, exactly as it appears in run-config
    /// metadata.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Aborted => "XDP_ABORTED",
            Self::Drop => "XDP_DROP",
            Self::Pass => "XDP_PASS",
            Self::Tx => "XDP_TX",
            Self::Redirect => "XDP_REDIRECT",
        }
    }

    /// Looks up an action by its kernel return value.
    #[must_use]
    pub const fn from_value(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Aborted),
            1 => Some(Self::Drop),
            2 => Some(Self::Pass),
            3 => Some(Self::Tx),
            4 => Some(Self::Redirect),
            _ => None,
        }
    }
}

impl fmt::Display for XdpAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for XdpAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|action| action.name() == s)
            .ok_or_else(|| Error::InvalidArgument {
                reason: format!("unknown XDP action name: {s}"),
            })
    }
}

/// Per-program chain-call policy.
///
/// Bit *a* set means "continue to the next program in the chain when this
/// program returns action *a*"; a clear bit short-circuits the chain with
/// that action. Only bits for the values in [`XdpAction`] can be set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainCallActions(u32);

impl ChainCallActions {
    /// Every action short-circuits.
    pub const NONE: Self = Self(0);

    /// The default policy: continue only on `XDP_PASS`.
    pub const DEFAULT: Self = Self(1 << XdpAction::Pass as u32);

    const VALID_MASK: u32 = (1 << 5) - 1;

    /// Builds a policy from a raw bitmap, discarding bits outside the action
    /// enum.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & Self::VALID_MASK)
    }

    /// The raw bitmap, as stored in the dispatcher's slot configuration.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether the chain continues on the given action.
    #[must_use]
    pub const fn contains(self, action: XdpAction) -> bool {
        self.0 & (1 << action as u32) != 0
    }

    /// Returns the policy with the given action's continuation bit set or
    /// cleared.
    #[must_use]
    pub const fn with(self, action: XdpAction, enabled: bool) -> Self {
        if enabled {
            Self(self.0 | (1 << action as u32))
        } else {
            Self(self.0 & !(1 << action as u32))
        }
    }
}

impl Default for ChainCallActions {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for ChainCallActions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for action in XdpAction::ALL {
            if self.contains(action) {
                if !first {
                    f.write_str(",")?;
                }
                f.write_str(action.name())?;
                first = false;
            }
        }
        Ok(())
    }
}
