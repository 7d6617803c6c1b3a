//! Newtype identifiers and the address-context markers found in stacks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process identifier as recorded in the capture.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Pid(pub i32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Thread identifier as recorded in the capture.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Tid(pub i32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

// =============================================================================
// ADDRESS CONTEXTS
// =============================================================================

// perf_event marks execution-context transitions inside a callchain with
// these sentinel values (PERF_CONTEXT_* in linux/perf_event.h).
const PERF_CONTEXT_HV: u64 = u64::MAX - 31;
const PERF_CONTEXT_KERNEL: u64 = u64::MAX - 127;
const PERF_CONTEXT_USER: u64 = u64::MAX - 511;
const PERF_CONTEXT_GUEST: u64 = u64::MAX - 2047;
const PERF_CONTEXT_GUEST_KERNEL: u64 = u64::MAX - 2175;
const PERF_CONTEXT_GUEST_USER: u64 = u64::MAX - 2559;

/// Execution context an address was captured in.
///
/// Stacks interleave real instruction pointers with context markers; every
/// address after a marker belongs to that marker's context until the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressContext {
    #[default]
    None,
    Hypervisor,
    Kernel,
    User,
    Guest,
    GuestKernel,
    GuestUser,
}

impl AddressContext {
    /// Every context that has a marker address, in marker order.
    pub const SWITCHABLE: [AddressContext; 6] = [
        AddressContext::Hypervisor,
        AddressContext::Kernel,
        AddressContext::User,
        AddressContext::Guest,
        AddressContext::GuestKernel,
        AddressContext::GuestUser,
    ];

    /// Decode a context-switch marker, returning `None` for ordinary addresses.
    #[must_use]
    pub fn from_marker(address: u64) -> Option<Self> {
        match address {
            PERF_CONTEXT_HV => Some(Self::Hypervisor),
            PERF_CONTEXT_KERNEL => Some(Self::Kernel),
            PERF_CONTEXT_USER => Some(Self::User),
            PERF_CONTEXT_GUEST => Some(Self::Guest),
            PERF_CONTEXT_GUEST_KERNEL => Some(Self::GuestKernel),
            PERF_CONTEXT_GUEST_USER => Some(Self::GuestUser),
            _ => None,
        }
    }

    /// Marker address announcing this context inside a stack.
    #[must_use]
    pub fn marker(self) -> Option<u64> {
        match self {
            Self::None => None,
            Self::Hypervisor => Some(PERF_CONTEXT_HV),
            Self::Kernel => Some(PERF_CONTEXT_KERNEL),
            Self::User => Some(PERF_CONTEXT_USER),
            Self::Guest => Some(PERF_CONTEXT_GUEST),
            Self::GuestKernel => Some(PERF_CONTEXT_GUEST_KERNEL),
            Self::GuestUser => Some(PERF_CONTEXT_GUEST_USER),
        }
    }

    /// Display name of the pseudo-frame that stands for this context.
    #[must_use]
    pub fn switch_label(self) -> &'static str {
        match self {
            Self::None => "- - None - -",
            Self::Hypervisor => "- - Hypervisor - -",
            Self::Kernel => "- - Kernel - -",
            Self::User => "- - User - -",
            Self::Guest => "- - Guest - -",
            Self::GuestKernel => "- - Guest Kernel - -",
            Self::GuestUser => "- - Guest User - -",
        }
    }

    /// Whether user-space resolvers should consider addresses in this context.
    #[must_use]
    pub fn is_user_space(self) -> bool {
        matches!(self, Self::None | Self::User)
    }
}
