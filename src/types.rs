//! Core transport types shared by every module

use core::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Message identifier assigned by the transport (never zero)
pub type MessageId = u32;

/// Opaque handle naming a port-owned object (section, context, reserve)
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AlpcHandle(pub u64);

impl AlpcHandle {
    /// The null handle
    pub const NULL: Self = Self(0);

    /// Check if this is the null handle
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Raw handle value
    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for AlpcHandle {
    fn from(value: u64) -> Self {
        AlpcHandle(value)
    }
}

/// Locally unique identifier (64 bits)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Luid {
    pub low_part: u32,
    pub high_part: i32,
}

impl Luid {
    /// Build from a combined 64-bit value
    pub const fn from_u64(value: u64) -> Self {
        Self {
            low_part: value as u32,
            high_part: (value >> 32) as i32,
        }
    }

    /// Combined 64-bit value
    pub const fn as_u64(&self) -> u64 {
        ((self.high_part as u32 as u64) << 32) | self.low_part as u64
    }

    /// Allocate a fresh process-unique LUID
    pub fn allocate() -> Self {
        static NEXT_LUID: AtomicU64 = AtomicU64::new(0x1000);
        Self::from_u64(NEXT_LUID.fetch_add(1, Ordering::SeqCst))
    }
}

/// Sender identity carried in every message header
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClientId {
    /// Process identifier
    pub process: u64,
    /// Thread identifier
    pub thread: u64,
}

impl ClientId {
    /// Create a client id
    pub const fn new(process: u64, thread: u64) -> Self {
        Self { process, thread }
    }
}

/// Port identifier - newtype for type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PortId(pub u32);

impl PortId {
    /// Allocate the next port id
    pub fn allocate() -> Self {
        static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);
        PortId(NEXT_PORT_ID.fetch_add(1, Ordering::SeqCst) as u32)
    }
}

/// Deadline for a blocking operation
///
/// Native callers pass a 64-bit interval where negative values are relative
/// and positive values absolute; here the two forms are separate variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Block until the operation completes
    #[default]
    Infinite,
    /// Block for at most this long from the start of the call
    After(Duration),
    /// Block until this instant
    At(Instant),
}

impl Timeout {
    /// Relative timeout in milliseconds
    pub fn from_millis(ms: u64) -> Self {
        Timeout::After(Duration::from_millis(ms))
    }

    /// Resolve to an absolute deadline; `None` means wait forever
    pub fn deadline(self) -> Option<Instant> {
        match self {
            Timeout::Infinite => None,
            Timeout::After(duration) => Some(
                Instant::now()
                    .checked_add(duration)
                    .unwrap_or_else(far_future),
            ),
            Timeout::At(instant) => Some(instant),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Timeout::After(duration)
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(duration: Option<Duration>) -> Self {
        duration.map_or(Timeout::Infinite, Timeout::After)
    }
}

fn far_future() -> Instant {
    // Roughly thirty years; enough to behave as infinite for any real caller
    Instant::now() + Duration::from_secs(86_400 * 365 * 30)
}
