//! Principals, SIDs and the per-thread impersonation stack
//!
//! Access checks made by the transport use the *effective* principal of the
//! calling thread: the top of its impersonation stack when impersonating,
//! otherwise the thread's own principal (or the process default).

use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, Ordering};
use std::cell::RefCell;

use spin::{Once, RwLock};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{AlpcError, Result};
use crate::types::{ClientId, Luid};

// ============================================================================
// Impersonation levels and QoS
// ============================================================================

/// Degree to which a receiver may act as the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u32)]
pub enum ImpersonationLevel {
    Anonymous = 0,
    Identification = 1,
    #[default]
    Impersonation = 2,
    Delegation = 3,
}

impl ImpersonationLevel {
    /// Convert from raw value (out-of-range values saturate to Delegation)
    pub fn from_raw(value: u32) -> Self {
        match value {
            0 => Self::Anonymous,
            1 => Self::Identification,
            2 => Self::Impersonation,
            _ => Self::Delegation,
        }
    }
}

/// When the client's identity is captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum ContextTrackingMode {
    /// Captured once at connect time
    #[default]
    Static = 0,
    /// Captured for every message
    Dynamic = 1,
}

/// Security quality of service requested by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SecurityQos {
    pub impersonation_level: ImpersonationLevel,
    pub tracking_mode: ContextTrackingMode,
    pub effective_only: bool,
}

impl SecurityQos {
    const PRESENT: u64 = 1 << 63;

    /// Create a QoS record
    pub const fn new(
        impersonation_level: ImpersonationLevel,
        tracking_mode: ContextTrackingMode,
        effective_only: bool,
    ) -> Self {
        Self {
            impersonation_level,
            tracking_mode,
            effective_only,
        }
    }

    /// Pack into the 64-bit QoS reference slot of a security attribute
    pub fn to_raw(&self) -> u64 {
        Self::PRESENT
            | self.impersonation_level as u64
            | (self.tracking_mode as u64) << 8
            | (self.effective_only as u64) << 16
    }

    /// Unpack a QoS reference; zero means "no QoS supplied"
    pub fn from_raw(raw: u64) -> Option<Self> {
        if raw & Self::PRESENT == 0 {
            return None;
        }
        Some(Self {
            impersonation_level: ImpersonationLevel::from_raw((raw & 0xFF) as u32),
            tracking_mode: if (raw >> 8) & 0xFF == 0 {
                ContextTrackingMode::Static
            } else {
                ContextTrackingMode::Dynamic
            },
            effective_only: (raw >> 16) & 0xFF != 0,
        })
    }
}

// ============================================================================
// SIDs
// ============================================================================

/// Maximum sub-authorities in a SID
pub const SID_MAX_SUB_AUTHORITIES: usize = 15;

/// Security identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sid {
    revision: u8,
    authority: u64,
    sub_authorities: heapless::Vec<u32, SID_MAX_SUB_AUTHORITIES>,
}

impl Sid {
    /// Build a revision-1 SID
    pub fn new(authority: u64, sub_authorities: &[u32]) -> Result<Self> {
        if authority >= 1 << 48 {
            return Err(AlpcError::InvalidParameter("SID authority exceeds 48 bits"));
        }
        let subs = heapless::Vec::from_slice(sub_authorities)
            .map_err(|_| AlpcError::InvalidParameter("too many SID sub-authorities"))?;
        Ok(Self {
            revision: 1,
            authority,
            sub_authorities: subs,
        })
    }

    /// Parse the `S-1-<authority>-<sub>...` form
    pub fn parse(text: &str) -> Result<Self> {
        let mut parts = text.split('-');
        if !matches!(parts.next(), Some("S") | Some("s")) {
            return Err(AlpcError::InvalidParameter("SID must start with S-"));
        }
        let revision: u8 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or(AlpcError::InvalidParameter("bad SID revision"))?;
        if revision != 1 {
            return Err(AlpcError::InvalidParameter("unsupported SID revision"));
        }
        let authority = parts
            .next()
            .and_then(|p| {
                p.strip_prefix("0x")
                    .map_or_else(|| p.parse().ok(), |hex| u64::from_str_radix(hex, 16).ok())
            })
            .ok_or(AlpcError::InvalidParameter("bad SID authority"))?;
        let mut subs = heapless::Vec::<u32, SID_MAX_SUB_AUTHORITIES>::new();
        for part in parts {
            let value = part
                .parse()
                .map_err(|_| AlpcError::InvalidParameter("bad SID sub-authority"))?;
            subs.push(value)
                .map_err(|_| AlpcError::InvalidParameter("too many SID sub-authorities"))?;
        }
        Self::new(authority, &subs)
    }

    /// Anonymous logon (S-1-5-7)
    pub fn anonymous() -> Self {
        Self::well_known(&[7])
    }

    /// Local system (S-1-5-18)
    pub fn local_system() -> Self {
        Self::well_known(&[18])
    }

    fn well_known(subs: &[u32]) -> Self {
        let mut sub_authorities = heapless::Vec::new();
        for sub in subs {
            let _ = sub_authorities.push(*sub);
        }
        Self {
            revision: 1,
            authority: 5,
            sub_authorities,
        }
    }

    /// Identifier authority
    pub fn authority(&self) -> u64 {
        self.authority
    }

    /// Sub-authorities
    pub fn sub_authorities(&self) -> &[u32] {
        &self.sub_authorities
    }

    /// Size of the binary encoding
    pub fn binary_len(&self) -> usize {
        8 + 4 * self.sub_authorities.len()
    }

    /// Binary encoding: revision, count, 48-bit big-endian authority,
    /// little-endian sub-authorities
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.binary_len());
        out.push(self.revision);
        out.push(self.sub_authorities.len() as u8);
        out.extend_from_slice(&self.authority.to_be_bytes()[2..]);
        for sub in &self.sub_authorities {
            out.extend_from_slice(&sub.to_le_bytes());
        }
        out
    }

    /// Decode the binary form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(AlpcError::InvalidParameter("SID shorter than its header"));
        }
        let count = bytes[1] as usize;
        if bytes.len() < 8 + 4 * count {
            return Err(AlpcError::InvalidParameter("SID truncated"));
        }
        let mut authority = [0u8; 8];
        authority[2..].copy_from_slice(&bytes[2..8]);
        let subs: Vec<u32> = bytes[8..8 + 4 * count]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let mut sid = Self::new(u64::from_be_bytes(authority), &subs)?;
        sid.revision = bytes[0];
        Ok(sid)
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S-{}-", self.revision)?;
        if self.authority >= 1 << 32 {
            write!(f, "0x{:012X}", self.authority)?;
        } else {
            write!(f, "{}", self.authority)?;
        }
        for sub in &self.sub_authorities {
            write!(f, "-{}", sub)?;
        }
        Ok(())
    }
}

// ============================================================================
// Principals
// ============================================================================

/// Token identifiers carried by the token attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TokenIdentity {
    pub token_id: Luid,
    pub authentication_id: Luid,
    pub modified_id: Luid,
}

impl TokenIdentity {
    /// Allocate fresh identifiers for a new token
    pub fn allocate() -> Self {
        Self {
            token_id: Luid::allocate(),
            authentication_id: Luid::allocate(),
            modified_id: Luid::allocate(),
        }
    }
}

/// A security principal as seen by the access checker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub sid: Sid,
    pub token: TokenIdentity,
    /// App container SID, if the principal runs inside one
    pub container: Option<Sid>,
}

impl Principal {
    /// New principal with a freshly allocated token
    pub fn new(sid: Sid) -> Self {
        Self {
            sid,
            token: TokenIdentity::allocate(),
            container: None,
        }
    }

    /// Attach an app container SID
    pub fn with_container(mut self, container: Sid) -> Self {
        self.container = Some(container);
        self
    }

    /// The anonymous principal used for degraded impersonation
    pub fn anonymous() -> Self {
        Self {
            sid: Sid::anonymous(),
            token: TokenIdentity::default(),
            container: None,
        }
    }

    /// Principal representing the container, or `self` outside a container
    pub fn container_principal(&self) -> Principal {
        match &self.container {
            Some(sid) => Principal {
                sid: sid.clone(),
                token: self.token,
                container: Some(sid.clone()),
            },
            None => self.clone(),
        }
    }
}

// ============================================================================
// Thread identity
// ============================================================================

static PROCESS_PRINCIPAL: RwLock<Option<Principal>> = RwLock::new(None);
static DEFAULT_PRINCIPAL: Once<Principal> = Once::new();
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

struct Impersonation {
    /// Identifies the guard that pushed this frame
    frame: u64,
    principal: Principal,
    level: ImpersonationLevel,
}

#[derive(Default)]
struct IdentityStack {
    thread_id: u64,
    own: Option<Principal>,
    impersonations: Vec<Impersonation>,
    next_frame: u64,
}

impl IdentityStack {
    /// Position of `frame` if it is still on the stack at `depth`
    fn find(&self, depth: usize, frame: u64) -> Option<usize> {
        let index = depth.checked_sub(1)?;
        let imp = self.impersonations.get(index)?;
        (imp.frame == frame).then_some(index)
    }
}

thread_local! {
    static IDENTITY: RefCell<IdentityStack> = RefCell::new(IdentityStack {
        thread_id: NEXT_THREAD_ID.fetch_add(1, Ordering::SeqCst),
        ..Default::default()
    });
}

/// Replace the principal every thread without its own principal runs as
pub fn set_process_principal(principal: Principal) {
    *PROCESS_PRINCIPAL.write() = Some(principal);
}

/// Principal of the process (local system unless overridden)
pub fn process_principal() -> Principal {
    if let Some(principal) = PROCESS_PRINCIPAL.read().as_ref() {
        return principal.clone();
    }
    DEFAULT_PRINCIPAL
        .call_once(|| Principal::new(Sid::local_system()))
        .clone()
}

/// Give the calling thread its own principal
pub fn set_thread_principal(principal: Principal) {
    IDENTITY.with(|id| id.borrow_mut().own = Some(principal));
}

/// The calling thread's own (non-impersonated) principal
pub fn thread_principal() -> Principal {
    IDENTITY
        .with(|id| id.borrow().own.clone())
        .unwrap_or_else(process_principal)
}

/// The principal access checks run as on this thread right now
pub fn effective_principal() -> Principal {
    IDENTITY
        .with(|id| {
            let stack = id.borrow();
            stack
                .impersonations
                .last()
                .map(|imp| imp.principal.clone())
                .or_else(|| stack.own.clone())
        })
        .unwrap_or_else(process_principal)
}

/// Level of the active impersonation, if any
pub fn impersonation_level() -> Option<ImpersonationLevel> {
    IDENTITY.with(|id| id.borrow().impersonations.last().map(|imp| imp.level))
}

/// Whether the calling thread is impersonating
pub fn is_impersonating() -> bool {
    impersonation_level().is_some()
}

/// Client id stamped on messages sent from this thread
pub fn current_client_id() -> ClientId {
    let thread = IDENTITY.with(|id| id.borrow().thread_id);
    ClientId::new(std::process::id() as u64, thread)
}

/// Thread-scoped impersonation; reverts on drop
///
/// Guards nest with stack discipline: reverting an outer guard also drops
/// any impersonation pushed after it. A guard whose frame is already gone
/// reverts nothing.
#[must_use = "impersonation is reverted when the guard is dropped"]
pub struct ImpersonationGuard {
    depth: usize,
    frame: u64,
    reverted: bool,
    // Thread-scoped: must not cross threads
    _not_send: PhantomData<*const ()>,
}

impl ImpersonationGuard {
    pub(crate) fn push(principal: Principal, level: ImpersonationLevel) -> Self {
        let (depth, frame) = IDENTITY.with(|id| {
            let mut stack = id.borrow_mut();
            stack.next_frame += 1;
            let frame = stack.next_frame;
            stack.impersonations.push(Impersonation {
                frame,
                principal,
                level,
            });
            (stack.impersonations.len(), frame)
        });
        Self {
            depth,
            frame,
            reverted: false,
            _not_send: PhantomData,
        }
    }

    /// Impersonation level in force under this guard
    pub fn level(&self) -> Option<ImpersonationLevel> {
        IDENTITY.with(|id| {
            let stack = id.borrow();
            let index = stack.find(self.depth, self.frame)?;
            Some(stack.impersonations[index].level)
        })
    }

    /// Revert explicitly
    pub fn revert(mut self) {
        self.revert_in_place();
    }

    fn revert_in_place(&mut self) {
        if self.reverted {
            return;
        }
        self.reverted = true;
        IDENTITY.with(|id| {
            let mut stack = id.borrow_mut();
            if let Some(index) = stack.find(self.depth, self.frame) {
                stack.impersonations.truncate(index);
            }
        });
    }
}

impl Drop for ImpersonationGuard {
    fn drop(&mut self) {
        self.revert_in_place();
    }
}
