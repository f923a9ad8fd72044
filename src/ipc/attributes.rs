//! Message attributes - the out-of-band bundle riding alongside a message
//!
//! An attribute buffer starts with two 32-bit masks, `allocated` (kinds with
//! space reserved) and `valid` (kinds holding real data), followed by one
//! fixed-size payload per allocated kind. Payloads are laid out in
//! descending flag order: Security, View, Context, Handle, Token, Direct,
//! WorkOnBehalfOf. A kind absent from `allocated` takes no space, so the
//! offset of every kind depends on which higher kinds are allocated.
//!
//! Invariant: `valid` is always a subset of `allocated`, and reading a kind
//! that is not valid yields `None`, never a zeroed payload.

use bitflags::bitflags;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{AlpcError, Result};
use crate::identity::SecurityQos;
use crate::types::{AlpcHandle, Luid, MessageId};

/// Size of the two-mask buffer header
pub const ATTRIBUTE_HEADER_SIZE: usize = 8;

// ============================================================================
// Flags
// ============================================================================

bitflags! {
    /// Attribute kinds, as they appear in the allocated/valid masks
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct AttributeFlags: u32 {
        const WORK_ON_BEHALF_OF = 0x0200_0000;
        const DIRECT = 0x0400_0000;
        const TOKEN = 0x0800_0000;
        const HANDLE = 0x1000_0000;
        const CONTEXT = 0x2000_0000;
        const VIEW = 0x4000_0000;
        const SECURITY = 0x8000_0000;
    }
}

bitflags! {
    /// Security attribute flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct SecurityAttrFlags: u32 {
        const CREATE_HANDLE = 0x0002_0000;
    }
}

bitflags! {
    /// Data view attribute flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct ViewAttrFlags: u32 {
        const NOT_SECURE = 0x0004_0000;
    }
}

bitflags! {
    /// Handle attribute flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct HandleAttrFlags: u32 {
        const SAME_ACCESS = 0x0001_0000;
        const SAME_ATTRIBUTES = 0x0002_0000;
        /// `handle` references an array; `object_type` holds the count
        const INDIRECT = 0x0004_0000;
        const INHERIT = 0x0008_0000;
    }
}

bitflags! {
    /// Object types a port allows to be duplicated through handle attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct ObjectTypes: u32 {
        const FILE = 0x0001;
        const UNKNOWN_0002 = 0x0002;
        const THREAD = 0x0004;
        const SEMAPHORE = 0x0008;
        const EVENT = 0x0010;
        const PROCESS = 0x0020;
        const MUTEX = 0x0040;
        const SECTION = 0x0080;
        const REG_KEY = 0x0100;
        const TOKEN = 0x0200;
        const COMPOSITION = 0x0400;
        const JOB = 0x0800;
        const ALL_OBJECTS = 0x0FFD;
    }
}

// ============================================================================
// Kinds
// ============================================================================

/// One attribute kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    Security,
    View,
    Context,
    Handle,
    Token,
    Direct,
    WorkOnBehalfOf,
}

impl AttributeKind {
    /// All kinds in buffer layout order
    pub const ALL: [AttributeKind; 7] = [
        AttributeKind::Security,
        AttributeKind::View,
        AttributeKind::Context,
        AttributeKind::Handle,
        AttributeKind::Token,
        AttributeKind::Direct,
        AttributeKind::WorkOnBehalfOf,
    ];

    /// Mask bit of this kind
    pub const fn flag(self) -> AttributeFlags {
        match self {
            AttributeKind::Security => AttributeFlags::SECURITY,
            AttributeKind::View => AttributeFlags::VIEW,
            AttributeKind::Context => AttributeFlags::CONTEXT,
            AttributeKind::Handle => AttributeFlags::HANDLE,
            AttributeKind::Token => AttributeFlags::TOKEN,
            AttributeKind::Direct => AttributeFlags::DIRECT,
            AttributeKind::WorkOnBehalfOf => AttributeFlags::WORK_ON_BEHALF_OF,
        }
    }

    /// Fixed payload size in the buffer
    pub const fn payload_size(self) -> usize {
        match self {
            AttributeKind::Security => 24,
            AttributeKind::View => 32,
            AttributeKind::Context => 32,
            AttributeKind::Handle => 24,
            AttributeKind::Token => 24,
            AttributeKind::Direct => 8,
            AttributeKind::WorkOnBehalfOf => 8,
        }
    }

    const fn index(self) -> usize {
        self as usize
    }

    /// Kinds present in a mask, in layout order
    pub fn iter(mask: AttributeFlags) -> impl Iterator<Item = AttributeKind> {
        Self::ALL.into_iter().filter(move |kind| mask.contains(kind.flag()))
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Security attribute: `{flags, QoS reference, context handle}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SecurityAttr {
    pub flags: SecurityAttrFlags,
    pub qos: Option<SecurityQos>,
    pub context: AlpcHandle,
}

/// Data view attribute: `{flags, section handle, view base, view size}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ViewAttr {
    pub flags: ViewAttrFlags,
    pub section: AlpcHandle,
    pub view_base: u64,
    pub view_size: u64,
}

/// Context attribute filled in by the transport on receive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ContextAttr {
    pub port_context: u64,
    pub message_context: u64,
    pub sequence: u32,
    pub message_id: MessageId,
    pub callback_id: u32,
}

/// Handle attribute: `{flags, handle or array reference, object types, access}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HandleAttr {
    pub flags: HandleAttrFlags,
    pub handle: u64,
    pub object_type: ObjectTypes,
    pub desired_access: u32,
}

impl HandleAttr {
    /// Number of handles referenced (indirect form) or one
    pub fn handle_count(&self) -> u32 {
        if self.flags.contains(HandleAttrFlags::INDIRECT) {
            self.object_type.bits()
        } else {
            1
        }
    }
}

/// Token attribute: three local identifiers of the sender's token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TokenAttr {
    pub token_id: Luid,
    pub authentication_id: Luid,
    pub modified_id: Luid,
}

/// Direct attribute: event signalled when the message is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DirectAttr {
    pub event: AlpcHandle,
}

/// Work-on-behalf-of ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WorkOnBehalfAttr {
    pub thread_id: u32,
    pub thread_creation_time_low: u32,
}

/// One populated attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Attribute {
    Security(SecurityAttr),
    View(ViewAttr),
    Context(ContextAttr),
    Handle(HandleAttr),
    Token(TokenAttr),
    Direct(DirectAttr),
    WorkOnBehalfOf(WorkOnBehalfAttr),
}

impl Attribute {
    /// Kind of this attribute
    pub fn kind(&self) -> AttributeKind {
        match self {
            Attribute::Security(_) => AttributeKind::Security,
            Attribute::View(_) => AttributeKind::View,
            Attribute::Context(_) => AttributeKind::Context,
            Attribute::Handle(_) => AttributeKind::Handle,
            Attribute::Token(_) => AttributeKind::Token,
            Attribute::Direct(_) => AttributeKind::Direct,
            Attribute::WorkOnBehalfOf(_) => AttributeKind::WorkOnBehalfOf,
        }
    }

    /// Encode into exactly `kind().payload_size()` bytes
    fn encode(&self, out: &mut [u8]) {
        debug_assert_eq!(out.len(), self.kind().payload_size());
        out.fill(0);
        match self {
            Attribute::Security(a) => {
                put_u32(out, 0, a.flags.bits());
                put_u64(out, 8, a.qos.map_or(0, |q| q.to_raw()));
                put_u64(out, 16, a.context.as_raw());
            }
            Attribute::View(a) => {
                put_u32(out, 0, a.flags.bits());
                put_u64(out, 8, a.section.as_raw());
                put_u64(out, 16, a.view_base);
                put_u64(out, 24, a.view_size);
            }
            Attribute::Context(a) => {
                put_u64(out, 0, a.port_context);
                put_u64(out, 8, a.message_context);
                put_u32(out, 16, a.sequence);
                put_u32(out, 20, a.message_id);
                put_u32(out, 24, a.callback_id);
            }
            Attribute::Handle(a) => {
                put_u32(out, 0, a.flags.bits());
                put_u64(out, 8, a.handle);
                put_u32(out, 16, a.object_type.bits());
                put_u32(out, 20, a.desired_access);
            }
            Attribute::Token(a) => {
                put_u64(out, 0, a.token_id.as_u64());
                put_u64(out, 8, a.authentication_id.as_u64());
                put_u64(out, 16, a.modified_id.as_u64());
            }
            Attribute::Direct(a) => put_u64(out, 0, a.event.as_raw()),
            Attribute::WorkOnBehalfOf(a) => {
                put_u32(out, 0, a.thread_id);
                put_u32(out, 4, a.thread_creation_time_low);
            }
        }
    }

    /// Decode a payload span of the given kind
    fn decode(kind: AttributeKind, bytes: &[u8]) -> Attribute {
        match kind {
            AttributeKind::Security => Attribute::Security(SecurityAttr {
                flags: SecurityAttrFlags::from_bits_retain(get_u32(bytes, 0)),
                qos: SecurityQos::from_raw(get_u64(bytes, 8)),
                context: AlpcHandle(get_u64(bytes, 16)),
            }),
            AttributeKind::View => Attribute::View(ViewAttr {
                flags: ViewAttrFlags::from_bits_retain(get_u32(bytes, 0)),
                section: AlpcHandle(get_u64(bytes, 8)),
                view_base: get_u64(bytes, 16),
                view_size: get_u64(bytes, 24),
            }),
            AttributeKind::Context => Attribute::Context(ContextAttr {
                port_context: get_u64(bytes, 0),
                message_context: get_u64(bytes, 8),
                sequence: get_u32(bytes, 16),
                message_id: get_u32(bytes, 20),
                callback_id: get_u32(bytes, 24),
            }),
            AttributeKind::Handle => Attribute::Handle(HandleAttr {
                flags: HandleAttrFlags::from_bits_retain(get_u32(bytes, 0)),
                handle: get_u64(bytes, 8),
                object_type: ObjectTypes::from_bits_retain(get_u32(bytes, 16)),
                desired_access: get_u32(bytes, 20),
            }),
            AttributeKind::Token => Attribute::Token(TokenAttr {
                token_id: Luid::from_u64(get_u64(bytes, 0)),
                authentication_id: Luid::from_u64(get_u64(bytes, 8)),
                modified_id: Luid::from_u64(get_u64(bytes, 16)),
            }),
            AttributeKind::Direct => Attribute::Direct(DirectAttr {
                event: AlpcHandle(get_u64(bytes, 0)),
            }),
            AttributeKind::WorkOnBehalfOf => Attribute::WorkOnBehalfOf(WorkOnBehalfAttr {
                thread_id: get_u32(bytes, 0),
                thread_creation_time_low: get_u32(bytes, 4),
            }),
        }
    }
}

fn put_u32(out: &mut [u8], at: usize, value: u32) {
    out[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(out: &mut [u8], at: usize, value: u64) {
    out[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn get_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

// ============================================================================
// Layout
// ============================================================================

/// Byte offsets of each allocated kind for a given mask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeLayout {
    kinds: AttributeFlags,
    offsets: [Option<usize>; 7],
    total: usize,
}

impl AttributeLayout {
    /// Compute the layout for a set of kinds
    pub fn for_kinds(kinds: AttributeFlags) -> Self {
        let mut offsets = [None; 7];
        let mut cursor = ATTRIBUTE_HEADER_SIZE;
        for kind in AttributeKind::iter(kinds) {
            offsets[kind.index()] = Some(cursor);
            cursor += kind.payload_size();
        }
        Self {
            kinds,
            offsets,
            total: cursor,
        }
    }

    /// Buffer size required for this layout
    pub fn total_size(&self) -> usize {
        self.total
    }

    /// Offset of a kind's payload, if allocated
    pub fn offset(&self, kind: AttributeKind) -> Option<usize> {
        self.offsets[kind.index()]
    }

    /// Payload span of a kind, if allocated
    pub fn span(&self, kind: AttributeKind) -> Option<core::ops::Range<usize>> {
        self.offset(kind).map(|at| at..at + kind.payload_size())
    }

    /// Kinds covered
    pub fn kinds(&self) -> AttributeFlags {
        self.kinds
    }
}

// ============================================================================
// In-place buffer codec
// ============================================================================

/// Attribute buffer codec operating on caller memory
///
/// Two-phase protocol: [`AttributeBuffer::required_size`] first, then
/// [`AttributeBuffer::initialize`] with a buffer of at least that size.
#[derive(Debug)]
pub struct AttributeBuffer<'a> {
    bytes: &'a mut [u8],
    allocated: AttributeFlags,
    valid: AttributeFlags,
}

impl<'a> AttributeBuffer<'a> {
    /// Size needed to hold the given kinds
    pub fn required_size(kinds: AttributeFlags) -> usize {
        AttributeLayout::for_kinds(kinds).total_size()
    }

    /// Reserve space for `kinds`; nothing is valid afterwards
    pub fn initialize(kinds: AttributeFlags, bytes: &'a mut [u8]) -> Result<Self> {
        let required = Self::required_size(kinds);
        if bytes.len() < required {
            return Err(AlpcError::BufferTooSmall { required });
        }
        bytes[..required].fill(0);
        let mut buffer = Self {
            bytes,
            allocated: kinds,
            valid: AttributeFlags::empty(),
        };
        buffer.store_header();
        Ok(buffer)
    }

    /// Wrap a buffer that already holds a header
    pub fn open(bytes: &'a mut [u8]) -> Result<Self> {
        let (allocated, valid) = parse_header(bytes)?;
        Ok(Self {
            bytes,
            allocated,
            valid,
        })
    }

    /// Kinds with reserved space
    pub fn allocated(&self) -> AttributeFlags {
        self.allocated
    }

    /// Kinds holding data
    pub fn valid(&self) -> AttributeFlags {
        self.valid
    }

    /// Populate one kind, marking it allocated and valid together.
    ///
    /// Writing a kind that has no reserved span extends the allocation only
    /// when no allocated span moves; otherwise the write would overlap
    /// existing data and is rejected.
    pub fn write(&mut self, attribute: &Attribute) -> Result<()> {
        let kind = attribute.kind();
        let current = AttributeLayout::for_kinds(self.allocated);
        let layout = if current.offset(kind).is_some() {
            current
        } else {
            let extended = AttributeLayout::for_kinds(self.allocated | kind.flag());
            for other in AttributeKind::iter(self.allocated) {
                if current.offset(other) != extended.offset(other) {
                    return Err(AlpcError::InvalidAttributeLayout(
                        "kind would overlap an allocated span",
                    ));
                }
            }
            if extended.total_size() > self.bytes.len() {
                return Err(AlpcError::BufferTooSmall {
                    required: extended.total_size(),
                });
            }
            extended
        };
        let span = layout
            .span(kind)
            .ok_or(AlpcError::InvalidAttributeLayout("kind has no span"))?;
        attribute.encode(&mut self.bytes[span]);
        self.allocated |= kind.flag();
        self.valid |= kind.flag();
        self.store_header();
        Ok(())
    }

    /// Read one kind; `None` unless it is valid
    pub fn read(&self, kind: AttributeKind) -> Option<Attribute> {
        read_valid(self.bytes, self.allocated, self.valid, kind)
    }

    /// Clear the valid bit of a kind, keeping its space
    pub fn invalidate(&mut self, kind: AttributeKind) {
        self.valid.remove(kind.flag());
        self.store_header();
    }

    fn store_header(&mut self) {
        put_u32(self.bytes, 0, self.allocated.bits());
        put_u32(self.bytes, 4, self.valid.bits());
    }
}

/// Read one kind from an immutable buffer; `Ok(None)` when not valid
pub fn read_attribute(bytes: &[u8], kind: AttributeKind) -> Result<Option<Attribute>> {
    let (allocated, valid) = parse_header(bytes)?;
    Ok(read_valid(bytes, allocated, valid, kind))
}

fn parse_header(bytes: &[u8]) -> Result<(AttributeFlags, AttributeFlags)> {
    if bytes.len() < ATTRIBUTE_HEADER_SIZE {
        return Err(AlpcError::BufferTooSmall {
            required: ATTRIBUTE_HEADER_SIZE,
        });
    }
    let allocated = AttributeFlags::from_bits(get_u32(bytes, 0))
        .ok_or(AlpcError::InvalidAttributeLayout("unknown kind in allocated mask"))?;
    let valid = AttributeFlags::from_bits(get_u32(bytes, 4))
        .ok_or(AlpcError::InvalidAttributeLayout("unknown kind in valid mask"))?;
    if !allocated.contains(valid) {
        return Err(AlpcError::InvalidAttributeLayout("valid kind without allocation"));
    }
    if AttributeLayout::for_kinds(allocated).total_size() > bytes.len() {
        return Err(AlpcError::InvalidAttributeLayout("buffer shorter than allocated spans"));
    }
    Ok((allocated, valid))
}

fn read_valid(
    bytes: &[u8],
    allocated: AttributeFlags,
    valid: AttributeFlags,
    kind: AttributeKind,
) -> Option<Attribute> {
    if !valid.contains(kind.flag()) {
        return None;
    }
    let span = AttributeLayout::for_kinds(allocated).span(kind)?;
    Some(Attribute::decode(kind, &bytes[span]))
}

// ============================================================================
// Typed bundle
// ============================================================================

/// Owned attribute bundle: a closed mapping from kind to optional payload
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttributeBundle {
    allocated: AttributeFlags,
    entries: [Option<Attribute>; 7],
}

impl AttributeBundle {
    /// Empty bundle
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundle with space reserved for `kinds`, none valid (receive side)
    pub fn with_allocated(kinds: AttributeFlags) -> Self {
        Self {
            allocated: kinds,
            entries: [None; 7],
        }
    }

    /// Add an attribute, marking its kind allocated and valid
    pub fn with(mut self, attribute: Attribute) -> Self {
        self.insert(attribute);
        self
    }

    /// Kinds with reserved space
    pub fn allocated(&self) -> AttributeFlags {
        self.allocated
    }

    /// Kinds holding data
    pub fn valid(&self) -> AttributeFlags {
        AttributeKind::ALL
            .into_iter()
            .filter(|kind| self.entries[kind.index()].is_some())
            .fold(AttributeFlags::empty(), |acc, kind| acc | kind.flag())
    }

    /// Populate a kind; returns the payload it replaced
    pub fn insert(&mut self, attribute: Attribute) -> Option<Attribute> {
        let kind = attribute.kind();
        self.allocated |= kind.flag();
        self.entries[kind.index()].replace(attribute)
    }

    /// Payload of a kind, `None` when absent
    pub fn get(&self, kind: AttributeKind) -> Option<&Attribute> {
        self.entries[kind.index()].as_ref()
    }

    /// Clear a kind's data, keeping its allocation
    pub fn take(&mut self, kind: AttributeKind) -> Option<Attribute> {
        self.entries[kind.index()].take()
    }

    /// Clear every kind's data, keeping allocations
    pub fn clear_valid(&mut self) {
        self.entries = [None; 7];
    }

    /// Security payload
    pub fn security(&self) -> Option<&SecurityAttr> {
        match self.get(AttributeKind::Security) {
            Some(Attribute::Security(a)) => Some(a),
            _ => None,
        }
    }

    /// View payload
    pub fn view(&self) -> Option<&ViewAttr> {
        match self.get(AttributeKind::View) {
            Some(Attribute::View(a)) => Some(a),
            _ => None,
        }
    }

    /// Context payload
    pub fn context(&self) -> Option<&ContextAttr> {
        match self.get(AttributeKind::Context) {
            Some(Attribute::Context(a)) => Some(a),
            _ => None,
        }
    }

    /// Handle payload
    pub fn handle(&self) -> Option<&HandleAttr> {
        match self.get(AttributeKind::Handle) {
            Some(Attribute::Handle(a)) => Some(a),
            _ => None,
        }
    }

    /// Token payload
    pub fn token(&self) -> Option<&TokenAttr> {
        match self.get(AttributeKind::Token) {
            Some(Attribute::Token(a)) => Some(a),
            _ => None,
        }
    }

    /// Direct payload
    pub fn direct(&self) -> Option<&DirectAttr> {
        match self.get(AttributeKind::Direct) {
            Some(Attribute::Direct(a)) => Some(a),
            _ => None,
        }
    }

    /// Work-on-behalf payload
    pub fn work_on_behalf(&self) -> Option<&WorkOnBehalfAttr> {
        match self.get(AttributeKind::WorkOnBehalfOf) {
            Some(Attribute::WorkOnBehalfOf(a)) => Some(a),
            _ => None,
        }
    }

    /// Buffer size needed by [`AttributeBundle::pack_into`]
    pub fn required_size(&self) -> usize {
        AttributeBuffer::required_size(self.allocated)
    }

    /// Serialize into a caller buffer; returns the bytes used
    pub fn pack_into(&self, bytes: &mut [u8]) -> Result<usize> {
        let required = self.required_size();
        let mut buffer = AttributeBuffer::initialize(self.allocated, bytes)?;
        for attribute in self.entries.iter().flatten() {
            buffer.write(attribute)?;
        }
        Ok(required)
    }

    /// Serialize into a fresh vector
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.required_size()];
        // Sized exactly by required_size, so packing cannot fail
        let _ = self.pack_into(&mut out);
        out
    }

    /// Deserialize a buffer; kinds not valid stay absent
    pub fn unpack(bytes: &[u8]) -> Result<Self> {
        let (allocated, valid) = parse_header(bytes)?;
        let mut bundle = Self::with_allocated(allocated);
        for kind in AttributeKind::iter(valid) {
            if let Some(attribute) = read_valid(bytes, allocated, valid, kind) {
                bundle.entries[kind.index()] = Some(attribute);
            }
        }
        Ok(bundle)
    }
}
