//! Port messages - fixed header plus variable payload
//!
//! Wire layout of the 40-byte header (little-endian):
//!
//! | offset | size | field                                              |
//! |-------:|-----:|----------------------------------------------------|
//! | 0      | 2    | data length   \ length union, also readable as one |
//! | 2      | 2    | total length  / combined 32-bit length             |
//! | 4      | 2    | message type  \ type union, also readable as one   |
//! | 6      | 2    | data info offset / zero-initializable 32-bit field |
//! | 8      | 8    | client process id                                  |
//! | 16     | 8    | client thread id                                   |
//! | 24     | 4    | message id                                         |
//! | 28     | 4    | padding (zero)                                     |
//! | 32     | 8    | client view size, or callback id in the low 32 bits|
//!
//! `total_length` includes the header; `data_length` counts payload bytes.

use bitflags::bitflags;

use crate::config::MAX_ALLOWED_MESSAGE_LENGTH;
use crate::error::{AlpcError, Result};
use crate::types::{AlpcHandle, ClientId, MessageId};

/// Size of the encoded message header
pub const PORT_MESSAGE_HEADER_SIZE: usize = 40;

/// Largest payload a single message can carry
pub const MAX_MESSAGE_DATA: usize = MAX_ALLOWED_MESSAGE_LENGTH - PORT_MESSAGE_HEADER_SIZE;

// ============================================================================
// Header unions
// ============================================================================

/// Length union: split 16-bit data/total lengths or one 32-bit value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LengthField(u32);

impl LengthField {
    /// Build from the split form
    pub const fn new(data_length: u16, total_length: u16) -> Self {
        Self(data_length as u32 | (total_length as u32) << 16)
    }

    /// Build from the combined form
    pub const fn from_combined(raw: u32) -> Self {
        Self(raw)
    }

    /// Combined 32-bit view
    pub const fn combined(&self) -> u32 {
        self.0
    }

    /// Payload length (bytes 0..2)
    pub const fn data_length(&self) -> u16 {
        self.0 as u16
    }

    /// Header plus payload length (bytes 2..4)
    pub const fn total_length(&self) -> u16 {
        (self.0 >> 16) as u16
    }
}

/// Type union: split 16-bit type/data-info-offset or one 32-bit value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TypeField(u32);

impl TypeField {
    /// Build from the split form
    pub const fn new(message_type: u16, data_info_offset: u16) -> Self {
        Self(message_type as u32 | (data_info_offset as u32) << 16)
    }

    /// Build from the combined form
    pub const fn from_zero_init(raw: u32) -> Self {
        Self(raw)
    }

    /// Combined 32-bit view
    pub const fn zero_init(&self) -> u32 {
        self.0
    }

    /// Raw 16-bit type (kind in the low byte, flags in the high byte)
    pub const fn raw_type(&self) -> u16 {
        self.0 as u16
    }

    /// Decoded message kind
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_raw(self.raw_type() & 0x00FF)
    }

    /// Flags carried in the high byte of the type
    pub fn flags(&self) -> TypeFlags {
        TypeFlags::from_bits_truncate(self.raw_type() & 0xFF00)
    }

    /// Offset of the data info block (bytes 6..8)
    pub const fn data_info_offset(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    fn with_kind(self, kind: MessageType) -> Self {
        Self((self.0 & !0x00FF) | kind as u32)
    }

    fn with_flags(self, flags: TypeFlags) -> Self {
        Self(self.0 | flags.bits() as u32)
    }
}

/// Trailing union: client view size, or callback id in the low 32 bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Trailer(u64);

impl Trailer {
    /// Interpret as a view size
    pub const fn from_view_size(size: u64) -> Self {
        Self(size)
    }

    /// Interpret as a callback id
    pub const fn from_callback_id(id: u32) -> Self {
        Self(id as u64)
    }

    /// View-size reading
    pub const fn client_view_size(&self) -> u64 {
        self.0
    }

    /// Callback-id reading
    pub const fn callback_id(&self) -> u32 {
        self.0 as u32
    }
}

/// Message kinds (low byte of the type field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Request = 1,
    Reply = 2,
    Datagram = 3,
    LostReply = 4,
    PortClosed = 5,
    ClientDied = 6,
    Exception = 7,
    DebugEvent = 8,
    ErrorEvent = 9,
    ConnectionRequest = 10,
    ConnectionReply = 11,
    Canceled = 12,
    UnregisterProcess = 13,
}

impl MessageType {
    /// Convert from raw value
    pub fn from_raw(value: u16) -> Option<Self> {
        Some(match value {
            1 => Self::Request,
            2 => Self::Reply,
            3 => Self::Datagram,
            4 => Self::LostReply,
            5 => Self::PortClosed,
            6 => Self::ClientDied,
            7 => Self::Exception,
            8 => Self::DebugEvent,
            9 => Self::ErrorEvent,
            10 => Self::ConnectionRequest,
            11 => Self::ConnectionReply,
            12 => Self::Canceled,
            13 => Self::UnregisterProcess,
            _ => return None,
        })
    }

    /// Does the sender expect a reply?
    pub fn expects_reply(self) -> bool {
        matches!(self, Self::Request | Self::ConnectionRequest)
    }
}

bitflags! {
    /// Flags in the high byte of the message type
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TypeFlags: u16 {
        const CONTINUATION_REQUIRED = 0x2000;
        /// Sender declined impersonation for this message
        const NO_IMPERSONATE = 0x4000;
        const KERNEL_MODE = 0x8000;
    }
}

// ============================================================================
// Header
// ============================================================================

/// Fixed message header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortMessageHeader {
    pub length: LengthField,
    pub kind: TypeField,
    pub client_id: ClientId,
    pub message_id: MessageId,
    pub trailer: Trailer,
}

impl PortMessageHeader {
    /// Encode into exactly [`PORT_MESSAGE_HEADER_SIZE`] bytes
    pub fn to_bytes(&self) -> [u8; PORT_MESSAGE_HEADER_SIZE] {
        let mut out = [0u8; PORT_MESSAGE_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.length.combined().to_le_bytes());
        out[4..8].copy_from_slice(&self.kind.zero_init().to_le_bytes());
        out[8..16].copy_from_slice(&self.client_id.process.to_le_bytes());
        out[16..24].copy_from_slice(&self.client_id.thread.to_le_bytes());
        out[24..28].copy_from_slice(&self.message_id.to_le_bytes());
        out[32..40].copy_from_slice(&self.trailer.client_view_size().to_le_bytes());
        out
    }

    /// Decode from the first [`PORT_MESSAGE_HEADER_SIZE`] bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PORT_MESSAGE_HEADER_SIZE {
            return Err(AlpcError::InvalidParameter("buffer shorter than message header"));
        }
        Ok(Self {
            length: LengthField::from_combined(read_u32(bytes, 0)),
            kind: TypeField::from_zero_init(read_u32(bytes, 4)),
            client_id: ClientId::new(read_u64(bytes, 8), read_u64(bytes, 16)),
            message_id: read_u32(bytes, 24),
            trailer: Trailer::from_view_size(read_u64(bytes, 32)),
        })
    }

    /// Check `data_length + header <= total_length <= max`
    pub fn validate(&self, max_message_length: usize) -> Result<()> {
        let total = self.length.total_length() as usize;
        let data = self.length.data_length() as usize;
        if total < PORT_MESSAGE_HEADER_SIZE || data + PORT_MESSAGE_HEADER_SIZE > total {
            return Err(AlpcError::InvalidParameter("inconsistent message lengths"));
        }
        if total > max_message_length {
            return Err(AlpcError::MessageTooLarge {
                size: total,
                max: max_message_length,
            });
        }
        Ok(())
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

// ============================================================================
// Message
// ============================================================================

/// A header plus payload, as sent or received through a port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMessage {
    pub header: PortMessageHeader,
    data: Vec<u8>,
    /// Resource reserve the message is sent under; not part of the wire header
    reserve: Option<AlpcHandle>,
}

impl PortMessage {
    /// Create a message with the given payload and no kind
    pub fn new(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_MESSAGE_DATA {
            return Err(AlpcError::MessageTooLarge {
                size: data.len() + PORT_MESSAGE_HEADER_SIZE,
                max: MAX_ALLOWED_MESSAGE_LENGTH,
            });
        }
        let total = data.len() + PORT_MESSAGE_HEADER_SIZE;
        Ok(Self {
            header: PortMessageHeader {
                length: LengthField::new(data.len() as u16, total as u16),
                ..Default::default()
            },
            data: data.to_vec(),
            reserve: None,
        })
    }

    /// Header-only message
    pub(crate) fn empty() -> Self {
        Self {
            header: PortMessageHeader {
                length: LengthField::new(0, PORT_MESSAGE_HEADER_SIZE as u16),
                ..Default::default()
            },
            data: Vec::new(),
            reserve: None,
        }
    }

    /// Fill in the fields the transport owns on send
    pub(crate) fn stamp(&mut self, kind: MessageType, message_id: MessageId, client_id: ClientId) {
        self.header.kind = self.header.kind.with_kind(kind);
        self.header.message_id = message_id;
        self.header.client_id = client_id;
    }

    /// A request that expects a reply
    pub fn request(data: &[u8]) -> Result<Self> {
        Ok(Self::new(data)?.with_kind(MessageType::Request))
    }

    /// A one-way message
    pub fn datagram(data: &[u8]) -> Result<Self> {
        Ok(Self::new(data)?.with_kind(MessageType::Datagram))
    }

    /// A reply to `request`, carrying its message id
    pub fn reply_to(request: &PortMessageHeader, data: &[u8]) -> Result<Self> {
        let mut reply = Self::new(data)?.with_kind(MessageType::Reply);
        reply.header.message_id = request.message_id;
        reply.header.trailer = request.trailer;
        Ok(reply)
    }

    /// Set the message kind
    pub fn with_kind(mut self, kind: MessageType) -> Self {
        self.header.kind = self.header.kind.with_kind(kind);
        self
    }

    /// Add type flags
    pub fn with_type_flags(mut self, flags: TypeFlags) -> Self {
        self.header.kind = self.header.kind.with_flags(flags);
        self
    }

    /// Send under a resource reserve
    pub fn with_reserve(mut self, reserve: AlpcHandle) -> Self {
        self.reserve = Some(reserve);
        self
    }

    /// Set the callback id in the trailing union
    pub fn with_callback_id(mut self, callback_id: u32) -> Self {
        self.header.trailer = Trailer::from_callback_id(callback_id);
        self
    }

    /// Payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Message kind, if the type field holds a known one
    pub fn kind(&self) -> Option<MessageType> {
        self.header.kind.kind()
    }

    /// Message id
    pub fn message_id(&self) -> MessageId {
        self.header.message_id
    }

    /// Header plus payload length
    pub fn total_length(&self) -> usize {
        PORT_MESSAGE_HEADER_SIZE + self.data.len()
    }

    /// Reserve the message is sent under
    pub fn reserve(&self) -> Option<AlpcHandle> {
        self.reserve
    }

    /// Encode header and payload
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_length());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Encode into a caller buffer; fails with the required size if short
    pub fn encode_into(&self, buffer: &mut [u8]) -> Result<usize> {
        let total = self.total_length();
        if buffer.len() < total {
            return Err(AlpcError::BufferTooSmall { required: total });
        }
        buffer[..PORT_MESSAGE_HEADER_SIZE].copy_from_slice(&self.header.to_bytes());
        buffer[PORT_MESSAGE_HEADER_SIZE..total].copy_from_slice(&self.data);
        Ok(total)
    }

    /// Decode a message from its wire form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = PortMessageHeader::from_bytes(bytes)?;
        header.validate(MAX_ALLOWED_MESSAGE_LENGTH)?;
        let total = header.length.total_length() as usize;
        if bytes.len() < total {
            return Err(AlpcError::InvalidParameter("buffer shorter than total length"));
        }
        let data_end = PORT_MESSAGE_HEADER_SIZE + header.length.data_length() as usize;
        Ok(Self {
            header,
            data: bytes[PORT_MESSAGE_HEADER_SIZE..data_end].to_vec(),
            reserve: None,
        })
    }
}

// ============================================================================
// Receive buffer
// ============================================================================

/// Caller-owned receive buffer with a capacity advertised up front
#[derive(Debug, Clone)]
pub struct MessageBuffer {
    bytes: Vec<u8>,
    len: usize,
}

impl MessageBuffer {
    /// Allocate a buffer able to hold `capacity` bytes (header included)
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: vec![0; capacity],
            len: 0,
        }
    }

    /// Largest message this buffer accepts
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Bytes of the last received message
    pub fn len(&self) -> usize {
        self.len
    }

    /// True until a message has been received
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw bytes of the last received message
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Header of the last received message
    pub fn header(&self) -> Option<PortMessageHeader> {
        if self.is_empty() {
            return None;
        }
        PortMessageHeader::from_bytes(self.as_bytes()).ok()
    }

    /// Payload of the last received message
    pub fn data(&self) -> &[u8] {
        match self.header() {
            Some(header) => {
                let end = PORT_MESSAGE_HEADER_SIZE + header.length.data_length() as usize;
                &self.bytes[PORT_MESSAGE_HEADER_SIZE..end]
            }
            None => &[],
        }
    }

    /// Decode the last received message
    pub fn message(&self) -> Result<PortMessage> {
        if self.is_empty() {
            return Err(AlpcError::NotFound);
        }
        PortMessage::from_bytes(self.as_bytes())
    }

    pub(crate) fn fill(&mut self, message: &PortMessage) -> Result<()> {
        self.len = message.encode_into(&mut self.bytes)?;
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_union_views() {
        let length = LengthField::new(0x0010, 0x0038);
        assert_eq!(length.combined(), 0x0038_0010);
        assert_eq!(LengthField::from_combined(0x0038_0010).total_length(), 0x38);
        assert_eq!(LengthField::from_combined(0x0038_0010).data_length(), 0x10);
    }

    #[test]
    fn test_type_union_views() {
        let kind = TypeField::new(MessageType::Request as u16 | TypeFlags::NO_IMPERSONATE.bits(), 8);
        assert_eq!(kind.kind(), Some(MessageType::Request));
        assert!(kind.flags().contains(TypeFlags::NO_IMPERSONATE));
        assert_eq!(kind.data_info_offset(), 8);
        assert_eq!(kind.zero_init(), 0x0008_4001);
    }

    #[test]
    fn test_header_byte_layout() {
        let mut message = PortMessage::request(b"ping").unwrap().with_callback_id(7);
        message.header.client_id = ClientId::new(0x11, 0x22);
        message.header.message_id = 0x3344;
        let bytes = message.to_bytes();

        assert_eq!(bytes.len(), 44);
        assert_eq!(&bytes[0..2], &4u16.to_le_bytes());
        assert_eq!(&bytes[2..4], &44u16.to_le_bytes());
        assert_eq!(&bytes[4..6], &1u16.to_le_bytes());
        assert_eq!(bytes[8], 0x11);
        assert_eq!(bytes[16], 0x22);
        assert_eq!(&bytes[24..28], &0x3344u32.to_le_bytes());
        assert_eq!(&bytes[28..32], &[0, 0, 0, 0]);
        assert_eq!(&bytes[32..36], &7u32.to_le_bytes());
        assert_eq!(&bytes[40..], b"ping");

        assert_eq!(PortMessage::from_bytes(&bytes).unwrap(), message);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let data = vec![0u8; MAX_MESSAGE_DATA + 1];
        assert!(matches!(
            PortMessage::new(&data),
            Err(AlpcError::MessageTooLarge { .. })
        ));
        assert!(PortMessage::new(&data[..MAX_MESSAGE_DATA]).is_ok());
    }

    #[test]
    fn test_validate_lengths() {
        let message = PortMessage::datagram(&[0u8; 100]).unwrap();
        assert!(message.header.validate(1000).is_ok());
        assert_eq!(
            message.header.validate(100),
            Err(AlpcError::MessageTooLarge { size: 140, max: 100 })
        );

        let mut broken = message.header;
        broken.length = LengthField::new(200, 140);
        assert!(broken.validate(1000).is_err());
    }

    #[test]
    fn test_buffer_too_small() {
        let message = PortMessage::datagram(&[1u8; 60]).unwrap();
        let mut buffer = MessageBuffer::with_capacity(64);
        assert_eq!(
            buffer.fill(&message),
            Err(AlpcError::BufferTooSmall { required: 100 })
        );
        assert!(buffer.is_empty());

        let mut buffer = MessageBuffer::with_capacity(100);
        buffer.fill(&message).unwrap();
        assert_eq!(buffer.data(), &[1u8; 60][..]);
        assert_eq!(buffer.message().unwrap(), message);
    }

    #[test]
    fn test_reply_keeps_message_id() {
        let mut request = PortMessage::request(b"q").unwrap();
        request.header.message_id = 99;
        let reply = PortMessage::reply_to(&request.header, b"a").unwrap();
        assert_eq!(reply.message_id(), 99);
        assert_eq!(reply.kind(), Some(MessageType::Reply));
    }
}
