//! Error types for ALPC transport operations
//!
//! Every fallible operation returns [`AlpcError`] carrying enough context
//! (required size, granted size, limits) for the caller to retry correctly.

use thiserror::Error;

use crate::identity::ImpersonationLevel;

/// Result type for transport operations
pub type Result<T> = core::result::Result<T, AlpcError>;

/// Errors that can occur during ALPC operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AlpcError {
    /// Malformed attribute, message, size or flag combination
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// Principal or rights check failed
    #[error("access denied")]
    AccessDenied,

    /// Deadline elapsed with no delivery
    #[error("operation timed out")]
    Timeout,

    /// The outstanding message was cancelled
    #[error("message was cancelled")]
    Cancelled,

    /// Cancellation lost the race against delivery
    #[error("message was already delivered")]
    AlreadyDelivered,

    /// Caller buffer too small; `required` is the size that would succeed
    #[error("buffer too small: {required} bytes required")]
    BufferTooSmall { required: usize },

    /// Operation attempted on a torn-down port
    #[error("port is disconnected")]
    PortDisconnected,

    /// Message exceeds the port or reserve limit
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Unknown view base, reserve id, message or port name
    #[error("object not found")]
    NotFound,

    /// Information class not supported for this operation
    #[error("invalid information class")]
    InvalidInformationClass,

    /// Handle does not name a live object
    #[error("invalid handle: {0:#x}")]
    InvalidHandle(u64),

    /// Server refused the connection request
    #[error("connection refused")]
    ConnectionRefused,

    /// Sender's impersonation level is below what the caller demanded
    #[error("impersonation level too low: required {required:?}, sender allows {actual:?}")]
    ImpersonationLevelTooLow {
        required: ImpersonationLevel,
        actual: ImpersonationLevel,
    },

    /// Attribute buffer header or spans are inconsistent
    #[error("invalid attribute layout: {0}")]
    InvalidAttributeLayout(&'static str),

    /// A port with that name already exists
    #[error("port name already in use")]
    NameCollision,

    /// A port quota would be exceeded
    #[error("quota exceeded: {requested} bytes requested, {available} available")]
    QuotaExceeded { requested: usize, available: usize },

    /// The referenced security context has been revoked or deleted
    #[error("security context revoked")]
    ContextRevoked,
}

// NTSTATUS values reported by the native transport
const STATUS_SUCCESS_TIMEOUT: u32 = 0x0000_0102;
const STATUS_INVALID_INFO_CLASS: u32 = 0xC000_0003;
const STATUS_INVALID_HANDLE: u32 = 0xC000_0008;
const STATUS_INVALID_PARAMETER: u32 = 0xC000_000D;
const STATUS_ACCESS_DENIED: u32 = 0xC000_0022;
const STATUS_BUFFER_TOO_SMALL: u32 = 0xC000_0023;
const STATUS_OBJECT_NAME_COLLISION: u32 = 0xC000_0035;
const STATUS_PORT_DISCONNECTED: u32 = 0xC000_0037;
const STATUS_PORT_MESSAGE_TOO_LONG: u32 = 0xC000_002F;
const STATUS_QUOTA_EXCEEDED: u32 = 0xC000_0044;
const STATUS_BAD_IMPERSONATION_LEVEL: u32 = 0xC000_00A5;
const STATUS_CANCELLED: u32 = 0xC000_0120;
const STATUS_NOT_FOUND: u32 = 0xC000_0225;
const STATUS_CONNECTION_REFUSED: u32 = 0xC000_0236;
const STATUS_ALREADY_COMPLETE: u32 = 0x0000_00FF;

impl AlpcError {
    /// Native status code for this error
    pub fn status(&self) -> u32 {
        match self {
            AlpcError::InvalidParameter(_) => STATUS_INVALID_PARAMETER,
            AlpcError::AccessDenied => STATUS_ACCESS_DENIED,
            AlpcError::Timeout => STATUS_SUCCESS_TIMEOUT,
            AlpcError::Cancelled => STATUS_CANCELLED,
            AlpcError::AlreadyDelivered => STATUS_ALREADY_COMPLETE,
            AlpcError::BufferTooSmall { .. } => STATUS_BUFFER_TOO_SMALL,
            AlpcError::PortDisconnected => STATUS_PORT_DISCONNECTED,
            AlpcError::MessageTooLarge { .. } => STATUS_PORT_MESSAGE_TOO_LONG,
            AlpcError::NotFound => STATUS_NOT_FOUND,
            AlpcError::InvalidInformationClass => STATUS_INVALID_INFO_CLASS,
            AlpcError::InvalidHandle(_) => STATUS_INVALID_HANDLE,
            AlpcError::ConnectionRefused => STATUS_CONNECTION_REFUSED,
            AlpcError::ImpersonationLevelTooLow { .. } => STATUS_BAD_IMPERSONATION_LEVEL,
            AlpcError::InvalidAttributeLayout(_) => STATUS_INVALID_PARAMETER,
            AlpcError::NameCollision => STATUS_OBJECT_NAME_COLLISION,
            AlpcError::QuotaExceeded { .. } => STATUS_QUOTA_EXCEEDED,
            AlpcError::ContextRevoked => STATUS_ACCESS_DENIED,
        }
    }

    /// Required buffer size carried by a [`AlpcError::BufferTooSmall`]
    pub fn required_size(&self) -> Option<usize> {
        match self {
            AlpcError::BufferTooSmall { required } => Some(*required),
            _ => None,
        }
    }

    /// Whether the error tears down the connection state of the port
    pub fn is_disconnect(&self) -> bool {
        matches!(self, AlpcError::PortDisconnected)
    }
}
