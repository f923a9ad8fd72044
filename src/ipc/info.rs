//! Port and message information classes
//!
//! Queries follow a two-phase protocol: a buffer that is too small fails
//! with `BufferTooSmall` carrying the required size, and the caller retries
//! with exactly that much. Direct status is the exception, see
//! [`Port::query_message_direct_status`].
//!
//! Layouts are little-endian:
//!
//! | Class | Layout |
//! |---|---|
//! | Basic | `flags u32, sequence u32, port_context u64` |
//! | ConnectedSid | binary SID |
//! | Server | `thread_blocked u32, pad u32, process_id u64, name_len u16, name_max u16, pad u32, name UTF-16` |
//! | AssociateCompletionPort | `completion_key u64, completion_port u64` |
//! | MessageZone | `base u64, size u32, pad u32` |
//! | RegisterCompletionList | `base u64, size u32, concurrency u32, attribute_flags u32, pad u32` |
//! | AdjustCompletionListConcurrencyCount | `concurrency u32` |

use alloc::vec::Vec;
use log::debug;

use super::attributes::AttributeFlags;
use super::message::PortMessageHeader;
use crate::error::{AlpcError, Result};
use crate::transport::Port;
use crate::types::AlpcHandle;

// ============================================================================
// Information classes
// ============================================================================

/// Port information classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PortInformationClass {
    Basic = 0,
    Port = 1,
    AssociateCompletionPort = 2,
    ConnectedSid = 3,
    Server = 4,
    MessageZone = 5,
    RegisterCompletionList = 6,
    UnregisterCompletionList = 7,
    AdjustCompletionListConcurrencyCount = 8,
    RegisterCallback = 9,
    CompletionListRundown = 10,
    WaitForPortReferences = 11,
}

impl PortInformationClass {
    pub fn from_raw(value: u32) -> Result<Self> {
        Ok(match value {
            0 => Self::Basic,
            1 => Self::Port,
            2 => Self::AssociateCompletionPort,
            3 => Self::ConnectedSid,
            4 => Self::Server,
            5 => Self::MessageZone,
            6 => Self::RegisterCompletionList,
            7 => Self::UnregisterCompletionList,
            8 => Self::AdjustCompletionListConcurrencyCount,
            9 => Self::RegisterCallback,
            10 => Self::CompletionListRundown,
            11 => Self::WaitForPortReferences,
            _ => return Err(AlpcError::InvalidInformationClass),
        })
    }
}

/// Per-message information classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageInformationClass {
    Sid = 0,
    TokenModifiedId = 1,
    DirectStatus = 2,
    Handle = 3,
}

impl MessageInformationClass {
    pub fn from_raw(value: u32) -> Result<Self> {
        Ok(match value {
            0 => Self::Sid,
            1 => Self::TokenModifiedId,
            2 => Self::DirectStatus,
            3 => Self::Handle,
            _ => return Err(AlpcError::InvalidInformationClass),
        })
    }
}

/// Size of the basic information record
pub const BASIC_INFORMATION_SIZE: usize = 16;
/// Fixed part of the server information record
pub const SERVER_INFORMATION_SIZE: usize = 24;
/// Size of a message handle information record
pub const MESSAGE_HANDLE_INFORMATION_SIZE: usize = 24;

/// Typed form of the basic information class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicInformation {
    pub flags: u32,
    pub sequence: u32,
    pub port_context: u64,
}

// ============================================================================
// Settable state
// ============================================================================

/// Completion port a port's messages are reported to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionPort {
    pub key: u64,
    pub port: AlpcHandle,
}

/// Caller-provided buffer messages may be received into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageZone {
    pub base: u64,
    pub size: u32,
}

/// Registered completion list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionList {
    pub base: u64,
    pub size: u32,
    pub concurrency: u32,
    pub attribute_flags: AttributeFlags,
}

/// Information set on a port
#[derive(Debug, Default, Clone)]
pub(crate) struct PortInfoState {
    pub completion_port: Option<CompletionPort>,
    pub message_zone: Option<MessageZone>,
    pub completion_list: Option<CompletionList>,
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

/// Copy `bytes` out, or report how much room is needed
fn copy_out(bytes: &[u8], out: &mut [u8]) -> Result<usize> {
    if out.len() < bytes.len() {
        return Err(AlpcError::BufferTooSmall {
            required: bytes.len(),
        });
    }
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(bytes.len())
}

fn expect_len(bytes: &[u8], required: usize) -> Result<()> {
    if bytes.len() < required {
        return Err(AlpcError::BufferTooSmall { required });
    }
    Ok(())
}

// ============================================================================
// Port information
// ============================================================================

impl Port {
    /// Basic information in typed form
    pub fn basic_information(&self) -> BasicInformation {
        let port = &self.object;
        BasicInformation {
            flags: port.attributes.flags.bits(),
            sequence: port.queue.seqno(),
            port_context: port.port_context,
        }
    }

    /// Query a port information class into `out`, returning the bytes written
    pub fn query_information(&self, class: PortInformationClass, out: &mut [u8]) -> Result<usize> {
        let port = &self.object;
        match class {
            PortInformationClass::Basic => {
                let basic = self.basic_information();
                let mut bytes = [0u8; BASIC_INFORMATION_SIZE];
                bytes[0..4].copy_from_slice(&basic.flags.to_le_bytes());
                bytes[4..8].copy_from_slice(&basic.sequence.to_le_bytes());
                bytes[8..16].copy_from_slice(&basic.port_context.to_le_bytes());
                copy_out(&bytes, out)
            }
            PortInformationClass::ConnectedSid => {
                let sid = port
                    .links
                    .lock()
                    .peer_principal
                    .as_ref()
                    .map(|principal| principal.sid.to_bytes())
                    .ok_or(AlpcError::PortDisconnected)?;
                copy_out(&sid, out)
            }
            PortInformationClass::Server => {
                let connection = match port.kind {
                    super::port::PortKind::Connection => None,
                    _ => port.connection(),
                };
                let name = connection
                    .as_ref()
                    .and_then(|c| c.name.clone())
                    .or_else(|| port.name.clone())
                    .unwrap_or_default();
                let process = port.peer().map_or(0, |peer| peer.owner_client.process);
                let blocked = port.queue.waiter_count() > 0;

                let utf16: Vec<u8> = name.encode_utf16().flat_map(u16::to_le_bytes).collect();
                let name_len = u16::try_from(utf16.len())
                    .map_err(|_| AlpcError::InvalidParameter("port name too long"))?;
                let mut bytes = Vec::with_capacity(SERVER_INFORMATION_SIZE + utf16.len());
                bytes.extend_from_slice(&u32::from(blocked).to_le_bytes());
                bytes.extend_from_slice(&[0; 4]);
                bytes.extend_from_slice(&process.to_le_bytes());
                bytes.extend_from_slice(&name_len.to_le_bytes());
                bytes.extend_from_slice(&name_len.to_le_bytes());
                bytes.extend_from_slice(&[0; 4]);
                bytes.extend_from_slice(&utf16);
                copy_out(&bytes, out)
            }
            _ => Err(AlpcError::InvalidInformationClass),
        }
    }

    /// Set a port information class from `bytes`
    pub fn set_information(&self, class: PortInformationClass, bytes: &[u8]) -> Result<()> {
        let port = &self.object;
        let mut info = port.info.lock();
        match class {
            PortInformationClass::AssociateCompletionPort => {
                expect_len(bytes, 16)?;
                let handle = AlpcHandle(read_u64(bytes, 8));
                if handle.is_null() {
                    return Err(AlpcError::InvalidHandle(0));
                }
                info.completion_port = Some(CompletionPort {
                    key: read_u64(bytes, 0),
                    port: handle,
                });
            }
            PortInformationClass::MessageZone => {
                expect_len(bytes, 16)?;
                let zone = MessageZone {
                    base: read_u64(bytes, 0),
                    size: read_u32(bytes, 8),
                };
                if zone.size == 0 {
                    return Err(AlpcError::InvalidParameter("empty message zone"));
                }
                info.message_zone = Some(zone);
            }
            PortInformationClass::RegisterCompletionList => {
                expect_len(bytes, 24)?;
                if info.completion_list.is_some() {
                    return Err(AlpcError::InvalidParameter("completion list already registered"));
                }
                let list = CompletionList {
                    base: read_u64(bytes, 0),
                    size: read_u32(bytes, 8),
                    concurrency: read_u32(bytes, 12),
                    attribute_flags: AttributeFlags::from_bits_truncate(read_u32(bytes, 16)),
                };
                if list.size == 0 {
                    return Err(AlpcError::InvalidParameter("empty completion list"));
                }
                info.completion_list = Some(list);
            }
            PortInformationClass::UnregisterCompletionList => {
                info.completion_list.take().ok_or(AlpcError::NotFound)?;
            }
            PortInformationClass::AdjustCompletionListConcurrencyCount => {
                expect_len(bytes, 4)?;
                let list = info.completion_list.as_mut().ok_or(AlpcError::NotFound)?;
                list.concurrency = read_u32(bytes, 0);
            }
            _ => return Err(AlpcError::InvalidInformationClass),
        }
        debug!("port {:?}: set {:?}", port.id, class);
        Ok(())
    }

    /// Completion port associated with this port
    pub fn completion_port(&self) -> Option<CompletionPort> {
        self.object.info.lock().completion_port
    }

    /// Message zone set on this port
    pub fn message_zone(&self) -> Option<MessageZone> {
        self.object.info.lock().message_zone
    }

    /// Completion list registered on this port
    pub fn completion_list(&self) -> Option<CompletionList> {
        self.object.info.lock().completion_list
    }

    // ========================================================================
    // Message information
    // ========================================================================

    /// Query information about a received message.
    ///
    /// For the handle class the first four bytes of `out` select the handle
    /// index on input.
    pub fn query_message_information(
        &self,
        message: &PortMessageHeader,
        class: MessageInformationClass,
        out: &mut [u8],
    ) -> Result<usize> {
        let port = &self.object;
        match class {
            MessageInformationClass::Sid => {
                let sid = port.with_record(message.message_id, |record| match &record.origin.security {
                    Some(context) => context.principal().sid.to_bytes(),
                    None => record.origin.principal.sid.to_bytes(),
                })?;
                copy_out(&sid, out)
            }
            MessageInformationClass::TokenModifiedId => {
                let modified = port.with_record(message.message_id, |record| {
                    record.origin.principal.token.modified_id.as_u64()
                })?;
                copy_out(&modified.to_le_bytes(), out)
            }
            MessageInformationClass::Handle => {
                if out.len() < MESSAGE_HANDLE_INFORMATION_SIZE {
                    return Err(AlpcError::BufferTooSmall {
                        required: MESSAGE_HANDLE_INFORMATION_SIZE,
                    });
                }
                let index = read_u32(out, 0);
                let handle = port
                    .with_record(message.message_id, |record| record.handle)?
                    .filter(|handle| index < handle.handle_count())
                    .ok_or(AlpcError::NotFound)?;
                let mut bytes = [0u8; MESSAGE_HANDLE_INFORMATION_SIZE];
                bytes[0..4].copy_from_slice(&index.to_le_bytes());
                bytes[4..8].copy_from_slice(&handle.flags.bits().to_le_bytes());
                bytes[8..16].copy_from_slice(&handle.handle.to_le_bytes());
                bytes[16..20].copy_from_slice(&handle.object_type.bits().to_le_bytes());
                bytes[20..24].copy_from_slice(&handle.desired_access.to_le_bytes());
                copy_out(&bytes, out)
            }
            MessageInformationClass::DirectStatus => Err(AlpcError::InvalidParameter(
                "direct status goes through query_message_direct_status",
            )),
        }
    }

    /// Direct completion status of a message sent from this port.
    ///
    /// `out` must be exactly four bytes; any other size is rejected without
    /// reporting a required size.
    pub fn query_message_direct_status(&self, message: &PortMessageHeader, out: &mut [u8]) -> Result<()> {
        if out.len() != 4 {
            return Err(AlpcError::InvalidParameter("direct status takes exactly four bytes"));
        }
        let ticket = self
            .object
            .sent_ticket(message.message_id)
            .ok_or(AlpcError::NotFound)?;
        if !ticket.is_direct() {
            return Err(AlpcError::InvalidParameter("message was not sent with a direct attribute"));
        }
        out.copy_from_slice(&ticket.direct_status().to_le_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::port::{PortAttributeFlags, PortAttributes};
    use crate::transport::Transport;

    #[test]
    fn test_class_numbers() {
        assert_eq!(PortInformationClass::from_raw(4), Ok(PortInformationClass::Server));
        assert_eq!(
            PortInformationClass::from_raw(12),
            Err(AlpcError::InvalidInformationClass)
        );
        assert_eq!(
            MessageInformationClass::from_raw(2),
            Ok(MessageInformationClass::DirectStatus)
        );
        assert_eq!(PortInformationClass::WaitForPortReferences as u32, 11);
    }

    #[test]
    fn test_basic_information_two_phase() {
        let port = Transport::default()
            .create_port(
                None,
                Some(PortAttributes::new().with_flags(PortAttributeFlags::ALLOW_IMPERSONATION)),
            )
            .unwrap();
        let mut small = [0u8; 8];
        assert_eq!(
            port.query_information(PortInformationClass::Basic, &mut small),
            Err(AlpcError::BufferTooSmall { required: 16 })
        );
        let mut out = [0u8; 16];
        assert_eq!(port.query_information(PortInformationClass::Basic, &mut out), Ok(16));
        assert_eq!(read_u32(&out, 0), PortAttributeFlags::ALLOW_IMPERSONATION.bits());
        assert_eq!(read_u32(&out, 4), 0);
    }

    #[test]
    fn test_server_information_names_port() {
        let port = Transport::default().create_port(Some("\\srv"), None).unwrap();
        let required = match port.query_information(PortInformationClass::Server, &mut []) {
            Err(AlpcError::BufferTooSmall { required }) => required,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(required, SERVER_INFORMATION_SIZE + 8);
        let mut out = vec![0u8; required];
        assert_eq!(port.query_information(PortInformationClass::Server, &mut out), Ok(required));
        assert_eq!(u16::from_le_bytes([out[16], out[17]]), 8);
        let name: Vec<u16> = out[24..]
            .chunks(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        assert_eq!(String::from_utf16(&name).unwrap(), "\\srv");
    }

    #[test]
    fn test_unsupported_classes() {
        let port = Transport::default().create_port(None, None).unwrap();
        let mut out = [0u8; 64];
        assert_eq!(
            port.query_information(PortInformationClass::RegisterCallback, &mut out),
            Err(AlpcError::InvalidInformationClass)
        );
        assert_eq!(
            port.set_information(PortInformationClass::Basic, &out),
            Err(AlpcError::InvalidInformationClass)
        );
        // No peer on a listening port
        assert_eq!(
            port.query_information(PortInformationClass::ConnectedSid, &mut out),
            Err(AlpcError::PortDisconnected)
        );
    }

    #[test]
    fn test_completion_list_registration() {
        let port = Transport::default().create_port(None, None).unwrap();
        let mut list = [0u8; 24];
        list[0..8].copy_from_slice(&0x1000u64.to_le_bytes());
        list[8..12].copy_from_slice(&4096u32.to_le_bytes());
        list[12..16].copy_from_slice(&2u32.to_le_bytes());

        assert_eq!(
            port.set_information(PortInformationClass::RegisterCompletionList, &list[..16]),
            Err(AlpcError::BufferTooSmall { required: 24 })
        );
        port.set_information(PortInformationClass::RegisterCompletionList, &list).unwrap();
        assert!(port
            .set_information(PortInformationClass::RegisterCompletionList, &list)
            .is_err());
        port.set_information(
            PortInformationClass::AdjustCompletionListConcurrencyCount,
            &8u32.to_le_bytes(),
        )
        .unwrap();
        assert_eq!(port.completion_list().unwrap().concurrency, 8);

        port.set_information(PortInformationClass::UnregisterCompletionList, &[]).unwrap();
        assert_eq!(
            port.set_information(PortInformationClass::UnregisterCompletionList, &[]),
            Err(AlpcError::NotFound)
        );
    }

    #[test]
    fn test_completion_port_and_zone() {
        let port = Transport::default().create_port(None, None).unwrap();
        let mut association = [0u8; 16];
        association[0..8].copy_from_slice(&7u64.to_le_bytes());
        association[8..16].copy_from_slice(&0x88u64.to_le_bytes());
        port.set_information(PortInformationClass::AssociateCompletionPort, &association)
            .unwrap();
        assert_eq!(
            port.completion_port(),
            Some(CompletionPort {
                key: 7,
                port: AlpcHandle(0x88)
            })
        );

        let mut zone = [0u8; 16];
        zone[0..8].copy_from_slice(&0x2000u64.to_le_bytes());
        assert!(matches!(
            port.set_information(PortInformationClass::MessageZone, &zone),
            Err(AlpcError::InvalidParameter(_))
        ));
        zone[8..12].copy_from_slice(&512u32.to_le_bytes());
        port.set_information(PortInformationClass::MessageZone, &zone).unwrap();
        assert_eq!(port.message_zone().map(|z| z.size), Some(512));
    }

    #[test]
    fn test_direct_status_needs_exact_buffer() {
        let port = Transport::default().create_port(None, None).unwrap();
        let header = PortMessageHeader::default();
        let mut wrong = [0u8; 8];
        assert!(matches!(
            port.query_message_direct_status(&header, &mut wrong),
            Err(AlpcError::InvalidParameter(_))
        ));
        let mut exact = [0u8; 4];
        assert_eq!(
            port.query_message_direct_status(&header, &mut exact),
            Err(AlpcError::NotFound)
        );
        assert!(matches!(
            port.query_message_information(&header, MessageInformationClass::DirectStatus, &mut wrong),
            Err(AlpcError::InvalidParameter(_))
        ));
    }
}
