//! Port implementation - the fundamental transport endpoint
//!
//! Three kinds of port exist. A *connection port* is created by a server and
//! listens under a name. Connecting to it produces a *client communication
//! port* on the client side, and accepting produces a *server communication
//! port* on the server side. Peers reference each other weakly: each side
//! owns only the port it created or accepted.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::attributes::{HandleAttr, ObjectTypes};
use super::connect::PendingConnection;
use super::info::PortInfoState;
use super::message::{MessageType, PORT_MESSAGE_HEADER_SIZE};
use super::mqueue::{DeliveryTicket, MessageQueue, Origin};
use super::reserve::Reserve;
use super::section::{Section, View};
use super::security::SecurityContext;
use crate::error::{AlpcError, Result};
use crate::identity::{self, ImpersonationLevel, Principal, SecurityQos};
use crate::transport::TransportInner;
use crate::types::{AlpcHandle, ClientId, MessageId, PortId};

// ============================================================================
// Attributes
// ============================================================================

bitflags! {
    /// Port attribute flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct PortAttributeFlags: u32 {
        /// Receivers may impersonate senders using this port
        const ALLOW_IMPERSONATION = 0x0001_0000;
        const ALLOW_LPC_REQUESTS = 0x0002_0000;
        const WAITABLE_PORT = 0x0004_0000;
        /// Handle attributes may be delivered to this port
        const ALLOW_DUP_OBJECT = 0x0008_0000;
        const LRPC_WAKE_POLICY1 = 0x0020_0000;
        const LRPC_WAKE_POLICY2 = 0x0040_0000;
        const LRPC_WAKE_POLICY3 = 0x0080_0000;
        const NO_COMPLETE_DUP_OBJECT = 0x0200_0000;
    }
}

/// Quota and security attributes of a port
///
/// Quota fields set to zero are unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PortAttributes {
    pub flags: PortAttributeFlags,
    pub security_qos: SecurityQos,
    /// Largest message (header included) the port sends or accepts
    pub max_message_length: usize,
    /// View bytes a single message may reference
    pub memory_bandwidth: usize,
    /// Queued message bytes plus reserve grants held at the port
    pub max_pool_usage: usize,
    pub max_section_size: usize,
    pub max_view_size: usize,
    pub max_total_section_size: usize,
    /// Object types handle attributes may carry into this port
    pub dup_object_types: ObjectTypes,
}

impl Default for PortAttributes {
    fn default() -> Self {
        Self {
            flags: PortAttributeFlags::empty(),
            security_qos: SecurityQos::default(),
            max_message_length: 0x7FFF,
            memory_bandwidth: 0,
            max_pool_usage: 0,
            max_section_size: 0,
            max_view_size: 0,
            max_total_section_size: 0,
            dup_object_types: ObjectTypes::ALL_OBJECTS,
        }
    }
}

impl PortAttributes {
    /// Default attributes
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flags(mut self, flags: PortAttributeFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_security_qos(mut self, qos: SecurityQos) -> Self {
        self.security_qos = qos;
        self
    }

    pub fn with_max_message_length(mut self, length: usize) -> Self {
        self.max_message_length = length;
        self
    }

    pub fn with_memory_bandwidth(mut self, bytes: usize) -> Self {
        self.memory_bandwidth = bytes;
        self
    }

    pub fn with_max_pool_usage(mut self, bytes: usize) -> Self {
        self.max_pool_usage = bytes;
        self
    }

    pub fn with_max_section_size(mut self, bytes: usize) -> Self {
        self.max_section_size = bytes;
        self
    }

    pub fn with_max_view_size(mut self, bytes: usize) -> Self {
        self.max_view_size = bytes;
        self
    }

    pub fn with_max_total_section_size(mut self, bytes: usize) -> Self {
        self.max_total_section_size = bytes;
        self
    }

    pub fn with_dup_object_types(mut self, types: ObjectTypes) -> Self {
        self.dup_object_types = types;
        self
    }

    /// Check the attributes against the global message length cap
    pub fn validate(&self, max_allowed: usize) -> Result<()> {
        if self.max_message_length > max_allowed {
            return Err(AlpcError::InvalidParameter(
                "max message length exceeds the global cap",
            ));
        }
        if self.max_message_length < PORT_MESSAGE_HEADER_SIZE {
            return Err(AlpcError::InvalidParameter(
                "max message length smaller than a message header",
            ));
        }
        Ok(())
    }
}

/// Apply a quota where zero means unlimited
pub(crate) fn within_quota(limit: usize, value: usize) -> bool {
    limit == 0 || value <= limit
}

// ============================================================================
// Port kind and state
// ============================================================================

/// Role of a port in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// Named listening port owned by a server
    Connection,
    /// Client end of an accepted connection
    ClientCommunication,
    /// Server end of an accepted connection
    ServerCommunication,
}

/// Port lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Created,
    Listening,
    Connected,
    Disconnected,
    Closed,
}

// ============================================================================
// Retained bookkeeping
// ============================================================================

/// Record of a message a port has handed to a receiver
///
/// Replies, impersonation and per-message queries resolve the message id
/// through these records.
pub(crate) struct DeliveredRecord {
    pub message_id: MessageId,
    pub kind: MessageType,
    pub client_id: ClientId,
    pub ticket: Arc<DeliveryTicket>,
    pub origin: Origin,
    pub handle: Option<HandleAttr>,
}

/// Insertion-ordered map with a size bound
///
/// When full, the oldest entry matching the eviction preference goes first,
/// then the oldest entry overall.
pub(crate) struct RetainedMap<T> {
    entries: BTreeMap<MessageId, T>,
    order: VecDeque<MessageId>,
    limit: usize,
}

impl<T> RetainedMap<T> {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            order: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub fn insert(&mut self, id: MessageId, value: T, evict_first: impl Fn(&T) -> bool) {
        if self.entries.insert(id, value).is_some() {
            self.order.retain(|existing| *existing != id);
        }
        self.order.push_back(id);
        while self.entries.len() > self.limit {
            let preferred = self
                .order
                .iter()
                .position(|key| *key != id && self.entries.get(key).is_some_and(&evict_first));
            let index = preferred.unwrap_or(0);
            if let Some(key) = self.order.remove(index) {
                self.entries.remove(&key);
            }
        }
    }

    pub fn get(&self, id: MessageId) -> Option<&T> {
        self.entries.get(&id)
    }

    pub fn remove(&mut self, id: MessageId) -> Option<T> {
        let value = self.entries.remove(&id)?;
        self.order.retain(|existing| *existing != id);
        Some(value)
    }

    pub fn drain(&mut self) -> Vec<T> {
        self.order.clear();
        core::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Objects owned by a port
#[derive(Default)]
pub(crate) struct PortResources {
    pub sections: BTreeMap<AlpcHandle, Section>,
    pub total_section_bytes: usize,
    pub views: BTreeMap<u64, View>,
    pub contexts: BTreeMap<AlpcHandle, Arc<SecurityContext>>,
    pub reserves: BTreeMap<AlpcHandle, Reserve>,
}

/// Links to the other ports of a conversation
#[derive(Default)]
pub(crate) struct PortLinks {
    /// Opposite communication port
    pub peer: Weak<PortObject>,
    /// Server connection port the conversation was accepted on
    pub connection: Weak<PortObject>,
    /// Principal of the other side, captured when the connection formed
    pub peer_principal: Option<Principal>,
    /// Communication ports accepted on a connection port
    pub accepted: Vec<Weak<PortObject>>,
}

// ============================================================================
// Port object
// ============================================================================

/// Shared state of one port
pub struct PortObject {
    pub(crate) id: PortId,
    pub(crate) kind: PortKind,
    pub(crate) name: Option<String>,
    pub(crate) attributes: PortAttributes,
    /// Principal that created or accepted the port
    pub(crate) owner: Principal,
    pub(crate) owner_client: ClientId,
    pub(crate) port_context: u64,
    pub(crate) shared: Arc<TransportInner>,
    pub(crate) state: Mutex<PortState>,
    pub(crate) queue: MessageQueue,
    pub(crate) links: Mutex<PortLinks>,
    pub(crate) resources: Mutex<PortResources>,
    /// Pool bytes held by reserves charged against this port
    pub(crate) pool_reserved: Mutex<usize>,
    /// Messages received through this port
    pub(crate) retained: Mutex<RetainedMap<DeliveredRecord>>,
    /// Tickets of messages sent from this port
    pub(crate) sent: Mutex<RetainedMap<Arc<DeliveryTicket>>>,
    /// Connection requests received but not yet accepted or refused
    pub(crate) pending: Mutex<BTreeMap<MessageId, Arc<PendingConnection>>>,
    pub(crate) info: Mutex<PortInfoState>,
}

impl core::fmt::Debug for PortObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PortObject")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl PortObject {
    /// Create a port owned by the calling thread's effective principal
    pub(crate) fn new(
        shared: Arc<TransportInner>,
        kind: PortKind,
        name: Option<String>,
        attributes: PortAttributes,
        port_context: u64,
    ) -> Arc<Self> {
        let limit = shared.config.retained_message_limit;
        let initial = match kind {
            PortKind::Connection => PortState::Listening,
            _ => PortState::Created,
        };
        Arc::new(Self {
            id: PortId::allocate(),
            kind,
            name,
            attributes,
            owner: identity::effective_principal(),
            owner_client: identity::current_client_id(),
            port_context,
            shared,
            state: Mutex::new(initial),
            queue: MessageQueue::new(),
            links: Mutex::new(PortLinks::default()),
            resources: Mutex::new(PortResources::default()),
            pool_reserved: Mutex::new(0),
            retained: Mutex::new(RetainedMap::new(limit)),
            sent: Mutex::new(RetainedMap::new(limit)),
            pending: Mutex::new(BTreeMap::new()),
            info: Mutex::new(PortInfoState::default()),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> PortState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: PortState) {
        *self.state.lock() = state;
    }

    /// Fail with `PortDisconnected` unless the port can send
    pub(crate) fn ensure_live(&self) -> Result<()> {
        match self.state() {
            PortState::Listening | PortState::Connected => Ok(()),
            _ => Err(AlpcError::PortDisconnected),
        }
    }

    pub(crate) fn peer(&self) -> Option<Arc<PortObject>> {
        self.links.lock().peer.upgrade()
    }

    pub(crate) fn connection(&self) -> Option<Arc<PortObject>> {
        self.links.lock().connection.upgrade()
    }

    /// Port whose queue receives messages sent (not replied) from this port
    pub(crate) fn send_target(&self) -> Result<Arc<PortObject>> {
        let target = match self.kind {
            PortKind::ClientCommunication => self.connection(),
            PortKind::ServerCommunication => self.peer(),
            PortKind::Connection => {
                return Err(AlpcError::InvalidParameter(
                    "a connection port can only reply",
                ))
            }
        };
        target.ok_or(AlpcError::PortDisconnected)
    }

    /// Context the receiver sees for messages sent from this port
    pub(crate) fn conversation_context(&self) -> u64 {
        match self.kind {
            PortKind::ClientCommunication => self.peer().map_or(0, |peer| peer.port_context),
            _ => self.port_context,
        }
    }

    /// Principal captured for a message sent from this port now
    pub(crate) fn sender_principal(&self) -> Principal {
        match self.attributes.security_qos.tracking_mode {
            identity::ContextTrackingMode::Static => self.owner.clone(),
            identity::ContextTrackingMode::Dynamic => identity::effective_principal(),
        }
    }

    /// Impersonation level the sender grants, or `None` if it declined
    pub(crate) fn offered_impersonation(&self, declined_by_message: bool) -> Option<ImpersonationLevel> {
        let level = self.attributes.security_qos.impersonation_level;
        let allowed = !declined_by_message
            && self.attributes.flags.contains(PortAttributeFlags::ALLOW_IMPERSONATION)
            && level > ImpersonationLevel::Anonymous;
        allowed.then_some(level)
    }

    /// Largest number of bytes that may still be queued here
    pub(crate) fn pool_limit(&self) -> Option<usize> {
        let max = self.attributes.max_pool_usage;
        if max == 0 {
            return None;
        }
        Some(max.saturating_sub(*self.pool_reserved.lock()))
    }

    /// Remember a delivered message for replies and queries
    pub(crate) fn remember(&self, record: DeliveredRecord) {
        let id = record.message_id;
        self.retained
            .lock()
            .insert(id, record, |existing| existing.kind == MessageType::Datagram);
    }

    /// Look up a delivered record here, then on the connection port
    pub(crate) fn with_record<T>(
        &self,
        message_id: MessageId,
        f: impl FnOnce(&DeliveredRecord) -> T,
    ) -> Result<T> {
        if let Some(record) = self.retained.lock().get(message_id) {
            return Ok(f(record));
        }
        let connection = self.connection().ok_or(AlpcError::NotFound)?;
        let retained = connection.retained.lock();
        retained.get(message_id).map(f).ok_or(AlpcError::NotFound)
    }

    /// Remove a delivered record here, then on the connection port
    pub(crate) fn take_record(&self, message_id: MessageId) -> Option<DeliveredRecord> {
        if let Some(record) = self.retained.lock().remove(message_id) {
            return Some(record);
        }
        self.connection()?.retained.lock().remove(message_id)
    }

    /// Track a ticket for a message sent from this port
    pub(crate) fn track_sent(&self, ticket: Arc<DeliveryTicket>) {
        self.sent
            .lock()
            .insert(ticket.message_id(), ticket, |t| t.is_settled());
    }

    pub(crate) fn sent_ticket(&self, message_id: MessageId) -> Option<Arc<DeliveryTicket>> {
        self.sent.lock().get(message_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_attributes() {
        let attributes = PortAttributes::default();
        assert_eq!(attributes.max_message_length, 0x7FFF);
        assert_eq!(attributes.dup_object_types, ObjectTypes::ALL_OBJECTS);
        assert_eq!(
            attributes.security_qos.impersonation_level,
            ImpersonationLevel::Impersonation
        );
        assert!(attributes.flags.is_empty());
    }

    #[test]
    fn test_validate_against_cap() {
        assert!(PortAttributes::new().validate(0xFFEF).is_ok());
        assert!(matches!(
            PortAttributes::new()
                .with_max_message_length(0x10000)
                .validate(0xFFEF),
            Err(AlpcError::InvalidParameter(_))
        ));
        assert!(PortAttributes::new()
            .with_max_message_length(8)
            .validate(0xFFEF)
            .is_err());
    }

    #[test]
    fn test_quota_zero_is_unlimited() {
        assert!(within_quota(0, usize::MAX));
        assert!(within_quota(10, 10));
        assert!(!within_quota(10, 11));
    }

    #[test]
    fn test_retained_map_evicts_preferred_first() {
        let mut map = RetainedMap::new(2);
        map.insert(1, "request", |v: &&str| *v == "datagram");
        map.insert(2, "datagram", |v: &&str| *v == "datagram");
        map.insert(3, "request", |v: &&str| *v == "datagram");
        assert!(map.get(1).is_some());
        assert!(map.get(2).is_none());
        assert!(map.get(3).is_some());

        map.insert(4, "request", |v: &&str| *v == "datagram");
        assert!(map.get(1).is_none());
        assert_eq!(map.len(), 2);
    }
}
