//! Transport - the port namespace and its collaborators
//!
//! A [`Transport`] owns the table of named connection ports, the id and
//! handle counters, and the external access checker and sender opener.
//! Every port belongs to exactly one transport. [`Port`] is the owning
//! handle of a port: dropping it closes the port.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::debug;
use spin::Mutex;

use crate::access::{AccessCheck, AllowAll, NoSenderAccess, SenderOpener};
use crate::config::TransportConfig;
use crate::error::{AlpcError, Result};
use crate::ipc::port::{PortAttributes, PortKind, PortObject, PortState};
use crate::types::{AlpcHandle, MessageId, PortId};

// ============================================================================
// Shared state
// ============================================================================

/// State shared by every port of a transport
pub(crate) struct TransportInner {
    pub config: TransportConfig,
    /// Named connection ports
    names: Mutex<BTreeMap<String, Weak<PortObject>>>,
    pub access: Arc<dyn AccessCheck>,
    pub opener: Arc<dyn SenderOpener>,
    next_message_id: AtomicU32,
    next_handle: AtomicU64,
    next_view_base: AtomicU64,
}

impl TransportInner {
    /// Bind `name` to a connection port
    pub fn register(&self, name: &str, port: &Arc<PortObject>) -> Result<()> {
        let mut names = self.names.lock();
        if names.get(name).is_some_and(|existing| existing.strong_count() > 0) {
            return Err(AlpcError::NameCollision);
        }
        names.insert(String::from(name), Arc::downgrade(port));
        Ok(())
    }

    /// Resolve a name to a live connection port
    pub fn lookup(&self, name: &str) -> Option<Arc<PortObject>> {
        self.names.lock().get(name).and_then(Weak::upgrade)
    }

    /// Drop the binding of `name` if it still refers to `port`
    pub fn unregister(&self, name: &str, port: &PortObject) {
        let mut names = self.names.lock();
        let bound_here = names
            .get(name)
            .is_some_and(|existing| core::ptr::eq(existing.as_ptr(), port));
        if bound_here {
            names.remove(name);
            debug!("transport: name {:?} released", name);
        }
    }

    /// Next message id; zero is never handed out
    pub fn next_message_id(&self) -> MessageId {
        loop {
            let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
            if id != 0 {
                return id;
            }
        }
    }

    /// Next handle for a port-owned object
    pub fn allocate_handle(&self) -> AlpcHandle {
        AlpcHandle(self.next_handle.fetch_add(4, Ordering::SeqCst))
    }

    /// Page-aligned base for a view of `size` bytes, followed by a guard page
    pub fn allocate_view_base(&self, size: usize) -> u64 {
        let span = self.config.page_round(size.max(1)) + self.config.page_size;
        self.next_view_base.fetch_add(span as u64, Ordering::SeqCst)
    }
}

// ============================================================================
// Transport
// ============================================================================

/// A namespace of ports plus the collaborators they consult
///
/// Cloning is cheap; clones share the same namespace.
#[derive(Clone)]
pub struct Transport {
    pub(crate) inner: Arc<TransportInner>,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl core::fmt::Debug for Transport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Transport")
            .field("config", &self.inner.config)
            .field("names", &self.inner.names.lock().len())
            .finish_non_exhaustive()
    }
}

/// Process-wide transport
static SYSTEM_TRANSPORT: spin::Once<Transport> = spin::Once::new();

impl Transport {
    /// Transport that permits every operation and opens no sender objects
    pub fn new(config: TransportConfig) -> Self {
        Self::with_collaborators(config, Arc::new(AllowAll), Arc::new(NoSenderAccess))
    }

    /// Transport with an external access checker and sender opener
    pub fn with_collaborators(
        config: TransportConfig,
        access: Arc<dyn AccessCheck>,
        opener: Arc<dyn SenderOpener>,
    ) -> Self {
        let view_base_start = config.view_base_start;
        Self {
            inner: Arc::new(TransportInner {
                config,
                names: Mutex::new(BTreeMap::new()),
                access,
                opener,
                next_message_id: AtomicU32::new(1),
                next_handle: AtomicU64::new(4),
                next_view_base: AtomicU64::new(view_base_start),
            }),
        }
    }

    /// The process-wide transport, created with defaults on first use
    pub fn system() -> &'static Transport {
        SYSTEM_TRANSPORT.call_once(Transport::default)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Names currently bound to live connection ports
    pub fn port_names(&self) -> Vec<String> {
        self.inner
            .names
            .lock()
            .iter()
            .filter(|(_, port)| port.strong_count() > 0)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

// ============================================================================
// Port handle
// ============================================================================

/// Owning handle of a port
///
/// Dropping the handle disconnects and closes the port. The opposite end of
/// a conversation is never owned through this handle.
pub struct Port {
    pub(crate) object: Arc<PortObject>,
}

impl Port {
    pub(crate) fn from_object(object: Arc<PortObject>) -> Self {
        Self { object }
    }

    pub fn id(&self) -> PortId {
        self.object.id
    }

    /// Name the port was created under
    pub fn name(&self) -> Option<&str> {
        self.object.name.as_deref()
    }

    pub fn kind(&self) -> PortKind {
        self.object.kind
    }

    /// Current lifecycle state
    pub fn state(&self) -> PortState {
        self.object.state()
    }

    pub fn attributes(&self) -> &PortAttributes {
        &self.object.attributes
    }

    /// Context value supplied when the port was accepted
    pub fn port_context(&self) -> u64 {
        self.object.port_context
    }

    /// Messages waiting in this port's queue
    pub fn pending_messages(&self) -> usize {
        self.object.queue.count()
    }
}

impl core::fmt::Debug for Port {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(&*self.object, f)
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        self.object.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_ids_are_nonzero_and_increasing() {
        let transport = Transport::default();
        let first = transport.inner.next_message_id();
        let second = transport.inner.next_message_id();
        assert_ne!(first, 0);
        assert!(second > first);

        transport.inner.next_message_id.store(u32::MAX, Ordering::SeqCst);
        assert_eq!(transport.inner.next_message_id(), u32::MAX);
        assert_eq!(transport.inner.next_message_id(), 1);
    }

    #[test]
    fn test_view_bases_are_page_aligned_and_disjoint() {
        let transport = Transport::default();
        let first = transport.inner.allocate_view_base(100);
        let second = transport.inner.allocate_view_base(8192);
        let third = transport.inner.allocate_view_base(1);
        assert_eq!(first % 4096, 0);
        assert_eq!(second, first + 8192);
        assert_eq!(third, second + 8192 + 4096);
    }

    #[test]
    fn test_names_released_on_drop() {
        let transport = Transport::default();
        let port = transport.create_port(Some("\\named"), None).unwrap();
        assert_eq!(port.name(), Some("\\named"));
        assert_eq!(transport.port_names(), vec![String::from("\\named")]);
        drop(port);
        assert!(transport.port_names().is_empty());
        assert!(transport.inner.lookup("\\named").is_none());
    }

    #[test]
    fn test_system_transport_is_shared() {
        let first = Transport::system() as *const Transport;
        let second = Transport::system() as *const Transport;
        assert_eq!(first, second);
    }
}
