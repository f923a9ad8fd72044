//! Resource reserves - pre-granted quota for one in-flight message
//!
//! A reserve is carved out of the pool of the port its messages land on:
//! the send target for a communication port, the port itself for a
//! connection port. Its granted size may be smaller than requested; a
//! message sent under it is checked against the granted size at send time.
//!
//! A reserve carries one message at a time. It stays busy until that
//! message settles: a datagram when it is received, a request when it is
//! replied to, released or cancelled.

use alloc::sync::{Arc, Weak};
use log::{debug, trace};

use super::message::{PortMessage, PORT_MESSAGE_HEADER_SIZE};
use super::mqueue::DeliveryTicket;
use super::port::{PortKind, PortObject};
use crate::error::{AlpcError, Result};
use crate::transport::Port;
use crate::types::AlpcHandle;

/// Grant held against one port's pool
pub(crate) struct Reserve {
    pub granted: usize,
    /// Port whose pool holds the grant
    pub pool: Weak<PortObject>,
    /// Message currently sent under the reserve
    pub in_flight: Option<Arc<DeliveryTicket>>,
}

impl Reserve {
    fn is_busy(&self) -> bool {
        self.in_flight.as_ref().is_some_and(|ticket| !ticket.is_settled())
    }
}

impl Drop for Reserve {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            let mut reserved = pool.pool_reserved.lock();
            *reserved = reserved.saturating_sub(self.granted);
        }
    }
}

impl PortObject {
    /// Check a message against the reserve it is sent under
    pub(crate) fn check_reserve(&self, message: &PortMessage) -> Result<()> {
        let Some(reserve) = message.reserve() else {
            return Ok(());
        };
        let granted = self
            .resources
            .lock()
            .reserves
            .get(&reserve)
            .ok_or(AlpcError::NotFound)?
            .granted;
        let size = message.total_length();
        if size > granted {
            return Err(AlpcError::MessageTooLarge { size, max: granted });
        }
        Ok(())
    }

    /// Bind the message's reserve to `ticket`.
    ///
    /// Returns true when the grant already holds room in `target`'s pool, so
    /// the push needs no pool check. Fails with `QuotaExceeded` while the
    /// reserve still carries an earlier message.
    pub(crate) fn claim_reserve(
        &self,
        message: &PortMessage,
        target: &PortObject,
        ticket: &Arc<DeliveryTicket>,
    ) -> Result<bool> {
        let Some(handle) = message.reserve() else {
            return Ok(false);
        };
        let mut resources = self.resources.lock();
        let reserve = resources.reserves.get_mut(&handle).ok_or(AlpcError::NotFound)?;
        if reserve.is_busy() {
            return Err(AlpcError::QuotaExceeded {
                requested: message.total_length(),
                available: 0,
            });
        }
        reserve.in_flight = Some(ticket.clone());
        trace!("port {:?}: reserve {:?} carries {}", self.id, handle, ticket.message_id());
        Ok(reserve.pool.upgrade().is_some_and(|pool| pool.id == target.id))
    }

    /// Free a reserve claimed for a message that was never queued
    pub(crate) fn unclaim_reserve(&self, message: &PortMessage, ticket: &Arc<DeliveryTicket>) {
        let Some(handle) = message.reserve() else {
            return;
        };
        if let Some(reserve) = self.resources.lock().reserves.get_mut(&handle) {
            if reserve.in_flight.as_ref().is_some_and(|held| Arc::ptr_eq(held, ticket)) {
                reserve.in_flight = None;
            }
        }
    }

    /// Port whose pool backs reserves created here
    fn reserve_pool(self: &Arc<Self>) -> Result<Arc<PortObject>> {
        match self.kind {
            PortKind::Connection => Ok(self.clone()),
            _ => self.send_target(),
        }
    }
}

impl Port {
    /// Reserve room for one message of up to `message_size` bytes.
    ///
    /// Returns the reserve id and the granted size, which is capped by the
    /// port's message length and by what remains of the pool the reserve is
    /// charged against.
    pub fn create_resource_reserve(&self, flags: u32, message_size: usize) -> Result<(AlpcHandle, usize)> {
        if flags != 0 {
            return Err(AlpcError::InvalidParameter("reserved flags must be zero"));
        }
        if message_size < PORT_MESSAGE_HEADER_SIZE {
            return Err(AlpcError::InvalidParameter("reserve smaller than a message header"));
        }
        let port = &self.object;
        port.ensure_live()?;
        let pool = port.reserve_pool()?;

        let mut granted = message_size.min(port.attributes.max_message_length);
        {
            let mut reserved = pool.pool_reserved.lock();
            if pool.attributes.max_pool_usage != 0 {
                let used = *reserved + pool.queue.pool_bytes();
                let remaining = pool.attributes.max_pool_usage.saturating_sub(used);
                if remaining < PORT_MESSAGE_HEADER_SIZE {
                    return Err(AlpcError::QuotaExceeded {
                        requested: message_size,
                        available: remaining,
                    });
                }
                granted = granted.min(remaining);
            }
            *reserved += granted;
        }

        let handle = port.shared.allocate_handle();
        port.resources.lock().reserves.insert(
            handle,
            Reserve {
                granted,
                pool: Arc::downgrade(&pool),
                in_flight: None,
            },
        );
        debug!(
            "port {:?}: reserve {:?} granted {} of {} bytes from port {:?}",
            port.id, handle, granted, message_size, pool.id
        );
        Ok((handle, granted))
    }

    /// Delete a reserve; messages already sent under it are unaffected
    pub fn delete_resource_reserve(&self, flags: u32, reserve: AlpcHandle) -> Result<()> {
        if flags != 0 {
            return Err(AlpcError::InvalidParameter("reserved flags must be zero"));
        }
        let port = &self.object;
        let removed = port.resources.lock().reserves.remove(&reserve);
        removed.ok_or(AlpcError::NotFound)?;
        debug!("port {:?}: reserve {:?} deleted", port.id, reserve);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::port::PortAttributes;
    use crate::transport::Transport;

    #[test]
    fn test_granted_size_is_capped() {
        let transport = Transport::default();
        let port = transport
            .create_port(
                None,
                Some(PortAttributes::new().with_max_message_length(1000).with_max_pool_usage(1500)),
            )
            .unwrap();

        let (first, granted) = port.create_resource_reserve(0, 4000).unwrap();
        assert_eq!(granted, 1000);
        let (_, granted) = port.create_resource_reserve(0, 4000).unwrap();
        assert_eq!(granted, 500);
        assert!(matches!(
            port.create_resource_reserve(0, 100),
            Err(AlpcError::QuotaExceeded { .. })
        ));

        port.delete_resource_reserve(0, first).unwrap();
        assert_eq!(port.delete_resource_reserve(0, first), Err(AlpcError::NotFound));
        assert_eq!(port.create_resource_reserve(0, 100).unwrap().1, 100);
    }

    #[test]
    fn test_reserve_too_small() {
        let port = Transport::default().create_port(None, None).unwrap();
        assert!(matches!(
            port.create_resource_reserve(0, 8),
            Err(AlpcError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_message_checked_against_grant() {
        let port = Transport::default().create_port(None, None).unwrap();
        let (reserve, granted) = port.create_resource_reserve(0, 100).unwrap();
        assert_eq!(granted, 100);

        let fits = PortMessage::new(&[0; 60]).unwrap().with_reserve(reserve);
        assert!(port.object.check_reserve(&fits).is_ok());
        let too_big = PortMessage::new(&[0; 61]).unwrap().with_reserve(reserve);
        assert_eq!(
            port.object.check_reserve(&too_big),
            Err(AlpcError::MessageTooLarge { size: 101, max: 100 })
        );
        let unknown = PortMessage::new(&[]).unwrap().with_reserve(AlpcHandle(0x99));
        assert_eq!(port.object.check_reserve(&unknown), Err(AlpcError::NotFound));
    }
}
