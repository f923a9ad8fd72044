//! Port message queue - blocking FIFO with delivery tickets
//!
//! Every queued message carries a [`DeliveryTicket`]. The ticket is the single
//! arbiter between the receive path (which moves it out of `Queued`) and
//! `CancelMessage` (which moves it to `Cancelled`), so a message is delivered
//! at most once and a cancel reports exactly one outcome.

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use log::trace;
use parking_lot::{Condvar, Mutex};

use super::attributes::AttributeBundle;
use super::connect::PendingConnection;
use super::message::{MessageType, PortMessage};
use super::port::PortObject;
use super::section::SharedView;
use super::security::SecurityContext;
use crate::error::{AlpcError, Result};
use crate::identity::{ImpersonationLevel, Principal};
use crate::types::{ClientId, MessageId};

/// Direct status while the message is still queued (STATUS_PENDING)
pub const DIRECT_STATUS_PENDING: u32 = 0x0000_0103;
/// Direct status once the receiver has taken the message
pub const DIRECT_STATUS_DELIVERED: u32 = 0;
/// Direct status of a cancelled message (STATUS_CANCELLED)
pub const DIRECT_STATUS_CANCELLED: u32 = 0xC000_0120;

// ============================================================================
// Delivery tickets
// ============================================================================

/// Delivery progress of one sent message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketState {
    /// Waiting in the destination queue
    Queued,
    /// Taken by a receiver; requests now await their reply
    Dequeued,
    /// Reply routed back to the sender
    Replied,
    Cancelled,
}

/// Shared delivery state of one message
#[derive(Debug)]
pub struct DeliveryTicket {
    message_id: MessageId,
    callback_id: u32,
    expects_reply: bool,
    direct: bool,
    sequence: AtomicU32,
    state: spin::Mutex<TicketState>,
}

impl DeliveryTicket {
    pub(crate) fn new(message_id: MessageId, callback_id: u32, expects_reply: bool, direct: bool) -> Arc<Self> {
        Arc::new(Self {
            message_id,
            callback_id,
            expects_reply,
            direct,
            sequence: AtomicU32::new(0),
            state: spin::Mutex::new(TicketState::Queued),
        })
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn callback_id(&self) -> u32 {
        self.callback_id
    }

    /// Sequence number assigned by the destination queue
    pub fn sequence(&self) -> u32 {
        self.sequence.load(Ordering::Acquire)
    }

    pub fn state(&self) -> TicketState {
        *self.state.lock()
    }

    /// Whether the message was sent with a direct attribute
    pub fn is_direct(&self) -> bool {
        self.direct
    }

    /// True once the receiver has taken the message
    pub fn is_delivered(&self) -> bool {
        matches!(self.state(), TicketState::Dequeued | TicketState::Replied)
    }

    /// No further transition is possible
    pub(crate) fn is_settled(&self) -> bool {
        match self.state() {
            TicketState::Queued => false,
            TicketState::Dequeued => !self.expects_reply,
            TicketState::Replied | TicketState::Cancelled => true,
        }
    }

    /// Direct completion status
    pub fn direct_status(&self) -> u32 {
        match self.state() {
            TicketState::Queued => DIRECT_STATUS_PENDING,
            TicketState::Dequeued | TicketState::Replied => DIRECT_STATUS_DELIVERED,
            TicketState::Cancelled => DIRECT_STATUS_CANCELLED,
        }
    }

    fn set_sequence(&self, sequence: u32) {
        self.sequence.store(sequence, Ordering::Release);
    }

    /// Receiver takes the message; false if it was cancelled first
    pub(crate) fn mark_dequeued(&self) -> bool {
        let mut state = self.state.lock();
        if *state == TicketState::Queued {
            *state = TicketState::Dequeued;
            true
        } else {
            false
        }
    }

    /// Reply arrives; false if the request was cancelled
    pub(crate) fn complete_reply(&self) -> bool {
        let mut state = self.state.lock();
        if *state == TicketState::Dequeued {
            *state = TicketState::Replied;
            true
        } else {
            false
        }
    }

    /// Cancel the message.
    ///
    /// A queued message is always cancellable. A dequeued request can still
    /// have its reply wait cancelled unless `try_only` is set. Anything the
    /// receiver already owns reports `AlreadyDelivered`.
    pub(crate) fn cancel(&self, try_only: bool) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            TicketState::Queued => {
                *state = TicketState::Cancelled;
                Ok(())
            }
            TicketState::Dequeued if self.expects_reply && !try_only => {
                *state = TicketState::Cancelled;
                Ok(())
            }
            TicketState::Dequeued | TicketState::Replied => Err(AlpcError::AlreadyDelivered),
            TicketState::Cancelled => Ok(()),
        }
    }

    /// Mark the message abandoned (queue torn down before delivery)
    pub(crate) fn abandon(&self) {
        let mut state = self.state.lock();
        if matches!(*state, TicketState::Queued | TicketState::Dequeued) {
            *state = TicketState::Cancelled;
        }
    }
}

// ============================================================================
// Envelopes
// ============================================================================

/// What the receiver learns about the sender of a message
#[derive(Clone)]
pub(crate) struct Origin {
    /// Port replies are routed to
    pub port: Weak<PortObject>,
    pub client_id: ClientId,
    /// Context of the conversation as seen by the receiver
    pub port_context: u64,
    pub principal: Principal,
    /// Level the sender grants, `None` when it declined impersonation
    pub impersonation: Option<ImpersonationLevel>,
    pub security: Option<Arc<SecurityContext>>,
}

/// A queued message with everything the receive path needs
pub(crate) struct Envelope {
    pub message: PortMessage,
    /// Attributes the sender populated
    pub attributes: AttributeBundle,
    pub shared_view: Option<SharedView>,
    pub ticket: Arc<DeliveryTicket>,
    pub origin: Origin,
    pub connection: Option<Arc<PendingConnection>>,
    pub sequence: u32,
    /// Counted against the destination pool; set by the queue
    pub pooled: bool,
}

impl core::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Envelope")
            .field("sequence", &self.sequence)
            .field("pooled", &self.pooled)
            .finish_non_exhaustive()
    }
}

impl Envelope {
    fn size(&self) -> usize {
        self.message.total_length()
    }

    fn is_reply_to(&self, message_id: MessageId) -> bool {
        self.message.kind() == Some(MessageType::Reply) && self.message.message_id() == message_id
    }
}

/// Which queued message a receiver is waiting for
#[derive(Clone, Copy)]
pub(crate) enum Wanted<'a> {
    /// Head of the queue
    Any,
    /// Reply to a request sent from this port
    ReplyTo(&'a DeliveryTicket),
}

// ============================================================================
// Message Queue
// ============================================================================

/// Message queue state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqueueState {
    /// Queue is active and accepting messages
    Active,
    /// No further messages accepted; remaining ones can still be drained
    Dead,
}

struct QueueInner {
    state: MqueueState,
    messages: VecDeque<Envelope>,
    queued_bytes: usize,
    /// Bytes of messages charged to the pool
    pool_bytes: usize,
    seqno: u32,
    waiters: usize,
}

impl QueueInner {
    fn purge_cancelled(&mut self) {
        let before = self.messages.len();
        let mut freed = 0;
        let mut pooled = 0;
        self.messages.retain(|envelope| {
            let keep = envelope.ticket.state() != TicketState::Cancelled;
            if !keep {
                freed += envelope.size();
                if envelope.pooled {
                    pooled += envelope.size();
                }
            }
            keep
        });
        if self.messages.len() != before {
            self.queued_bytes -= freed;
            self.pool_bytes -= pooled;
            trace!("mqueue: purged {} cancelled message(s)", before - self.messages.len());
        }
    }

    fn position(&self, wanted: &Wanted<'_>) -> Option<usize> {
        match wanted {
            Wanted::Any => (!self.messages.is_empty()).then_some(0),
            Wanted::ReplyTo(ticket) => self
                .messages
                .iter()
                .position(|envelope| envelope.is_reply_to(ticket.message_id())),
        }
    }

    fn remove(&mut self, index: usize) -> Option<Envelope> {
        let envelope = self.messages.remove(index)?;
        self.queued_bytes -= envelope.size();
        if envelope.pooled {
            self.pool_bytes -= envelope.size();
        }
        Some(envelope)
    }
}

/// Blocking message queue of a port
///
/// Messages are kept in FIFO order. Receivers block on a condition variable
/// with an optional deadline; senders never block.
pub struct MessageQueue {
    inner: Mutex<QueueInner>,
    ready: Condvar,
}

impl MessageQueue {
    /// Create an empty, active queue
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                state: MqueueState::Active,
                messages: VecDeque::new(),
                queued_bytes: 0,
                pool_bytes: 0,
                seqno: 0,
                waiters: 0,
            }),
            ready: Condvar::new(),
        }
    }

    /// Get queue state
    pub fn state(&self) -> MqueueState {
        self.inner.lock().state
    }

    /// Get number of messages in queue
    pub fn count(&self) -> usize {
        self.inner.lock().messages.len()
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Bytes held by queued messages
    pub fn queued_bytes(&self) -> usize {
        self.inner.lock().queued_bytes
    }

    /// Bytes of queued messages charged to the port's pool
    pub fn pool_bytes(&self) -> usize {
        self.inner.lock().pool_bytes
    }

    /// Last sequence number handed out
    pub fn seqno(&self) -> u32 {
        self.inner.lock().seqno
    }

    /// Threads currently blocked in a receive
    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters
    }

    // ========================================================================
    // Send Operations
    // ========================================================================

    /// Enqueue a message, assigning its sequence number.
    ///
    /// `pool_limit` bounds the pool-charged bytes the queue may hold after
    /// the push. Messages pushed without a limit are not charged.
    pub(crate) fn push(&self, mut envelope: Envelope, pool_limit: Option<usize>) -> Result<u32> {
        let mut inner = self.inner.lock();
        if inner.state == MqueueState::Dead {
            return Err(AlpcError::PortDisconnected);
        }
        inner.purge_cancelled();

        let size = envelope.size();
        if let Some(limit) = pool_limit {
            if inner.pool_bytes + size > limit {
                return Err(AlpcError::QuotaExceeded {
                    requested: size,
                    available: limit.saturating_sub(inner.pool_bytes),
                });
            }
            inner.pool_bytes += size;
            envelope.pooled = true;
        }

        inner.seqno = inner.seqno.wrapping_add(1);
        let sequence = inner.seqno;
        envelope.sequence = sequence;
        envelope.ticket.set_sequence(sequence);
        trace!(
            "mqueue: enqueue id={} seq={} len={}",
            envelope.message.message_id(),
            sequence,
            size
        );
        inner.queued_bytes += size;
        inner.messages.push_back(envelope);

        // Waiters filter differently (any vs. a specific reply), wake them all
        self.ready.notify_all();
        Ok(sequence)
    }

    // ========================================================================
    // Receive Operations
    // ========================================================================

    /// Dequeue the wanted message, blocking until `deadline`.
    ///
    /// A message larger than `capacity` stays queued and the call fails with
    /// the size it needs.
    pub(crate) fn pop(
        &self,
        wanted: Wanted<'_>,
        capacity: usize,
        deadline: Option<Instant>,
    ) -> Result<Envelope> {
        let mut inner = self.inner.lock();
        loop {
            inner.purge_cancelled();
            if let Wanted::ReplyTo(ticket) = wanted {
                if ticket.state() == TicketState::Cancelled {
                    return Err(AlpcError::Cancelled);
                }
            }

            if let Some(index) = inner.position(&wanted) {
                let required = inner.messages[index].size();
                if required > capacity {
                    return Err(AlpcError::BufferTooSmall { required });
                }
                if let Some(envelope) = inner.remove(index) {
                    if envelope.ticket.mark_dequeued() {
                        trace!(
                            "mqueue: dequeue id={} seq={}",
                            envelope.message.message_id(),
                            envelope.sequence
                        );
                        return Ok(envelope);
                    }
                }
                // Lost the race against a cancel; look again
                continue;
            }

            if inner.state == MqueueState::Dead {
                return Err(AlpcError::PortDisconnected);
            }

            inner.waiters += 1;
            match deadline {
                None => self.ready.wait(&mut inner),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        inner.waiters -= 1;
                        return Err(AlpcError::Timeout);
                    }
                    let _ = self.ready.wait_until(&mut inner, deadline);
                }
            }
            inner.waiters -= 1;
        }
    }

    /// Remove a still-queued message by id
    pub(crate) fn withdraw(&self, message_id: MessageId) -> Option<Envelope> {
        let mut inner = self.inner.lock();
        let index = inner
            .messages
            .iter()
            .position(|envelope| envelope.message.message_id() == message_id)?;
        inner.remove(index)
    }

    /// Wake every blocked receiver so it re-evaluates its wait
    pub(crate) fn notify_all(&self) {
        let _inner = self.inner.lock();
        self.ready.notify_all();
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Stop accepting messages; queued ones remain receivable
    pub(crate) fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.state = MqueueState::Dead;
        self.ready.notify_all();
    }

    /// Stop accepting messages and hand back everything queued
    pub(crate) fn close(&self) -> Vec<Envelope> {
        let mut inner = self.inner.lock();
        inner.state = MqueueState::Dead;
        inner.queued_bytes = 0;
        inner.pool_bytes = 0;
        let drained = inner.messages.drain(..).collect();
        self.ready.notify_all();
        drained
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}
