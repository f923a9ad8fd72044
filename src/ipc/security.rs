//! Security contexts and client impersonation
//!
//! A security context snapshots a principal plus QoS so a receiver can act as
//! the sender while processing a message. Contexts are bound to one port and
//! go Created -> Active on creation, Active -> Revoked on revoke and
//! {Active, Revoked} -> Deleted on delete. Messages hold the context by
//! reference, so revoking after a send still blocks impersonation.

use alloc::sync::Arc;
use bitflags::bitflags;
use log::debug;
use spin::Mutex;

use super::message::PortMessageHeader;
use super::port::PortObject;
use crate::error::{AlpcError, Result};
use crate::identity::{self, ImpersonationGuard, ImpersonationLevel, Principal, SecurityQos};
use crate::transport::Port;
use crate::types::AlpcHandle;

/// Security context lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityContextState {
    Created,
    Active,
    Revoked,
    Deleted,
}

/// Captured identity usable for impersonation
#[derive(Debug)]
pub struct SecurityContext {
    handle: AlpcHandle,
    principal: Principal,
    qos: SecurityQos,
    state: Mutex<SecurityContextState>,
}

impl SecurityContext {
    /// Capture the calling thread's effective principal
    pub(crate) fn capture(handle: AlpcHandle, qos: SecurityQos) -> Arc<Self> {
        let context = Self {
            handle,
            principal: identity::effective_principal(),
            qos,
            state: Mutex::new(SecurityContextState::Created),
        };
        *context.state.lock() = SecurityContextState::Active;
        Arc::new(context)
    }

    pub fn handle(&self) -> AlpcHandle {
        self.handle
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn qos(&self) -> SecurityQos {
        self.qos
    }

    pub fn state(&self) -> SecurityContextState {
        *self.state.lock()
    }

    fn revoke(&self) {
        let mut state = self.state.lock();
        if *state == SecurityContextState::Active {
            *state = SecurityContextState::Revoked;
        }
    }

    fn delete(&self) {
        *self.state.lock() = SecurityContextState::Deleted;
    }

    /// Principal and level to impersonate, if the context is still usable
    pub(crate) fn impersonation(&self) -> Result<(Principal, ImpersonationLevel)> {
        match self.state() {
            SecurityContextState::Active => Ok((self.principal.clone(), self.qos.impersonation_level)),
            _ => Err(AlpcError::ContextRevoked),
        }
    }
}

bitflags! {
    /// Flags for impersonating the sender of a message
    ///
    /// Bits 2 and 3 carry the minimum level demanded with
    /// `REQUIRE_IMPERSONATION_LEVEL`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ImpersonationFlags: u32 {
        /// Degrade to anonymous instead of failing when the sender declined
        const ANONYMOUS_FALLBACK = 0x1;
        const REQUIRE_IMPERSONATION_LEVEL = 0x2;
    }
}

impl ImpersonationFlags {
    /// Demand at least `level`
    pub fn require_level(level: ImpersonationLevel) -> Self {
        Self::from_bits_retain(Self::REQUIRE_IMPERSONATION_LEVEL.bits() | (level as u32) << 2)
    }

    /// Minimum level demanded, if any
    pub fn required_level(&self) -> Option<ImpersonationLevel> {
        self.contains(Self::REQUIRE_IMPERSONATION_LEVEL)
            .then(|| ImpersonationLevel::from_raw((self.bits() >> 2) & 0x3))
    }
}

impl PortObject {
    /// Look up a context owned by this port
    pub(crate) fn security_context(&self, handle: AlpcHandle) -> Result<Arc<SecurityContext>> {
        self.resources
            .lock()
            .contexts
            .get(&handle)
            .cloned()
            .ok_or(AlpcError::InvalidHandle(handle.as_raw()))
    }

    fn impersonate(
        &self,
        message: &PortMessageHeader,
        flags: ImpersonationFlags,
        container: bool,
    ) -> Result<ImpersonationGuard> {
        let (principal, level) = self.with_record(message.message_id, |record| {
            match &record.origin.security {
                Some(context) => context.impersonation().map(|(p, l)| (p, Some(l))),
                None => Ok((record.origin.principal.clone(), record.origin.impersonation)),
            }
        })??;

        let (principal, level) = match level {
            Some(level) => (principal, level),
            None if flags.contains(ImpersonationFlags::ANONYMOUS_FALLBACK) => {
                (Principal::anonymous(), ImpersonationLevel::Anonymous)
            }
            None => return Err(AlpcError::AccessDenied),
        };

        if let Some(required) = flags.required_level() {
            if level < required {
                return Err(AlpcError::ImpersonationLevelTooLow {
                    required,
                    actual: level,
                });
            }
        }

        let principal = if container {
            principal.container_principal()
        } else {
            principal
        };
        debug!(
            "port {:?}: impersonating sender of message {} as {} ({:?})",
            self.id, message.message_id, principal.sid, level
        );
        Ok(ImpersonationGuard::push(principal, level))
    }
}

impl Port {
    /// Create a security context capturing the caller's effective principal.
    ///
    /// Without an explicit QoS the port's QoS applies.
    pub fn create_security_context(&self, flags: u32, qos: Option<SecurityQos>) -> Result<AlpcHandle> {
        if flags != 0 {
            return Err(AlpcError::InvalidParameter("reserved flags must be zero"));
        }
        let port = &self.object;
        port.ensure_live()?;
        let handle = port.shared.allocate_handle();
        let context = SecurityContext::capture(handle, qos.unwrap_or(port.attributes.security_qos));
        port.resources.lock().contexts.insert(handle, context);
        debug!("port {:?}: security context {:?} created", port.id, handle);
        Ok(handle)
    }

    /// Revoke a context; later impersonation through it fails
    pub fn revoke_security_context(&self, flags: u32, handle: AlpcHandle) -> Result<()> {
        if flags != 0 {
            return Err(AlpcError::InvalidParameter("reserved flags must be zero"));
        }
        self.object.security_context(handle)?.revoke();
        debug!("port {:?}: security context {:?} revoked", self.object.id, handle);
        Ok(())
    }

    /// Delete a context (valid after revoke)
    pub fn delete_security_context(&self, flags: u32, handle: AlpcHandle) -> Result<()> {
        if flags != 0 {
            return Err(AlpcError::InvalidParameter("reserved flags must be zero"));
        }
        let context = self
            .object
            .resources
            .lock()
            .contexts
            .remove(&handle)
            .ok_or(AlpcError::InvalidHandle(handle.as_raw()))?;
        context.delete();
        debug!("port {:?}: security context {:?} deleted", self.object.id, handle);
        Ok(())
    }

    /// State of a context owned by this port
    pub fn security_context_state(&self, handle: AlpcHandle) -> Result<SecurityContextState> {
        Ok(self.object.security_context(handle)?.state())
    }

    /// Impersonate the sender of a received message on the calling thread.
    ///
    /// The returned guard reverts the impersonation when dropped, including
    /// on early returns.
    pub fn impersonate_client(
        &self,
        message: &PortMessageHeader,
        flags: ImpersonationFlags,
    ) -> Result<ImpersonationGuard> {
        self.object.impersonate(message, flags, false)
    }

    /// Impersonate the app container of a message's sender
    pub fn impersonate_client_container(
        &self,
        message: &PortMessageHeader,
        flags: ImpersonationFlags,
    ) -> Result<ImpersonationGuard> {
        self.object.impersonate(message, flags, true)
    }
}
