//! External collaborators consumed by the transport
//!
//! The transport never evaluates security descriptors or opens process and
//! thread objects itself. It calls through the narrow traits here, which the
//! embedding system implements.

use bitflags::bitflags;

use crate::error::{AlpcError, Result};
use crate::identity::{Principal, Sid};
use crate::types::ClientId;

bitflags! {
    /// Access rights on a port object
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessRights: u32 {
        const CONNECT = 0x0000_0001;
        const DELETE = 0x0001_0000;
        const READ_CONTROL = 0x0002_0000;
        const WRITE_DAC = 0x0004_0000;
        const WRITE_OWNER = 0x0008_0000;
        const SYNCHRONIZE = 0x0010_0000;
        const ACCESS_SYSTEM_SECURITY = 0x0100_0000;
        const MAXIMUM_ALLOWED = 0x0200_0000;
        const GENERIC_ALL = 0x1000_0000;
        const GENERIC_EXECUTE = 0x2000_0000;
        const GENERIC_WRITE = 0x4000_0000;
        const GENERIC_READ = 0x8000_0000;
    }
}

/// Mapping of the four generic rights to specific port rights
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericMapping {
    pub read: u32,
    pub write: u32,
    pub execute: u32,
    pub all: u32,
}

/// Generic mapping used for ALPC ports
pub const ALPC_GENERIC_MAPPING: GenericMapping = GenericMapping {
    read: 0x0002_0001,
    write: 0x0001_0001,
    execute: 0,
    all: 0x001F_0001,
};

impl AccessRights {
    /// Replace generic bits with the specific rights they stand for
    pub fn map_generic(self, mapping: &GenericMapping) -> AccessRights {
        let mut raw = self.bits()
            & !(Self::GENERIC_READ | Self::GENERIC_WRITE | Self::GENERIC_EXECUTE | Self::GENERIC_ALL)
                .bits();
        if self.contains(Self::GENERIC_READ) {
            raw |= mapping.read;
        }
        if self.contains(Self::GENERIC_WRITE) {
            raw |= mapping.write;
        }
        if self.contains(Self::GENERIC_EXECUTE) {
            raw |= mapping.execute;
        }
        if self.contains(Self::GENERIC_ALL) {
            raw |= mapping.all;
        }
        AccessRights::from_bits_truncate(raw)
    }
}

/// Operation being authorized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortOperation {
    /// Creating a (possibly named) connection port
    Create,
    /// Connecting to a named connection port
    Connect,
}

/// Server security requirement a client imposes when connecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequiredServer {
    /// The server must run as exactly this SID
    Sid(Sid),
    /// The server must satisfy an opaque security descriptor
    Descriptor(Vec<u8>),
}

/// Access-control predicate supplied by the embedding system
pub trait AccessCheck: Send + Sync {
    /// Can `principal` perform `rights` for `operation` on the port `name`?
    fn can_perform(
        &self,
        principal: &Principal,
        operation: PortOperation,
        name: Option<&str>,
        rights: AccessRights,
    ) -> bool;

    /// Does the server principal satisfy the client's requirement?
    fn server_satisfies(&self, required: &RequiredServer, server: &Principal) -> bool {
        match required {
            RequiredServer::Sid(sid) => server.sid == *sid,
            RequiredServer::Descriptor(_) => false,
        }
    }
}

/// Permits every operation; SID requirements must still match exactly
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessCheck for AllowAll {
    fn can_perform(&self, _: &Principal, _: PortOperation, _: Option<&str>, _: AccessRights) -> bool {
        true
    }
}

/// Opens process and thread objects for the sender of a message
pub trait SenderOpener: Send + Sync {
    /// Open the sender's process with `desired_access`
    fn open_process(&self, client: ClientId, desired_access: u32) -> Result<u64>;

    /// Open the sender's thread with `desired_access`
    fn open_thread(&self, client: ClientId, desired_access: u32) -> Result<u64>;
}

/// Refuses every open request
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSenderAccess;

impl SenderOpener for NoSenderAccess {
    fn open_process(&self, _: ClientId, _: u32) -> Result<u64> {
        Err(AlpcError::AccessDenied)
    }

    fn open_thread(&self, _: ClientId, _: u32) -> Result<u64> {
        Err(AlpcError::AccessDenied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_mapping() {
        let mapped = AccessRights::GENERIC_READ.map_generic(&ALPC_GENERIC_MAPPING);
        assert_eq!(mapped, AccessRights::READ_CONTROL | AccessRights::CONNECT);

        let all = (AccessRights::GENERIC_ALL | AccessRights::SYNCHRONIZE)
            .map_generic(&ALPC_GENERIC_MAPPING);
        assert_eq!(all.bits(), 0x001F_0001);
        assert!(!all.contains(AccessRights::GENERIC_ALL));
    }

    #[test]
    fn test_default_server_requirement() {
        let server = Principal::new(Sid::local_system());
        assert!(AllowAll.server_satisfies(&RequiredServer::Sid(Sid::local_system()), &server));
        assert!(!AllowAll.server_satisfies(&RequiredServer::Sid(Sid::anonymous()), &server));
        assert!(!AllowAll.server_satisfies(&RequiredServer::Descriptor(vec![1, 0]), &server));
    }
}
