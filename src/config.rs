//! Transport configuration
//!
//! Global limits and defaults. Everything here can be queried before any
//! port exists so callers can size buffers up front.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::ipc::attributes::{AttributeFlags, AttributeLayout};
use crate::ipc::port::PortAttributes;

/// Hard cap on the total length (header included) of any message.
///
/// The total-length half of the length union is 16 bits wide; the top of
/// that range is kept back for the transport's own bookkeeping.
pub const MAX_ALLOWED_MESSAGE_LENGTH: usize = 0xFFEF;

/// Page granularity for sections and views
pub const PAGE_SIZE: usize = 4096;

/// Maximum allowed message length (header included)
pub fn max_allowed_message_length() -> usize {
    MAX_ALLOWED_MESSAGE_LENGTH
}

/// Size of an attribute buffer holding the given kinds
pub fn attribute_header_size(kinds: AttributeFlags) -> usize {
    AttributeLayout::for_kinds(kinds).total_size()
}

/// Transport-wide configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TransportConfig {
    /// Global cap on `max_message_length` of any port
    pub max_message_length: usize,
    /// Attributes used when a caller supplies none
    pub default_port_attributes: PortAttributes,
    /// Section sizes are rounded up to this granularity
    pub page_size: usize,
    /// First synthetic base address handed out for views
    pub view_base_start: u64,
    /// Received messages a port keeps for replies and queries
    pub retained_message_limit: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_length: MAX_ALLOWED_MESSAGE_LENGTH,
            default_port_attributes: PortAttributes::default(),
            page_size: PAGE_SIZE,
            view_base_start: 0x0000_7FF0_0000_0000,
            retained_message_limit: 256,
        }
    }
}

impl TransportConfig {
    /// Override the global message length cap (clamped to the hard cap)
    pub fn with_max_message_length(mut self, length: usize) -> Self {
        self.max_message_length = length.min(MAX_ALLOWED_MESSAGE_LENGTH);
        self
    }

    /// Override the default port attributes
    pub fn with_default_port_attributes(mut self, attributes: PortAttributes) -> Self {
        self.default_port_attributes = attributes;
        self
    }

    /// Override how many received messages a port retains
    pub fn with_retained_message_limit(mut self, limit: usize) -> Self {
        self.retained_message_limit = limit.max(1);
        self
    }

    /// Round a size up to page granularity
    pub fn page_round(&self, size: usize) -> usize {
        let page = self.page_size.max(1);
        size.div_ceil(page).saturating_mul(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.max_message_length, 0xFFEF);
        assert_eq!(config.default_port_attributes.max_message_length, 0x7FFF);
        assert_eq!(config.page_round(1), 4096);
        assert_eq!(config.page_round(4096), 4096);
        assert_eq!(config.page_round(0), 0);
    }

    #[test]
    fn test_message_length_clamped() {
        let config = TransportConfig::default().with_max_message_length(1 << 20);
        assert_eq!(config.max_message_length, MAX_ALLOWED_MESSAGE_LENGTH);
    }

    #[test]
    fn test_header_size_query() {
        assert_eq!(attribute_header_size(AttributeFlags::empty()), 8);
        assert_eq!(
            attribute_header_size(AttributeFlags::CONTEXT | AttributeFlags::DIRECT),
            8 + 32 + 8
        );
    }
}
