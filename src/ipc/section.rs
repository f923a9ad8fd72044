//! Port sections and section views
//!
//! A section is a page-granular block of shared memory bound to a port. A
//! view maps a section (or a prefix of it) at a base address; the base is
//! the only key a view is known by. Sending a view attribute maps the same
//! memory into the receiving port at a fresh base, so both sides read and
//! write the same bytes.

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::debug;
use parking_lot::RwLock;

use super::attributes::{ViewAttr, ViewAttrFlags};
use super::port::{within_quota, PortObject};
use crate::error::{AlpcError, Result};
use crate::transport::Port;
use crate::types::AlpcHandle;

/// Memory backing a section, shared by every view of it
pub(crate) type SectionMemory = Arc<RwLock<Vec<u8>>>;

/// Section bound to a port
pub(crate) struct Section {
    pub size: usize,
    pub memory: SectionMemory,
}

/// Mapped view of a section
pub(crate) struct View {
    pub flags: ViewAttrFlags,
    pub section: AlpcHandle,
    pub size: usize,
    pub memory: SectionMemory,
}

/// View memory travelling with a message
#[derive(Clone)]
pub(crate) struct SharedView {
    pub flags: ViewAttrFlags,
    pub size: usize,
    pub memory: SectionMemory,
}

fn reserved_flags(flags: u32) -> Result<()> {
    if flags != 0 {
        return Err(AlpcError::InvalidParameter("reserved flags must be zero"));
    }
    Ok(())
}

impl PortObject {
    /// Resolve a view attribute of an outgoing message
    pub(crate) fn share_view(&self, attr: &ViewAttr) -> Result<SharedView> {
        let resources = self.resources.lock();
        let view = resources.views.get(&attr.view_base).ok_or(AlpcError::NotFound)?;
        let size = match attr.view_size as usize {
            0 => view.size,
            size if size <= view.size => size,
            _ => return Err(AlpcError::InvalidParameter("view size exceeds the mapped view")),
        };
        if !within_quota(self.attributes.memory_bandwidth, size) {
            return Err(AlpcError::QuotaExceeded {
                requested: size,
                available: self.attributes.memory_bandwidth,
            });
        }
        Ok(SharedView {
            flags: attr.flags | view.flags,
            size,
            memory: view.memory.clone(),
        })
    }

    /// Map view memory received with a message into this port
    pub(crate) fn map_shared(&self, shared: &SharedView) -> ViewAttr {
        let base = self.shared.allocate_view_base(shared.size);
        self.resources.lock().views.insert(
            base,
            View {
                flags: shared.flags,
                section: AlpcHandle::NULL,
                size: shared.size,
                memory: shared.memory.clone(),
            },
        );
        debug!("port {:?}: mapped received view at {:#x} ({} bytes)", self.id, base, shared.size);
        ViewAttr {
            flags: shared.flags,
            section: AlpcHandle::NULL,
            view_base: base,
            view_size: shared.size as u64,
        }
    }
}

impl Port {
    /// Create a section bound to this port.
    ///
    /// With `existing` set, the new section shares that section's memory.
    /// Returns the handle and the granted size, rounded up to whole pages;
    /// view math must use the granted size.
    pub fn create_port_section(
        &self,
        flags: u32,
        existing: Option<AlpcHandle>,
        size: usize,
    ) -> Result<(AlpcHandle, usize)> {
        reserved_flags(flags)?;
        let port = &self.object;
        port.ensure_live()?;
        if size == 0 {
            return Err(AlpcError::InvalidParameter("section size must be nonzero"));
        }
        let granted = port.shared.config.page_round(size);
        let limits = &port.attributes;
        if !within_quota(limits.max_section_size, granted) {
            return Err(AlpcError::QuotaExceeded {
                requested: granted,
                available: limits.max_section_size,
            });
        }

        let mut resources = port.resources.lock();
        let total = resources.total_section_bytes + granted;
        if !within_quota(limits.max_total_section_size, total) {
            return Err(AlpcError::QuotaExceeded {
                requested: granted,
                available: limits
                    .max_total_section_size
                    .saturating_sub(resources.total_section_bytes),
            });
        }

        let memory = match existing {
            Some(handle) => {
                let backing = resources
                    .sections
                    .get(&handle)
                    .ok_or(AlpcError::InvalidHandle(handle.as_raw()))?;
                if backing.size < granted {
                    return Err(AlpcError::InvalidParameter("section larger than its backing"));
                }
                backing.memory.clone()
            }
            None => Arc::new(RwLock::new(vec![0u8; granted])),
        };

        let handle = port.shared.allocate_handle();
        resources.sections.insert(
            handle,
            Section {
                size: granted,
                memory,
            },
        );
        resources.total_section_bytes = total;
        debug!("port {:?}: section {:?} created ({} bytes)", port.id, handle, granted);
        Ok((handle, granted))
    }

    /// Delete a section; views already mapped keep their memory
    pub fn delete_port_section(&self, flags: u32, section: AlpcHandle) -> Result<()> {
        reserved_flags(flags)?;
        let port = &self.object;
        let mut resources = port.resources.lock();
        let removed = resources
            .sections
            .remove(&section)
            .ok_or(AlpcError::InvalidHandle(section.as_raw()))?;
        resources.total_section_bytes -= removed.size;
        debug!("port {:?}: section {:?} deleted", port.id, section);
        Ok(())
    }

    /// Map a view of `view.section`.
    ///
    /// A zero `view_size` maps the whole section. On success the chosen base
    /// address and the mapped size are written back into `view`.
    pub fn create_section_view(&self, flags: u32, view: &mut ViewAttr) -> Result<()> {
        reserved_flags(flags)?;
        let port = &self.object;
        port.ensure_live()?;
        let mut resources = port.resources.lock();
        let section = resources
            .sections
            .get(&view.section)
            .ok_or(AlpcError::InvalidHandle(view.section.as_raw()))?;

        let size = match view.view_size as usize {
            0 => section.size,
            size if size <= section.size => size,
            _ => return Err(AlpcError::InvalidParameter("view larger than its section")),
        };
        if !within_quota(port.attributes.max_view_size, size) {
            return Err(AlpcError::QuotaExceeded {
                requested: size,
                available: port.attributes.max_view_size,
            });
        }

        let mapped = View {
            flags: view.flags,
            section: view.section,
            size,
            memory: section.memory.clone(),
        };
        let base = port.shared.allocate_view_base(size);
        resources.views.insert(base, mapped);
        view.view_base = base;
        view.view_size = size as u64;
        debug!("port {:?}: view at {:#x} ({} bytes)", port.id, base, size);
        Ok(())
    }

    /// Unmap the view created at exactly `view_base`
    pub fn delete_section_view(&self, flags: u32, view_base: u64) -> Result<()> {
        reserved_flags(flags)?;
        let port = &self.object;
        port.resources
            .lock()
            .views
            .remove(&view_base)
            .ok_or(AlpcError::NotFound)?;
        debug!("port {:?}: view at {:#x} deleted", port.id, view_base);
        Ok(())
    }

    /// Copy bytes out of a mapped view
    pub fn view_read(&self, view_base: u64, offset: usize, out: &mut [u8]) -> Result<()> {
        let memory = self.view_memory(view_base, offset, out.len())?;
        let bytes = memory.read();
        out.copy_from_slice(&bytes[offset..offset + out.len()]);
        Ok(())
    }

    /// Copy bytes into a mapped view
    pub fn view_write(&self, view_base: u64, offset: usize, data: &[u8]) -> Result<()> {
        let memory = self.view_memory(view_base, offset, data.len())?;
        let mut bytes = memory.write();
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn view_memory(&self, view_base: u64, offset: usize, len: usize) -> Result<SectionMemory> {
        let resources = self.object.resources.lock();
        let view = resources.views.get(&view_base).ok_or(AlpcError::NotFound)?;
        let end = offset
            .checked_add(len)
            .ok_or(AlpcError::InvalidParameter("view range overflows"))?;
        if end > view.size {
            return Err(AlpcError::InvalidParameter("range outside the view"));
        }
        Ok(view.memory.clone())
    }
}
