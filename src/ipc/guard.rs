//! Scoped port resources
//!
//! Sections, views, security contexts and reserves are created and deleted
//! in explicit pairs. [`Scoped`] owns one such resource and deletes it when
//! dropped, so a setup that fails halfway releases what it already created.

use core::fmt;
use log::warn;

use super::attributes::ViewAttr;
use crate::error::Result;
use crate::identity::SecurityQos;
use crate::transport::Port;
use crate::types::AlpcHandle;

/// A resource kind owned by a port
pub trait PortResource {
    type Id: Copy + fmt::Debug;
    const NAME: &'static str;

    /// Delete the resource from `port`
    fn release(port: &Port, id: Self::Id) -> Result<()>;
}

/// Port section, keyed by its handle
pub struct SectionResource;

impl PortResource for SectionResource {
    type Id = AlpcHandle;
    const NAME: &'static str = "section";

    fn release(port: &Port, id: AlpcHandle) -> Result<()> {
        port.delete_port_section(0, id)
    }
}

/// Section view, keyed by its base
pub struct ViewResource;

impl PortResource for ViewResource {
    type Id = u64;
    const NAME: &'static str = "view";

    fn release(port: &Port, id: u64) -> Result<()> {
        port.delete_section_view(0, id)
    }
}

/// Security context
pub struct ContextResource;

impl PortResource for ContextResource {
    type Id = AlpcHandle;
    const NAME: &'static str = "security context";

    fn release(port: &Port, id: AlpcHandle) -> Result<()> {
        port.delete_security_context(0, id)
    }
}

/// Resource reserve
pub struct ReserveResource;

impl PortResource for ReserveResource {
    type Id = AlpcHandle;
    const NAME: &'static str = "reserve";

    fn release(port: &Port, id: AlpcHandle) -> Result<()> {
        port.delete_resource_reserve(0, id)
    }
}

/// Owning wrapper that deletes its resource on drop
#[must_use = "dropping the guard deletes the resource"]
pub struct Scoped<'p, R: PortResource> {
    port: &'p Port,
    id: Option<R::Id>,
}

impl<'p, R: PortResource> Scoped<'p, R> {
    /// Take ownership of an existing resource
    pub fn new(port: &'p Port, id: R::Id) -> Self {
        Self { port, id: Some(id) }
    }

    /// Identifier of the owned resource
    pub fn get(&self) -> Option<R::Id> {
        self.id
    }

    /// Keep the resource alive past the guard
    pub fn into_inner(mut self) -> Option<R::Id> {
        self.id.take()
    }

    /// Delete now and report the outcome
    pub fn delete(mut self) -> Result<()> {
        match self.id.take() {
            Some(id) => R::release(self.port, id),
            None => Ok(()),
        }
    }
}

impl<R: PortResource> fmt::Debug for Scoped<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scoped")
            .field("kind", &R::NAME)
            .field("id", &self.id)
            .finish()
    }
}

impl<R: PortResource> Drop for Scoped<'_, R> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            if let Err(err) = R::release(self.port, id) {
                warn!("failed to release {} {:?}: {}", R::NAME, id, err);
            }
        }
    }
}

impl Port {
    /// [`Port::create_port_section`] with scoped deletion
    pub fn scoped_section(&self, size: usize) -> Result<(Scoped<'_, SectionResource>, usize)> {
        let (handle, granted) = self.create_port_section(0, None, size)?;
        Ok((Scoped::new(self, handle), granted))
    }

    /// [`Port::create_section_view`] with scoped deletion
    pub fn scoped_view(&self, view: &mut ViewAttr) -> Result<Scoped<'_, ViewResource>> {
        self.create_section_view(0, view)?;
        Ok(Scoped::new(self, view.view_base))
    }

    /// [`Port::create_security_context`] with scoped deletion
    pub fn scoped_security_context(&self, qos: Option<SecurityQos>) -> Result<Scoped<'_, ContextResource>> {
        let handle = self.create_security_context(0, qos)?;
        Ok(Scoped::new(self, handle))
    }

    /// [`Port::create_resource_reserve`] with scoped deletion
    pub fn scoped_reserve(&self, message_size: usize) -> Result<(Scoped<'_, ReserveResource>, usize)> {
        let (handle, granted) = self.create_resource_reserve(0, message_size)?;
        Ok((Scoped::new(self, handle), granted))
    }
}
