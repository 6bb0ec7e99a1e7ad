//! Native Integration Hub layer.
//!
//! The connection manager only talks to the native world through
//! [`NativeApi`]; how that API comes into existence (dynamic loading, a
//! statically linked build, a test double) is a [`NativeBinder`].

pub mod library;
pub mod loader;
pub mod symbols;

#[cfg(test)]
pub(crate) mod mock;

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::Level;

use crate::error::HubError;

pub use crate::dispatcher::EventSink;
pub use library::{IntegrationHubBinder, IntegrationHubLibrary};
pub use loader::{LoadedModules, ModuleSet};
pub use symbols::{Slot, SymbolTable};

/// Opaque pointer to one live native communication object.
///
/// Only valid between `createCommunication` and `deleteCommunication`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(NonNull<c_void>);

// The handle is an opaque token; the native module owns what it points to
// and every use goes through the connection manager.
unsafe impl Send for SessionHandle {}
unsafe impl Sync for SessionHandle {}

impl SessionHandle {
    /// `None` for a null pointer.
    pub fn from_raw(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionHandle({:p})", self.0)
    }
}

/// The nine entry points of the Integration Hub module.
///
/// The connection manager serializes calls on a live handle, and never
/// destroys a handle while another call is using it.
pub trait NativeApi: Send + Sync {
    /// `Ok(None)` when the module returned a null handle.
    fn create_communication(&self, company: &str) -> Result<Option<SessionHandle>, HubError>;

    fn delete_communication(&self, handle: SessionHandle) -> Result<(), HubError>;

    fn reconnect(&self, handle: SessionHandle) -> Result<(), HubError>;

    fn get_active_device_index(&self, handle: SessionHandle) -> Result<i32, HubError>;

    fn send_basket(&self, handle: SessionHandle, json: &str) -> Result<i32, HubError>;

    fn send_payment(&self, handle: SessionHandle, json: &str) -> Result<i32, HubError>;

    fn get_fiscal_info(&self, handle: SessionHandle) -> Result<String, HubError>;

    /// Route serial-in callbacks for `handle` into `sink`.
    fn set_serial_in_callback(&self, handle: SessionHandle, sink: EventSink)
        -> Result<(), HubError>;

    /// Route device-state callbacks for `handle` into `sink`.
    fn set_device_state_callback(
        &self,
        handle: SessionHandle,
        sink: EventSink,
    ) -> Result<(), HubError>;
}

/// Produces a [`NativeApi`] on first use.
pub trait NativeBinder: Send + Sync {
    /// Whether this platform can host the native module at all.
    fn supported(&self) -> bool {
        true
    }

    /// Load and resolve. Human-readable progress lines go to `log`, tagged
    /// with the level they should be reported at.
    fn bind(&self, log: &mut dyn FnMut(Level, String)) -> Result<Arc<dyn NativeApi>, HubError>;
}

/// Binder for an API that is already available.
pub struct PreBound(Arc<dyn NativeApi>);

impl PreBound {
    pub fn new(api: Arc<dyn NativeApi>) -> Self {
        Self(api)
    }
}

impl NativeBinder for PreBound {
    fn bind(&self, _log: &mut dyn FnMut(Level, String)) -> Result<Arc<dyn NativeApi>, HubError> {
        Ok(self.0.clone())
    }
}
