//! Integration Hub binding over a resolved [`SymbolTable`].
//!
//! Strings cross the boundary as NUL-terminated UTF-16. Text handed to us
//! by the module (fiscal info, callback arguments) is a BSTR: it is copied
//! into an owned `String` and released with `SysFreeString` straight away.
//!
//! The callback ABI has no user-data pointer, so routing uses one
//! process-wide slot: the sink of the manager that registered callbacks
//! last. There is at most one live session per process. Callback strings are
//! released even when no sink is routed.

use libloading::Library;
use std::ffi::c_int;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, info, warn, Level};

use super::loader::{self, LoadedModules, ModuleSet};
use super::symbols::*;
use super::{EventSink, NativeApi, NativeBinder, SessionHandle};
use crate::config::NativeConfig;
use crate::error::HubError;

/// Module providing the BSTR allocator.
pub const OLEAUT_MODULE: &str = "oleaut32.dll";
pub const SYS_FREE_STRING: &str = "SysFreeString";

pub type SysFreeStringFn = unsafe extern "system" fn(*mut u16);

// ---------------------------------------------------------------------------
// Wide strings
// ---------------------------------------------------------------------------

pub(crate) fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Copy a NUL-terminated UTF-16 string. Null reads as empty.
///
/// # Safety
/// `ptr` must be null or point to a readable, NUL-terminated UTF-16 buffer.
pub(crate) unsafe fn from_wide(ptr: *const u16) -> String {
    if ptr.is_null() {
        return String::new();
    }
    let mut len = 0;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len))
}

/// Copy a native string, then release the native buffer.
unsafe fn take_native_string(ptr: *mut u16, free: SysFreeStringFn) -> String {
    let text = from_wide(ptr);
    if !ptr.is_null() {
        free(ptr);
    }
    text
}

// ---------------------------------------------------------------------------
// Callback routing
// ---------------------------------------------------------------------------

static CALLBACK_ROUTE: Mutex<Option<EventSink>> = Mutex::new(None);

// Set once by the first callback registration; the allocator is process-wide.
static CALLBACK_FREE: OnceLock<SysFreeStringFn> = OnceLock::new();

fn install_route(sink: EventSink, free_string: SysFreeStringFn) {
    let _ = CALLBACK_FREE.set(free_string);
    let mut route = CALLBACK_ROUTE.lock().unwrap_or_else(|e| e.into_inner());
    *route = Some(sink);
}

fn current_route() -> Option<EventSink> {
    CALLBACK_ROUTE
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
}

/// Copy a callback string and release it, whether or not anyone listens.
///
/// # Safety
/// `ptr` must be null or a BSTR the module handed over to us.
unsafe fn take_callback_string(ptr: *mut u16) -> String {
    let text = catch_unwind(AssertUnwindSafe(|| from_wide(ptr))).unwrap_or_default();
    if !ptr.is_null() {
        if let Some(free) = CALLBACK_FREE.get() {
            free(ptr);
        }
    }
    text
}

extern "system" fn serial_in_trampoline(type_code: c_int, value: *mut u16) {
    // SAFETY: the module passes a valid BSTR that we own once called.
    let text = unsafe { take_callback_string(value) };
    let delivered = catch_unwind(AssertUnwindSafe(|| {
        current_route().is_some_and(|sink| sink.serial_in(type_code, text))
    }));
    if !matches!(delivered, Ok(true)) {
        debug!(type_code, "Serial-in callback dropped");
    }
}

extern "system" fn device_state_trampoline(connected: bool, device_id: *mut u16) {
    // SAFETY: as above.
    let id = unsafe { take_callback_string(device_id) };
    let delivered = catch_unwind(AssertUnwindSafe(|| {
        current_route().is_some_and(|sink| sink.device_state(connected, id))
    }));
    if !matches!(delivered, Ok(true)) {
        debug!(connected, "Device-state callback dropped");
    }
}

// ---------------------------------------------------------------------------
// Library
// ---------------------------------------------------------------------------

/// [`NativeApi`] backed by the Integration Hub's exported functions.
pub struct IntegrationHubLibrary {
    symbols: SymbolTable,
    free_string: SysFreeStringFn,
    // Keep the code the function pointers point into mapped.
    _allocator: Option<Library>,
    _modules: Option<LoadedModules<Library>>,
}

impl IntegrationHubLibrary {
    /// Bind to an already-resolved table, e.g. a statically linked build.
    ///
    /// # Safety
    /// Every bound slot and `free_string` must stay callable for the
    /// lifetime of the returned value.
    pub unsafe fn from_parts(symbols: SymbolTable, free_string: SysFreeStringFn) -> Self {
        Self {
            symbols,
            free_string,
            _allocator: None,
            _modules: None,
        }
    }

    /// Load the module set, resolve the hub API and the BSTR allocator.
    pub fn load(
        config: &NativeConfig,
        log: &mut dyn FnMut(Level, String),
    ) -> Result<Self, HubError> {
        let set = ModuleSet::from_config(config)?;
        let modules = loader::load(&set, &config.resolved_search_paths(), log)?;

        // SAFETY: the primary module is the Integration Hub DLL, which
        // exports the API declared in `symbols`; `modules` is stored next to
        // the table and outlives it.
        let symbols = match unsafe { SymbolTable::from_library(modules.primary()) } {
            Ok(table) => {
                log(Level::INFO, "Successfully initialized all DLL functions".to_string());
                table
            }
            Err(e) => {
                log(
                    Level::WARN,
                    format!("Failed to resolve one or more functions from DLL: {e}"),
                );
                return Err(e);
            }
        };

        let (allocator, free_string) = load_string_allocator()?;
        info!(modules = modules.len(), primary = %set.primary(), "Integration Hub bound");

        Ok(Self {
            symbols,
            free_string,
            _allocator: Some(allocator),
            _modules: Some(modules),
        })
    }
}

fn load_string_allocator() -> Result<(Library, SysFreeStringFn), HubError> {
    // SAFETY: oleaut32 is a system library with no special initialisation.
    let library = unsafe { Library::new(OLEAUT_MODULE) }.map_err(|e| {
        warn!(error = %e, "Failed to load {OLEAUT_MODULE}");
        HubError::LibraryLoadFailure {
            module: OLEAUT_MODULE.into(),
        }
    })?;
    let free_string = {
        // SAFETY: SysFreeString has exactly this signature.
        let sym = unsafe { library.get::<SysFreeStringFn>(SYS_FREE_STRING.as_bytes()) }
            .map_err(|_| HubError::SymbolResolutionFailure {
                symbol: SYS_FREE_STRING.into(),
            })?;
        *sym
    };
    Ok((library, free_string))
}

impl NativeApi for IntegrationHubLibrary {
    fn create_communication(&self, company: &str) -> Result<Option<SessionHandle>, HubError> {
        let create = self.symbols.create_communication.get(CREATE_COMMUNICATION)?;
        let company = to_wide(company);
        let raw = unsafe { create(company.as_ptr()) };
        Ok(SessionHandle::from_raw(raw))
    }

    fn delete_communication(&self, handle: SessionHandle) -> Result<(), HubError> {
        let delete = self.symbols.delete_communication.get(DELETE_COMMUNICATION)?;
        unsafe { delete(handle.as_ptr()) };
        Ok(())
    }

    fn reconnect(&self, handle: SessionHandle) -> Result<(), HubError> {
        let reconnect = self.symbols.reconnect.get(RECONNECT)?;
        unsafe { reconnect(handle.as_ptr()) };
        Ok(())
    }

    fn get_active_device_index(&self, handle: SessionHandle) -> Result<i32, HubError> {
        let index = self
            .symbols
            .get_active_device_index
            .get(GET_ACTIVE_DEVICE_INDEX)?;
        Ok(unsafe { index(handle.as_ptr()) })
    }

    fn send_basket(&self, handle: SessionHandle, json: &str) -> Result<i32, HubError> {
        let send = self.symbols.send_basket.get(SEND_BASKET)?;
        let json = to_wide(json);
        Ok(unsafe { send(handle.as_ptr(), json.as_ptr()) })
    }

    fn send_payment(&self, handle: SessionHandle, json: &str) -> Result<i32, HubError> {
        let send = self.symbols.send_payment.get(SEND_PAYMENT)?;
        let json = to_wide(json);
        Ok(unsafe { send(handle.as_ptr(), json.as_ptr()) })
    }

    fn get_fiscal_info(&self, handle: SessionHandle) -> Result<String, HubError> {
        let fiscal = self.symbols.get_fiscal_info.get(GET_FISCAL_INFO)?;
        let bstr = unsafe { fiscal(handle.as_ptr()) };
        if bstr.is_null() {
            return Err(HubError::null_result(GET_FISCAL_INFO));
        }
        Ok(unsafe { take_native_string(bstr, self.free_string) })
    }

    fn set_serial_in_callback(
        &self,
        handle: SessionHandle,
        sink: EventSink,
    ) -> Result<(), HubError> {
        let set = self.symbols.set_serial_in_callback.get(SET_SERIAL_IN_CALLBACK)?;
        install_route(sink, self.free_string);
        unsafe { set(handle.as_ptr(), serial_in_trampoline) };
        Ok(())
    }

    fn set_device_state_callback(
        &self,
        handle: SessionHandle,
        sink: EventSink,
    ) -> Result<(), HubError> {
        let set = self
            .symbols
            .set_device_state_callback
            .get(SET_DEVICE_STATE_CALLBACK)?;
        install_route(sink, self.free_string);
        unsafe { set(handle.as_ptr(), device_state_trampoline) };
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Binder
// ---------------------------------------------------------------------------

/// Binds the Integration Hub DLL from the configured module set.
pub struct IntegrationHubBinder {
    config: NativeConfig,
}

impl IntegrationHubBinder {
    pub fn new(config: NativeConfig) -> Self {
        Self { config }
    }
}

impl NativeBinder for IntegrationHubBinder {
    fn supported(&self) -> bool {
        cfg!(windows)
    }

    fn bind(&self, log: &mut dyn FnMut(Level, String)) -> Result<Arc<dyn NativeApi>, HubError> {
        if !self.supported() {
            log(
                Level::WARN,
                "IntegrationHub library is only supported on Windows. Functionality will be limited."
                    .to_string(),
            );
            return Err(HubError::UnsupportedPlatform);
        }
        let library = IntegrationHubLibrary::load(&self.config, log)?;
        Ok(Arc::new(library))
    }
}
