//! Typed symbol table for the Integration Hub entry points.
//!
//! Every entry point sits in a [`Slot`]; a missing symbol is an explicit
//! `Unavailable` that fails with `SymbolResolutionFailure` instead of being
//! called. Resolution is all-or-nothing.

use libloading::Library;
use std::ffi::{c_int, c_void};
use std::ptr::NonNull;

use crate::error::HubError;

pub const CREATE_COMMUNICATION: &str = "createCommunication";
pub const DELETE_COMMUNICATION: &str = "deleteCommunication";
pub const RECONNECT: &str = "reconnect";
pub const GET_ACTIVE_DEVICE_INDEX: &str = "getActiveDeviceIndex";
pub const SEND_BASKET: &str = "sendBasket";
pub const SEND_PAYMENT: &str = "sendPayment";
pub const GET_FISCAL_INFO: &str = "getFiscalInfo";
pub const SET_SERIAL_IN_CALLBACK: &str = "setSerialInCallback";
pub const SET_DEVICE_STATE_CALLBACK: &str = "setDeviceStateCallback";

pub const REQUIRED_SYMBOLS: [&str; 9] = [
    CREATE_COMMUNICATION,
    DELETE_COMMUNICATION,
    RECONNECT,
    GET_ACTIVE_DEVICE_INDEX,
    SEND_BASKET,
    SEND_PAYMENT,
    GET_FISCAL_INFO,
    SET_SERIAL_IN_CALLBACK,
    SET_DEVICE_STATE_CALLBACK,
];

// Wide strings are NUL-terminated UTF-16 (`wchar_t` on Windows). Text results
// and callback arguments are BSTRs.
pub type CreateCommunicationFn = unsafe extern "C" fn(*const u16) -> *mut c_void;
pub type DeleteCommunicationFn = unsafe extern "C" fn(*mut c_void);
pub type ReconnectFn = unsafe extern "C" fn(*mut c_void);
pub type GetActiveDeviceIndexFn = unsafe extern "C" fn(*mut c_void) -> c_int;
pub type SendTextFn = unsafe extern "C" fn(*mut c_void, *const u16) -> c_int;
pub type GetFiscalInfoFn = unsafe extern "C" fn(*mut c_void) -> *mut u16;
pub type SerialInCallback = extern "system" fn(c_int, *mut u16);
pub type DeviceStateCallback = extern "system" fn(bool, *mut u16);
pub type SetSerialInCallbackFn = unsafe extern "C" fn(*mut c_void, SerialInCallback);
pub type SetDeviceStateCallbackFn = unsafe extern "C" fn(*mut c_void, DeviceStateCallback);

#[derive(Clone, Copy)]
pub enum Slot<F> {
    Bound(F),
    Unavailable,
}

impl<F> Default for Slot<F> {
    fn default() -> Self {
        Slot::Unavailable
    }
}

impl<F: Copy> Slot<F> {
    pub fn get(&self, symbol: &str) -> Result<F, HubError> {
        match self {
            Slot::Bound(f) => Ok(*f),
            Slot::Unavailable => Err(HubError::SymbolResolutionFailure {
                symbol: symbol.to_string(),
            }),
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self, Slot::Bound(_))
    }
}

#[derive(Clone, Copy, Default)]
pub struct SymbolTable {
    pub create_communication: Slot<CreateCommunicationFn>,
    pub delete_communication: Slot<DeleteCommunicationFn>,
    pub reconnect: Slot<ReconnectFn>,
    pub get_active_device_index: Slot<GetActiveDeviceIndexFn>,
    pub send_basket: Slot<SendTextFn>,
    pub send_payment: Slot<SendTextFn>,
    pub get_fiscal_info: Slot<GetFiscalInfoFn>,
    pub set_serial_in_callback: Slot<SetSerialInCallbackFn>,
    pub set_device_state_callback: Slot<SetDeviceStateCallbackFn>,
}

impl SymbolTable {
    /// A table with every slot `Unavailable`.
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Resolve every required symbol through `lookup`.
    ///
    /// # Safety
    /// Each address returned by `lookup` must be a function with the
    /// signature declared for that name in this module.
    pub unsafe fn resolve<L>(mut lookup: L) -> Result<Self, HubError>
    where
        L: FnMut(&str) -> Option<NonNull<c_void>>,
    {
        let mut find = |name: &str| {
            lookup(name).ok_or_else(|| HubError::SymbolResolutionFailure {
                symbol: name.to_string(),
            })
        };

        let create = find(CREATE_COMMUNICATION)?;
        let delete = find(DELETE_COMMUNICATION)?;
        let reconnect = find(RECONNECT)?;
        let active_index = find(GET_ACTIVE_DEVICE_INDEX)?;
        let basket = find(SEND_BASKET)?;
        let payment = find(SEND_PAYMENT)?;
        let fiscal = find(GET_FISCAL_INFO)?;
        let serial_cb = find(SET_SERIAL_IN_CALLBACK)?;
        let device_cb = find(SET_DEVICE_STATE_CALLBACK)?;

        Ok(Self {
            create_communication: Slot::Bound(cast(create)),
            delete_communication: Slot::Bound(cast(delete)),
            reconnect: Slot::Bound(cast(reconnect)),
            get_active_device_index: Slot::Bound(cast(active_index)),
            send_basket: Slot::Bound(cast(basket)),
            send_payment: Slot::Bound(cast(payment)),
            get_fiscal_info: Slot::Bound(cast(fiscal)),
            set_serial_in_callback: Slot::Bound(cast(serial_cb)),
            set_device_state_callback: Slot::Bound(cast(device_cb)),
        })
    }

    /// Resolve from the loaded primary module.
    ///
    /// # Safety
    /// `library` must export the Integration Hub API with the signatures
    /// declared here, and must outlive the returned table.
    pub unsafe fn from_library(library: &Library) -> Result<Self, HubError> {
        Self::resolve(|name| {
            library
                .get::<*mut c_void>(name.as_bytes())
                .ok()
                .and_then(|sym| NonNull::new(*sym))
        })
    }

    pub fn is_complete(&self) -> bool {
        self.create_communication.is_bound()
            && self.delete_communication.is_bound()
            && self.reconnect.is_bound()
            && self.get_active_device_index.is_bound()
            && self.send_basket.is_bound()
            && self.send_payment.is_bound()
            && self.get_fiscal_info.is_bound()
            && self.set_serial_in_callback.is_bound()
            && self.set_device_state_callback.is_bound()
    }
}

unsafe fn cast<F: Copy>(addr: NonNull<c_void>) -> F {
    debug_assert_eq!(
        std::mem::size_of::<F>(),
        std::mem::size_of::<*mut c_void>()
    );
    std::mem::transmute_copy(&addr.as_ptr())
}
