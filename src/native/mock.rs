//! Recording test double for [`NativeApi`].

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::Level;

use super::{EventSink, NativeApi, NativeBinder, SessionHandle};
use crate::error::HubError;
use crate::events::HubEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Create(String),
    Delete(usize),
    Reconnect(usize),
    ActiveDeviceIndex,
    SendBasket(String),
    SendPayment(String),
    FiscalInfo,
    SetSerialIn,
    SetDeviceState,
}

#[derive(Debug, Clone)]
pub(crate) enum CreateBehavior {
    Handle,
    Null,
    Fail(HubError),
    Panic,
}

pub(crate) struct MockNative {
    calls: Mutex<Vec<Call>>,
    create: Mutex<CreateBehavior>,
    create_gate: Mutex<Option<std_mpsc::Receiver<()>>>,
    fail_registration: AtomicBool,
    status: AtomicI32,
    device_index: AtomicI32,
    fiscal: Mutex<String>,
    payment_delay: Mutex<Option<Duration>>,
    panic_on_payment: AtomicBool,
    next_handle: AtomicUsize,
    sink: Mutex<Option<EventSink>>,
    report_on_register: Mutex<Option<(bool, String)>>,
}

impl Default for MockNative {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            create: Mutex::new(CreateBehavior::Handle),
            create_gate: Mutex::new(None),
            fail_registration: AtomicBool::new(false),
            status: AtomicI32::new(0),
            device_index: AtomicI32::new(1),
            fiscal: Mutex::new(String::new()),
            payment_delay: Mutex::new(None),
            panic_on_payment: AtomicBool::new(false),
            next_handle: AtomicUsize::new(0x1000),
            sink: Mutex::new(None),
            report_on_register: Mutex::new(None),
        }
    }
}

impl MockNative {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_create(&self, behavior: CreateBehavior) {
        *self.create.lock().unwrap() = behavior;
    }

    /// Block the next `create_communication` until the returned sender fires
    /// (or is dropped).
    pub(crate) fn hold_create(&self) -> std_mpsc::Sender<()> {
        let (tx, rx) = std_mpsc::channel();
        *self.create_gate.lock().unwrap() = Some(rx);
        tx
    }

    pub(crate) fn fail_registration(&self) {
        self.fail_registration.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_status(&self, status: i32) {
        self.status.store(status, Ordering::SeqCst);
    }

    pub(crate) fn set_device_index(&self, index: i32) {
        self.device_index.store(index, Ordering::SeqCst);
    }

    pub(crate) fn set_fiscal(&self, text: &str) {
        *self.fiscal.lock().unwrap() = text.to_string();
    }

    pub(crate) fn delay_payment(&self, delay: Duration) {
        *self.payment_delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn panic_on_payment(&self) {
        self.panic_on_payment.store(true, Ordering::SeqCst);
    }

    /// Report a device state from inside `set_device_state_callback`, before
    /// the registration returns.
    pub(crate) fn report_on_register(&self, connected: bool, device_id: &str) {
        *self.report_on_register.lock().unwrap() = Some((connected, device_id.to_string()));
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub(crate) fn creates(&self) -> usize {
        self.count(|c| matches!(c, Call::Create(_)))
    }

    pub(crate) fn deletes(&self) -> usize {
        self.count(|c| matches!(c, Call::Delete(_)))
    }

    /// Fire a serial-in callback from a thread the manager does not own.
    pub(crate) fn fire_serial_in(&self, type_code: i32, value: &str) -> bool {
        let sink = self.registered_sink();
        let value = value.to_string();
        std::thread::spawn(move || sink.serial_in(type_code, value))
            .join()
            .unwrap()
    }

    /// Fire a device-state callback from a thread the manager does not own.
    pub(crate) fn fire_device_state(&self, connected: bool, device_id: &str) -> bool {
        let sink = self.registered_sink();
        let device_id = device_id.to_string();
        std::thread::spawn(move || sink.device_state(connected, device_id))
            .join()
            .unwrap()
    }

    fn registered_sink(&self) -> EventSink {
        self.sink
            .lock()
            .unwrap()
            .clone()
            .expect("no callback registered")
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl NativeApi for MockNative {
    fn create_communication(&self, company: &str) -> Result<Option<SessionHandle>, HubError> {
        self.record(Call::Create(company.to_string()));
        let gate = self.create_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        let behavior = self.create.lock().unwrap().clone();
        match behavior {
            CreateBehavior::Handle => {
                let raw = self.next_handle.fetch_add(0x10, Ordering::SeqCst);
                Ok(SessionHandle::from_raw(raw as *mut c_void))
            }
            CreateBehavior::Null => Ok(None),
            CreateBehavior::Fail(e) => Err(e),
            CreateBehavior::Panic => panic!("createCommunication blew up"),
        }
    }

    fn delete_communication(&self, handle: SessionHandle) -> Result<(), HubError> {
        self.record(Call::Delete(handle.as_ptr() as usize));
        Ok(())
    }

    fn reconnect(&self, handle: SessionHandle) -> Result<(), HubError> {
        self.record(Call::Reconnect(handle.as_ptr() as usize));
        Ok(())
    }

    fn get_active_device_index(&self, _handle: SessionHandle) -> Result<i32, HubError> {
        self.record(Call::ActiveDeviceIndex);
        Ok(self.device_index.load(Ordering::SeqCst))
    }

    fn send_basket(&self, _handle: SessionHandle, json: &str) -> Result<i32, HubError> {
        self.record(Call::SendBasket(json.to_string()));
        Ok(self.status.load(Ordering::SeqCst))
    }

    fn send_payment(&self, _handle: SessionHandle, json: &str) -> Result<i32, HubError> {
        self.record(Call::SendPayment(json.to_string()));
        if self.panic_on_payment.load(Ordering::SeqCst) {
            panic!("sendPayment blew up");
        }
        let delay = *self.payment_delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        Ok(self.status.load(Ordering::SeqCst))
    }

    fn get_fiscal_info(&self, _handle: SessionHandle) -> Result<String, HubError> {
        self.record(Call::FiscalInfo);
        Ok(self.fiscal.lock().unwrap().clone())
    }

    fn set_serial_in_callback(
        &self,
        _handle: SessionHandle,
        sink: EventSink,
    ) -> Result<(), HubError> {
        self.record(Call::SetSerialIn);
        if self.fail_registration.load(Ordering::SeqCst) {
            return Err(HubError::NativeCallFailure {
                call: "setSerialInCallback",
                code: 5,
            });
        }
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn set_device_state_callback(
        &self,
        _handle: SessionHandle,
        sink: EventSink,
    ) -> Result<(), HubError> {
        self.record(Call::SetDeviceState);
        *self.sink.lock().unwrap() = Some(sink.clone());
        let report = self.report_on_register.lock().unwrap().clone();
        if let Some((connected, device_id)) = report {
            sink.device_state(connected, device_id);
        }
        Ok(())
    }
}

/// Binder with a fixed outcome that counts how often it was asked.
pub(crate) struct MockBinder {
    outcome: Result<Arc<MockNative>, HubError>,
    supported: bool,
    binds: Arc<AtomicUsize>,
}

impl MockBinder {
    pub(crate) fn ok(api: Arc<MockNative>) -> Self {
        Self {
            outcome: Ok(api),
            supported: true,
            binds: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn failing(error: HubError) -> Self {
        Self {
            outcome: Err(error),
            supported: true,
            binds: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn unsupported(api: Arc<MockNative>) -> Self {
        Self {
            outcome: Ok(api),
            supported: false,
            binds: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn bind_counter(&self) -> Arc<AtomicUsize> {
        self.binds.clone()
    }
}

impl NativeBinder for MockBinder {
    fn supported(&self) -> bool {
        self.supported
    }

    fn bind(&self, log: &mut dyn FnMut(Level, String)) -> Result<Arc<dyn NativeApi>, HubError> {
        self.binds.fetch_add(1, Ordering::SeqCst);
        if !self.supported {
            return Err(HubError::UnsupportedPlatform);
        }
        match &self.outcome {
            Ok(api) => {
                log(Level::INFO, "Successfully initialized all DLL functions".to_string());
                Ok(api.clone())
            }
            Err(e) => Err(e.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Async helpers
// ---------------------------------------------------------------------------

const WAIT: Duration = Duration::from_secs(5);

/// Next event matching `pred`, skipping the rest. Panics after five seconds.
pub(crate) async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<HubEvent>,
    pred: impl Fn(&HubEvent) -> bool,
) -> HubEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Every event up to and including the first one matching `pred`.
pub(crate) async fn collect_until(
    rx: &mut mpsc::UnboundedReceiver<HubEvent>,
    pred: impl Fn(&HubEvent) -> bool,
) -> Vec<HubEvent> {
    let mut seen = Vec::new();
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Some(event) => {
                    let done = pred(&event);
                    seen.push(event);
                    if done {
                        return;
                    }
                }
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out collecting events");
    seen
}

pub(crate) fn is_log(event: &HubEvent, prefix: &str) -> bool {
    matches!(event, HubEvent::LogMessage { message } if message.starts_with(prefix))
}

/// Poll `cond` until it holds. Panics after five seconds.
pub(crate) async fn wait_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for condition")
}
