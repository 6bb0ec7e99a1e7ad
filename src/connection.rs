//! Connection Manager: owner of the native session.
//!
//! One manager per application root, shared by cloning. It drives the
//! Disconnected → Connecting → Connected state machine, runs each connect
//! attempt on the blocking pool, and applies everything coming back from
//! native code (connect outcomes, device callbacks) on the single dispatch
//! consumer.
//!
//! All session state lives behind one short-held lock. The handle is only
//! read or replaced with that lock held, including across the native destroy
//! call. Native calls on a live session are serialized by a second lock, the
//! call gate, which `disconnect` also takes, so a handle is never destroyed
//! under a running call and the dispatch consumer never waits on one.
//! `is_connected`/`is_connecting` read atomic mirrors and never wait at all.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Level};

use crate::config::HubConfig;
use crate::dispatcher::{self, Dispatch, DispatchTarget, EventSink, Flow};
use crate::error::HubError;
use crate::events::{EventKind, HubEvent, SubscriptionId, Subscribers};
use crate::native::symbols::{
    CREATE_COMMUNICATION, DELETE_COMMUNICATION, RECONNECT, SET_DEVICE_STATE_CALLBACK,
    SET_SERIAL_IN_CALLBACK,
};
use crate::native::{IntegrationHubBinder, NativeApi, NativeBinder, PreBound, SessionHandle};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Point-in-time view of the manager, for diagnostics screens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub connected: bool,
    pub connecting: bool,
    pub company_name: String,
    /// Last id reported by a device-state callback.
    pub device_id: Option<String>,
    pub connect_attempts: u64,
    pub auto_reconnects: u64,
    pub last_error: Option<String>,
    pub changed_at: DateTime<Utc>,
}

struct Session {
    state: ConnectionState,
    // Some iff state == Connected.
    handle: Option<SessionHandle>,
    device_connected: bool,
    // Last device report applied while Connecting.
    device_reported: Option<bool>,
    device_id: Option<String>,
    connect_attempts: u64,
    auto_reconnects: u64,
    last_error: Option<String>,
    changed_at: DateTime<Utc>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            handle: None,
            device_connected: false,
            device_reported: None,
            device_id: None,
            connect_attempts: 0,
            auto_reconnects: 0,
            last_error: None,
            changed_at: Utc::now(),
        }
    }
}

enum Binding {
    Pending,
    Ready(Arc<dyn NativeApi>),
    Failed(HubError),
}

// ---------------------------------------------------------------------------
// Shared core
// ---------------------------------------------------------------------------

struct Shared {
    company_name: String,
    // Lock order: calls, session, binding.
    calls: Mutex<()>,
    session: Mutex<Session>,
    state_mirror: AtomicU8,
    link_mirror: AtomicBool,
    closed: AtomicBool,
    stop_requested: AtomicBool,
    binding: Mutex<Binding>,
    binder: Box<dyn NativeBinder>,
    sink: EventSink,
    subscribers: Subscribers,
    runtime: Handle,
}

impl Shared {
    fn calls(&self) -> MutexGuard<'_, ()> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn binding(&self) -> MutexGuard<'_, Binding> {
        self.binding.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, session: &mut Session, state: ConnectionState) {
        if session.state != state {
            debug!(from = ?session.state, to = ?state, "Connection state changed");
        }
        session.state = state;
        session.changed_at = Utc::now();
        self.state_mirror.store(state as u8, Ordering::SeqCst);
    }

    fn set_link(&self, session: &mut Session, up: bool) {
        session.device_connected = up;
        self.link_mirror.store(up, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        ConnectionState::from_u8(self.state_mirror.load(Ordering::SeqCst))
            == ConnectionState::Connected
            && self.link_mirror.load(Ordering::SeqCst)
    }

    /// The bound API, binding on first use. Called with the session lock held.
    fn bound_api(&self) -> Result<Arc<dyn NativeApi>, HubError> {
        let mut binding = self.binding();
        match &*binding {
            Binding::Ready(api) => return Ok(api.clone()),
            Binding::Failed(e) => return Err(e.clone()),
            Binding::Pending => {}
        }

        let sink = self.sink.clone();
        let result = self.binder.bind(&mut |level: Level, line: String| {
            if level == Level::ERROR || level == Level::WARN {
                sink.warn(line);
            } else {
                sink.info(line);
            }
        });
        *binding = match &result {
            Ok(api) => Binding::Ready(api.clone()),
            Err(e) => {
                warn!(error = %e, "Native binding failed, connection manager disabled");
                Binding::Failed(e.clone())
            }
        };
        result
    }

    fn ready_api(&self) -> Option<Arc<dyn NativeApi>> {
        match &*self.binding() {
            Binding::Ready(api) => Some(api.clone()),
            _ => None,
        }
    }

    // Consumer-side logging: delivered straight to subscribers.
    fn log_info(&self, message: String) {
        info!("{message}");
        self.subscribers.publish(&HubEvent::log(message));
    }

    fn log_warn(&self, message: String) {
        warn!("{message}");
        self.subscribers.publish(&HubEvent::log(message));
    }

    // No cap and no backoff.
    fn request_auto_reconnect(&self) {
        self.log_warn("Connection lost. Attempting to reconnect...".into());
        self.sink.send(Dispatch::AutoReconnect);
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    fn connect(this: &Arc<Self>) {
        if this.closed.load(Ordering::SeqCst) {
            this.sink.warn(format!("Cannot connect: {}", HubError::ShutDown));
            return;
        }

        let mut session = this.session();
        match session.state {
            ConnectionState::Connected => {
                drop(session);
                this.sink.info("Already connected");
                return;
            }
            ConnectionState::Connecting => {
                drop(session);
                this.sink.info("Connection attempt already in progress...");
                return;
            }
            ConnectionState::Disconnected => {}
        }

        let api = match this.bound_api() {
            Ok(api) => api,
            Err(e) => {
                session.last_error = Some(e.to_string());
                drop(session);
                this.sink.warn(format!("Cannot connect: {e}"));
                return;
            }
        };

        // Shutdown may have landed while waiting for the lock or binding.
        if this.closed.load(Ordering::SeqCst) {
            drop(session);
            this.sink.warn(format!("Cannot connect: {}", HubError::ShutDown));
            return;
        }

        this.set_state(&mut session, ConnectionState::Connecting);
        session.device_reported = None;
        session.connect_attempts += 1;
        let attempt = session.connect_attempts;
        drop(session);

        this.sink.notify(HubEvent::ConnectionStatusChanged { connected: false });
        this.sink.info("Connecting...");
        debug!(attempt, company = %this.company_name, "Connect attempt started");

        let company = this.company_name.clone();
        let sink = this.sink.clone();
        this.runtime.spawn_blocking(move || {
            let outcome = establish(api.as_ref(), &company, &sink);
            // Nobody left to own the session: destroy it here.
            if let Err(Dispatch::ConnectFinished {
                outcome: Ok(handle),
            }) = sink.deliver(Dispatch::ConnectFinished { outcome })
            {
                let _ = guarded(DELETE_COMMUNICATION, || api.delete_communication(handle));
            }
        });
    }

    /// Destroy the live session, if any. Returns whether there was one.
    fn disconnect(&self) -> bool {
        let _calls = self.calls();
        let mut session = self.session();
        let Some(handle) = session.handle.take() else {
            return false;
        };

        if let Some(api) = self.ready_api() {
            if let Err(e) = guarded(DELETE_COMMUNICATION, || api.delete_communication(handle)) {
                warn!(error = %e, "deleteCommunication failed, handle dropped anyway");
            }
        }
        self.set_state(&mut session, ConnectionState::Disconnected);
        self.set_link(&mut session, false);
        drop(session);

        self.sink
            .notify(HubEvent::ConnectionStatusChanged { connected: false });
        self.sink.info("Disconnected");
        true
    }

    /// Run `f` against the live session with the call gate held.
    pub(crate) fn with_session<T, F>(&self, call: &'static str, f: F) -> Result<T, HubError>
    where
        F: FnOnce(&dyn NativeApi, SessionHandle) -> Result<T, HubError>,
    {
        if !self.binder.supported() {
            return Err(HubError::UnsupportedPlatform);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(HubError::ShutDown);
        }
        let _calls = self.calls();
        let handle = {
            let session = self.session();
            session.handle.ok_or(HubError::NotConnected)?
        };
        let api = self.ready_api().ok_or(HubError::NotConnected)?;
        guarded(call, || f(api.as_ref(), handle))
    }

    // -----------------------------------------------------------------------
    // Consumer side
    // -----------------------------------------------------------------------

    fn on_connect_finished(&self, outcome: Result<SessionHandle, HubError>) -> Flow {
        let mut session = self.session();

        if self.closed.load(Ordering::SeqCst) {
            if let (Ok(handle), Some(api)) = (&outcome, self.ready_api()) {
                let _ = guarded(DELETE_COMMUNICATION, || api.delete_communication(*handle));
            }
            self.set_state(&mut session, ConnectionState::Disconnected);
            drop(session);
            self.log_info("Connect attempt finished after shutdown, session discarded".into());
            return if self.stop_requested.load(Ordering::SeqCst) {
                Flow::Stop
            } else {
                Flow::Continue
            };
        }

        match outcome {
            Ok(handle) => {
                // A report that arrived during registration outranks the
                // optimistic "up".
                let link = session.device_reported.take().unwrap_or(true);
                session.handle = Some(handle);
                session.last_error = None;
                self.set_state(&mut session, ConnectionState::Connected);
                self.set_link(&mut session, link);
                if !link {
                    session.auto_reconnects += 1;
                }
                drop(session);

                self.subscribers
                    .publish(&HubEvent::ConnectionStatusChanged { connected: link });
                self.log_info("Connected successfully".into());
                if !link {
                    self.request_auto_reconnect();
                }
            }
            Err(e) => {
                session.device_reported = None;
                session.last_error = Some(e.to_string());
                self.set_state(&mut session, ConnectionState::Disconnected);
                self.set_link(&mut session, false);
                drop(session);

                self.subscribers
                    .publish(&HubEvent::ConnectionStatusChanged { connected: false });
                self.log_warn(format!("Error connecting: {e}"));
            }
        }
        Flow::Continue
    }

    fn on_device_state(&self, connected: bool, device_id: String) {
        let reconnect = {
            let mut session = self.session();
            self.set_link(&mut session, connected);
            session.device_id = Some(device_id.clone());
            let connecting = session.state == ConnectionState::Connecting;
            if connecting {
                session.device_reported = Some(connected);
            }
            let reconnect = !connected && !connecting && !self.closed.load(Ordering::SeqCst);
            if reconnect {
                session.auto_reconnects += 1;
            }
            reconnect
        };

        self.subscribers.publish(&HubEvent::DeviceStateChanged {
            connected,
            device_id: device_id.clone(),
        });
        // The reported value, even while a connect is still in flight.
        self.subscribers
            .publish(&HubEvent::ConnectionStatusChanged { connected });
        self.log_info(format!(
            "Device State - Connected: {}, ID: {device_id}",
            if connected { "Yes" } else { "No" }
        ));

        if reconnect {
            self.request_auto_reconnect();
        }
    }
}

impl DispatchTarget for Shared {
    fn apply(this: &Arc<Self>, dispatch: Dispatch) -> Flow {
        match dispatch {
            Dispatch::SerialIn { type_code, value } => {
                this.log_info(format!("Serial In - Type: {type_code}, Value: {value}"));
                this.subscribers
                    .publish(&HubEvent::SerialInReceived { type_code, value });
            }
            Dispatch::DeviceState {
                connected,
                device_id,
            } => this.on_device_state(connected, device_id),
            Dispatch::ConnectFinished { outcome } => return this.on_connect_finished(outcome),
            Dispatch::Notify(event) => this.subscribers.publish(&event),
            Dispatch::AutoReconnect => Shared::connect(this),
            Dispatch::Shutdown => {
                this.stop_requested.store(true, Ordering::SeqCst);
                // An attempt in flight still has to come back and be destroyed.
                if this.session().state != ConnectionState::Connecting {
                    return Flow::Stop;
                }
            }
        }
        Flow::Continue
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let session = self.session.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = session.handle.take() {
            if let Binding::Ready(api) = self.binding.get_mut().unwrap_or_else(|e| e.into_inner()) {
                debug!(?handle, "Destroying session of dropped connection manager");
                let _ = guarded(DELETE_COMMUNICATION, || api.delete_communication(handle));
            }
        }
        self.sink.send(Dispatch::Shutdown);
    }
}

/// Create a session and register both callbacks. Runs on the blocking pool.
fn establish(
    api: &dyn NativeApi,
    company: &str,
    sink: &EventSink,
) -> Result<SessionHandle, HubError> {
    sink.info("Creating communication instance...");
    let handle = guarded(CREATE_COMMUNICATION, || api.create_communication(company))?
        .ok_or_else(|| HubError::null_result(CREATE_COMMUNICATION))?;

    sink.info("Setting up callbacks...");
    let registered = guarded(SET_SERIAL_IN_CALLBACK, || {
        api.set_serial_in_callback(handle, sink.clone())
    })
    .and_then(|()| {
        guarded(SET_DEVICE_STATE_CALLBACK, || {
            api.set_device_state_callback(handle, sink.clone())
        })
    });
    if let Err(e) = registered {
        if let Err(cleanup) = guarded(DELETE_COMMUNICATION, || api.delete_communication(handle)) {
            warn!(error = %cleanup, "Failed to destroy half-initialised session");
        }
        return Err(e);
    }

    sink.info("Connection setup complete");
    Ok(handle)
}

/// Run one native call, turning a panic into `NativeCallFailure { code: -1 }`.
pub(crate) fn guarded<T, F>(call: &'static str, f: F) -> Result<T, HubError>
where
    F: FnOnce() -> Result<T, HubError>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(_) => {
            warn!(call, "Native call panicked");
            Err(HubError::panicked(call))
        }
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Client handle for the Integration Hub session. Clones share one manager.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Build a manager around `binder`. Must be called inside a tokio runtime.
    pub fn new(
        company_name: impl Into<String>,
        binder: Box<dyn NativeBinder>,
    ) -> Result<Self, HubError> {
        let runtime = Handle::try_current().map_err(|_| HubError::NoRuntime)?;
        let (sink, rx) = dispatcher::channel();
        let company_name = company_name.into();

        let shared = Arc::new(Shared {
            company_name,
            calls: Mutex::new(()),
            session: Mutex::new(Session::new()),
            state_mirror: AtomicU8::new(ConnectionState::Disconnected as u8),
            link_mirror: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            binding: Mutex::new(Binding::Pending),
            binder,
            sink,
            subscribers: Subscribers::new(),
            runtime: runtime.clone(),
        });
        dispatcher::spawn_consumer(&runtime, Arc::downgrade(&shared), rx);

        info!(company = %shared.company_name, "Connection manager created");
        Ok(Self { shared })
    }

    /// Manager for the Integration Hub DLL described by `config`.
    pub fn from_config(config: &HubConfig) -> Result<Self, HubError> {
        Self::new(
            config.company_name.clone(),
            Box::new(IntegrationHubBinder::new(config.native.clone())),
        )
    }

    /// Manager over an already-bound native API.
    pub fn with_native(
        company_name: impl Into<String>,
        api: Arc<dyn NativeApi>,
    ) -> Result<Self, HubError> {
        Self::new(company_name, Box::new(PreBound::new(api)))
    }

    pub fn company_name(&self) -> &str {
        &self.shared.company_name
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&HubEvent) + Send + Sync + 'static,
    {
        self.shared.subscribers.subscribe(listener)
    }

    pub fn subscribe_to<F>(&self, kinds: &[EventKind], listener: F) -> SubscriptionId
    where
        F: Fn(&HubEvent) + Send + Sync + 'static,
    {
        self.shared.subscribers.subscribe_to(kinds, listener)
    }

    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<HubEvent>) {
        self.shared.subscribers.subscribe_channel()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.subscribers.unsubscribe(id)
    }

    /// Connected with the device link up. Never blocks.
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// A connect attempt is in flight. Never blocks.
    pub fn is_connecting(&self) -> bool {
        self.state() == ConnectionState::Connecting
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state_mirror.load(Ordering::SeqCst))
    }

    /// Start a connect attempt in the background.
    ///
    /// Does nothing but log while connecting or connected. The first call
    /// loads and binds the native module; a binding failure is final.
    pub fn connect(&self) {
        Shared::connect(&self.shared);
    }

    /// Destroy the live session. No-op when there is none.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    /// Ask the native side to re-establish its device link on the existing
    /// session, or connect when there is no session.
    pub fn reconnect(&self) {
        match self
            .shared
            .with_session(RECONNECT, |api, handle| api.reconnect(handle))
        {
            Ok(()) => self.shared.sink.info("Reconnection initiated"),
            Err(HubError::NotConnected) => self.connect(),
            Err(e) => self.shared.sink.warn(format!("Error reconnecting: {e}")),
        }
    }

    /// Snapshot of the session. Does not wait for an in-flight native call.
    pub fn status(&self) -> ConnectionStatus {
        let session = self.shared.session();
        ConnectionStatus {
            state: session.state,
            connected: session.state == ConnectionState::Connected && session.device_connected,
            connecting: session.state == ConnectionState::Connecting,
            company_name: self.shared.company_name.clone(),
            device_id: session.device_id.clone(),
            connect_attempts: session.connect_attempts,
            auto_reconnects: session.auto_reconnects,
            last_error: session.last_error.clone(),
            changed_at: session.changed_at,
        }
    }

    /// Disconnect and stop accepting connects. The dispatch consumer exits
    /// once no connect attempt is in flight.
    pub fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.disconnect();
        self.shared.sink.info("Connection manager shut down");
        self.shared.sink.send(Dispatch::Shutdown);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn with_session<T, F>(&self, call: &'static str, f: F) -> Result<T, HubError>
    where
        F: FnOnce(&dyn NativeApi, SessionHandle) -> Result<T, HubError>,
    {
        self.shared.with_session(call, f)
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("company_name", &self.shared.company_name)
            .field("state", &self.state())
            .field("connected", &self.is_connected())
            .finish()
    }
}
