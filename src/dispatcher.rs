//! Callback dispatcher.
//!
//! Native callbacks arrive on a thread owned by the vendor module. They only
//! ever enqueue into a single unbounded channel; one consumer task drains it
//! and is the only place shared state is mutated from callback data or
//! subscribers are notified. FIFO order holds for everything that goes
//! through one sink.

use std::fmt;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::HubError;
use crate::events::HubEvent;
use crate::native::SessionHandle;

pub(crate) enum Dispatch {
    SerialIn { type_code: i32, value: String },
    DeviceState { connected: bool, device_id: String },
    ConnectFinished { outcome: Result<SessionHandle, HubError> },
    Notify(HubEvent),
    AutoReconnect,
    Shutdown,
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatch::SerialIn { type_code, .. } => write!(f, "SerialIn({type_code})"),
            Dispatch::DeviceState { connected, device_id } => {
                write!(f, "DeviceState({connected}, {device_id})")
            }
            Dispatch::ConnectFinished { outcome } => {
                write!(f, "ConnectFinished(ok={})", outcome.is_ok())
            }
            Dispatch::Notify(event) => write!(f, "Notify({:?})", event.kind()),
            Dispatch::AutoReconnect => f.write_str("AutoReconnect"),
            Dispatch::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Entry point for native-originated events.
///
/// Cheap to clone and safe to use from any thread. Strings must already be
/// owned copies: nothing passed in may borrow native memory.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Dispatch>,
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl EventSink {
    /// Queue a serial-in event. `false` once the consumer is gone.
    pub fn serial_in(&self, type_code: i32, value: String) -> bool {
        self.send(Dispatch::SerialIn { type_code, value })
    }

    /// Queue a device-state event. `false` once the consumer is gone.
    pub fn device_state(&self, connected: bool, device_id: String) -> bool {
        self.send(Dispatch::DeviceState {
            connected,
            device_id,
        })
    }

    pub(crate) fn send(&self, dispatch: Dispatch) -> bool {
        self.deliver(dispatch).is_ok()
    }

    /// Like `send`, but hands the dispatch back if nobody will consume it.
    pub(crate) fn deliver(&self, dispatch: Dispatch) -> Result<(), Dispatch> {
        self.tx.send(dispatch).map_err(|e| e.0)
    }

    pub(crate) fn notify(&self, event: HubEvent) {
        let _ = self.send(Dispatch::Notify(event));
    }

    /// `LogMessage` for subscribers, mirrored to tracing at info.
    pub(crate) fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{message}");
        self.notify(HubEvent::log(message));
    }

    /// `LogMessage` for subscribers, mirrored to tracing at warn.
    pub(crate) fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.notify(HubEvent::log(message));
    }
}

pub(crate) fn channel() -> (EventSink, mpsc::UnboundedReceiver<Dispatch>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

/// Owner of the state the consumer applies dispatches to.
pub(crate) trait DispatchTarget: Send + Sync + 'static {
    fn apply(this: &Arc<Self>, dispatch: Dispatch) -> Flow;
}

/// Spawn the single consumer. It holds only a weak reference, so it ends
/// when the target is dropped, when the channel closes, or on `Flow::Stop`.
pub(crate) fn spawn_consumer<T: DispatchTarget>(
    runtime: &Handle,
    target: Weak<T>,
    mut rx: mpsc::UnboundedReceiver<Dispatch>,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        debug!("Dispatch consumer started");
        while let Some(dispatch) = rx.recv().await {
            let Some(target) = target.upgrade() else {
                break;
            };
            if T::apply(&target, dispatch) == Flow::Stop {
                break;
            }
        }
        debug!("Dispatch consumer stopped");
    })
}
