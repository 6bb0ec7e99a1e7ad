//! POS Hub - client for the Integration Hub payment-terminal module.
//!
//! The Integration Hub is a vendor DLL exporting a small C API: create a
//! communication session, push basket and payment documents, read fiscal
//! info, and receive serial-in and device-state callbacks on a thread the
//! module owns. This crate loads that module, keeps one session alive
//! through a [`ConnectionManager`], and turns native callbacks into
//! [`HubEvent`]s for the presentation layer.
//!
//! ```no_run
//! # async fn demo() -> Result<(), pos_hub::HubError> {
//! let config = pos_hub::HubConfig::load(std::path::Path::new("hub.json"))?;
//! let _log_guard = pos_hub::diagnostics::init_logging(&config.logging)?;
//!
//! let hub = pos_hub::ConnectionManager::from_config(&config)?;
//! hub.subscribe(|event| println!("{}", serde_json::json!(event)));
//! hub.connect();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod diagnostics;
mod dispatcher;
pub mod error;
pub mod events;
pub mod native;
mod transactions;

pub use config::{HubConfig, LoggingConfig, NativeConfig};
pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus};
pub use error::HubError;
pub use events::{EventKind, HubEvent, SubscriptionId};
pub use native::{EventSink, NativeApi, NativeBinder, SessionHandle};
