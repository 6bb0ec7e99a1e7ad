//! Error taxonomy for the Integration Hub client.
//!
//! Loader and resolver failures are only ever logged by the connection
//! manager (and make it permanently unusable for the process run); facade
//! failures are returned to the immediate caller.

use thiserror::Error;

/// `NativeCallFailure::code` when the native side returned a null handle or pointer.
pub const NULL_RESULT: i32 = 0;

/// `NativeCallFailure::code` when the call panicked before returning.
pub const CALL_PANICKED: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// A required module was not found or failed to load in any search path.
    #[error("failed to load required module {module}")]
    LibraryLoadFailure { module: String },

    /// An entry point is missing from the primary module.
    #[error("failed to resolve native symbol {symbol}")]
    SymbolResolutionFailure { symbol: String },

    /// No live session handle.
    #[error("not connected")]
    NotConnected,

    /// A native call failed. See [`NULL_RESULT`] and [`CALL_PANICKED`].
    #[error("native call {call} failed (code {code})")]
    NativeCallFailure { call: &'static str, code: i32 },

    /// The native module cannot be hosted on this platform.
    #[error("function not available on this platform")]
    UnsupportedPlatform,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("logging setup failed: {0}")]
    Logging(String),

    /// The manager needs a tokio runtime to run its dispatch consumer.
    #[error("no tokio runtime available")]
    NoRuntime,

    /// A bounded call did not complete in time. The native call keeps running.
    #[error("{call} did not complete within {after_ms} ms")]
    Timeout { call: &'static str, after_ms: u64 },

    #[error("connection manager has been shut down")]
    ShutDown,
}

impl HubError {
    pub(crate) fn null_result(call: &'static str) -> Self {
        HubError::NativeCallFailure {
            call,
            code: NULL_RESULT,
        }
    }

    pub(crate) fn panicked(call: &'static str) -> Self {
        HubError::NativeCallFailure {
            call,
            code: CALL_PANICKED,
        }
    }

    /// Whether this error leaves the manager unusable for the rest of the run.
    pub fn is_binding_failure(&self) -> bool {
        matches!(
            self,
            HubError::LibraryLoadFailure { .. }
                | HubError::SymbolResolutionFailure { .. }
                | HubError::UnsupportedPlatform
        )
    }
}
