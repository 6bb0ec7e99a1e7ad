//! Transaction Facade.
//!
//! Thin pass-through to the live session: payloads go out untouched, status
//! codes and fiscal text come back untouched. The plain calls block for as
//! long as the terminal takes; the `*_within` variants bound the wait for
//! async callers.

use std::time::Duration;
use tracing::{debug, warn};

use crate::connection::ConnectionManager;
use crate::error::HubError;
use crate::native::symbols::{GET_ACTIVE_DEVICE_INDEX, GET_FISCAL_INFO, SEND_BASKET, SEND_PAYMENT};

impl ConnectionManager {
    /// Index of the terminal the native module is currently talking to.
    pub fn get_active_device_index(&self) -> Result<i32, HubError> {
        self.with_session(GET_ACTIVE_DEVICE_INDEX, |api, handle| {
            api.get_active_device_index(handle)
        })
    }

    /// Send a basket document; returns the native status code.
    pub fn send_basket(&self, json: &str) -> Result<i32, HubError> {
        debug!(bytes = json.len(), "Sending basket");
        self.with_session(SEND_BASKET, |api, handle| api.send_basket(handle, json))
    }

    /// Start a payment; returns the native status code.
    pub fn send_payment(&self, json: &str) -> Result<i32, HubError> {
        debug!(bytes = json.len(), "Sending payment");
        self.with_session(SEND_PAYMENT, |api, handle| api.send_payment(handle, json))
    }

    pub fn get_fiscal_info(&self) -> Result<String, HubError> {
        self.with_session(GET_FISCAL_INFO, |api, handle| api.get_fiscal_info(handle))
    }

    // -----------------------------------------------------------------------
    // Bounded-latency variants
    // -----------------------------------------------------------------------

    pub async fn get_active_device_index_within(&self, limit: Duration) -> Result<i32, HubError> {
        self.run_within(GET_ACTIVE_DEVICE_INDEX, limit, |mgr| {
            mgr.get_active_device_index()
        })
        .await
    }

    pub async fn send_basket_within(&self, json: &str, limit: Duration) -> Result<i32, HubError> {
        let json = json.to_string();
        self.run_within(SEND_BASKET, limit, move |mgr| mgr.send_basket(&json))
            .await
    }

    pub async fn send_payment_within(&self, json: &str, limit: Duration) -> Result<i32, HubError> {
        let json = json.to_string();
        self.run_within(SEND_PAYMENT, limit, move |mgr| mgr.send_payment(&json))
            .await
    }

    pub async fn get_fiscal_info_within(&self, limit: Duration) -> Result<String, HubError> {
        self.run_within(GET_FISCAL_INFO, limit, |mgr| mgr.get_fiscal_info())
            .await
    }

    /// Run a blocking facade call on the blocking pool and stop waiting after
    /// `limit`. The native call itself runs to completion regardless.
    async fn run_within<T, F>(
        &self,
        call: &'static str,
        limit: Duration,
        f: F,
    ) -> Result<T, HubError>
    where
        T: Send + 'static,
        F: FnOnce(&ConnectionManager) -> Result<T, HubError> + Send + 'static,
    {
        let mgr = self.clone();
        let task = tokio::task::spawn_blocking(move || f(&mgr));

        match tokio::time::timeout(limit, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(call, error = %e, "Blocking task failed");
                Err(HubError::panicked(call))
            }
            Err(_) => {
                let after_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                warn!(call, after_ms, "Native call still running after deadline");
                Err(HubError::Timeout { call, after_ms })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::connection::ConnectionManager;
    use crate::error::{HubError, CALL_PANICKED};
    use crate::events::HubEvent;
    use crate::native::mock::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    const BASKET: &str = r#"{"documentType":9008,"taxFreeAmount":5000,"items":[{"name":"Kaşar","price":2500,"quantity":2}]}"#;

    async fn connected(api: &Arc<MockNative>) -> ConnectionManager {
        let mgr = ConnectionManager::with_native("Acme Market", api.clone()).unwrap();
        let (_id, mut rx) = mgr.subscribe_channel();
        mgr.connect();
        wait_for(&mut rx, |e| {
            matches!(e, HubEvent::ConnectionStatusChanged { connected: true })
        })
        .await;
        mgr
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disconnected_calls_fail_without_native_calls() {
        let api = MockNative::new();
        let mgr = ConnectionManager::with_native("Acme Market", api.clone()).unwrap();

        assert_eq!(mgr.get_active_device_index(), Err(HubError::NotConnected));
        assert_eq!(mgr.send_basket(BASKET), Err(HubError::NotConnected));
        assert_eq!(mgr.send_payment("{}"), Err(HubError::NotConnected));
        assert_eq!(mgr.get_fiscal_info(), Err(HubError::NotConnected));
        assert!(api.calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_basket_payload_and_status_pass_through() {
        let api = MockNative::new();
        let mgr = connected(&api).await;
        api.set_status(-17);

        assert_eq!(mgr.send_basket(BASKET), Ok(-17));
        assert_eq!(api.count(|c| *c == Call::SendBasket(BASKET.into())), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_payment_device_index_and_fiscal_info() {
        let api = MockNative::new();
        let mgr = connected(&api).await;
        api.set_status(0);
        api.set_device_index(3);
        api.set_fiscal("Z-0042;total=1250");

        let payment = r#"{"amount":1250,"currency":"TRY"}"#;
        assert_eq!(mgr.send_payment(payment), Ok(0));
        assert_eq!(mgr.get_active_device_index(), Ok(3));
        assert_eq!(mgr.get_fiscal_info().as_deref(), Ok("Z-0042;total=1250"));
        assert_eq!(api.count(|c| *c == Call::SendPayment(payment.into())), 1);
        assert_eq!(api.count(|c| *c == Call::FiscalInfo), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_native_panic_is_reported_as_call_failure() {
        let api = MockNative::new();
        let mgr = connected(&api).await;
        api.panic_on_payment();

        let err = mgr.send_payment("{}").unwrap_err();
        assert_eq!(
            err,
            HubError::NativeCallFailure {
                call: "sendPayment",
                code: CALL_PANICKED
            }
        );
        // The call gate survives the panic.
        assert_eq!(mgr.get_active_device_index(), Ok(1));
        assert!(mgr.is_connected());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unsupported_platform_fails_every_call() {
        let api = MockNative::new();
        let mgr =
            ConnectionManager::new("Acme Market", Box::new(MockBinder::unsupported(api.clone())))
                .unwrap();

        assert_eq!(mgr.get_active_device_index(), Err(HubError::UnsupportedPlatform));
        assert_eq!(mgr.send_basket(BASKET), Err(HubError::UnsupportedPlatform));
        assert_eq!(mgr.send_payment("{}"), Err(HubError::UnsupportedPlatform));
        assert_eq!(mgr.get_fiscal_info(), Err(HubError::UnsupportedPlatform));
        assert!(api.calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_within_times_out_slow_payment() {
        let api = MockNative::new();
        let mgr = connected(&api).await;
        api.delay_payment(Duration::from_millis(500));

        let started = Instant::now();
        let result = mgr
            .send_payment_within("{}", Duration::from_millis(50))
            .await;
        assert_eq!(
            result,
            Err(HubError::Timeout {
                call: "sendPayment",
                after_ms: 50
            })
        );
        assert!(started.elapsed() < Duration::from_millis(400));

        // Reads stay non-blocking while the payment holds the call gate.
        assert!(mgr.is_connected());
        assert!(!mgr.is_connecting());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_within_returns_result_in_time() {
        let api = MockNative::new();
        let mgr = connected(&api).await;
        api.set_status(2);
        api.set_fiscal("FISCAL-OK");

        let limit = Duration::from_secs(2);
        assert_eq!(mgr.send_basket_within(BASKET, limit).await, Ok(2));
        assert_eq!(
            mgr.get_fiscal_info_within(limit).await.as_deref(),
            Ok("FISCAL-OK")
        );
        assert_eq!(mgr.get_active_device_index_within(limit).await, Ok(1));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_within_when_disconnected_is_not_connected() {
        let api = MockNative::new();
        let mgr = ConnectionManager::with_native("Acme Market", api.clone()).unwrap();
        let result = mgr
            .send_basket_within(BASKET, Duration::from_secs(1))
            .await;
        assert_eq!(result, Err(HubError::NotConnected));
        assert!(api.calls().is_empty());
    }
}
