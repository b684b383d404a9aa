//! Self-registration with the discovery registry.
//!
//! While running, the loop writes `<controller-id>/address -> <address>`
//! into the registry, once immediately and then again `delay` after each
//! attempt has finished.  Attempts never overlap: the timer is re-armed only
//! when the previous attempt completed, however long it took.
//!
//! Each attempt dials the registry anew.  A connection kept across a network
//! partition could stay broken forever, while a fresh dial recovers as soon
//! as the registry is reachable again.  Failures are logged and otherwise
//! ignored; the next attempt is simply the next tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ControllerError;
use crate::types::registry_address_path;

/// Write access to the registry's key/value directory.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn set_value(&self, path: &str, value: &str) -> Result<(), ControllerError>;

    /// Release the underlying connection.
    fn close(&self) {}
}

/// Opens a new [`RegistryClient`] connection for every registration attempt.
#[async_trait]
pub trait RegistryDialer: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Box<dyn RegistryClient>, ControllerError>;
}

/// What to register where, and how often.
#[derive(Clone)]
pub struct Registration {
    registry_address: String,
    delay: Duration,
    controller_id: String,
    controller_address: String,
    dialer: Arc<dyn RegistryDialer>,
}

impl Registration {
    pub fn new(
        registry_address: impl Into<String>,
        delay: Duration,
        controller_id: impl Into<String>,
        controller_address: impl Into<String>,
        dialer: Arc<dyn RegistryDialer>,
    ) -> Self {
        Self {
            registry_address: registry_address.into(),
            delay,
            controller_id: controller_id.into(),
            controller_address: controller_address.into(),
            dialer,
        }
    }

    /// Dial the registry and publish the controller address once.
    pub async fn register_once(&self) -> Result<(), ControllerError> {
        info!(
            controller_id = %self.controller_id,
            address = %self.controller_address,
            registry = %self.registry_address,
            "registering controller",
        );
        let client = self.dialer.connect(&self.registry_address).await?;
        let result = client
            .set_value(
                &registry_address_path(&self.controller_id),
                &self.controller_address,
            )
            .await;
        client.close();
        result
    }

    /// Run the registration loop on a new Tokio task.
    pub fn spawn(self) -> RegistrationHandle {
        let token = CancellationToken::new();
        let join = tokio::spawn(self.run(token.clone()));
        RegistrationHandle { token, join }
    }

    async fn run(self, token: CancellationToken) {
        // TODO: back off exponentially while the registry is unreachable
        // instead of retrying at the fixed delay.
        while !token.is_cancelled() {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                result = self.register_once() => {
                    if let Err(e) = result {
                        warn!(registry = %self.registry_address, error = %e, "registration failed");
                    }
                }
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        debug!(registry = %self.registry_address, "registration loop stopped");
    }
}

/// Handle of a running registration loop.
pub struct RegistrationHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl RegistrationHandle {
    /// Cancel the loop and wait until its task has exited.  An attempt that
    /// is in flight is abandoned.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.join.await {
            warn!(error = %e, "registration task did not exit cleanly");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Dialer double: records every write, optionally failing to connect or
    /// taking `latency` per write.
    #[derive(Default)]
    struct RecordingDialer {
        dials: AtomicUsize,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        writes: Arc<Mutex<Vec<(String, String)>>>,
        fail: bool,
        latency: Duration,
        hang: bool,
    }

    struct RecordingClient {
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        writes: Arc<Mutex<Vec<(String, String)>>>,
        latency: Duration,
        hang: bool,
    }

    #[async_trait]
    impl RegistryDialer for RecordingDialer {
        async fn connect(
            &self,
            address: &str,
        ) -> Result<Box<dyn RegistryClient>, ControllerError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ControllerError::TransportError(format!(
                    "{address}: connection refused"
                )));
            }
            Ok(Box::new(RecordingClient {
                in_flight: Arc::clone(&self.in_flight),
                max_in_flight: Arc::clone(&self.max_in_flight),
                writes: Arc::clone(&self.writes),
                latency: self.latency,
                hang: self.hang,
            }))
        }
    }

    #[async_trait]
    impl RegistryClient for RecordingClient {
        async fn set_value(&self, path: &str, value: &str) -> Result<(), ControllerError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(self.latency).await;
            self.writes
                .lock()
                .unwrap()
                .push((path.to_owned(), value.to_owned()));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn registration(dialer: Arc<RecordingDialer>, delay: Duration) -> Registration {
        Registration::new("registry:8999", delay, "host-0", "10.0.0.1:7000", dialer)
    }

    #[tokio::test(start_paused = true)]
    async fn two_ticks_two_attempts() {
        let dialer = Arc::new(RecordingDialer::default());
        let handle = registration(Arc::clone(&dialer), Duration::from_millis(100)).spawn();

        // Attempts at t=0 and t=100ms; the next one would be at t=200ms.
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.stop().await;

        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
        let writes = dialer.writes.lock().unwrap().clone();
        assert_eq!(
            writes,
            vec![
                ("host-0/address".to_owned(), "10.0.0.1:7000".to_owned()),
                ("host-0/address".to_owned(), "10.0.0.1:7000".to_owned()),
            ]
        );

        // Nothing runs after stop returned.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_end_the_loop() {
        let dialer = Arc::new(RecordingDialer {
            fail: true,
            ..Default::default()
        });
        let handle = registration(Arc::clone(&dialer), Duration::from_millis(100)).spawn();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!handle.is_finished());
        handle.stop().await;

        assert_eq!(dialer.dials.load(Ordering::SeqCst), 3);
        assert!(dialer.writes.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_never_overlap() {
        let dialer = Arc::new(RecordingDialer {
            latency: Duration::from_millis(250),
            ..Default::default()
        });
        let handle = registration(Arc::clone(&dialer), Duration::from_millis(100)).spawn();

        // First attempt runs 0..250ms, the second starts at 350ms.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
        handle.stop().await;

        assert_eq!(dialer.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(dialer.writes.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_abandons_hanging_attempt() {
        let dialer = Arc::new(RecordingDialer {
            hang: true,
            ..Default::default()
        });
        let handle = registration(Arc::clone(&dialer), Duration::from_millis(100)).spawn();
        tokio::time::sleep(Duration::from_millis(10)).await;

        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .expect("stop must not wait for the hanging attempt");
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
        assert!(dialer.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn register_once_reports_errors() {
        let dialer = Arc::new(RecordingDialer {
            fail: true,
            ..Default::default()
        });
        let err = registration(dialer, Duration::from_secs(60))
            .register_once()
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::TransportError(_)));
    }
}
