//! Background expiry sweep.
//!
//! Polls on a fixed interval and asks the fulfillment service to release
//! overdue stock reservations and fail orders whose payment intent lapsed.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::info;

use crate::fulfillment::FulfillmentService;
use crate::order_store::OrderStore;

/// Sweeper configuration.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// How often to sweep.
    pub interval: Duration,
    /// Thread name for logging.
    pub name: String,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            name: "expiry-sweeper".to_string(),
        }
    }
}

/// Handle to control a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl SweeperHandle {
    /// Request graceful shutdown and wait for the thread to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Spawner for the expiry sweep thread.
pub struct ExpirySweeper;

impl ExpirySweeper {
    pub fn spawn<S>(service: Arc<FulfillmentService<S>>, config: SweeperConfig) -> SweeperHandle
    where
        S: OrderStore + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || loop {
                match shutdown_rx.recv_timeout(config.interval) {
                    // Shutdown requested, or the handle was dropped.
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        let stats = service.expire_stale();
                        if stats.reservations_released > 0 || stats.intents_expired > 0 {
                            info!(
                                reservations_released = stats.reservations_released,
                                intents_expired = stats.intents_expired,
                                "expiry sweep"
                            );
                        }
                    }
                }
            })
            .expect("failed to spawn sweeper thread");

        SweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}
