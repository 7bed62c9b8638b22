// Background task that closes idle pooled connections

use crate::connection::registry::ClientRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument};

/// Configuration for the idle reclaimer
#[derive(Debug, Clone)]
pub struct ReclaimerConfig {
    /// How often the registry is swept
    pub sweep_interval: Duration,
    /// Connections unused for longer than this are closed
    pub idle_threshold: Duration,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            idle_threshold: Duration::from_secs(3600),
        }
    }
}

/// Periodically sweeps the registry until told to stop
pub struct IdleReclaimer {
    config: ReclaimerConfig,
    registry: Arc<ClientRegistry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl IdleReclaimer {
    pub fn new(config: ReclaimerConfig, registry: Arc<ClientRegistry>) -> Self {
        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

        Self {
            config,
            registry,
            shutdown_tx,
        }
    }

    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Run one sweep now
    pub async fn sweep_once(&self) -> usize {
        self.registry.sweep_idle(self.config.idle_threshold).await
    }

    /// Start the sweep loop on the runtime. The shutdown subscription is taken
    /// before the task starts, so a `stop` issued right after `spawn` is seen.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let shutdown_rx = self.shutdown_receiver();
        tokio::spawn(async move { self.run_until(shutdown_rx).await })
    }

    /// Run the sweep loop on the current task
    pub async fn run(&self) {
        let shutdown_rx = self.shutdown_receiver();
        self.run_until(shutdown_rx).await
    }

    #[instrument(skip_all)]
    async fn run_until(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            sweep_interval_ms = self.config.sweep_interval.as_millis() as u64,
            idle_threshold_ms = self.config.idle_threshold.as_millis() as u64,
            "Starting idle connection reclaimer"
        );

        let mut sweep_interval = interval(self.config.sweep_interval);
        sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = sweep_interval.tick() => {
                    let reclaimed = self.sweep_once().await;
                    debug!(reclaimed, pooled = self.registry.len(), "Idle sweep finished");
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping reclaimer");
                    break;
                }
            }
        }

        info!("Idle connection reclaimer stopped");
    }

    /// Signal the sweep loop to stop
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
