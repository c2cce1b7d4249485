//! rangedl Core - Transfer Engine
//!
//! This crate provides the segmented, resumable transfer engine behind rangedl.
//! It probes sources for range support, splits transfers into byte ranges,
//! streams them concurrently under a speed cap and keeps all state in a
//! [`TransferStore`] so transfers survive restarts.

mod config;
mod control;
mod engine;
mod error;
mod paths;
mod scheduler;
mod stats;
mod store;

pub use config::*;
pub use control::*;
pub use engine::*;
pub use error::*;
pub use paths::*;
pub use scheduler::*;
pub use stats::*;
pub use store::*;

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// The main rangedl engine instance
pub struct TransferEngine {
    store: Arc<dyn TransferStore>,
    config: Arc<EngineConfig>,
    meter: Arc<ThroughputMeter>,
    registry: Arc<TaskRegistry>,
    orchestrator: Arc<Orchestrator>,
    control: TransferControl,
    /// Cancels the runners and, through child tokens, every worker
    shutdown: CancellationToken,
    runners: Mutex<Vec<JoinHandle<()>>>,
}

impl TransferEngine {
    /// Wire the engine around `store`. Nothing runs until [`start`](Self::start).
    pub fn new(store: Arc<dyn TransferStore>, config: EngineConfig) -> Result<Self> {
        let config = Arc::new(config);
        let client = config.build_client()?;
        let meter = Arc::new(ThroughputMeter::new(config.meter_window_ms));
        let registry = Arc::new(TaskRegistry::new());
        let shutdown = CancellationToken::new();

        meter.subscribe(Arc::new(StatsRecorder::new(store.clone())));

        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            meter.clone(),
            registry.clone(),
            client,
            config.clone(),
            shutdown.clone(),
        ));
        let control = TransferControl::new(store.clone(), registry.clone(), meter.clone());

        Ok(Self {
            store,
            config,
            meter,
            registry,
            orchestrator,
            control,
            shutdown,
            runners: Mutex::new(Vec::new()),
        })
    }

    /// Recover interrupted segments and spawn the tick and meter runners
    pub async fn start(&self) -> Result<()> {
        self.control.recover_interrupted().await?;

        let orchestrator = self.orchestrator.clone();
        let tick = spawn_periodic(
            "orchestrator",
            self.config.tick_interval(),
            self.shutdown.clone(),
            move || {
                let orchestrator = orchestrator.clone();
                async move {
                    if let Err(e) = orchestrator.tick().await {
                        error!("Orchestrator tick failed: {}", e);
                    }
                }
            },
        );

        let meter = self.meter.clone();
        let recompute = spawn_periodic(
            "throughput-meter",
            self.config.tick_interval(),
            self.shutdown.clone(),
            move || {
                let meter = meter.clone();
                async move {
                    meter.recompute_now().await;
                }
            },
        );

        self.runners.lock().extend([tick, recompute]);
        info!("Transfer engine started");
        Ok(())
    }

    /// Stop the runners and every in-flight worker, then wait for them
    pub async fn shutdown(&self) {
        info!("Shutting down transfer engine");
        self.shutdown.cancel();

        let runners: Vec<_> = self.runners.lock().drain(..).collect();
        for runner in runners {
            let _ = runner.await;
        }
        for id in self.registry.transfer_ids() {
            for handle in self.registry.drain(id) {
                handle.join().await;
            }
        }
    }

    /// Run one orchestrator pass outside the periodic runner
    pub async fn tick(&self) -> Result<TickReport> {
        self.orchestrator.tick().await
    }

    pub fn control(&self) -> &TransferControl {
        &self.control
    }

    pub fn meter(&self) -> &Arc<ThroughputMeter> {
        &self.meter
    }

    pub fn store(&self) -> &Arc<dyn TransferStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
