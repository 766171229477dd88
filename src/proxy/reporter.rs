//! Periodic connection registry reporting
//!
//! Diagnostic only: logs how long every live connection has been open and
//! how many connections each registry holds.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, instrument};

use crate::config::RegistryConfig;
use crate::proxy::registry::{ConnectionRegistry, RegistrySummary};

/// Reporter configuration
#[derive(Clone)]
pub struct RegistryReporterConfig {
    /// Interval between summaries
    pub report_interval: Duration,
    /// Age above which a connection is logged prominently
    pub long_lived_threshold: Duration,
}

impl Default for RegistryReporterConfig {
    fn default() -> Self {
        Self {
            report_interval: Duration::from_secs(10),
            long_lived_threshold: Duration::from_secs(10 * 60),
        }
    }
}

impl From<&RegistryConfig> for RegistryReporterConfig {
    fn from(config: &RegistryConfig) -> Self {
        Self {
            report_interval: config.report_interval(),
            long_lived_threshold: config.long_lived_threshold(),
        }
    }
}

/// Summarizes a set of registries on a fixed interval
pub struct RegistryReporter {
    registries: Vec<ConnectionRegistry>,
    config: RegistryReporterConfig,
}

impl RegistryReporter {
    pub fn new(registries: Vec<ConnectionRegistry>, config: RegistryReporterConfig) -> Self {
        Self { registries, config }
    }

    /// Summarizes every registry once.
    pub fn report_once(&self) -> Vec<RegistrySummary> {
        let now = Utc::now();
        self.registries
            .iter()
            .map(|registry| registry.summarize(now, self.config.long_lived_threshold))
            .collect()
    }

    /// Run the reporter (call in a spawned task)
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting registry reporter with {:?} interval",
            self.config.report_interval
        );

        let mut ticker = interval(self.config.report_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.report_once();
                }
                changed = shutdown.changed() => {
                    // A dropped sender also means shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Registry reporter shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Handle for stopping the registry reporter
pub struct RegistryReporterHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl RegistryReporterHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
