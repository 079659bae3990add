//! Periodic device health probing.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::state::Health;
use crate::state::HealthReporter;
use crate::state::HealthUpdate;

/// Observes the health of a single device.
pub trait HealthProbe: Send + Sync {
    fn probe(&self, id: &str) -> Health;
}

/// Reports a device unhealthy once its host node `<prefix><id>` disappears.
#[derive(Debug, Clone)]
pub struct DeviceNodeProbe {
    prefix: PathBuf,
}

impl DeviceNodeProbe {
    /// `prefix` is the node path without the id, e.g. `/dev/cambricon_dev`.
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl HealthProbe for DeviceNodeProbe {
    fn probe(&self, id: &str) -> Health {
        let mut node = self.prefix.clone().into_os_string();
        node.push(id);
        if PathBuf::from(node).exists() {
            Health::Healthy
        } else {
            Health::Unhealthy
        }
    }
}

pub struct HealthMonitor {
    probe: Arc<dyn HealthProbe>,
    reporter: HealthReporter,
    period: Duration,
}

impl HealthMonitor {
    pub fn new(probe: Arc<dyn HealthProbe>, reporter: HealthReporter, period: Duration) -> Self {
        Self {
            probe,
            reporter,
            period,
        }
    }

    /// Probe `ids` every period and report transitions until cancelled.
    ///
    /// Devices are assumed healthy at start, matching what the server first
    /// advertises.
    #[tracing::instrument(skip_all, fields(period = ?self.period))]
    pub async fn run(self, ids: Vec<String>, cancellation_token: CancellationToken) {
        info!("starting device health monitor");
        let mut last_seen: HashMap<String, Health> = ids
            .into_iter()
            .map(|id| (id, Health::Healthy))
            .collect();

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("device health monitor shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    if !self.check(&mut last_seen).await {
                        warn!("device plugin server is gone, stopping health monitor");
                        break;
                    }
                }
            }
        }
    }

    /// Returns `false` once reports can no longer be delivered.
    async fn check(&self, last_seen: &mut HashMap<String, Health>) -> bool {
        for (id, last) in last_seen.iter_mut() {
            let health = self.probe.probe(id);
            if health == *last {
                continue;
            }
            debug!(%id, from = %last, to = %health, "device health transition");
            *last = health;
            if !self.reporter.report(HealthUpdate::new(id.clone(), health)).await {
                return false;
            }
        }
        true
    }
}
