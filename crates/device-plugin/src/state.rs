//! Advertised devices and their health.

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use derive_more::Display;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

/// Health of a device as reported to the kubelet. The `Display` form is the
/// wire string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Health {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub id: String,
    pub health: Health,
}

impl DeviceRecord {
    pub fn new(id: impl Into<String>, health: Health) -> Self {
        Self {
            id: id.into(),
            health,
        }
    }
}

/// A health change for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthUpdate {
    pub id: String,
    pub health: Health,
}

impl HealthUpdate {
    pub fn new(id: impl Into<String>, health: Health) -> Self {
        Self {
            id: id.into(),
            health,
        }
    }
}

/// The device list advertised to the kubelet.
///
/// Membership is fixed at construction; only health changes. Every applied
/// change bumps a generation counter that watchers subscribe to, after which
/// they re-read the full list with [`PluginState::snapshot`].
#[derive(Debug)]
pub struct PluginState {
    devices: Mutex<Vec<DeviceRecord>>,
    generation: watch::Sender<u64>,
}

impl PluginState {
    /// Every device starts out healthy.
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let devices = ids
            .into_iter()
            .map(|id| DeviceRecord::new(id, Health::Healthy))
            .collect();
        let (generation, _) = watch::channel(0);
        Self {
            devices: Mutex::new(devices),
            generation,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DeviceRecord>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current device list in advertisement order.
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Receiver that wakes on every applied change.
    ///
    /// Subscribe before taking the first snapshot so no change between the
    /// two is missed.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Apply `update` and notify watchers. Returns whether the list changed.
    ///
    /// Updates for unknown devices are ignored.
    pub(crate) fn apply(&self, update: &HealthUpdate) -> bool {
        let changed = {
            let mut devices = self.lock();
            match devices.iter_mut().find(|d| d.id == update.id) {
                Some(device) if device.health != update.health => {
                    device.health = update.health;
                    true
                }
                Some(_) => false,
                None => {
                    debug!(id = %update.id, "ignoring health update for unknown device");
                    false
                }
            }
        };

        if changed {
            info!(id = %update.id, health = %update.health, "device health changed");
            self.generation.send_modify(|generation| *generation += 1);
        }
        changed
    }
}

/// Handle for submitting health changes to a running server.
#[derive(Debug, Clone)]
pub struct HealthReporter {
    tx: mpsc::Sender<HealthUpdate>,
}

impl HealthReporter {
    pub(crate) fn new(tx: mpsc::Sender<HealthUpdate>) -> Self {
        Self { tx }
    }

    /// Submit a change. Returns `false` once the server has stopped.
    pub async fn report(&self, update: HealthUpdate) -> bool {
        self.tx.send(update).await.is_ok()
    }
}

/// Drain the health channel into `state` until cancelled or every reporter
/// is gone.
#[tracing::instrument(skip_all)]
pub(crate) async fn apply_health_updates(
    state: &PluginState,
    mut updates: mpsc::Receiver<HealthUpdate>,
    cancellation_token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => break,
            update = updates.recv() => match update {
                Some(update) => {
                    state.apply(&update);
                }
                None => break,
            },
        }
    }
    debug!("health update applier stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    #[test]
    fn health_displays_as_wire_string() {
        assert_eq!(Health::Healthy.to_string(), "Healthy");
        assert_eq!(Health::Unhealthy.to_string(), "Unhealthy");
    }

    #[test]
    fn devices_start_healthy_in_order() {
        let state = PluginState::new(["0", "1", "2"]);
        assert_eq!(
            state.snapshot(),
            vec![
                DeviceRecord::new("0", Health::Healthy),
                DeviceRecord::new("1", Health::Healthy),
                DeviceRecord::new("2", Health::Healthy),
            ]
        );
    }

    #[test]
    fn apply_overwrites_only_the_named_device() {
        let state = PluginState::new(["0", "1"]);

        assert!(state.apply(&HealthUpdate::new("1", Health::Unhealthy)));
        assert_eq!(
            state.snapshot(),
            vec![
                DeviceRecord::new("0", Health::Healthy),
                DeviceRecord::new("1", Health::Unhealthy),
            ]
        );
    }

    #[test]
    fn apply_ignores_unknown_device() {
        let state = PluginState::new(["0", "1"]);
        let rx = state.subscribe();

        assert!(!state.apply(&HealthUpdate::new("9", Health::Unhealthy)));
        assert_eq!(state.len(), 2);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn membership_is_fixed_under_any_update_sequence() {
        let ids = ["a", "b", "c", "d"];
        let state = PluginState::new(ids);
        let updates = [
            ("a", Health::Unhealthy),
            ("x", Health::Unhealthy),
            ("c", Health::Unhealthy),
            ("a", Health::Healthy),
            ("c", Health::Unhealthy),
            ("y", Health::Healthy),
        ];

        for (id, health) in updates {
            state.apply(&HealthUpdate::new(id, health));
        }

        assert_eq!(
            state.snapshot(),
            vec![
                DeviceRecord::new("a", Health::Healthy),
                DeviceRecord::new("b", Health::Healthy),
                DeviceRecord::new("c", Health::Unhealthy),
                DeviceRecord::new("d", Health::Healthy),
            ]
        );
    }

    #[test]
    fn only_real_changes_wake_subscribers() {
        let state = PluginState::new(["0"]);
        let mut rx = state.subscribe();

        state.apply(&HealthUpdate::new("0", Health::Healthy));
        assert!(!rx.has_changed().unwrap());

        state.apply(&HealthUpdate::new("0", Health::Unhealthy));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        assert!(!rx.has_changed().unwrap());
    }

    #[test(tokio::test)]
    async fn applier_drains_reported_updates() {
        let state = Arc::new(PluginState::new(["0", "1"]));
        let (tx, rx) = mpsc::channel(4);
        let reporter = HealthReporter::new(tx);
        let token = CancellationToken::new();

        let applier = {
            let state = state.clone();
            let token = token.clone();
            tokio::spawn(async move { apply_health_updates(&state, rx, token).await })
        };

        let mut changes = state.subscribe();
        assert!(reporter.report(HealthUpdate::new("0", Health::Unhealthy)).await);
        changes.changed().await.expect("should observe change");
        assert_eq!(state.snapshot()[0].health, Health::Unhealthy);

        token.cancel();
        applier.await.expect("applier should exit");
        assert!(!reporter.report(HealthUpdate::new("1", Health::Unhealthy)).await);
    }
}
