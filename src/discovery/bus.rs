//! Aggregate discovery over several strategies.

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, error, info};

use super::DiscoveryStrategy;
use crate::error::LinkResult;
use crate::identity::DeviceId;

/// Runs every registered strategy and merges the results.
///
/// Results are de-duplicated (a device may appear twice while it enumerates) and
/// sorted by canonical string. A failing strategy is logged once when it starts
/// failing, not on every tick; the other strategies still contribute.
#[derive(Default)]
pub struct DeviceBus {
    strategies: Vec<Box<dyn DiscoveryStrategy>>,
    failing: HashSet<usize>,
    device_ids: Vec<DeviceId>,
}

impl std::fmt::Debug for DeviceBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.strategies.iter().map(|s| s.name()).collect();
        f.debug_struct("DeviceBus")
            .field("strategies", &names)
            .field("device_ids", &self.device_ids)
            .finish()
    }
}

impl DeviceBus {
    /// Empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a strategy.
    pub fn with_strategy(mut self, strategy: impl DiscoveryStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    /// Add a boxed strategy.
    pub fn push(&mut self, strategy: Box<dyn DiscoveryStrategy>) {
        self.strategies.push(strategy);
    }

    /// Run every strategy once and return the merged device list.
    pub fn update(&mut self) -> &[DeviceId] {
        let mut merged = BTreeSet::new();
        for (i, strategy) in self.strategies.iter_mut().enumerate() {
            match strategy.list_current_devices() {
                Ok(ids) => {
                    if self.failing.remove(&i) {
                        info!(strategy = strategy.name(), "Discovery strategy recovered");
                    }
                    merged.extend(ids);
                }
                Err(e) => {
                    if self.failing.insert(i) {
                        error!(strategy = strategy.name(), error = %e, "Discovery strategy failed");
                    }
                }
            }
        }
        self.device_ids = merged.into_iter().collect();
        debug!(count = self.device_ids.len(), "Device bus updated");
        &self.device_ids
    }

    /// Result of the last [`update`](Self::update).
    pub fn device_ids(&self) -> &[DeviceId] {
        &self.device_ids
    }

    /// Whether the last update found nothing.
    pub fn is_empty(&self) -> bool {
        self.device_ids.is_empty()
    }
}

impl DiscoveryStrategy for DeviceBus {
    fn name(&self) -> &str {
        "bus"
    }

    fn list_current_devices(&mut self) -> LinkResult<Vec<DeviceId>> {
        Ok(self.update().to_vec())
    }
}
