//! Per-device holder of the latest metric snapshot.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::trace;
use weatherflow_common::DeviceId;

use crate::catalog::{MetricCatalog, MetricDefinition};
use crate::snapshot::{MetricValue, Snapshot};

/// Thread-safe store of the latest values observed for one device.
///
/// Written by the feed callback of the owning token, read by scrapes. Each
/// update replaces entries wholesale under a write lock, so a reader never
/// observes a partially written entry.
#[derive(Debug)]
pub struct DeviceCollector {
    device_id: DeviceId,
    catalog: Arc<MetricCatalog>,
    snapshot: RwLock<Snapshot>,
    updates: AtomicU64,
}

impl DeviceCollector {
    /// Create a collector with an empty snapshot.
    pub fn new(device_id: DeviceId, catalog: Arc<MetricCatalog>) -> Self {
        Self {
            device_id,
            catalog,
            snapshot: RwLock::new(Snapshot::default()),
            updates: AtomicU64::new(0),
        }
    }

    /// Apply a batch of values (last write wins per metric).
    pub fn update(&self, values: Vec<MetricValue>) {
        if values.is_empty() {
            return;
        }

        let count = values.len();
        self.snapshot.write().apply(values);
        self.updates.fetch_add(1, Ordering::Relaxed);

        trace!(device_id = self.device_id, values = count, "Snapshot updated");
    }

    /// A copy of the current snapshot.
    pub fn export(&self) -> Snapshot {
        self.snapshot.read().clone()
    }

    /// Every metric this collector can report, observed or not.
    pub fn describe(&self) -> &[Arc<MetricDefinition>] {
        self.catalog.definitions()
    }

    /// The values currently present, in catalog order.
    pub fn collect(&self) -> Vec<MetricValue> {
        let snapshot = self.snapshot.read();
        self.catalog
            .definitions()
            .iter()
            .filter_map(|def| snapshot.get(def.measurement).cloned())
            .collect()
    }

    /// Number of non-empty updates applied.
    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }
}
