//! Process-level metrics for the exporter itself.

use std::sync::atomic::AtomicU64;

use parking_lot::Mutex;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::warn;

/// Resource usage of the current process, refreshed before each render.
#[derive(Debug)]
pub struct ProcessMetrics {
    pid: Option<Pid>,
    system: Mutex<System>,
    resident_memory: Gauge,
    virtual_memory: Gauge,
    start_time: Gauge,
    cpu_usage: Gauge<f64, AtomicU64>,
}

impl ProcessMetrics {
    /// Register the `process_*` families on the registry root.
    pub fn register(registry: &mut Registry) -> Self {
        let pid = sysinfo::get_current_pid()
            .inspect_err(|e| warn!(error = %e, "Process metrics unavailable"))
            .ok();

        let resident_memory = Gauge::default();
        registry.register(
            "process_resident_memory_bytes",
            "Resident memory size in bytes",
            resident_memory.clone(),
        );

        let virtual_memory = Gauge::default();
        registry.register(
            "process_virtual_memory_bytes",
            "Virtual memory size in bytes",
            virtual_memory.clone(),
        );

        let start_time = Gauge::default();
        registry.register(
            "process_start_time_seconds",
            "Start time of the process since unix epoch in seconds",
            start_time.clone(),
        );

        let cpu_usage = Gauge::<f64, AtomicU64>::default();
        registry.register(
            "process_cpu_usage_percent",
            "CPU usage of the process since the previous refresh",
            cpu_usage.clone(),
        );

        Self {
            pid,
            system: Mutex::new(System::new()),
            resident_memory,
            virtual_memory,
            start_time,
            cpu_usage,
        }
    }

    /// Read current figures from the OS.
    pub fn refresh(&self) {
        let Some(pid) = self.pid else {
            return;
        };

        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let Some(process) = system.process(pid) else {
            return;
        };

        self.resident_memory.set(to_i64(process.memory()));
        self.virtual_memory.set(to_i64(process.virtual_memory()));
        self.start_time.set(to_i64(process.start_time()));
        self.cpu_usage.set(f64::from(process.cpu_usage()));
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
