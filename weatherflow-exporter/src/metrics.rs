//! Exporter self-metrics served on the metrics path.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::process::ProcessMetrics;

/// Namespace of every self-metric.
pub const SELF_PREFIX: &str = "weatherflow_exporter";

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct MessageLabels {
    kind: String,
}

/// Counters and gauges describing the exporter itself, plus `process_*`
/// families for the running process.
#[derive(Debug)]
pub struct ExporterMetrics {
    registry: Registry,
    process: ProcessMetrics,
    scrapes: Counter,
    rejected_scrapes: Counter,
    messages: Family<MessageLabels, Counter>,
    dropped_messages: Counter,
    sessions_created: Counter,
    sessions_evicted: Counter,
    active_tokens: Gauge,
    active_devices: Gauge,
}

impl ExporterMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let own = registry.sub_registry_with_prefix(SELF_PREFIX);

        let scrapes = Counter::default();
        own.register(
            "scrape_requests",
            "Valid device scrape requests served",
            scrapes.clone(),
        );

        let rejected_scrapes = Counter::default();
        own.register(
            "scrape_rejected",
            "Scrape requests rejected for missing or malformed parameters",
            rejected_scrapes.clone(),
        );

        let messages = Family::<MessageLabels, Counter>::default();
        own.register(
            "feed_messages",
            "Messages received from upstream feeds, by message type",
            messages.clone(),
        );

        let dropped_messages = Counter::default();
        own.register(
            "feed_messages_dropped",
            "Feed messages discarded because no session exists for their device",
            dropped_messages.clone(),
        );

        let sessions_created = Counter::default();
        own.register(
            "sessions_created",
            "Device sessions created by scrapes",
            sessions_created.clone(),
        );

        let sessions_evicted = Counter::default();
        own.register(
            "sessions_evicted",
            "Device sessions evicted after the idle timeout",
            sessions_evicted.clone(),
        );

        let active_tokens = Gauge::default();
        own.register(
            "active_tokens",
            "Tokens with an open upstream feed",
            active_tokens.clone(),
        );

        let active_devices = Gauge::default();
        own.register(
            "active_devices",
            "Device sessions currently alive",
            active_devices.clone(),
        );

        let process = ProcessMetrics::register(&mut registry);

        Self {
            registry,
            process,
            scrapes,
            rejected_scrapes,
            messages,
            dropped_messages,
            sessions_created,
            sessions_evicted,
            active_tokens,
            active_devices,
        }
    }

    pub fn record_scrape(&self) {
        self.scrapes.inc();
    }

    pub fn record_rejected_scrape(&self) {
        self.rejected_scrapes.inc();
    }

    pub fn record_message(&self, kind: &str) {
        self.messages
            .get_or_create(&MessageLabels {
                kind: kind.to_string(),
            })
            .inc();
    }

    pub fn record_dropped_message(&self) {
        self.dropped_messages.inc();
    }

    pub fn record_session_created(&self) {
        self.sessions_created.inc();
    }

    pub fn record_session_evicted(&self) {
        self.sessions_evicted.inc();
    }

    /// Publish the current size of the session table.
    pub fn set_active(&self, tokens: usize, devices: usize) {
        self.active_tokens.set(tokens as i64);
        self.active_devices.set(devices as i64);
    }

    /// Render in Prometheus text format.
    pub fn render(&self) -> String {
        self.process.refresh();

        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!(error = %e, "Failed to encode self-metrics");
        }
        buffer
    }
}

impl Default for ExporterMetrics {
    fn default() -> Self {
        Self::new()
    }
}
