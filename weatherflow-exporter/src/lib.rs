//! Multi-tenant Prometheus exporter for the WeatherFlow Tempest API.
//!
//! Each scrape names an API token and a device. The first scrape of a device
//! opens (or joins) the token's upstream WebSocket feed and creates a session
//! holding that device's latest observations; later scrapes render them and
//! keep the session alive. Sessions idle for the configured timeout are
//! evicted, and a token's feed closes with its last device.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │ WeatherFlow WSS │────>│ SnapshotBuilder │────>│ DeviceCollector │
//! │  (one / token)  │     │   (catalog)     │     │  (per device)   │
//! └─────────────────┘     └─────────────────┘     └────────┬────────┘
//!          ^                                               │
//!          │              ┌─────────────────┐     ┌────────v────────┐
//!          └──────────────│ SessionManager  │<────│   HTTP Server   │
//!                         │  (idle timers)  │     │ (/scrape?token) │
//!                         └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! weatherflow-exporter --config config.json5
//! curl 'http://localhost:6969/scrape?token=<token>&device_id=<device>'
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod catalog;
pub mod collector;
pub mod config;
pub mod feed;
pub mod http;
pub mod metrics;
pub mod process;
pub mod registry;
pub mod session;
pub mod snapshot;

pub use catalog::{CatalogError, Measurement, MetricCatalog, MetricDefinition, MetricKind};
pub use collector::DeviceCollector;
pub use config::ExporterConfig;
pub use feed::{FeedConnector, FeedHandle, MessageHandler, WebSocketConnector};
pub use http::{HttpServer, ScrapeError};
pub use metrics::ExporterMetrics;
pub use registry::{DeviceRegistry, MetricFilter, RenderOptions};
pub use session::{SessionManager, SessionStats};
pub use snapshot::{MetricValue, Snapshot, SnapshotBuilder};
