//! Tenant and device session management.
//!
//! A scrape of `(token, device)` creates the device session on first use and
//! pushes its idle deadline forward on every later use. Each token owns one
//! upstream feed shared by all of its devices; the feed is opened with the
//! first device and closed when the last device is evicted.
//!
//! All structural state lives in one table behind one mutex. Idle timers run
//! as independent tasks that re-enter the table to evict; the feed callback
//! takes the lock only to find the target collector.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use weatherflow_common::{DeviceId, Message, redact};

use crate::catalog::MetricCatalog;
use crate::collector::DeviceCollector;
use crate::config::{ExporterConfig, MAX_IDLE_TIMEOUT_SECS};
use crate::feed::{FeedConnector, FeedHandle, MessageHandler};
use crate::metrics::ExporterMetrics;
use crate::registry::{DeviceRegistry, MetricFilter, RenderOptions};
use crate::snapshot::SnapshotBuilder;

/// Session table statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Tokens with an open feed.
    pub tokens: usize,
    /// Live device sessions across all tokens.
    pub devices: usize,
    /// Device sessions created since startup.
    pub created: u64,
    /// Device sessions evicted since startup.
    pub evicted: u64,
}

/// Owner of every token and device session.
pub struct SessionManager {
    shared: Arc<Shared>,
}

struct Shared {
    table: Mutex<SessionTable>,
    connector: Arc<dyn FeedConnector>,
    builder: SnapshotBuilder,
    filter: Arc<MetricFilter>,
    options: RenderOptions,
    idle_timeout: Duration,
    metrics: Arc<ExporterMetrics>,
    next_session_id: AtomicU64,
    created: AtomicU64,
    evicted: AtomicU64,
}

#[derive(Default)]
struct SessionTable {
    tokens: HashMap<String, TokenSession>,
}

impl SessionTable {
    fn device_count(&self) -> usize {
        self.tokens.values().map(|t| t.devices.len()).sum()
    }
}

struct TokenSession {
    feed: Box<dyn FeedHandle>,
    devices: HashMap<DeviceId, DeviceSession>,
}

struct DeviceSession {
    /// Distinguishes this session from a later one for the same device.
    id: u64,
    collector: Arc<DeviceCollector>,
    registry: Arc<DeviceRegistry>,
    deadline: Instant,
    timer: JoinHandle<()>,
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

enum Expiry {
    Evicted,
    Extended(Instant),
    Gone,
}

impl SessionManager {
    /// Create an empty session manager.
    ///
    /// Sessions spawn tokio tasks, so the manager must be used from within a
    /// runtime.
    pub fn new(
        config: &ExporterConfig,
        catalog: Arc<MetricCatalog>,
        connector: Arc<dyn FeedConnector>,
        metrics: Arc<ExporterMetrics>,
    ) -> Self {
        let shared = Shared {
            table: Mutex::new(SessionTable::default()),
            connector,
            builder: SnapshotBuilder::new(catalog),
            filter: Arc::new(MetricFilter::new(&config.filters)),
            options: RenderOptions {
                timestamps: config.prometheus.timestamps,
            },
            idle_timeout: config.sessions.idle_timeout(),
            metrics,
            next_session_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        };

        Self {
            shared: Arc::new(shared),
        }
    }

    /// Look up the session for `(token, device_id)`, creating it if absent.
    ///
    /// An existing session gets its idle deadline reset to the full window.
    pub fn get_or_create(
        &self,
        token: &str,
        device_id: DeviceId,
    ) -> (Arc<DeviceCollector>, Arc<DeviceRegistry>) {
        let shared = &self.shared;
        let deadline = idle_deadline(shared.idle_timeout);
        let mut table = shared.table.lock();

        if let Some(session) = table
            .tokens
            .get_mut(token)
            .and_then(|t| t.devices.get_mut(&device_id))
        {
            session.deadline = deadline;
            return (session.collector.clone(), session.registry.clone());
        }

        let tenant = table
            .tokens
            .entry(token.to_string())
            .or_insert_with(|| {
                info!(token = %redact(token), "Opening feed for new token");
                TokenSession {
                    feed: shared
                        .connector
                        .open(token, message_handler(shared, token)),
                    devices: HashMap::new(),
                }
            });

        let session_id = shared.next_session_id.fetch_add(1, Ordering::Relaxed);
        let collector = Arc::new(DeviceCollector::new(
            device_id,
            shared.builder.catalog().clone(),
        ));
        let registry = Arc::new(DeviceRegistry::new(
            collector.clone(),
            shared.filter.clone(),
            shared.options,
        ));
        let timer = spawn_idle_timer(
            Arc::downgrade(shared),
            token.to_string(),
            device_id,
            session_id,
            deadline,
        );

        tenant.devices.insert(
            device_id,
            DeviceSession {
                id: session_id,
                collector: collector.clone(),
                registry: registry.clone(),
                deadline,
                timer,
            },
        );
        tenant.feed.add_device(device_id);

        shared.created.fetch_add(1, Ordering::Relaxed);
        shared.metrics.record_session_created();
        shared.publish_active(&table);
        drop(table);

        info!(token = %redact(token), device_id, "Created device session");
        (collector, registry)
    }

    /// Whether a session for `(token, device_id)` is currently alive.
    pub fn contains(&self, token: &str, device_id: DeviceId) -> bool {
        self.shared
            .table
            .lock()
            .tokens
            .get(token)
            .is_some_and(|t| t.devices.contains_key(&device_id))
    }

    pub fn stats(&self) -> SessionStats {
        let table = self.shared.table.lock();
        SessionStats {
            tokens: table.tokens.len(),
            devices: table.device_count(),
            created: self.shared.created.load(Ordering::Relaxed),
            evicted: self.shared.evicted.load(Ordering::Relaxed),
        }
    }

    /// Close every feed and drop every session.
    pub fn shutdown(&self) {
        let mut table = self.shared.table.lock();
        let tokens = table.tokens.len();
        let devices = table.device_count();

        for (_, tenant) in table.tokens.drain() {
            tenant.feed.close();
        }
        self.shared.publish_active(&table);
        drop(table);

        info!(tokens, devices, "Closed all sessions");
    }
}

/// One idle window from now, capped at the longest accepted timeout.
fn idle_deadline(idle_timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(idle_timeout)
        .unwrap_or_else(|| now + Duration::from_secs(MAX_IDLE_TIMEOUT_SECS))
}

impl Shared {
    /// Evict the session if it is still the one the timer was armed for and
    /// its deadline has passed.
    fn expire(&self, token: &str, device_id: DeviceId, session_id: u64) -> Expiry {
        let mut table = self.table.lock();

        let Some(tenant) = table.tokens.get_mut(token) else {
            return Expiry::Gone;
        };
        match tenant.devices.get(&device_id) {
            Some(session) if session.id == session_id => {
                if session.deadline > Instant::now() {
                    return Expiry::Extended(session.deadline);
                }
            }
            _ => return Expiry::Gone,
        }

        let evicted = tenant.devices.remove(&device_id);
        tenant.feed.remove_device(device_id);

        let feed_closed = tenant.devices.is_empty();
        if feed_closed {
            tenant.feed.close();
            table.tokens.remove(token);
        }

        self.evicted.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_session_evicted();
        self.publish_active(&table);
        drop(table);

        info!(
            token = %redact(token),
            device_id,
            feed_closed,
            "Evicted idle device session"
        );
        drop(evicted);
        Expiry::Evicted
    }

    /// Apply a feed message to the collector of its device.
    fn route(&self, token: &str, message: Message) {
        self.metrics.record_message(message.kind());

        let Some(device_id) = message.device_id() else {
            return;
        };

        let collector = {
            let table = self.table.lock();
            table
                .tokens
                .get(token)
                .and_then(|t| t.devices.get(&device_id))
                .map(|s| s.collector.clone())
        };

        match collector {
            Some(collector) => collector.update(self.builder.build(&message)),
            None => {
                self.metrics.record_dropped_message();
                debug!(
                    token = %redact(token),
                    device_id,
                    kind = message.kind(),
                    "Dropped message for device without session"
                );
            }
        }
    }

    fn publish_active(&self, table: &SessionTable) {
        self.metrics
            .set_active(table.tokens.len(), table.device_count());
    }
}

fn message_handler(shared: &Arc<Shared>, token: &str) -> MessageHandler {
    let shared = Arc::downgrade(shared);
    let token = token.to_string();
    Arc::new(move |message| {
        if let Some(shared) = shared.upgrade() {
            shared.route(&token, message);
        }
    })
}

fn spawn_idle_timer(
    shared: Weak<Shared>,
    token: String,
    device_id: DeviceId,
    session_id: u64,
    deadline: Instant,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut deadline = deadline;
        loop {
            tokio::time::sleep_until(deadline).await;

            let Some(shared) = shared.upgrade() else {
                return;
            };
            match shared.expire(&token, device_id, session_id) {
                Expiry::Extended(next) => deadline = next,
                Expiry::Evicted | Expiry::Gone => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DEFAULT_PREFIX, Measurement};
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicBool;
    use weatherflow_common::decode_message;

    struct FakeFeed {
        token: String,
        devices: Mutex<BTreeSet<DeviceId>>,
        closed: AtomicBool,
        handler: MessageHandler,
    }

    impl FakeFeed {
        fn deliver(&self, frame: &str) {
            (self.handler)(decode_message(frame).unwrap());
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    struct FakeHandle(Arc<FakeFeed>);

    impl FeedHandle for FakeHandle {
        fn add_device(&self, device_id: DeviceId) {
            self.0.devices.lock().insert(device_id);
        }

        fn remove_device(&self, device_id: DeviceId) {
            self.0.devices.lock().remove(&device_id);
        }

        fn device_count(&self) -> usize {
            self.0.devices.lock().len()
        }

        fn close(&self) {
            self.0.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        feeds: Mutex<Vec<Arc<FakeFeed>>>,
    }

    impl FakeConnector {
        fn feeds_for(&self, token: &str) -> Vec<Arc<FakeFeed>> {
            self.feeds
                .lock()
                .iter()
                .filter(|f| f.token == token)
                .cloned()
                .collect()
        }

        fn feed(&self, token: &str) -> Arc<FakeFeed> {
            self.feeds_for(token).pop().unwrap()
        }
    }

    impl FeedConnector for FakeConnector {
        fn open(&self, token: &str, on_message: MessageHandler) -> Box<dyn FeedHandle> {
            let feed = Arc::new(FakeFeed {
                token: token.to_string(),
                devices: Mutex::new(BTreeSet::new()),
                closed: AtomicBool::new(false),
                handler: on_message,
            });
            self.feeds.lock().push(feed.clone());
            Box::new(FakeHandle(feed))
        }
    }

    fn setup(idle_timeout_secs: u64) -> (SessionManager, Arc<FakeConnector>, Arc<ExporterMetrics>) {
        let mut config = ExporterConfig::default();
        config.sessions.idle_timeout_secs = idle_timeout_secs;

        let catalog = Arc::new(MetricCatalog::standard(DEFAULT_PREFIX).unwrap());
        let connector = Arc::new(FakeConnector::default());
        let metrics = Arc::new(ExporterMetrics::new());
        let manager = SessionManager::new(&config, catalog, connector.clone(), metrics.clone());
        (manager, connector, metrics)
    }

    const OBS_42: &str = r#"{"type":"obs_st","device_id":42,
        "obs":[[1700000000,1.2,2.0,3.0,90,3,1000.5,null,60,100,0.5,10,0,0,0,0,2.5,1,0,0,0,0]]}"#;

    #[tokio::test]
    async fn test_get_or_create_returns_same_collector() {
        let (manager, connector, _) = setup(60);

        let (first, first_registry) = manager.get_or_create("abc", 42);
        let (second, second_registry) = manager.get_or_create("abc", 42);

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first_registry, &second_registry));
        assert_eq!(connector.feeds_for("abc").len(), 1);
        assert_eq!(manager.stats().created, 1);
    }

    #[tokio::test]
    async fn test_devices_share_token_feed() {
        let (manager, connector, _) = setup(60);

        manager.get_or_create("abc", 1);
        manager.get_or_create("abc", 2);
        manager.get_or_create("xyz", 1);

        assert_eq!(connector.feeds_for("abc").len(), 1);
        assert_eq!(connector.feeds_for("xyz").len(), 1);
        assert_eq!(connector.feed("abc").devices.lock().len(), 2);

        let stats = manager.stats();
        assert_eq!(stats.tokens, 2);
        assert_eq!(stats.devices, 3);
    }

    #[tokio::test]
    async fn test_feed_message_updates_matching_collector() {
        let (manager, connector, _) = setup(60);

        let (collector, registry) = manager.get_or_create("abc", 42);
        connector.feed("abc").deliver(OBS_42);

        let snapshot = collector.export();
        assert_eq!(snapshot.get(Measurement::WindLull).unwrap().value, 1.2);
        assert!(!snapshot.contains(Measurement::AirTemperature));
        assert!(registry
            .render()
            .contains("weatherflow_wind_lull{device_id=\"42\"} 1.2 1700000000000"));
    }

    #[tokio::test]
    async fn test_message_for_unsessioned_device_is_dropped() {
        let (manager, connector, metrics) = setup(60);

        let (collector, _) = manager.get_or_create("abc", 7);
        connector.feed("abc").deliver(OBS_42);
        connector
            .feed("abc")
            .deliver(r#"{"type":"connection_opened"}"#);

        assert!(collector.export().is_empty());
        assert!(!manager.contains("abc", 42));

        let output = metrics.render();
        assert!(output.contains("weatherflow_exporter_feed_messages_dropped_total 1"));
        assert!(output.contains("kind=\"connection_opened\""));
    }

    #[tokio::test]
    async fn test_tokens_are_isolated() {
        let (manager, connector, _) = setup(60);

        let (abc, _) = manager.get_or_create("abc", 42);
        let (xyz, _) = manager.get_or_create("xyz", 42);
        connector.feed("xyz").deliver(OBS_42);

        assert!(abc.export().is_empty());
        assert!(!xyz.export().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_is_evicted() {
        let (manager, connector, _) = setup(60);

        let (first, _) = manager.get_or_create("abc", 42);
        connector.feed("abc").deliver(OBS_42);
        assert!(!first.export().is_empty());

        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(!manager.contains("abc", 42));
        assert!(connector.feed("abc").is_closed());
        assert_eq!(manager.stats(), SessionStats {
            tokens: 0,
            devices: 0,
            created: 1,
            evicted: 1,
        });

        let (second, _) = manager.get_or_create("abc", 42);
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.export().is_empty());
        assert_eq!(connector.feeds_for("abc").len(), 2);
        assert!(!connector.feed("abc").is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scrape_resets_idle_timer() {
        let (manager, _connector, _) = setup(60);

        let (first, _) = manager.get_or_create("abc", 42);
        tokio::time::sleep(Duration::from_secs(40)).await;
        manager.get_or_create("abc", 42);

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(manager.contains("abc", 42));
        let (again, _) = manager.get_or_create("abc", 42);
        assert!(Arc::ptr_eq(&first, &again));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!manager.contains("abc", 42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_device_eviction_closes_feed() {
        let (manager, connector, _) = setup(60);

        manager.get_or_create("abc", 1);
        tokio::time::sleep(Duration::from_secs(30)).await;
        manager.get_or_create("abc", 2);

        tokio::time::sleep(Duration::from_secs(35)).await;
        let feed = connector.feed("abc");
        assert!(!manager.contains("abc", 1));
        assert!(manager.contains("abc", 2));
        assert!(!feed.is_closed());
        assert_eq!(*feed.devices.lock(), BTreeSet::from([2]));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!manager.contains("abc", 2));
        assert!(feed.is_closed());
        assert!(feed.devices.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_idle_timeout_does_not_overflow() {
        let (manager, _, _) = setup(u64::MAX);

        manager.get_or_create("abc", 42);
        manager.get_or_create("abc", 42);
        tokio::time::sleep(Duration::from_secs(3600)).await;

        assert!(manager.contains("abc", 42));
        assert_eq!(manager.stats().evicted, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_feeds() {
        let (manager, connector, metrics) = setup(60);

        manager.get_or_create("abc", 1);
        manager.get_or_create("xyz", 2);
        manager.shutdown();

        assert!(connector.feed("abc").is_closed());
        assert!(connector.feed("xyz").is_closed());
        assert_eq!(manager.stats().devices, 0);
        assert!(metrics
            .render()
            .contains("weatherflow_exporter_active_tokens 0"));
    }
}
