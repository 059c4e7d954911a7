//! Upstream WeatherFlow feed connections.
//!
//! The session manager only sees the [`FeedConnector`] and [`FeedHandle`]
//! traits. [`WebSocketConnector`] implements them on top of the WeatherFlow
//! WebSocket API: one background task per token, reconnecting with
//! exponential backoff and re-subscribing every registered device.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};
use url::form_urlencoded;
use weatherflow_common::{Command, DeviceId, Message, decode_message, encode_command, redact};

use crate::config::FeedConfig;

/// Callback invoked for every message decoded from a feed.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// A live feed for one token.
///
/// Methods never block; subscription changes are applied asynchronously.
pub trait FeedHandle: Send + Sync {
    /// Start receiving observations for a device.
    fn add_device(&self, device_id: DeviceId);

    /// Stop receiving observations for a device.
    fn remove_device(&self, device_id: DeviceId);

    /// Number of devices currently subscribed.
    fn device_count(&self) -> usize;

    /// Stop the feed. Further calls are no-ops.
    fn close(&self);
}

/// Opens feeds.
pub trait FeedConnector: Send + Sync {
    /// Open a feed for `token`, delivering decoded messages to `on_message`.
    fn open(&self, token: &str, on_message: MessageHandler) -> Box<dyn FeedHandle>;
}

/// Feed errors. These never escape the feed task; they trigger a reconnect.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Failed to encode listen command: {0}")]
    Encode(#[from] weatherflow_common::Error),
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

enum FeedCommand {
    Subscribe(DeviceId),
    Unsubscribe(DeviceId),
}

enum SessionEnd {
    Shutdown,
    Disconnected,
}

/// Connector for the WeatherFlow WebSocket API.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    config: FeedConfig,
}

impl WebSocketConnector {
    pub fn new(config: FeedConfig) -> Self {
        Self { config }
    }
}

impl FeedConnector for WebSocketConnector {
    fn open(&self, token: &str, on_message: MessageHandler) -> Box<dyn FeedHandle> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let devices = Arc::new(Mutex::new(BTreeSet::new()));

        let worker = FeedWorker {
            url: feed_url(&self.config.url, token),
            token_hint: redact(token).to_string(),
            rapid_wind: self.config.rapid_wind,
            initial_backoff: self.config.reconnect_delay(),
            max_backoff: self.config.max_reconnect_delay(),
            backoff: self.config.reconnect_delay(),
            devices: devices.clone(),
            commands: command_rx,
            shutdown: shutdown_rx,
            on_message,
            request_seq: 0,
        };
        tokio::spawn(worker.run());

        Box::new(WebSocketFeed {
            devices,
            commands: command_tx,
            shutdown: shutdown_tx,
        })
    }
}

/// Append the percent-encoded token query parameter to the feed endpoint.
fn feed_url(base: &str, token: &str) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    let token: String = form_urlencoded::byte_serialize(token.as_bytes()).collect();
    format!("{}{}token={}", base, separator, token)
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Handle to a running WebSocket feed task.
struct WebSocketFeed {
    devices: Arc<Mutex<BTreeSet<DeviceId>>>,
    commands: mpsc::UnboundedSender<FeedCommand>,
    shutdown: watch::Sender<bool>,
}

impl FeedHandle for WebSocketFeed {
    fn add_device(&self, device_id: DeviceId) {
        if self.devices.lock().insert(device_id) {
            let _ = self.commands.send(FeedCommand::Subscribe(device_id));
        }
    }

    fn remove_device(&self, device_id: DeviceId) {
        if self.devices.lock().remove(&device_id) {
            let _ = self.commands.send(FeedCommand::Unsubscribe(device_id));
        }
    }

    fn device_count(&self) -> usize {
        self.devices.lock().len()
    }

    fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for WebSocketFeed {
    fn drop(&mut self) {
        self.close();
    }
}

struct FeedWorker {
    url: String,
    token_hint: String,
    rapid_wind: bool,
    initial_backoff: Duration,
    max_backoff: Duration,
    backoff: Duration,
    devices: Arc<Mutex<BTreeSet<DeviceId>>>,
    commands: mpsc::UnboundedReceiver<FeedCommand>,
    shutdown: watch::Receiver<bool>,
    on_message: MessageHandler,
    request_seq: u64,
}

impl FeedWorker {
    async fn run(mut self) {
        info!(token = %self.token_hint, "Starting WeatherFlow feed");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.session().await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Disconnected) => {
                    warn!(token = %self.token_hint, "Feed connection closed by server");
                }
                Err(e) => {
                    warn!(
                        token = %self.token_hint,
                        error = %e,
                        retry_in_secs = self.backoff.as_secs(),
                        "Feed connection failed"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.backoff) => {}
                _ = self.shutdown.changed() => {}
            }
            self.backoff = next_backoff(self.backoff, self.max_backoff);
        }

        info!(token = %self.token_hint, "WeatherFlow feed stopped");
    }

    /// Run one connection until it ends.
    async fn session(&mut self) -> Result<SessionEnd, FeedError> {
        let connected = tokio::select! {
            result = connect_async(self.url.as_str()) => result,
            _ = self.shutdown.changed() => return Ok(SessionEnd::Shutdown),
        };
        let (ws, _response) = connected?;

        info!(token = %self.token_hint, "Connected to WeatherFlow feed");
        self.backoff = self.initial_backoff;

        let (mut sink, mut stream) = ws.split();

        // Queued changes are superseded by the current device set.
        while self.commands.try_recv().is_ok() {}
        let devices: Vec<DeviceId> = self.devices.lock().iter().copied().collect();
        for device_id in devices {
            self.send_listen(&mut sink, device_id, true).await?;
        }

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        let _ = sink.close().await;
                        return Ok(SessionEnd::Shutdown);
                    }
                }
                Some(command) = self.commands.recv() => {
                    match command {
                        FeedCommand::Subscribe(device_id) => {
                            self.send_listen(&mut sink, device_id, true).await?;
                        }
                        FeedCommand::Unsubscribe(device_id) => {
                            self.send_listen(&mut sink, device_id, false).await?;
                        }
                    }
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => self.dispatch(&text),
                        Some(Ok(WsMessage::Close(_))) | None => return Ok(SessionEnd::Disconnected),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
            }
        }
    }

    async fn send_listen(
        &mut self,
        sink: &mut WsSink,
        device_id: DeviceId,
        start: bool,
    ) -> Result<(), FeedError> {
        let mut commands = vec![if start {
            Command::ListenStart {
                device_id,
                id: self.next_request_id(device_id),
            }
        } else {
            Command::ListenStop {
                device_id,
                id: self.next_request_id(device_id),
            }
        }];

        if self.rapid_wind {
            let id = self.next_request_id(device_id);
            commands.push(if start {
                Command::ListenRapidStart { device_id, id }
            } else {
                Command::ListenRapidStop { device_id, id }
            });
        }

        for command in &commands {
            sink.send(WsMessage::Text(encode_command(command)?)).await?;
        }

        debug!(
            token = %self.token_hint,
            device_id,
            subscribed = start,
            "Sent listen request"
        );
        Ok(())
    }

    fn next_request_id(&mut self, device_id: DeviceId) -> String {
        self.request_seq += 1;
        format!("{}-{}", device_id, self.request_seq)
    }

    fn dispatch(&self, frame: &str) {
        match decode_message(frame) {
            Ok(message) => {
                match &message {
                    Message::Ack { id } => {
                        trace!(token = %self.token_hint, id = ?id, "Listen request acknowledged");
                    }
                    Message::ConnectionOpened => {
                        debug!(token = %self.token_hint, "Feed connection opened");
                    }
                    _ => {}
                }
                (self.on_message)(message);
            }
            Err(e) => {
                warn!(token = %self.token_hint, error = %e, "Failed to decode feed frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_url() {
        assert_eq!(
            feed_url("wss://ws.weatherflow.com/swd/data", "abc"),
            "wss://ws.weatherflow.com/swd/data?token=abc"
        );
        assert_eq!(
            feed_url("ws://localhost/data?api=1", "abc"),
            "ws://localhost/data?api=1&token=abc"
        );
    }

    #[test]
    fn test_feed_url_encodes_token() {
        assert_eq!(
            feed_url("wss://example.com/data", "a&b=c#d e"),
            "wss://example.com/data?token=a%26b%3Dc%23d+e"
        );
        assert_eq!(
            feed_url("wss://example.com/data", "b3a1f9d2-7c44"),
            "wss://example.com/data?token=b3a1f9d2-7c44"
        );
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let max = Duration::from_secs(300);

        assert_eq!(next_backoff(Duration::from_secs(5), max), Duration::from_secs(10));
        assert_eq!(next_backoff(Duration::from_secs(200), max), max);
        assert_eq!(next_backoff(Duration::MAX, Duration::MAX), Duration::MAX);
        assert_eq!(next_backoff(Duration::from_secs(u64::MAX), max), max);
    }

    #[tokio::test]
    async fn test_handle_tracks_devices() {
        // Unroutable port: the worker keeps retrying in the background while
        // the handle is exercised.
        let connector = WebSocketConnector::new(FeedConfig {
            url: "ws://127.0.0.1:9".to_string(),
            ..Default::default()
        });
        let handle = connector.open("token-under-test", Arc::new(|_: Message| {}));

        handle.add_device(1);
        handle.add_device(2);
        handle.add_device(1);
        assert_eq!(handle.device_count(), 2);

        handle.remove_device(1);
        handle.remove_device(99);
        assert_eq!(handle.device_count(), 1);

        handle.close();
        handle.close();
    }

    #[tokio::test]
    async fn test_worker_stops_on_close() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_command_tx, command_rx) = mpsc::unbounded_channel();

        let worker = FeedWorker {
            url: "ws://127.0.0.1:9".to_string(),
            token_hint: "...".to_string(),
            rapid_wind: true,
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
            backoff: Duration::from_secs(60),
            devices: Arc::new(Mutex::new(BTreeSet::new())),
            commands: command_rx,
            shutdown: shutdown_rx,
            on_message: Arc::new(|_: Message| {}),
            request_seq: 0,
        };
        let task = tokio::spawn(worker.run());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("worker should stop after close")
            .unwrap();
    }

    #[test]
    fn test_dispatch_forwards_decoded_messages() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_command_tx, command_rx) = mpsc::unbounded_channel();

        let worker = FeedWorker {
            url: String::new(),
            token_hint: "...".to_string(),
            rapid_wind: false,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(1),
            backoff: Duration::from_secs(1),
            devices: Arc::new(Mutex::new(BTreeSet::new())),
            commands: command_rx,
            shutdown: shutdown_rx,
            on_message: Arc::new(move |m: Message| sink.lock().push(m.kind())),
            request_seq: 0,
        };

        worker.dispatch(r#"{"type":"rapid_wind","device_id":1,"ob":[1,2.0,3]}"#);
        worker.dispatch("garbage");
        worker.dispatch(r#"{"type":"ack","id":"1-1"}"#);

        assert_eq!(*received.lock(), vec!["rapid_wind", "ack"]);
    }
}
