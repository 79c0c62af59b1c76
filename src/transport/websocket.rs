//! Self-reconnecting websocket supervisor.
//!
//! A `ConnectionSupervisor` owns one logical websocket connection. It dials,
//! sends the configured subscription payloads with a fixed spacing, and hands
//! every inbound frame unmodified to the registered handler. On disconnect it
//! reconnects by itself and delivers a synthetic `{"error":"closed"}` message
//! so consumers can tell transport loss from application errors. A heartbeat
//! watchdog forces a reconnect after a silent stall, and a 429-bearing
//! transport error mutes all sends for a cooldown window while reads keep
//! draining.

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsSink = futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Receives every inbound payload, unmodified.
pub type MessageHandler = Arc<dyn Fn(&str) + Send + Sync>;
/// Handler variant tagged with the originating connection id, used by the
/// feed race selector.
pub type RaceHandler = Arc<dyn Fn(&str, usize) + Send + Sync>;

/// Connection endpoint: a literal URL or a thunk evaluated at dial time
/// (for just-in-time auth tokens in the query string).
#[derive(Clone)]
pub enum UrlSource {
    Literal(String),
    Deferred(Arc<dyn Fn() -> String + Send + Sync>),
}

impl UrlSource {
    fn resolve(&self) -> String {
        match self {
            UrlSource::Literal(url) => url.clone(),
            UrlSource::Deferred(f) => f(),
        }
    }
}

impl From<&str> for UrlSource {
    fn from(url: &str) -> Self {
        UrlSource::Literal(url.to_string())
    }
}

impl From<String> for UrlSource {
    fn from(url: String) -> Self {
        UrlSource::Literal(url)
    }
}

/// Subscription payload sent right after the handshake: a literal value or a
/// thunk evaluated at send time.
#[derive(Clone)]
pub enum SubscriptionPayload {
    Literal(Value),
    Deferred(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl SubscriptionPayload {
    fn render(&self) -> Value {
        match self {
            SubscriptionPayload::Literal(v) => v.clone(),
            SubscriptionPayload::Deferred(f) => f(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    Init,
    Connecting,
    Subscribing,
    Live,
    Error,
    Stalled,
    Closed,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct WsConfig {
    /// No inbound frame for this long forces a reconnect.
    pub stall_threshold: Duration,
    /// Heartbeat watchdog poll interval.
    pub heartbeat_interval: Duration,
    /// Send mute window after a rate-limit transport error.
    pub flood_cooldown: Duration,
    /// Spacing between subscription payloads after the handshake.
    pub subscribe_spacing: Duration,
    /// Pause between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Consecutive send errors that force a reconnect.
    pub max_send_errors: u32,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            stall_threshold: Duration::from_secs(100),
            heartbeat_interval: Duration::from_secs(10),
            flood_cooldown: Duration::from_secs(200),
            subscribe_spacing: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(10),
            max_send_errors: 3,
        }
    }
}

struct WsShared {
    url: UrlSource,
    headers: Vec<(String, String)>,
    subs: Vec<SubscriptionPayload>,
    handler: Option<MessageHandler>,
    race_handler: Option<RaceHandler>,
    config: WsConfig,
    id: AtomicUsize,
    keep_alive: AtomicBool,
    state: Mutex<WsState>,
    last_heartbeat: Mutex<Instant>,
    error_count: AtomicU32,
    flood_until: Mutex<Option<Instant>>,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    reopen: Notify,
    reset: Notify,
}

impl WsShared {
    fn set_state(&self, state: WsState) {
        *self.state.lock().unwrap() = state;
    }

    fn state(&self) -> WsState {
        *self.state.lock().unwrap()
    }

    fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock().unwrap() = Instant::now();
    }

    fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.lock().unwrap().elapsed()
    }

    fn deliver(&self, raw: &str) {
        if let Some(handler) = &self.handler {
            handler(raw);
        }
        if let Some(handler) = &self.race_handler {
            handler(raw, self.id.load(Ordering::Relaxed));
        }
    }

    /// Forwards a transport error to the handler and arms the flood cooldown
    /// when the error carries a rate-limit signal.
    fn note_transport_error(&self, text: &str) {
        warn!("[websocket:{}] error: {}", self.id.load(Ordering::Relaxed), text);
        self.deliver(&serde_json::json!({ "error": text }).to_string());
        if text.contains("429") {
            warn!(
                "[websocket:{}] rate limited, muting sends for {:?}",
                self.id.load(Ordering::Relaxed),
                self.config.flood_cooldown
            );
            *self.flood_until.lock().unwrap() = Some(Instant::now() + self.config.flood_cooldown);
        }
    }

    fn flood_active(&self) -> bool {
        self.flood_until
            .lock()
            .unwrap()
            .map(|until| until > Instant::now())
            .unwrap_or(false)
    }

    async fn send_value(&self, payload: &Value) -> bool {
        if self.flood_active() {
            debug!(
                "[websocket:{}] send suppressed during flood cooldown",
                self.id.load(Ordering::Relaxed)
            );
            return false;
        }
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => match sink.send(Message::Text(payload.to_string())).await {
                Ok(()) => true,
                Err(e) => {
                    self.error_count.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        "[websocket:{}] send failed: {}",
                        self.id.load(Ordering::Relaxed),
                        e
                    );
                    false
                }
            },
            None => false,
        }
    }
}

pub struct ConnectionSupervisorBuilder {
    url: UrlSource,
    subs: Vec<SubscriptionPayload>,
    headers: Vec<(String, String)>,
    config: WsConfig,
    id: usize,
    handler: Option<MessageHandler>,
    race_handler: Option<RaceHandler>,
}

impl ConnectionSupervisorBuilder {
    pub fn handler(mut self, handler: MessageHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn race_handler(mut self, handler: RaceHandler) -> Self {
        self.race_handler = Some(handler);
        self
    }

    pub fn subscriptions(mut self, subs: Vec<SubscriptionPayload>) -> Self {
        self.subs = subs;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn config(mut self, config: WsConfig) -> Self {
        self.config = config;
        self
    }

    pub fn id(mut self, id: usize) -> Self {
        self.id = id;
        self
    }

    /// Spawns the connect loop and heartbeat watchdog. Must be called inside
    /// a tokio runtime.
    pub fn spawn(self) -> ConnectionSupervisor {
        let shared = Arc::new(WsShared {
            url: self.url,
            headers: self.headers,
            subs: self.subs,
            handler: self.handler,
            race_handler: self.race_handler,
            config: self.config,
            id: AtomicUsize::new(self.id),
            keep_alive: AtomicBool::new(true),
            state: Mutex::new(WsState::Init),
            last_heartbeat: Mutex::new(Instant::now()),
            error_count: AtomicU32::new(0),
            flood_until: Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            reopen: Notify::new(),
            reset: Notify::new(),
        });
        let tasks = vec![
            tokio::spawn(connect_loop(shared.clone())),
            tokio::spawn(heartbeat_loop(shared.clone())),
        ];
        ConnectionSupervisor {
            shared,
            tasks: Mutex::new(tasks),
        }
    }
}

pub struct ConnectionSupervisor {
    shared: Arc<WsShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    pub fn builder(url: impl Into<UrlSource>) -> ConnectionSupervisorBuilder {
        ConnectionSupervisorBuilder {
            url: url.into(),
            subs: Vec::new(),
            headers: Vec::new(),
            config: WsConfig::default(),
            id: 0,
            handler: None,
            race_handler: None,
        }
    }

    /// Sends a payload over the live connection. Returns false if there is no
    /// connection, the send failed, or sends are muted by flood control.
    pub async fn send(&self, payload: &Value) -> bool {
        self.shared.send_value(payload).await
    }

    /// Terminal: drops the connection and disables auto-reconnect.
    pub fn close(&self) {
        self.shared.keep_alive.store(false, Ordering::SeqCst);
        self.shared.reset.notify_one();
    }

    /// Re-enables auto-reconnect after a `close`.
    pub fn open(&self) {
        self.shared.keep_alive.store(true, Ordering::SeqCst);
        self.shared.reopen.notify_one();
    }

    /// Drops the current connection; the supervisor reconnects on its own.
    pub fn reset(&self) {
        self.shared.reset.notify_one();
    }

    pub fn state(&self) -> WsState {
        self.shared.state()
    }

    pub fn id(&self) -> usize {
        self.shared.id.load(Ordering::Relaxed)
    }

    pub fn set_id(&self, id: usize) {
        self.shared.id.store(id, Ordering::Relaxed);
    }

    pub fn heartbeat_age(&self) -> Duration {
        self.shared.heartbeat_age()
    }

    /// Aborts the supervisor tasks. Used on teardown; `close()` is the
    /// cooperative path.
    pub fn shutdown(&self) {
        self.shared.keep_alive.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn connect_loop(shared: Arc<WsShared>) {
    loop {
        if !shared.keep_alive.load(Ordering::SeqCst) {
            shared.set_state(WsState::Terminated);
            shared.reopen.notified().await;
            continue;
        }
        // Respect an active flood cooldown before dialing again.
        let wait = {
            let until = shared.flood_until.lock().unwrap();
            until.and_then(|t| t.checked_duration_since(Instant::now()))
        };
        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }

        shared.set_state(WsState::Connecting);
        let url = shared.url.resolve();
        info!(
            "[websocket:{}] connecting to {}",
            shared.id.load(Ordering::Relaxed),
            url
        );
        match dial(&shared, &url).await {
            Ok(stream) => run_connection(&shared, stream).await,
            Err(e) => {
                shared.set_state(WsState::Error);
                shared.note_transport_error(&e);
            }
        }
        tokio::time::sleep(shared.config.reconnect_delay).await;
    }
}

async fn dial(
    shared: &Arc<WsShared>,
    url: &str,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, String> {
    use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};

    let mut request = url.into_client_request().map_err(|e| e.to_string())?;
    for (name, value) in &shared.headers {
        let name: HeaderName = name.parse().map_err(|_| "bad header name".to_string())?;
        let value: HeaderValue = value.parse().map_err(|_| "bad header value".to_string())?;
        request.headers_mut().insert(name, value);
    }
    let (stream, _) = connect_async(request).await.map_err(|e| e.to_string())?;
    Ok(stream)
}

async fn run_connection(shared: &Arc<WsShared>, stream: WebSocketStream<MaybeTlsStream<TcpStream>>) {
    let (sink, mut read) = stream.split();
    *shared.writer.lock().await = Some(sink);
    shared.error_count.store(0, Ordering::SeqCst);
    shared.touch_heartbeat();

    shared.set_state(WsState::Subscribing);
    for sub in &shared.subs {
        tokio::time::sleep(shared.config.subscribe_spacing).await;
        shared.send_value(&sub.render()).await;
    }
    shared.set_state(WsState::Live);

    loop {
        tokio::select! {
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    shared.touch_heartbeat();
                    shared.deliver(&text);
                }
                Some(Ok(Message::Binary(bytes))) => {
                    shared.touch_heartbeat();
                    if let Ok(text) = String::from_utf8(bytes) {
                        shared.deliver(&text);
                    }
                }
                // Transport pings count as heartbeats.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => shared.touch_heartbeat(),
                Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    shared.set_state(WsState::Error);
                    shared.note_transport_error(&e.to_string());
                    break;
                }
            },
            _ = shared.reset.notified() => {
                debug!("[websocket:{}] reset requested", shared.id.load(Ordering::Relaxed));
                break;
            }
        }
    }

    *shared.writer.lock().await = None;
    if shared.keep_alive.load(Ordering::SeqCst) {
        if shared.state() != WsState::Stalled {
            shared.set_state(WsState::Closed);
        }
    } else {
        shared.set_state(WsState::Terminated);
    }
    info!("[websocket:{}] closed", shared.id.load(Ordering::Relaxed));
    shared.deliver("{\"error\":\"closed\"}");
}

async fn heartbeat_loop(shared: Arc<WsShared>) {
    loop {
        tokio::time::sleep(shared.config.heartbeat_interval).await;
        let state = shared.state();
        let live = matches!(state, WsState::Live | WsState::Subscribing);
        if live && shared.heartbeat_age() > shared.config.stall_threshold {
            warn!(
                "[websocket:{}] stalled, no message for {:?}",
                shared.id.load(Ordering::Relaxed),
                shared.heartbeat_age()
            );
            shared.set_state(WsState::Stalled);
            shared.reset.notify_one();
        }
        if shared.error_count.load(Ordering::SeqCst) >= shared.config.max_send_errors {
            warn!(
                "[websocket:{}] too many send errors, reconnecting",
                shared.id.load(Ordering::Relaxed)
            );
            shared.error_count.store(0, Ordering::SeqCst);
            if live {
                shared.reset.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    fn test_config() -> WsConfig {
        WsConfig {
            subscribe_spacing: Duration::from_millis(10),
            reconnect_delay: Duration::from_millis(50),
            heartbeat_interval: Duration::from_millis(50),
            ..WsConfig::default()
        }
    }

    /// Accepts one websocket client, records what it sends, pushes one
    /// message, then hangs up.
    async fn serve_once(listener: TcpListener, received: Arc<Mutex<Vec<String>>>) {
        let (stream, _) = match listener.accept().await {
            Ok(x) => x,
            Err(_) => return,
        };
        let mut ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(_) => return,
        };
        let _ = ws.send(Message::Text("{\"hello\":1}".into())).await;
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                received.lock().unwrap().push(text.clone());
                if text.contains("last") {
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn subscribes_delivers_and_reports_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let server = tokio::spawn(serve_once(listener, received.clone()));

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = seen.clone();
        let handler: MessageHandler = Arc::new(move |raw| {
            seen_in_handler.lock().unwrap().push(raw.to_string());
        });

        let supervisor = ConnectionSupervisor::builder(format!("ws://{}", addr))
            .handler(handler)
            .subscriptions(vec![
                SubscriptionPayload::Literal(serde_json::json!({"subscribe": "trades"})),
                SubscriptionPayload::Deferred(Arc::new(|| serde_json::json!({"last": true}))),
            ])
            .config(test_config())
            .spawn();

        let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
        // Give the read loop a beat to observe the hangup.
        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.close();

        let sent = received.lock().unwrap().clone();
        assert_eq!(sent.len(), 2, "server saw both subscription payloads");
        assert!(sent[0].contains("subscribe"));
        assert!(sent[1].contains("last"));

        let seen = seen.lock().unwrap().clone();
        assert!(seen.iter().any(|m| m.contains("hello")));
        assert!(
            seen.iter().any(|m| m == "{\"error\":\"closed\"}"),
            "synthetic closed marker delivered"
        );
        supervisor.shutdown();
    }

    #[tokio::test]
    async fn reconnects_after_server_hangup() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let server_connections = connections.clone();
        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let (stream, _) = match listener.accept().await {
                    Ok(x) => x,
                    Err(_) => return,
                };
                if tokio_tungstenite::accept_async(stream).await.is_ok() {
                    server_connections.fetch_add(1, Ordering::SeqCst);
                }
                // Dropping the stream hangs up on the client.
            }
        });

        let handler: MessageHandler = Arc::new(|_| {});
        let supervisor = ConnectionSupervisor::builder(format!("ws://{}", addr))
            .handler(handler)
            .config(test_config())
            .spawn();

        let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
        assert_eq!(connections.load(Ordering::SeqCst), 2, "client reconnected");
        supervisor.shutdown();
    }

    #[tokio::test]
    async fn rate_limit_error_mutes_sends() {
        let handler: MessageHandler = Arc::new(|_| {});
        let shared = Arc::new(WsShared {
            url: UrlSource::from("ws://unused"),
            headers: Vec::new(),
            subs: Vec::new(),
            handler: Some(handler),
            race_handler: None,
            config: WsConfig::default(),
            id: AtomicUsize::new(0),
            keep_alive: AtomicBool::new(true),
            state: Mutex::new(WsState::Init),
            last_heartbeat: Mutex::new(Instant::now()),
            error_count: AtomicU32::new(0),
            flood_until: Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            reopen: Notify::new(),
            reset: Notify::new(),
        });
        assert!(!shared.flood_active());
        shared.note_transport_error("HTTP 429 Too Many Requests");
        assert!(shared.flood_active());
        assert!(!shared.send_value(&serde_json::json!({"x": 1})).await);
    }
}
