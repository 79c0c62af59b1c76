//! Redundant-connection race selector.
//!
//! Runs several supervisors against the same logical feed and forwards only
//! the freshest message per class: messages carrying an embedded event
//! timestamp win by strictly exceeding the highest timestamp forwarded so
//! far; everything else passes only when it arrived on the current "hot"
//! connection. Connections score +1 per forwarded message; every cleanup
//! interval the best scorer becomes hot and the worst is replaced with a
//! fresh connection, bounded by a lifetime creation cap that a long-period
//! warmup resets.

use crate::transport::websocket::{
    ConnectionSupervisor, MessageHandler, RaceHandler, SubscriptionPayload, UrlSource, WsConfig,
};
use log::info;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// Extracts the embedded event timestamp from a raw message, or `None` for
/// message classes that are not latency-critical. Injected by the venue
/// adapter so the selector never parses venue payloads itself.
pub type TimestampExtractor = Arc<dyn Fn(&str) -> Option<f64> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RaceConfig {
    /// Concurrent connections in the pool.
    pub pool_size: usize,
    /// Lifetime cap on connections ever created.
    pub max_created: usize,
    /// Scoring window; hot/cold selection happens at this cadence.
    pub cleanup_interval: Duration,
    /// Restores the creation budget at this cadence.
    pub warmup_interval: Duration,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            max_created: 10,
            cleanup_interval: Duration::from_secs(60),
            warmup_interval: Duration::from_secs(4 * 60 * 60),
        }
    }
}

/// Pure arbitration state: decides, per message, whether to forward, and
/// periodically which connection to recycle.
pub struct RaceBoard {
    scores: Vec<u64>,
    hot: usize,
    last_timestamp: f64,
    created: usize,
    config: RaceConfig,
    last_cleanup: Instant,
    last_warmup: Instant,
}

impl RaceBoard {
    pub fn new(config: RaceConfig) -> Self {
        let now = Instant::now();
        Self {
            scores: vec![0; config.pool_size],
            hot: 0,
            last_timestamp: 0.0,
            created: config.pool_size,
            config,
            last_cleanup: now,
            last_warmup: now,
        }
    }

    pub fn hot(&self) -> usize {
        self.hot
    }

    pub fn scores(&self) -> &[u64] {
        &self.scores
    }

    /// Decides whether a message from `ws_id` is forwarded. `timestamp` is
    /// the embedded event timestamp for latency-critical classes, `None`
    /// otherwise.
    pub fn offer(&mut self, ws_id: usize, timestamp: Option<f64>) -> bool {
        match timestamp {
            Some(ts) if ts > self.last_timestamp => {
                self.last_timestamp = ts;
                if let Some(score) = self.scores.get_mut(ws_id) {
                    *score += 1;
                }
                true
            }
            // Stale or duplicate: a faster connection already delivered it.
            Some(_) => false,
            None => ws_id == self.hot,
        }
    }

    /// Periodic upkeep. Returns the index of the connection to recycle, if
    /// any. Scores reset each cleanup window.
    pub fn maintenance(&mut self, now: Instant) -> Option<usize> {
        if now.duration_since(self.last_warmup) > self.config.warmup_interval {
            self.last_warmup = now;
            self.created = self.config.pool_size;
        }
        if now.duration_since(self.last_cleanup) <= self.config.cleanup_interval {
            return None;
        }
        self.last_cleanup = now;

        let mut hot = self.hot;
        let mut cold = 0;
        let mut highest = 0u64;
        let mut lowest = u64::MAX;
        for (i, score) in self.scores.iter().enumerate() {
            if *score > highest {
                highest = *score;
                hot = i;
            }
            if *score < lowest {
                lowest = *score;
                cold = i;
            }
        }
        self.hot = hot;
        for score in &mut self.scores {
            *score = 0;
        }

        if self.created < self.config.max_created {
            self.created += 1;
            Some(cold)
        } else {
            None
        }
    }
}

struct RaceShared {
    url: UrlSource,
    subs: Vec<SubscriptionPayload>,
    ws_config: WsConfig,
    handler: MessageHandler,
    extract: TimestampExtractor,
    board: Mutex<RaceBoard>,
    sockets: Mutex<Vec<ConnectionSupervisor>>,
}

impl RaceShared {
    fn dispatch(self: &Arc<Self>, raw: &str, ws_id: usize) {
        let timestamp = (self.extract)(raw);
        let forward = self.board.lock().unwrap().offer(ws_id, timestamp);
        if forward {
            (self.handler)(raw);
        }

        let recycle = self.board.lock().unwrap().maintenance(Instant::now());
        if let Some(cold) = recycle {
            info!("[hot] recycling slowest connection {}", cold);
            let replacement = make_socket(self, cold);
            let mut sockets = self.sockets.lock().unwrap();
            if let Some(old) = sockets.get(cold) {
                old.close();
                old.shutdown();
            }
            if cold < sockets.len() {
                sockets[cold] = replacement;
            }
        }
    }
}

fn make_socket(shared: &Arc<RaceShared>, id: usize) -> ConnectionSupervisor {
    let weak: Weak<RaceShared> = Arc::downgrade(shared);
    let race_handler: RaceHandler = Arc::new(move |raw, ws_id| {
        if let Some(shared) = weak.upgrade() {
            shared.dispatch(raw, ws_id);
        }
    });
    ConnectionSupervisor::builder(shared.url.clone())
        .race_handler(race_handler)
        .subscriptions(shared.subs.clone())
        .config(shared.ws_config.clone())
        .id(id)
        .spawn()
}

/// Owns a pool of racing supervisors for one logical subscription.
pub struct FeedRaceSelector {
    shared: Arc<RaceShared>,
}

impl FeedRaceSelector {
    /// Spawns the pool. Must be called inside a tokio runtime.
    pub fn spawn(
        url: impl Into<UrlSource>,
        handler: MessageHandler,
        extract: TimestampExtractor,
        subs: Vec<SubscriptionPayload>,
        config: RaceConfig,
        ws_config: WsConfig,
    ) -> Self {
        let pool_size = config.pool_size.max(1);
        let shared = Arc::new(RaceShared {
            url: url.into(),
            subs,
            ws_config,
            handler,
            extract,
            board: Mutex::new(RaceBoard::new(RaceConfig {
                pool_size,
                ..config
            })),
            sockets: Mutex::new(Vec::new()),
        });
        for id in 0..pool_size {
            let socket = make_socket(&shared, id);
            shared.sockets.lock().unwrap().push(socket);
        }
        Self { shared }
    }

    /// Closes every pooled connection; terminal.
    pub fn close(&self) {
        for socket in self.shared.sockets.lock().unwrap().iter() {
            socket.close();
            socket.shutdown();
        }
    }

    pub fn hot_connection(&self) -> usize {
        self.shared.board.lock().unwrap().hot()
    }
}

impl Drop for FeedRaceSelector {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::SinkExt;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::protocol::Message;

    fn board(pool: usize) -> RaceBoard {
        RaceBoard::new(RaceConfig {
            pool_size: pool,
            ..RaceConfig::default()
        })
    }

    #[test]
    fn freshest_timestamp_wins_and_duplicates_drop() {
        let mut board = board(2);
        // Seed the tape.
        assert!(board.offer(0, Some(100.0)));
        // The same print arriving on the other connection is a duplicate.
        assert!(!board.offer(1, Some(100.0)));
        // A newer print forwards exactly once, whichever connection is first.
        assert!(board.offer(1, Some(101.0)));
        assert!(!board.offer(0, Some(101.0)));
        // Late stale print never forwards.
        assert!(!board.offer(0, Some(100.5)));
        assert_eq!(board.scores(), &[1, 1]);
    }

    #[test]
    fn untimestamped_messages_pass_only_on_the_hot_connection() {
        let mut board = board(3);
        assert!(board.offer(0, None), "initial hot connection is 0");
        assert!(!board.offer(1, None));
        assert!(!board.offer(2, None));
    }

    #[test]
    fn cleanup_promotes_best_scorer_and_recycles_worst() {
        let mut board = board(3);
        board.offer(1, Some(1.0));
        board.offer(1, Some(2.0));
        board.offer(2, Some(3.0));

        let later = Instant::now() + Duration::from_secs(61);
        let recycled = board.maintenance(later);
        assert_eq!(recycled, Some(0), "zero-score connection is recycled");
        assert_eq!(board.hot(), 1);
        assert_eq!(board.scores(), &[0, 0, 0], "scores reset each window");

        // Before the next window elapses nothing happens.
        assert_eq!(board.maintenance(later + Duration::from_secs(1)), None);
    }

    #[test]
    fn recycling_stops_at_the_creation_cap_until_warmup() {
        let mut board = RaceBoard::new(RaceConfig {
            pool_size: 2,
            max_created: 3,
            cleanup_interval: Duration::from_secs(60),
            warmup_interval: Duration::from_secs(3600),
        });
        let mut now = Instant::now();

        now += Duration::from_secs(61);
        assert!(board.maintenance(now).is_some(), "budget allows one recycle");
        now += Duration::from_secs(61);
        assert_eq!(board.maintenance(now), None, "cap reached");

        // Warmup restores the budget.
        now += Duration::from_secs(3600);
        assert!(board.maintenance(now).is_some());
    }

    // Two pooled connections receive the same timestamped prints; each print
    // reaches the handler exactly once.
    #[tokio::test]
    async fn pool_forwards_each_print_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut connections = Vec::new();
            for _ in 0..2 {
                let (stream, _) = match listener.accept().await {
                    Ok(x) => x,
                    Err(_) => return,
                };
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    connections.push(ws);
                }
            }
            for ws in &mut connections {
                let _ = ws.send(Message::Text("{\"ts\":1.0}".into())).await;
                let _ = ws.send(Message::Text("{\"ts\":2.0}".into())).await;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let forwarded: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = forwarded.clone();
        let handler: MessageHandler = Arc::new(move |raw| {
            sink.lock().unwrap().push(raw.to_string());
        });
        let extract: TimestampExtractor = Arc::new(|raw| {
            serde_json::from_str::<serde_json::Value>(raw)
                .ok()
                .and_then(|v| v.get("ts").and_then(|t| t.as_f64()))
        });

        let selector = FeedRaceSelector::spawn(
            format!("ws://{}", addr),
            handler,
            extract,
            Vec::new(),
            RaceConfig {
                pool_size: 2,
                ..RaceConfig::default()
            },
            WsConfig {
                reconnect_delay: Duration::from_millis(50),
                ..WsConfig::default()
            },
        );

        let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
        selector.close();

        let prints: Vec<String> = forwarded
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.contains("ts"))
            .cloned()
            .collect();
        assert_eq!(prints.len(), 2, "duplicates were absorbed: {:?}", prints);
        assert!(prints[0].contains("1.0") || prints[0].contains("1"));
        assert!(prints[1].contains('2'));
    }
}
