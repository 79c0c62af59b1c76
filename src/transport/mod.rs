//! Venue-facing transports: REST client, self-reconnecting websocket
//! supervisor, and the redundant-feed race selector.

pub mod hot;
pub mod rest;
pub mod websocket;

pub use hot::{FeedRaceSelector, RaceBoard, RaceConfig, TimestampExtractor};
pub use rest::{RestClient, RestReply, TransportError};
pub use websocket::{
    ConnectionSupervisor, MessageHandler, RaceHandler, SubscriptionPayload, UrlSource, WsConfig,
    WsState,
};
