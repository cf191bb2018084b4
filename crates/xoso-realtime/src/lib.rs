//! Realtime message client for the lottery community backend: one shared
//! socket connection, room membership that survives reconnects, and
//! per-room message logs reconciled against server broadcasts.

pub mod api;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod profanity;
pub mod rooms;
pub mod schedule;
pub mod session;
pub mod store;

pub use api::{HttpApi, MessageApi};
pub use config::ClientConfig;
pub use connection::{ConnectionEvent, ConnectionManager, Connector, DisconnectReason, WsConnector};
pub use dispatcher::EventDispatcher;
pub use error::ClientError;
pub use rooms::RoomTracker;
pub use session::RoomSession;
pub use store::MessageStore;
