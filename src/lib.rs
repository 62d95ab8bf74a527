//! Core of an automated trading client for derivatives exchanges.
//!
//! Connects to Binance USDⓈ-M Futures and BitMEX over signed REST and
//! streaming websockets, normalizes their payloads into one canonical model,
//! and runs trading strategies that open, monitor and close positions
//! automatically. The GUI, workspace persistence and process bootstrap are
//! external collaborators; they consume this crate through the accessors on
//! [`exchange_apis::Connector`] and the row types in [`workspace`].

pub mod candles;
pub mod config;
pub mod exchange_apis;
pub mod models;
pub mod strategies;
pub mod utils;
pub mod workspace;

/// Fixed delay between websocket reconnection attempts.
pub static RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(2);
/// Cadence of the order-fill confirmation poll.
pub static ORDER_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);
/// Fill polls give up after this many attempts (30 min at the 2s cadence).
pub static MAX_FILL_POLL_ATTEMPTS: u32 = 900;
