//! Streaming feed runtime: one long-lived task per exchange owning the
//! websocket, reconnecting with a fixed delay, re-issuing subscriptions after
//! every drop and forwarding decoded events to the connector's event loop.
//! One malformed frame is logged and skipped, never tears the connection down.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::{
	sync::{mpsc, watch},
	task::JoinSet,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use super::{ApiResult, ExchangeName};
use crate::RECONNECT_DELAY;

/// Market-data channels a caller can subscribe a symbol to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Channel {
	/// Best bid/ask updates.
	BookTicker,
	/// Raw trade ticks feeding the candle aggregator.
	Trades,
}

/// Connection lifecycle, published over a watch channel for the UI.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnState {
	#[default]
	Disconnected,
	Connecting,
	Connected,
}

/// Exchange frames normalized into the canonical vocabulary.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
	BookTicker { symbol: String, bid: f64, ask: f64 },
	/// Bulk per-instrument snapshot row; either side may be absent.
	InstrumentPartial { symbol: String, bid: Option<f64>, ask: Option<f64> },
	Trade { symbol: String, price: f64, size: f64, timestamp: i64 },
}

#[derive(Clone, Debug)]
pub enum FeedCommand {
	Subscribe { symbol: String, channel: Channel },
	Unsubscribe { symbol: String, channel: Channel },
}

/// Exchange-specific half of the feed: where to connect, how topics and
/// control frames are spelled, and how inbound frames decode.
pub trait StreamProtocol: Send + Sync {
	fn exchange(&self) -> ExchangeName;

	fn ws_url(&self) -> String;

	/// Concrete topic string for a (symbol, channel) pair. Idempotence is
	/// enforced on the returned string, so symbol-independent topics (BitMEX)
	/// naturally collapse.
	fn topic(&self, symbol: &str, channel: Channel) -> String;

	fn subscribe_frame(&self, topics: &[String]) -> String;

	fn unsubscribe_frame(&self, topics: &[String]) -> String;

	/// Exchange-imposed cap on subscriptions per connection. Exceeding it is
	/// a caller error surfaced as a warning, not a hard failure.
	fn max_topics(&self) -> usize;

	/// Decodes one text frame into zero or more events. Control
	/// acknowledgements decode to an empty vec.
	fn decode(&self, raw: &str) -> ApiResult<Vec<StreamEvent>>;
}

/// Active subscriptions of one connection. Survives reconnects so the runtime
/// can re-issue every topic, and deduplicates so a double subscribe stays a
/// no-op.
#[derive(Clone, Debug)]
pub(crate) struct TopicSet {
	topics: Vec<String>,
	max: usize,
}
impl TopicSet {
	pub fn new(max: usize) -> Self {
		Self { topics: Vec::new(), max }
	}

	/// Records a topic. Returns false (and changes nothing) if already present.
	pub fn insert(&mut self, topic: String) -> bool {
		if self.topics.iter().any(|t| *t == topic) {
			return false;
		}
		self.topics.push(topic);
		if self.topics.len() > self.max {
			warn!("Subscription count {} exceeds the per-connection limit of {}; the exchange may drop the connection", self.topics.len(), self.max);
		}
		true
	}

	pub fn remove(&mut self, topic: &str) -> bool {
		let before = self.topics.len();
		self.topics.retain(|t| t != topic);
		self.topics.len() < before
	}

	pub fn all(&self) -> &[String] {
		&self.topics
	}
}

/// Caller-side handle to the feed runtime.
#[derive(Clone, Debug)]
pub struct FeedHandle {
	cmd_tx: mpsc::Sender<FeedCommand>,
	cancel_tx: Arc<watch::Sender<bool>>,
	state_rx: watch::Receiver<ConnState>,
}
impl FeedHandle {
	pub async fn subscribe(&self, symbol: &str, channel: Channel) {
		let cmd = FeedCommand::Subscribe { symbol: symbol.to_owned(), channel };
		if self.cmd_tx.send(cmd).await.is_err() {
			warn!("Feed runtime is gone, subscribe request dropped");
		}
	}

	pub async fn unsubscribe(&self, symbol: &str, channel: Channel) {
		let cmd = FeedCommand::Unsubscribe { symbol: symbol.to_owned(), channel };
		if self.cmd_tx.send(cmd).await.is_err() {
			warn!("Feed runtime is gone, unsubscribe request dropped");
		}
	}

	/// Sets the cancellation flag: the runtime closes the socket and stops
	/// reconnecting, permanently.
	pub fn shutdown(&self) {
		let _ = self.cancel_tx.send(true);
	}

	pub fn state(&self) -> ConnState {
		*self.state_rx.borrow()
	}
}

/// Spawns the reconnect loop onto `parent_js` and returns its handle.
pub fn spawn_feed(protocol: Arc<dyn StreamProtocol>, events_tx: mpsc::Sender<StreamEvent>, parent_js: &mut JoinSet<()>) -> FeedHandle {
	let (cmd_tx, cmd_rx) = mpsc::channel::<FeedCommand>(64);
	let (cancel_tx, cancel_rx) = watch::channel(false);
	let (state_tx, state_rx) = watch::channel(ConnState::Disconnected);

	parent_js.spawn(feed_runtime(protocol, cmd_rx, cancel_rx, state_tx, events_tx));

	FeedHandle {
		cmd_tx,
		cancel_tx: Arc::new(cancel_tx),
		state_rx,
	}
}

//LOOP: lives for the whole connector lifetime, unless cancelled.
#[instrument(skip_all, fields(exchange = %protocol.exchange()))]
async fn feed_runtime(
	protocol: Arc<dyn StreamProtocol>,
	mut cmd_rx: mpsc::Receiver<FeedCommand>,
	mut cancel_rx: watch::Receiver<bool>,
	state_tx: watch::Sender<ConnState>,
	events_tx: mpsc::Sender<StreamEvent>,
) {
	let mut topics = TopicSet::new(protocol.max_topics());

	loop {
		if *cancel_rx.borrow() {
			break;
		}
		let _ = state_tx.send(ConnState::Connecting);

		let ws = match connect_async(protocol.ws_url()).await {
			Ok((ws, _)) => ws,
			Err(e) => {
				warn!("{} websocket connection failed: {}", protocol.exchange(), e);
				let _ = state_tx.send(ConnState::Disconnected);
				tokio::time::sleep(RECONNECT_DELAY).await;
				continue;
			}
		};
		let _ = state_tx.send(ConnState::Connected);
		info!("{} websocket connection opened", protocol.exchange());
		let (mut write, mut read) = ws.split();

		// Re-issue everything recorded before the drop so subscribers never
		// have to detect and repair it themselves.
		if !topics.all().is_empty() {
			let frame = protocol.subscribe_frame(topics.all());
			info!("{}: resubscribing to {} topics", protocol.exchange(), topics.all().len());
			if let Err(e) = write.send(Message::Text(frame)).await {
				warn!("Websocket error while resubscribing: {e}");
			}
		}

		'connected: loop {
			tokio::select! {
				changed = cancel_rx.changed() => {
					if changed.is_err() || *cancel_rx.borrow() {
						let _ = write.send(Message::Close(None)).await;
						let _ = state_tx.send(ConnState::Disconnected);
						info!("{} websocket cancelled, runtime exiting", protocol.exchange());
						return;
					}
				}
				Some(cmd) = cmd_rx.recv() => match cmd {
					FeedCommand::Subscribe { symbol, channel } => {
						let topic = protocol.topic(&symbol, channel);
						if topics.insert(topic.clone()) {
							info!("{}: subscribing to {}", protocol.exchange(), topic);
							if let Err(e) = write.send(Message::Text(protocol.subscribe_frame(&[topic]))).await {
								// recorded in the set; the reconnect pass will re-issue it
								warn!("Websocket error while subscribing: {e}");
							}
						} else {
							debug!("Already subscribed to {topic}");
						}
					}
					FeedCommand::Unsubscribe { symbol, channel } => {
						let topic = protocol.topic(&symbol, channel);
						if topics.remove(&topic) {
							info!("{}: unsubscribing from {}", protocol.exchange(), topic);
							if let Err(e) = write.send(Message::Text(protocol.unsubscribe_frame(&[topic]))).await {
								warn!("Websocket error while unsubscribing: {e}");
							}
						}
					}
				},
				msg = read.next() => match msg {
					Some(Ok(Message::Text(raw))) => match protocol.decode(&raw) {
						Ok(events) =>
							for event in events {
								if events_tx.send(event).await.is_err() {
									debug!("Event receiver dropped, feed runtime exiting");
									return;
								}
							},
						Err(e) => warn!("Skipping malformed {} stream message: {}", protocol.exchange(), e),
					},
					Some(Ok(Message::Ping(payload))) => {
						let _ = write.send(Message::Pong(payload)).await;
					}
					Some(Ok(Message::Close(_))) | None => {
						warn!("{} websocket connection closed", protocol.exchange());
						break 'connected;
					}
					Some(Err(e)) => {
						error!("{} websocket connection error: {}", protocol.exchange(), e);
						break 'connected;
					}
					Some(Ok(_)) => {}
				}
			}
		}

		let _ = state_tx.send(ConnState::Disconnected);
		tokio::time::sleep(RECONNECT_DELAY).await;
	}

	let _ = state_tx.send(ConnState::Disconnected);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn double_subscribe_is_a_noop() {
		let mut set = TopicSet::new(200);
		assert!(set.insert("btcusdt@bookTicker".to_string()));
		assert!(!set.insert("btcusdt@bookTicker".to_string()));
		assert_eq!(set.all().len(), 1);
	}

	#[test]
	fn topics_survive_for_resubscription() {
		// the set is the reconnect source of truth: everything subscribed
		// before a drop is still there, exactly once, for the re-issue pass
		let mut set = TopicSet::new(200);
		set.insert("btcusdt@aggTrade".to_string());
		set.insert("btcusdt@bookTicker".to_string());
		set.insert("btcusdt@aggTrade".to_string());
		assert_eq!(set.all(), ["btcusdt@aggTrade".to_string(), "btcusdt@bookTicker".to_string()]);
	}

	#[test]
	fn remove_is_idempotent() {
		let mut set = TopicSet::new(200);
		set.insert("instrument".to_string());
		assert!(set.remove("instrument"));
		assert!(!set.remove("instrument"));
		assert!(set.all().is_empty());
	}
}
