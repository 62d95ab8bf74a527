//! Exchange-facing side of the crate: one module per exchange implementing
//! the shared [`ExchangeRest`] capability set, the websocket feed runtime in
//! [`ws`], and the [`Connector`] composing both with the shared caches.

pub mod binance;
pub mod bitmex;
pub mod ws;

use std::{
	collections::HashMap,
	str::FromStr,
	sync::{Arc, RwLock},
};

use async_trait::async_trait;
use color_eyre::eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinSet};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use self::ws::{Channel, ConnState, FeedHandle, StreamEvent};
use crate::{
	models::{Balance, BidAsk, Candle, Contract, LogEntry, OrderKind, OrderStatus, Side, TimeInForce, Timeframe, Trade},
	strategies::{EngineContext, StrategyKind, StrategyRunner, StrategySpec, StrategyTable},
};

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum ExchangeName {
	#[default]
	Binance,
	Bitmex,
}
impl std::fmt::Display for ExchangeName {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ExchangeName::Binance => write!(f, "binance"),
			ExchangeName::Bitmex => write!(f, "bitmex"),
		}
	}
}
impl FromStr for ExchangeName {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"binance" | "binance_futures" => Ok(ExchangeName::Binance),
			"bitmex" => Ok(ExchangeName::Bitmex),
			_ => Err(format!("Unknown exchange: {s}")),
		}
	}
}

/// Classified failure of an exchange interaction. Everything here is
/// reported, never panicked on; `Transport` and most `Http` failures are
/// retryable, `Domain` means the caller should skip the current cycle.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
	#[error("connection error: {0}")]
	Transport(#[from] reqwest::Error),
	#[error("HTTP {status}: {body}")]
	Http { status: u16, body: String },
	#[error("unexpected response: {0}")]
	Decode(String),
	#[error("{0}")]
	Domain(String),
	#[error("invalid request: {0}")]
	InvalidRequest(String),
}
impl From<url::ParseError> for ApiError {
	fn from(e: url::ParseError) -> Self {
		ApiError::InvalidRequest(e.to_string())
	}
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Unrounded contract quantity committing `balance_pct` percent of the wallet
/// balance at the given reference price. Inverse contracts are denominated in
/// quote units, so the division flips into a multiplication.
pub fn raw_trade_size(wallet_balance: f64, balance_pct: f64, price: f64, inverse: bool) -> f64 {
	let committed = wallet_balance * balance_pct / 100.0;
	if inverse {
		committed * price
	} else {
		committed / price
	}
}

/// The uniform operation set every exchange implements, selected at
/// construction time and consumed through `Arc<dyn ExchangeRest>`. All
/// methods return canonical-model types; payload shapes stay private to the
/// exchange modules.
#[async_trait]
pub trait ExchangeRest: Send + Sync {
	fn exchange(&self) -> ExchangeName;

	async fn get_contracts(&self) -> ApiResult<HashMap<String, Arc<Contract>>>;

	async fn get_balances(&self) -> ApiResult<HashMap<String, Balance>>;

	async fn get_historical_candles(&self, contract: &Contract, timeframe: Timeframe) -> ApiResult<Vec<Candle>>;

	async fn get_bid_ask(&self, contract: &Contract) -> ApiResult<BidAsk>;

	/// Price and quantity are rounded to the contract's tick/lot size before
	/// submission; exchanges reject unrounded values.
	async fn place_order(&self, contract: &Contract, kind: OrderKind, quantity: f64, side: Side, price: Option<f64>, tif: Option<TimeInForce>) -> ApiResult<OrderStatus>;

	async fn cancel_order(&self, contract: &Contract, order_id: &str) -> ApiResult<OrderStatus>;

	async fn get_order_status(&self, contract: &Contract, order_id: &str) -> ApiResult<OrderStatus>;

	/// Converts a percentage-of-balance risk input into a contract quantity.
	/// Fails with a domain error when the contract's margin asset is absent
	/// from the account balances.
	async fn get_trade_size(&self, contract: &Contract, price: f64, balance_pct: f64) -> ApiResult<f64> {
		debug!("Computing trade size on {}", self.exchange());
		let balances = self.get_balances().await?;
		let balance = balances
			.get(&contract.margin_asset)
			.ok_or_else(|| ApiError::Domain(format!("{} balance not found on {}", contract.margin_asset, self.exchange())))?;

		let size = contract.round_quantity(raw_trade_size(balance.wallet_balance, balance_pct, price, contract.inverse));
		info!("Current {} balance = {}, trade size = {}", contract.margin_asset, balance.wallet_balance, size);
		Ok(size)
	}
}

/// One exchange connection: REST capability, streaming feed, and the shared
/// state both sides update. The UI and persistence collaborators only ever
/// touch the accessors below; the stream-side event loop is the sole writer
/// of the price cache from market data.
pub struct Connector {
	name: ExchangeName,
	rest: Arc<dyn ExchangeRest>,
	contracts: Arc<RwLock<HashMap<String, Arc<Contract>>>>,
	prices: Arc<RwLock<HashMap<String, BidAsk>>>,
	balances: Arc<RwLock<HashMap<String, Balance>>>,
	strategies: StrategyTable,
	logs: Arc<RwLock<Vec<LogEntry>>>,
	feed: FeedHandle,
}

impl Connector {
	/// Builds the REST client, loads the contract table and initial balances,
	/// and spawns the feed runtime plus the event loop onto `parent_js`.
	#[instrument(skip(keys, parent_js))]
	pub async fn init(name: ExchangeName, keys: &crate::config::ExchangeKeys, parent_js: &mut JoinSet<()>) -> Result<Self> {
		let rest: Arc<dyn ExchangeRest> = match name {
			ExchangeName::Binance => Arc::new(binance::BinanceRest::new(keys).wrap_err("Failed to build Binance REST client")?),
			ExchangeName::Bitmex => Arc::new(bitmex::BitmexRest::new(keys).wrap_err("Failed to build Bitmex REST client")?),
		};
		let protocol: Arc<dyn ws::StreamProtocol> = match name {
			ExchangeName::Binance => Arc::new(binance::BinanceStream::new(keys.testnet)),
			ExchangeName::Bitmex => Arc::new(bitmex::BitmexStream::new(keys.testnet)),
		};

		let contracts = rest.get_contracts().await.wrap_err_with(|| format!("Failed to load {name} contracts"))?;
		let balances = rest.get_balances().await.wrap_err_with(|| format!("Failed to load {name} balances"))?;

		let (events_tx, events_rx) = mpsc::channel::<StreamEvent>(256);
		let feed = ws::spawn_feed(protocol, events_tx, parent_js);

		let connector = Self {
			name,
			rest: rest.clone(),
			contracts: Arc::new(RwLock::new(contracts)),
			prices: Arc::new(RwLock::new(HashMap::new())),
			balances: Arc::new(RwLock::new(balances)),
			strategies: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
			logs: Arc::new(RwLock::new(Vec::new())),
			feed,
		};

		let ctx = EngineContext {
			rest,
			strategies: connector.strategies.clone(),
			logs: connector.logs.clone(),
		};
		let prices = connector.prices.clone();
		parent_js.spawn(event_loop(events_rx, prices, ctx));

		info!("{} connector successfully initialized", name);
		Ok(connector)
	}

	pub fn name(&self) -> ExchangeName {
		self.name
	}

	pub fn rest(&self) -> Arc<dyn ExchangeRest> {
		self.rest.clone()
	}

	//=============================================================================
	// Read accessors for the UI collaborator
	//=============================================================================

	pub fn contracts(&self) -> HashMap<String, Arc<Contract>> {
		self.contracts.read().unwrap().clone()
	}

	pub fn contract(&self, symbol: &str) -> Option<Arc<Contract>> {
		self.contracts.read().unwrap().get(symbol).cloned()
	}

	pub fn prices(&self) -> HashMap<String, BidAsk> {
		self.prices.read().unwrap().clone()
	}

	pub fn bid_ask(&self, symbol: &str) -> Option<BidAsk> {
		self.prices.read().unwrap().get(symbol).copied()
	}

	/// Last fetched balances; call [`Self::refresh_balances`] to update.
	pub fn balances(&self) -> HashMap<String, Balance> {
		self.balances.read().unwrap().clone()
	}

	pub fn connection_state(&self) -> ConnState {
		self.feed.state()
	}

	pub fn add_log(&self, message: impl Into<String>) {
		let message = message.into();
		info!("{message}");
		self.logs.write().unwrap().push(LogEntry::new(message));
	}

	/// Returns log entries not yet shown to the user and marks them displayed.
	pub fn pull_logs(&self) -> Vec<String> {
		let mut logs_lock = self.logs.write().unwrap();
		logs_lock
			.iter_mut()
			.filter(|e| !e.displayed)
			.map(|e| {
				e.displayed = true;
				e.message.clone()
			})
			.collect()
	}

	//=============================================================================
	// On-demand REST refreshes
	//=============================================================================

	#[instrument(skip(self))]
	pub async fn refresh_balances(&self) -> ApiResult<HashMap<String, Balance>> {
		let balances = self.rest.get_balances().await?;
		*self.balances.write().unwrap() = balances.clone();
		Ok(balances)
	}

	#[instrument(skip(self))]
	pub async fn refresh_bid_ask(&self, symbol: &str) -> ApiResult<BidAsk> {
		let contract = self.contract(symbol).ok_or_else(|| ApiError::Domain(format!("Unknown symbol: {symbol}")))?;
		let bid_ask = self.rest.get_bid_ask(&contract).await?;
		self.prices.write().unwrap().insert(symbol.to_owned(), bid_ask);
		Ok(bid_ask)
	}

	//=============================================================================
	// Watchlist and strategy lifecycle
	//=============================================================================

	pub async fn watch_symbol(&self, symbol: &str) {
		self.feed.subscribe(symbol, Channel::BookTicker).await;
	}

	pub async fn unwatch_symbol(&self, symbol: &str) {
		self.feed.unsubscribe(symbol, Channel::BookTicker).await;
	}

	/// Fetches the candle history, subscribes the symbol's market-data topics
	/// and activates a new strategy instance. Returns its id.
	#[instrument(skip(self, spec, kind), fields(symbol = %spec.contract.symbol))]
	pub async fn start_strategy(&self, spec: StrategySpec, kind: StrategyKind) -> Result<Uuid> {
		let history = self
			.rest
			.get_historical_candles(&spec.contract, spec.timeframe)
			.await
			.wrap_err_with(|| format!("Failed to load {} candle history", spec.contract.symbol))?;

		self.feed.subscribe(&spec.contract.symbol, Channel::Trades).await;
		self.feed.subscribe(&spec.contract.symbol, Channel::BookTicker).await;

		let id = Uuid::new_v4();
		let strategy_name = kind.name();
		let runner = StrategyRunner::new(id, spec.clone(), kind, history);
		self.strategies.lock().await.insert(id, runner);
		self.add_log(format!("{} strategy activated on {} {} ({})", strategy_name, spec.contract.symbol, spec.timeframe, self.name));
		Ok(id)
	}

	/// Deactivates the strategy: no further signal evaluation, and any
	/// outstanding fill poll for its pending entries terminates. The runner
	/// and its trade history stay readable.
	pub async fn stop_strategy(&self, id: Uuid) -> bool {
		let strategies_lock = self.strategies.lock().await;
		match strategies_lock.get(&id) {
			Some(runner) => {
				runner.deactivate();
				self.add_log(format!("{} strategy deactivated on {}", runner.kind().name(), runner.symbol()));
				true
			}
			None => {
				warn!("Attempted to stop unknown strategy {id}");
				false
			}
		}
	}

	pub async fn strategy_ids(&self) -> Vec<Uuid> {
		self.strategies.lock().await.keys().copied().collect()
	}

	/// Snapshot of one strategy's trade list.
	pub async fn strategy_trades(&self, id: Uuid) -> Option<Vec<Trade>> {
		self.strategies.lock().await.get(&id).map(|r| r.trades().to_vec())
	}

	/// Stops the feed runtime permanently. Strategies stop receiving ticks;
	/// their state stays readable.
	pub fn shutdown(&self) {
		self.feed.shutdown();
	}
}

/// Consumes decoded stream events: updates the price cache (sole stream-side
/// writer) and drives per-symbol strategy logic.
async fn event_loop(mut events_rx: mpsc::Receiver<StreamEvent>, prices: Arc<RwLock<HashMap<String, BidAsk>>>, ctx: EngineContext) {
	while let Some(event) = events_rx.recv().await {
		match event {
			StreamEvent::BookTicker { symbol, bid, ask } => {
				{
					let mut prices_lock = prices.write().unwrap();
					prices_lock.insert(symbol.clone(), BidAsk { bid: Some(bid), ask: Some(ask) });
				}
				let mut strategies_lock = ctx.strategies.lock().await;
				for runner in strategies_lock.values_mut().filter(|r| r.symbol() == symbol) {
					runner.on_book_ticker(bid, ask);
				}
			}
			StreamEvent::InstrumentPartial { symbol, bid, ask } => {
				let merged = {
					let mut prices_lock = prices.write().unwrap();
					let entry = prices_lock.entry(symbol.clone()).or_default();
					if bid.is_some() {
						entry.bid = bid;
					}
					if ask.is_some() {
						entry.ask = ask;
					}
					*entry
				};
				if let (Some(bid), Some(ask)) = (merged.bid, merged.ask) {
					let mut strategies_lock = ctx.strategies.lock().await;
					for runner in strategies_lock.values_mut().filter(|r| r.symbol() == symbol) {
						runner.on_book_ticker(bid, ask);
					}
				}
			}
			StreamEvent::Trade { symbol, price, size, timestamp } => {
				let mut strategies_lock = ctx.strategies.lock().await;
				for runner in strategies_lock.values_mut().filter(|r| r.symbol() == symbol) {
					runner.on_tick(price, size, timestamp, &ctx).await;
				}
			}
		}
	}
	debug!("Stream event channel closed, event loop exiting");
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn trade_size_formula() {
		// balance=1000 USDT, 10% at price 50 => 2.0 before lot rounding
		assert_eq!(raw_trade_size(1000.0, 10.0, 50.0, false), 2.0);
		// inverse: quantity is denominated in quote-units contracts
		assert_eq!(raw_trade_size(1.0, 10.0, 100.0, true), 10.0);
	}

	#[test]
	fn exchange_name_roundtrip() {
		assert_eq!("binance".parse::<ExchangeName>().unwrap(), ExchangeName::Binance);
		assert_eq!("Bitmex".parse::<ExchangeName>().unwrap(), ExchangeName::Bitmex);
		assert!("kraken".parse::<ExchangeName>().is_err());
		assert_eq!(ExchangeName::Binance.to_string(), "binance");
	}
}
