//! Strategy engine: signal evaluation over the candle series and the position
//! lifecycle (entry, asynchronous fill confirmation, TP/SL exit). Each
//! strategy instance holds at most one open trade; signals arriving while a
//! position is open, or after deactivation, are ignored.

pub mod breakout;
pub mod technical;

use std::{
	collections::HashMap,
	str::FromStr,
	sync::{Arc, RwLock},
};

pub use breakout::BreakoutParams;
use chrono::Utc;
pub use technical::TechnicalParams;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
	candles::{CandleSeries, TickResult},
	exchange_apis::{ExchangeName, ExchangeRest},
	models::{Candle, Contract, LogEntry, OrderKind, OrderState, Side, Timeframe, Trade},
	MAX_FILL_POLL_ATTEMPTS, ORDER_POLL_INTERVAL,
};

/// Configuration common to every strategy variant.
#[derive(Clone, Debug, derive_new::new)]
pub struct StrategySpec {
	pub contract: Arc<Contract>,
	pub exchange: ExchangeName,
	pub timeframe: Timeframe,
	/// Percentage of the margin-asset wallet balance committed per entry.
	pub balance_pct: f64,
	/// Exit thresholds, percentage offsets from the entry price.
	pub take_profit: f64,
	pub stop_loss: f64,
}

/// The signal variant: strategies differ only in their signal function.
#[derive(Clone, Debug, PartialEq)]
pub enum StrategyKind {
	/// RSI + MACD agreement, evaluated on bar close.
	Technical(TechnicalParams),
	/// Breakout with volume confirmation, evaluated on every tick.
	Breakout(BreakoutParams),
}
impl StrategyKind {
	pub fn name(&self) -> &'static str {
		match self {
			StrategyKind::Technical(_) => "Technical",
			StrategyKind::Breakout(_) => "Breakout",
		}
	}
}
impl std::fmt::Display for StrategyKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			StrategyKind::Technical(params) => write!(f, "technical:{params}"),
			StrategyKind::Breakout(params) => write!(f, "breakout:{params}"),
		}
	}
}
impl FromStr for StrategyKind {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let (name, params) = s.split_once(':').unwrap_or((s, ""));
		match name.to_lowercase().as_str() {
			"technical" => Ok(StrategyKind::Technical(params.parse()?)),
			"breakout" => Ok(StrategyKind::Breakout(params.parse()?)),
			_ => Err(format!("Unknown strategy: {s}")),
		}
	}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitReason {
	TakeProfit,
	StopLoss,
}
impl std::fmt::Display for ExitReason {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ExitReason::TakeProfit => write!(f, "Take profit"),
			ExitReason::StopLoss => write!(f, "Stop loss"),
		}
	}
}

/// Percentage-offset exit check against the entry price.
pub(crate) fn exit_reason(side: Side, entry: f64, take_profit: f64, stop_loss: f64, price: f64) -> Option<ExitReason> {
	match side {
		Side::Buy =>
			if price >= entry * (1.0 + take_profit / 100.0) {
				Some(ExitReason::TakeProfit)
			} else if price <= entry * (1.0 - stop_loss / 100.0) {
				Some(ExitReason::StopLoss)
			} else {
				None
			},
		Side::Sell =>
			if price <= entry * (1.0 - take_profit / 100.0) {
				Some(ExitReason::TakeProfit)
			} else if price >= entry * (1.0 + stop_loss / 100.0) {
				Some(ExitReason::StopLoss)
			} else {
				None
			},
	}
}

pub type StrategyTable = Arc<Mutex<HashMap<Uuid, StrategyRunner>>>;

/// Shared handles the engine needs while processing a tick: the REST
/// capability for orders, the strategy table for spawned fill polls, and the
/// connector's log list.
#[derive(Clone)]
pub struct EngineContext {
	pub rest: Arc<dyn ExchangeRest>,
	pub strategies: StrategyTable,
	pub logs: Arc<RwLock<Vec<LogEntry>>>,
}
impl EngineContext {
	pub(crate) fn add_log(&self, message: impl Into<String>) {
		push_log(&self.logs, message.into());
	}
}

fn push_log(logs: &RwLock<Vec<LogEntry>>, message: String) {
	info!("{message}");
	logs.write().unwrap().push(LogEntry::new(message));
}

/// One active strategy instance. Owned by the connector's strategy table;
/// only the stream-side event loop mutates it.
pub struct StrategyRunner {
	id: Uuid,
	spec: StrategySpec,
	kind: StrategyKind,
	series: CandleSeries,
	trades: Vec<Trade>,
	ongoing_position: bool,
	/// Doubles as the activation flag and the cancellation signal for fill polls.
	active_tx: watch::Sender<bool>,
}

impl StrategyRunner {
	pub fn new(id: Uuid, spec: StrategySpec, kind: StrategyKind, history: Vec<Candle>) -> Self {
		let (active_tx, _) = watch::channel(true);
		let series = CandleSeries::from_history(spec.timeframe, history);
		Self {
			id,
			spec,
			kind,
			series,
			trades: Vec::new(),
			ongoing_position: false,
			active_tx,
		}
	}

	pub fn id(&self) -> Uuid {
		self.id
	}

	pub fn spec(&self) -> &StrategySpec {
		&self.spec
	}

	pub fn kind(&self) -> &StrategyKind {
		&self.kind
	}

	pub fn symbol(&self) -> &str {
		&self.spec.contract.symbol
	}

	pub fn trades(&self) -> &[Trade] {
		&self.trades
	}

	pub fn series(&self) -> &CandleSeries {
		&self.series
	}

	pub fn has_open_position(&self) -> bool {
		self.ongoing_position
	}

	pub fn is_active(&self) -> bool {
		*self.active_tx.borrow()
	}

	/// Stops signal evaluation and cancels outstanding fill polls. Trades and
	/// series stay readable.
	pub fn deactivate(&self) {
		let _ = self.active_tx.send(false);
	}

	/// Best bid/ask moved: re-mark open positions.
	pub fn on_book_ticker(&mut self, bid: f64, ask: f64) {
		for trade in self.trades.iter_mut().filter(|t| t.is_open()) {
			trade.update_pnl(bid, ask);
		}
	}

	/// One trade tick: aggregate, evaluate the signal, and police TP/SL.
	pub async fn on_tick(&mut self, price: f64, size: f64, timestamp: i64, ctx: &EngineContext) {
		let result = self.series.update(price, size, timestamp);

		if self.is_active() && !self.ongoing_position {
			if let Some(side) = self.check_signal(result) {
				self.open_position(side, price, ctx).await;
			}
		}

		if self.ongoing_position {
			self.check_tp_sl(price, ctx).await;
		}
	}

	fn check_signal(&self, result: TickResult) -> Option<Side> {
		match &self.kind {
			StrategyKind::Technical(params) => match result {
				// bar-close strategy: only a freshly closed bar can produce a signal
				TickResult::NewCandle { .. } => technical::evaluate(params, &self.series.closed_closes()),
				TickResult::SameCandle => None,
			},
			StrategyKind::Breakout(params) => breakout::evaluate(params, self.series.candles()),
		}
	}

	#[instrument(skip(self, ctx), fields(symbol = %self.spec.contract.symbol))]
	async fn open_position(&mut self, side: Side, price: f64, ctx: &EngineContext) {
		let quantity = match ctx.rest.get_trade_size(&self.spec.contract, price, self.spec.balance_pct).await {
			Ok(q) if q > 0.0 => q,
			Ok(_) => {
				debug!("Trade size rounds to zero, skipping {side} signal");
				return;
			}
			Err(e) => {
				warn!("Failed to compute trade size: {e}");
				return;
			}
		};

		let status = match ctx.rest.place_order(&self.spec.contract, OrderKind::Market, quantity, side, None, None).await {
			Ok(s) => s,
			Err(e) => {
				ctx.add_log(format!("Error placing entry order on {}: {e}", self.symbol()));
				return;
			}
		};
		ctx.add_log(format!("{} strategy: {} {} {} @ market (order {})", self.kind.name(), side, quantity, self.symbol(), status.order_id));

		let mut trade = Trade::new(
			Utc::now().timestamp_millis(),
			self.spec.contract.clone(),
			self.kind.name().to_string(),
			side,
			status.order_id.clone(),
			None,
			quantity,
		);
		self.ongoing_position = true;

		match (status.status == OrderState::Filled, status.avg_price) {
			(true, Some(avg_price)) => {
				trade.confirm_entry(avg_price);
				ctx.add_log(format!("Entry price for {} confirmed at {}", self.symbol(), avg_price));
			}
			_ => {
				// confirmation is eventually consistent; poll until the exchange reports the fill
				tokio::spawn(poll_entry_fill(
					ctx.rest.clone(),
					ctx.strategies.clone(),
					ctx.logs.clone(),
					self.id,
					status.order_id,
					self.spec.contract.clone(),
					self.active_tx.subscribe(),
				));
			}
		}
		self.trades.push(trade);
	}

	async fn check_tp_sl(&mut self, price: f64, ctx: &EngineContext) {
		let Some(idx) = self.trades.iter().rposition(|t| t.is_open()) else {
			self.ongoing_position = false;
			return;
		};
		let (side, entry, quantity) = {
			let trade = &self.trades[idx];
			(trade.side, trade.entry_price, trade.quantity)
		};
		// a position whose entry is still unconfirmed has no exit thresholds yet
		let Some(entry) = entry else { return };
		let Some(reason) = exit_reason(side, entry, self.spec.take_profit, self.spec.stop_loss, price) else {
			return;
		};

		ctx.add_log(format!("{reason} hit for {} on {} at {price} (entry {entry})", self.kind.name(), self.symbol()));
		match ctx.rest.place_order(&self.spec.contract, OrderKind::Market, quantity, !side, None, None).await {
			Ok(status) => {
				self.trades[idx].close();
				self.ongoing_position = false;
				ctx.add_log(format!("Exit order {} placed for {} on {}", status.order_id, self.kind.name(), self.symbol()));
			}
			Err(e) => {
				// keep the position flagged open; the next tick retries the exit
				warn!("Failed to place exit order on {}: {e}", self.symbol());
			}
		}
	}

	/// Back-fills the entry price reported by the fill poll. No-op if the
	/// entry was already confirmed.
	pub(crate) fn confirm_entry(&mut self, entry_id: &str, price: f64) {
		if let Some(trade) = self.trades.iter_mut().find(|t| t.entry_id == entry_id) {
			if trade.confirm_entry(price) {
				info!("Entry price for order {} backfilled at {}", entry_id, price);
			}
		}
	}

	/// The entry order died unfilled: close the trade record and free the slot.
	pub(crate) fn abort_entry(&mut self, entry_id: &str) {
		if let Some(trade) = self.trades.iter_mut().find(|t| t.entry_id == entry_id && t.is_open()) {
			trade.close();
			self.ongoing_position = false;
			warn!("Entry order {} terminated unfilled; position slot freed", entry_id);
		}
	}
}

/// Polls order status on a fixed cadence until the entry fills, dies, the
/// strategy is deactivated, or the attempt budget runs out. Spawned off the
/// tick path so it never blocks stream processing.
#[instrument(skip_all, fields(%entry_id, symbol = %contract.symbol))]
pub(crate) async fn poll_entry_fill(
	rest: Arc<dyn ExchangeRest>,
	strategies: StrategyTable,
	logs: Arc<RwLock<Vec<LogEntry>>>,
	strategy_id: Uuid,
	entry_id: String,
	contract: Arc<Contract>,
	mut active_rx: watch::Receiver<bool>,
) {
	for attempt in 1..=MAX_FILL_POLL_ATTEMPTS {
		tokio::select! {
			_ = tokio::time::sleep(ORDER_POLL_INTERVAL) => {}
			changed = active_rx.changed() => {
				if changed.is_err() || !*active_rx.borrow() {
					debug!("Strategy deactivated, abandoning fill poll");
					return;
				}
			}
		}
		if !*active_rx.borrow() {
			debug!("Strategy deactivated, abandoning fill poll");
			return;
		}

		let status = match rest.get_order_status(&contract, &entry_id).await {
			Ok(s) => s,
			Err(e) => {
				warn!("Error polling order (attempt {attempt}): {e}");
				continue;
			}
		};

		match status.status {
			OrderState::Filled => match status.avg_price {
				Some(avg_price) => {
					{
						let mut strategies_lock = strategies.lock().await;
						if let Some(runner) = strategies_lock.get_mut(&strategy_id) {
							runner.confirm_entry(&entry_id, avg_price);
						}
					}
					push_log(&logs, format!("Order {entry_id} on {} filled at {avg_price}", contract.symbol));
					return;
				}
				None => {
					// filled with no execution price reported yet; poll again
					warn!("Order reports filled with zero executed quantity, polling again");
					continue;
				}
			},
			ref s if s.is_terminal_unfilled() => {
				{
					let mut strategies_lock = strategies.lock().await;
					if let Some(runner) = strategies_lock.get_mut(&strategy_id) {
						runner.abort_entry(&entry_id);
					}
				}
				push_log(&logs, format!("Order {entry_id} on {} ended {s} without filling", contract.symbol));
				return;
			}
			_ => {}
		}
	}
	warn!("Gave up polling order after {MAX_FILL_POLL_ATTEMPTS} attempts");
}

#[cfg(test)]
mod tests {
	use async_trait::async_trait;

	use super::*;
	use crate::{
		exchange_apis::{ApiError, ApiResult},
		models::{Balance, BidAsk, OrderStatus, TimeInForce},
	};

	fn contract() -> Arc<Contract> {
		Arc::new(Contract {
			symbol: "BTCUSDT".to_string(),
			base_asset: "BTC".to_string(),
			quote_asset: "USDT".to_string(),
			margin_asset: "USDT".to_string(),
			price_decimals: 2,
			quantity_decimals: 3,
			tick_size: 0.01,
			lot_size: 0.001,
			inverse: false,
			quanto: false,
			multiplier: 1.0,
		})
	}

	fn spec() -> StrategySpec {
		StrategySpec::new(contract(), ExchangeName::Binance, Timeframe::M1, 10.0, 2.0, 1.0)
	}

	/// Exchange double: fixed balance, orders fill at the configured price.
	struct MockRest {
		fill_price: Option<f64>,
		placed: std::sync::Mutex<Vec<(Side, f64)>>,
		poll_status: OrderStatus,
	}
	impl MockRest {
		fn filling_at(price: f64) -> Self {
			Self {
				fill_price: Some(price),
				placed: std::sync::Mutex::new(Vec::new()),
				poll_status: OrderStatus::default(),
			}
		}
	}

	#[async_trait]
	impl ExchangeRest for MockRest {
		fn exchange(&self) -> ExchangeName {
			ExchangeName::Binance
		}

		async fn get_contracts(&self) -> ApiResult<HashMap<String, Arc<Contract>>> {
			Ok(HashMap::new())
		}

		async fn get_balances(&self) -> ApiResult<HashMap<String, Balance>> {
			let mut balances = HashMap::new();
			balances.insert("USDT".to_string(), Balance::new(0.0, 0.0, 1000.0, 1000.0, 0.0));
			Ok(balances)
		}

		async fn get_historical_candles(&self, _contract: &Contract, _timeframe: Timeframe) -> ApiResult<Vec<Candle>> {
			Ok(Vec::new())
		}

		async fn get_bid_ask(&self, _contract: &Contract) -> ApiResult<BidAsk> {
			Ok(BidAsk::default())
		}

		async fn place_order(&self, _contract: &Contract, _kind: OrderKind, quantity: f64, side: Side, _price: Option<f64>, _tif: Option<TimeInForce>) -> ApiResult<OrderStatus> {
			self.placed.lock().unwrap().push((side, quantity));
			let (status, avg_price) = match self.fill_price {
				Some(price) => (OrderState::Filled, Some(price)),
				None => (OrderState::New, None),
			};
			Ok(OrderStatus::new("1".to_string(), status, avg_price, quantity))
		}

		async fn cancel_order(&self, _contract: &Contract, _order_id: &str) -> ApiResult<OrderStatus> {
			Err(ApiError::Domain("not supported by the mock".to_string()))
		}

		async fn get_order_status(&self, _contract: &Contract, _order_id: &str) -> ApiResult<OrderStatus> {
			Ok(self.poll_status.clone())
		}
	}

	fn ctx_with(rest: Arc<MockRest>) -> EngineContext {
		EngineContext {
			rest,
			strategies: Arc::new(Mutex::new(HashMap::new())),
			logs: Arc::new(RwLock::new(Vec::new())),
		}
	}

	fn breakout_runner() -> StrategyRunner {
		let history = vec![Candle::new(0, 100.0, 105.0, 99.0, 104.0, 50.0)];
		StrategyRunner::new(Uuid::new_v4(), spec(), StrategyKind::Breakout(BreakoutParams { min_volume: 0.0 }), history)
	}

	#[tokio::test]
	async fn breakout_entry_and_take_profit_exit() {
		let rest = Arc::new(MockRest::filling_at(106.0));
		let ctx = ctx_with(rest.clone());
		let mut runner = breakout_runner();

		// tick in the next bar, above the prior high: entry
		runner.on_tick(106.0, 5.0, 60_000, &ctx).await;
		assert!(runner.has_open_position());
		assert_eq!(runner.trades().len(), 1);
		assert_eq!(runner.trades()[0].entry_price, Some(106.0));
		assert_eq!(runner.trades()[0].side, Side::Buy);

		// 1000 USDT * 10% at price 106 = 0.943396.. -> lot-rounded
		let placed = rest.placed.lock().unwrap().clone();
		assert_eq!(placed, vec![(Side::Buy, 0.943)]);

		// take profit at +2%: 106 * 1.02 = 108.12
		runner.on_tick(108.2, 1.0, 61_000, &ctx).await;
		assert!(!runner.has_open_position());
		assert!(!runner.trades()[0].is_open());
		let placed = rest.placed.lock().unwrap().clone();
		assert_eq!(placed.len(), 2);
		assert_eq!(placed[1].0, Side::Sell);
	}

	#[tokio::test]
	async fn stop_loss_exits_short_positions() {
		let rest = Arc::new(MockRest::filling_at(98.0));
		let ctx = ctx_with(rest.clone());
		let mut runner = breakout_runner();

		// close below the prior low: short entry
		runner.on_tick(98.0, 5.0, 60_000, &ctx).await;
		assert_eq!(runner.trades()[0].side, Side::Sell);

		// stop loss at +1%: 98 * 1.01 = 98.98
		runner.on_tick(99.0, 1.0, 61_000, &ctx).await;
		assert!(!runner.has_open_position());
		assert_eq!(rest.placed.lock().unwrap().len(), 2);
	}

	#[tokio::test]
	async fn signals_ignored_while_position_open() {
		let rest = Arc::new(MockRest::filling_at(106.0));
		let ctx = ctx_with(rest.clone());
		let mut runner = breakout_runner();

		runner.on_tick(106.0, 5.0, 60_000, &ctx).await;
		// another breakout tick, but the slot is taken and no threshold is hit
		runner.on_tick(107.0, 5.0, 61_000, &ctx).await;
		assert_eq!(runner.trades().len(), 1);
		assert_eq!(rest.placed.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn deactivated_runner_places_no_orders() {
		let rest = Arc::new(MockRest::filling_at(106.0));
		let ctx = ctx_with(rest.clone());
		let mut runner = breakout_runner();

		runner.deactivate();
		runner.on_tick(106.0, 5.0, 60_000, &ctx).await;
		assert!(runner.trades().is_empty());
		assert!(rest.placed.lock().unwrap().is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn fill_poll_backfills_entry_price_once() {
		let mut rest = MockRest::filling_at(106.0);
		rest.poll_status = OrderStatus::new("7".to_string(), OrderState::Filled, Some(101.0), 1.0);
		let rest = Arc::new(rest);
		let ctx = ctx_with(rest.clone());

		let mut runner = breakout_runner();
		let id = runner.id();
		let active_rx = runner.active_tx.subscribe();
		runner.trades.push(Trade::new(0, contract(), "Breakout".to_string(), Side::Buy, "7".to_string(), None, 1.0));
		runner.ongoing_position = true;
		ctx.strategies.lock().await.insert(id, runner);

		poll_entry_fill(rest, ctx.strategies.clone(), ctx.logs.clone(), id, "7".to_string(), contract(), active_rx).await;

		let strategies_lock = ctx.strategies.lock().await;
		let runner = strategies_lock.get(&id).unwrap();
		assert_eq!(runner.trades()[0].entry_price, Some(101.0));
	}

	#[tokio::test(start_paused = true)]
	async fn fill_poll_stops_on_deactivation() {
		let mut rest = MockRest::filling_at(106.0);
		rest.poll_status = OrderStatus::new("7".to_string(), OrderState::New, None, 0.0);
		let rest = Arc::new(rest);
		let ctx = ctx_with(rest.clone());

		let runner = breakout_runner();
		let id = runner.id();
		let active_rx = runner.active_tx.subscribe();
		runner.deactivate();
		ctx.strategies.lock().await.insert(id, runner);

		// returns promptly instead of burning through the attempt budget
		poll_entry_fill(rest, ctx.strategies.clone(), ctx.logs.clone(), id, "7".to_string(), contract(), active_rx).await;
	}

	#[test]
	fn exit_thresholds_are_percentage_offsets() {
		// long, entry 100, tp 2%, sl 1%
		assert_eq!(exit_reason(Side::Buy, 100.0, 2.0, 1.0, 102.0), Some(ExitReason::TakeProfit));
		assert_eq!(exit_reason(Side::Buy, 100.0, 2.0, 1.0, 101.9), None);
		assert_eq!(exit_reason(Side::Buy, 100.0, 2.0, 1.0, 99.0), Some(ExitReason::StopLoss));
		// short mirrors
		assert_eq!(exit_reason(Side::Sell, 100.0, 2.0, 1.0, 98.0), Some(ExitReason::TakeProfit));
		assert_eq!(exit_reason(Side::Sell, 100.0, 2.0, 1.0, 101.0), Some(ExitReason::StopLoss));
		assert_eq!(exit_reason(Side::Sell, 100.0, 2.0, 1.0, 100.5), None);
	}

	#[test]
	fn strategy_kind_roundtrip() {
		let kind: StrategyKind = "technical:r14-f12-s26-g9".parse().unwrap();
		assert_eq!(kind, StrategyKind::Technical(TechnicalParams::default()));
		assert_eq!(kind.to_string(), "technical:r14-f12-s26-g9");
		assert_eq!(kind.name(), "Technical");

		let kind: StrategyKind = "breakout:v250".parse().unwrap();
		assert_eq!(kind, StrategyKind::Breakout(BreakoutParams { min_volume: 250.0 }));
		assert_eq!(kind.name(), "Breakout");

		assert!("martingale:x2".parse::<StrategyKind>().is_err());
	}
}
