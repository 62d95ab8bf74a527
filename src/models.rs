//! Canonical data model shared across exchanges. Everything the rest of the
//! crate consumes is expressed in these types; exchange-specific payload
//! shapes never leak past the connector modules.

use std::{str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::utils::round_to_step;

/// Direction of an order or a position. `Buy` holds long exposure, `Sell` short.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Side {
	#[default]
	Buy,
	Sell,
}
impl Side {
	pub fn sign(&self) -> f64 {
		match self {
			Side::Buy => 1.0,
			Side::Sell => -1.0,
		}
	}
}
impl std::ops::Not for Side {
	type Output = Side;

	fn not(self) -> Self::Output {
		match self {
			Side::Buy => Side::Sell,
			Side::Sell => Side::Buy,
		}
	}
}
impl std::fmt::Display for Side {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Side::Buy => write!(f, "Buy"),
			Side::Sell => write!(f, "Sell"),
		}
	}
}
impl FromStr for Side {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"buy" | "long" => Ok(Side::Buy),
			"sell" | "short" => Ok(Side::Sell),
			_ => Err(format!("Unknown side: {s}")),
		}
	}
}

/// Bar durations the engine aggregates on.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Timeframe {
	M1,
	M5,
	M15,
	M30,
	#[default]
	H1,
	H4,
	D1,
}
impl Timeframe {
	pub fn duration_ms(&self) -> i64 {
		match self {
			Timeframe::M1 => 60_000,
			Timeframe::M5 => 300_000,
			Timeframe::M15 => 900_000,
			Timeframe::M30 => 1_800_000,
			Timeframe::H1 => 3_600_000,
			Timeframe::H4 => 14_400_000,
			Timeframe::D1 => 86_400_000,
		}
	}

	/// Interval label of the Binance klines endpoint.
	pub fn binance_label(&self) -> &'static str {
		match self {
			Timeframe::M1 => "1m",
			Timeframe::M5 => "5m",
			Timeframe::M15 => "15m",
			Timeframe::M30 => "30m",
			Timeframe::H1 => "1h",
			Timeframe::H4 => "4h",
			Timeframe::D1 => "1d",
		}
	}

	/// Bucket label of the BitMEX trade/bucketed endpoint, which only serves a
	/// subset of the timeframes.
	pub fn bitmex_label(&self) -> Option<&'static str> {
		match self {
			Timeframe::M1 => Some("1m"),
			Timeframe::M5 => Some("5m"),
			Timeframe::H1 => Some("1h"),
			Timeframe::D1 => Some("1d"),
			_ => None,
		}
	}
}
impl std::fmt::Display for Timeframe {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.binance_label())
	}
}
impl FromStr for Timeframe {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"1m" => Ok(Timeframe::M1),
			"5m" => Ok(Timeframe::M5),
			"15m" => Ok(Timeframe::M15),
			"30m" => Ok(Timeframe::M30),
			"1h" => Ok(Timeframe::H1),
			"4h" => Ok(Timeframe::H4),
			"1d" => Ok(Timeframe::D1),
			_ => Err(format!("Unknown timeframe: {s}")),
		}
	}
}

/// One tradable instrument on one exchange, built from exchange metadata and
/// immutable afterwards. The connector's contract table owns the only
/// instance per symbol; strategies and trades hold `Arc` references to it.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Contract {
	pub symbol: String,
	pub base_asset: String,
	pub quote_asset: String,
	/// Asset the contract is margined in; `get_trade_size` reads this balance.
	pub margin_asset: String,
	pub price_decimals: u32,
	pub quantity_decimals: u32,
	pub tick_size: f64,
	pub lot_size: f64,
	/// Settled in the base currency (e.g. XBTUSD), so PnL is computed on inverse prices.
	pub inverse: bool,
	pub quanto: bool,
	/// Contract value multiplier, normalized to base-currency units. 1.0 for linear contracts.
	pub multiplier: f64,
}
impl Contract {
	/// Tick size and lot size must be strictly positive; instruments violating
	/// that are dropped at table construction.
	pub fn is_valid(&self) -> bool {
		self.tick_size > 0.0 && self.lot_size > 0.0
	}

	pub fn round_price(&self, price: f64) -> f64 {
		round_to_step(price, self.tick_size)
	}

	pub fn round_quantity(&self, quantity: f64) -> f64 {
		round_to_step(quantity, self.lot_size)
	}

	/// Fixed-decimals rendering, avoids scientific notation on the wire.
	pub fn format_price(&self, price: f64) -> String {
		format!("{:.*}", self.price_decimals as usize, price)
	}

	pub fn format_quantity(&self, quantity: f64) -> String {
		format!("{:.*}", self.quantity_decimals as usize, quantity)
	}
}

/// Per-asset margin snapshot, normalized to base-currency units regardless of
/// the exchange-native denomination (BitMEX reports satoshis).
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize, derive_new::new)]
pub struct Balance {
	pub initial_margin: f64,
	pub maintenance_margin: f64,
	pub margin_balance: f64,
	pub wallet_balance: f64,
	pub unrealized_pnl: f64,
}

/// One OHLCV bar. `timestamp` is epoch milliseconds aligned to the bar open.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize, derive_new::new)]
pub struct Candle {
	pub timestamp: i64,
	pub open: f64,
	pub high: f64,
	pub low: f64,
	pub close: f64,
	pub volume: f64,
}

/// Best bid/ask of one symbol. BitMEX instrument partials may carry only one
/// side, hence the options.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct BidAsk {
	pub bid: Option<f64>,
	pub ask: Option<f64>,
}

/// Order status vocabulary, lower-cased and shared across exchanges
/// (Binance reports `FILLED`, BitMEX `Filled`; both land on [`OrderState::Filled`]).
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum OrderState {
	#[default]
	New,
	PartiallyFilled,
	Filled,
	Canceled,
	Rejected,
	Expired,
	Other(String),
}
impl OrderState {
	pub fn parse(raw: &str) -> Self {
		match raw.to_lowercase().replace(['_', ' '], "").as_str() {
			"new" => OrderState::New,
			"partiallyfilled" => OrderState::PartiallyFilled,
			"filled" => OrderState::Filled,
			"canceled" | "cancelled" => OrderState::Canceled,
			"rejected" => OrderState::Rejected,
			"expired" | "expiredinmatch" => OrderState::Expired,
			_ => OrderState::Other(raw.to_lowercase()),
		}
	}

	/// The order will never fill further; any pending entry must be abandoned.
	pub fn is_terminal_unfilled(&self) -> bool {
		matches!(self, OrderState::Canceled | OrderState::Rejected | OrderState::Expired)
	}
}
impl std::fmt::Display for OrderState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			OrderState::New => write!(f, "new"),
			OrderState::PartiallyFilled => write!(f, "partially_filled"),
			OrderState::Filled => write!(f, "filled"),
			OrderState::Canceled => write!(f, "canceled"),
			OrderState::Rejected => write!(f, "rejected"),
			OrderState::Expired => write!(f, "expired"),
			OrderState::Other(raw) => write!(f, "{raw}"),
		}
	}
}

/// Result of placing, querying or canceling an order. Not retained beyond the
/// call site except through [`Trade`].
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, derive_new::new)]
pub struct OrderStatus {
	pub order_id: String,
	pub status: OrderState,
	/// Average fill price; present only once something was executed.
	pub avg_price: Option<f64>,
	pub executed_qty: f64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OrderKind {
	#[default]
	Market,
	Limit,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimeInForce {
	Gtc,
	Ioc,
	Fok,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TradeStatus {
	#[default]
	Open,
	Closed,
}

/// One strategy-initiated position. Never deleted; closed exactly once, and
/// `entry_price` transitions from `None` to a value exactly once.
#[derive(Clone, Debug, derive_new::new)]
pub struct Trade {
	pub time: i64,
	pub contract: Arc<Contract>,
	pub strategy: String,
	pub side: Side,
	pub entry_id: String,
	pub entry_price: Option<f64>,
	pub quantity: f64,
	#[new(default)]
	pub pnl: f64,
	#[new(default)]
	pub status: TradeStatus,
}
impl Trade {
	/// Back-fills the entry price on fill confirmation. Returns false if the
	/// entry was already confirmed, in which case nothing changes.
	pub fn confirm_entry(&mut self, price: f64) -> bool {
		if self.entry_price.is_some() {
			return false;
		}
		self.entry_price = Some(price);
		true
	}

	/// Transitions open -> closed. Returns false if already closed.
	pub fn close(&mut self) -> bool {
		if self.status == TradeStatus::Closed {
			return false;
		}
		self.status = TradeStatus::Closed;
		true
	}

	pub fn is_open(&self) -> bool {
		self.status == TradeStatus::Open
	}

	/// Marks PnL against the price the position would close at: the bid for
	/// longs, the ask for shorts.
	pub fn update_pnl(&mut self, bid: f64, ask: f64) {
		if !self.is_open() {
			return;
		}
		let Some(entry) = self.entry_price else { return };
		let exit = match self.side {
			Side::Buy => bid,
			Side::Sell => ask,
		};
		self.pnl = compute_pnl(&self.contract, self.side, entry, exit, self.quantity);
	}
}

/// Side-aware unrealized PnL, in the contract's margin asset. Inverse
/// contracts settle on the reciprocal price; quanto and linear contracts
/// differ only in the multiplier.
pub fn compute_pnl(contract: &Contract, side: Side, entry: f64, exit: f64, quantity: f64) -> f64 {
	if contract.inverse {
		let per_contract = match side {
			Side::Buy => 1.0 / entry - 1.0 / exit,
			Side::Sell => 1.0 / exit - 1.0 / entry,
		};
		per_contract * contract.multiplier * quantity
	} else {
		(exit - entry) * side.sign() * contract.multiplier * quantity
	}
}

/// One line of the user-facing activity log, pulled by the UI collaborator.
#[derive(Clone, Debug, derive_new::new)]
pub struct LogEntry {
	pub message: String,
	#[new(default)]
	pub displayed: bool,
}

#[cfg(test)]
mod tests {
	use super::*;

	fn linear_contract() -> Contract {
		Contract {
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
		}
	}

	fn inverse_contract() -> Contract {
		Contract {
			symbol: "XBTUSD".to_string(),
			base_asset: "XBT".to_string(),
			quote_asset: "USD".to_string(),
			margin_asset: "XBt".to_string(),
			price_decimals: 1,
			quantity_decimals: 0,
			tick_size: 0.5,
			lot_size: 100.0,
			inverse: true,
			quanto: false,
			multiplier: 1.0,
		}
	}

	#[test]
	fn order_state_normalizes_both_vocabularies() {
		assert_eq!(OrderState::parse("FILLED"), OrderState::Filled);
		assert_eq!(OrderState::parse("Filled"), OrderState::Filled);
		assert_eq!(OrderState::parse("PARTIALLY_FILLED"), OrderState::PartiallyFilled);
		assert_eq!(OrderState::parse("PartiallyFilled"), OrderState::PartiallyFilled);
		assert_eq!(OrderState::parse("Canceled"), OrderState::Canceled);
		assert_eq!(OrderState::parse("Untriggered"), OrderState::Other("untriggered".to_string()));
		assert_eq!(OrderState::Filled.to_string(), "filled");
	}

	#[test]
	fn contract_rounding_yields_exact_multiples() {
		let c = linear_contract();
		let price = c.round_price(50_123.4567);
		let qty = c.round_quantity(2.0004);
		assert_eq!(price, 50_123.46);
		assert_eq!(qty, 2.0);
		assert_eq!(c.format_price(price), "50123.46");
		assert_eq!(c.format_quantity(qty), "2.000");
	}

	#[test]
	fn entry_price_set_at_most_once() {
		let mut trade = Trade::new(0, Arc::new(linear_contract()), "Technical".to_string(), Side::Buy, "1".to_string(), None, 1.0);
		assert!(trade.confirm_entry(100.0));
		assert!(!trade.confirm_entry(105.0));
		assert_eq!(trade.entry_price, Some(100.0));
	}

	#[test]
	fn trade_closes_at_most_once() {
		let mut trade = Trade::new(0, Arc::new(linear_contract()), "Breakout".to_string(), Side::Sell, "1".to_string(), Some(100.0), 1.0);
		assert!(trade.close());
		assert!(!trade.close());
		assert_eq!(trade.status, TradeStatus::Closed);
	}

	#[test]
	fn linear_pnl_is_side_aware() {
		let c = linear_contract();
		assert_eq!(compute_pnl(&c, Side::Buy, 100.0, 102.0, 3.0), 6.0);
		assert_eq!(compute_pnl(&c, Side::Sell, 100.0, 102.0, 3.0), -6.0);
	}

	#[test]
	fn inverse_pnl_uses_reciprocal_prices() {
		let c = inverse_contract();
		// 100 contracts of 1 USD each, 1% favorable move
		let pnl = compute_pnl(&c, Side::Buy, 100.0, 101.0, 100.0);
		assert!((pnl - 0.009900990099).abs() < 1e-9);
		let pnl_short = compute_pnl(&c, Side::Sell, 100.0, 101.0, 100.0);
		assert!((pnl_short + 0.009900990099).abs() < 1e-9);
	}

	#[test]
	fn pnl_not_updated_after_close() {
		let mut trade = Trade::new(0, Arc::new(linear_contract()), "Technical".to_string(), Side::Buy, "1".to_string(), Some(100.0), 1.0);
		trade.update_pnl(110.0, 110.1);
		assert_eq!(trade.pnl, 10.0);
		trade.close();
		trade.update_pnl(120.0, 120.1);
		assert_eq!(trade.pnl, 10.0);
	}

	#[test]
	fn timeframe_roundtrip() {
		for tf in ["1m", "5m", "15m", "30m", "1h", "4h", "1d"] {
			assert_eq!(tf.parse::<Timeframe>().unwrap().to_string(), tf);
		}
		assert!("2h".parse::<Timeframe>().is_err());
		assert_eq!(Timeframe::M1.duration_ms(), 60_000);
		assert_eq!(Timeframe::M30.bitmex_label(), None);
	}
}
