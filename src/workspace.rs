//! In-memory shapes of the persisted workspace: strategy configuration rows
//! and watchlist rows. The persistence collaborator serializes these however
//! it likes; the core performs no I/O.

use std::{collections::HashMap, sync::Arc};

use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};

use crate::{
	exchange_apis::ExchangeName,
	models::Contract,
	strategies::{StrategyKind, StrategySpec},
};

/// One saved strategy configuration. `extra_params` is the strategy-specific
/// parameter blob in the same compact format [`StrategyKind`] parses.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StrategyRow {
	pub strategy_type: String,
	pub contract: String,
	pub exchange: String,
	pub timeframe: String,
	pub balance_pct: f64,
	pub take_profit: f64,
	pub stop_loss: f64,
	pub extra_params: String,
}

impl StrategyRow {
	pub fn from_parts(spec: &StrategySpec, kind: &StrategyKind) -> Self {
		let extra_params = match kind {
			StrategyKind::Technical(params) => params.to_string(),
			StrategyKind::Breakout(params) => params.to_string(),
		};
		Self {
			strategy_type: kind.name().to_lowercase(),
			contract: spec.contract.symbol.clone(),
			exchange: spec.exchange.to_string(),
			timeframe: spec.timeframe.to_string(),
			balance_pct: spec.balance_pct,
			take_profit: spec.take_profit,
			stop_loss: spec.stop_loss,
			extra_params,
		}
	}

	/// Rebuilds the live configuration against a connector's contract table.
	pub fn resolve(&self, contracts: &HashMap<String, Arc<Contract>>) -> Result<(StrategySpec, StrategyKind)> {
		let contract = contracts.get(&self.contract).cloned().ok_or_else(|| eyre!("Unknown contract: {}", self.contract))?;
		let exchange: ExchangeName = self.exchange.parse().map_err(|e: String| eyre!(e))?;
		let timeframe = self.timeframe.parse().map_err(|e: String| eyre!(e))?;
		let kind: StrategyKind = format!("{}:{}", self.strategy_type, self.extra_params).parse().map_err(|e: String| eyre!(e))?;

		let spec = StrategySpec::new(contract, exchange, timeframe, self.balance_pct, self.take_profit, self.stop_loss);
		Ok((spec, kind))
	}
}

/// One watched symbol.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct WatchlistRow {
	pub symbol: String,
	pub exchange: String,
}

/// The watchlist the UI edits and the persistence collaborator saves.
#[derive(Clone, Debug, Default)]
pub struct Watchlist {
	rows: Vec<WatchlistRow>,
}

impl Watchlist {
	pub fn new(rows: Vec<WatchlistRow>) -> Self {
		Self { rows }
	}

	/// Adding an already-watched symbol is a no-op. Returns whether the row
	/// was inserted.
	pub fn add(&mut self, symbol: &str, exchange: ExchangeName) -> bool {
		let row = WatchlistRow {
			symbol: symbol.to_owned(),
			exchange: exchange.to_string(),
		};
		if self.rows.contains(&row) {
			return false;
		}
		self.rows.push(row);
		true
	}

	pub fn remove(&mut self, symbol: &str, exchange: ExchangeName) -> bool {
		let before = self.rows.len();
		let exchange = exchange.to_string();
		self.rows.retain(|r| !(r.symbol == symbol && r.exchange == exchange));
		self.rows.len() < before
	}

	pub fn rows(&self) -> &[WatchlistRow] {
		&self.rows
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		models::Timeframe,
		strategies::{BreakoutParams, TechnicalParams},
	};

	fn contracts() -> HashMap<String, Arc<Contract>> {
		let mut contracts = HashMap::new();
		contracts.insert(
			"BTCUSDT".to_string(),
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
			}),
		);
		contracts
	}

	#[test]
	fn strategy_row_roundtrip() {
		let contracts = contracts();
		let spec = StrategySpec::new(contracts["BTCUSDT"].clone(), ExchangeName::Binance, Timeframe::H1, 10.0, 2.0, 1.0);
		let kind = StrategyKind::Technical(TechnicalParams::default());

		let row = StrategyRow::from_parts(&spec, &kind);
		assert_eq!(row.strategy_type, "technical");
		assert_eq!(row.extra_params, "r14-f12-s26-g9");

		let (resolved_spec, resolved_kind) = row.resolve(&contracts).unwrap();
		assert_eq!(resolved_spec.contract.symbol, "BTCUSDT");
		assert_eq!(resolved_spec.timeframe, Timeframe::H1);
		assert_eq!(resolved_kind, kind);
	}

	#[test]
	fn breakout_row_roundtrip() {
		let contracts = contracts();
		let spec = StrategySpec::new(contracts["BTCUSDT"].clone(), ExchangeName::Binance, Timeframe::M5, 20.0, 3.0, 1.5);
		let kind = StrategyKind::Breakout(BreakoutParams { min_volume: 100.0 });

		let row = StrategyRow::from_parts(&spec, &kind);
		let (_, resolved_kind) = row.resolve(&contracts).unwrap();
		assert_eq!(resolved_kind, kind);
	}

	#[test]
	fn unknown_contract_fails_resolution() {
		let row = StrategyRow {
			strategy_type: "technical".to_string(),
			contract: "DOGEUSDT".to_string(),
			exchange: "binance".to_string(),
			timeframe: "1h".to_string(),
			balance_pct: 10.0,
			take_profit: 2.0,
			stop_loss: 1.0,
			extra_params: String::new(),
		};
		assert!(row.resolve(&contracts()).is_err());
	}

	#[test]
	fn watchlist_add_is_idempotent() {
		let mut watchlist = Watchlist::default();
		assert!(watchlist.add("BTCUSDT", ExchangeName::Binance));
		assert!(!watchlist.add("BTCUSDT", ExchangeName::Binance));
		// same symbol on another exchange is a distinct row
		assert!(watchlist.add("BTCUSDT", ExchangeName::Bitmex));
		assert_eq!(watchlist.rows().len(), 2);

		assert!(watchlist.remove("BTCUSDT", ExchangeName::Binance));
		assert!(!watchlist.remove("BTCUSDT", ExchangeName::Binance));
	}
}
