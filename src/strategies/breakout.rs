//! Breakout signal with volume confirmation, evaluated on every tick against
//! the forming bar and the last closed bar.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::{Candle, Side};

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct BreakoutParams {
	/// Forming-bar volume below this keeps the signal flat.
	pub min_volume: f64,
}
impl std::fmt::Display for BreakoutParams {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "v{}", self.min_volume)
	}
}
impl FromStr for BreakoutParams {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut params = Self::default();
		for part in s.split('-').filter(|p| !p.is_empty()) {
			let (key, value) = part.split_at(1);
			match key {
				"v" => params.min_volume = value.parse().map_err(|_| format!("Invalid breakout parameter value: {part}"))?,
				_ => return Err(format!("Unknown breakout parameter: {part}")),
			}
		}
		Ok(params)
	}
}

/// Close pushing past the prior bar's extreme, with enough volume behind it.
/// `candles` is the live series, forming bar last.
pub(crate) fn evaluate(params: &BreakoutParams, candles: &[Candle]) -> Option<Side> {
	if candles.len() < 2 {
		return None;
	}
	let previous = &candles[candles.len() - 2];
	let forming = &candles[candles.len() - 1];

	if forming.volume <= params.min_volume {
		return None;
	}
	if forming.close > previous.high {
		Some(Side::Buy)
	} else if forming.close < previous.low {
		Some(Side::Sell)
	} else {
		None
	}
}
