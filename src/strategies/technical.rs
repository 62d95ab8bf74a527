//! Momentum/oscillator signal: RSI agreeing with a MACD crossover, evaluated
//! on bar close over fully closed bars only.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::Side;

const RSI_OVERSOLD: f64 = 30.0;
const RSI_OVERBOUGHT: f64 = 70.0;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct TechnicalParams {
	pub rsi_length: usize,
	pub ema_fast: usize,
	pub ema_slow: usize,
	pub ema_signal: usize,
}
impl Default for TechnicalParams {
	fn default() -> Self {
		Self {
			rsi_length: 14,
			ema_fast: 12,
			ema_slow: 26,
			ema_signal: 9,
		}
	}
}
impl std::fmt::Display for TechnicalParams {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "r{}-f{}-s{}-g{}", self.rsi_length, self.ema_fast, self.ema_slow, self.ema_signal)
	}
}
impl FromStr for TechnicalParams {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut params = Self::default();
		for part in s.split('-').filter(|p| !p.is_empty()) {
			let (key, value) = part.split_at(1);
			let value: usize = value.parse().map_err(|_| format!("Invalid technical parameter value: {part}"))?;
			match key {
				"r" => params.rsi_length = value,
				"f" => params.ema_fast = value,
				"s" => params.ema_slow = value,
				"g" => params.ema_signal = value,
				_ => return Err(format!("Unknown technical parameter: {part}")),
			}
		}
		Ok(params)
	}
}

/// Oversold plus a bullish crossover goes long; overbought plus a bearish one
/// goes short. `closes` are fully closed bars; returns `None` (skip the
/// cycle) while the history is too short for the indicators.
pub(crate) fn evaluate(params: &TechnicalParams, closes: &[f64]) -> Option<Side> {
	let rsi = rsi(closes, params.rsi_length)?;
	let (macd_line, signal_line) = macd(closes, params.ema_fast, params.ema_slow, params.ema_signal)?;

	if rsi < RSI_OVERSOLD && macd_line > signal_line {
		Some(Side::Buy)
	} else if rsi > RSI_OVERBOUGHT && macd_line < signal_line {
		Some(Side::Sell)
	} else {
		None
	}
}

/// Wilder's RSI: simple average seed over the first `length` changes, then
/// recursive smoothing.
pub(crate) fn rsi(closes: &[f64], length: usize) -> Option<f64> {
	if length == 0 || closes.len() < length + 1 {
		return None;
	}

	let mut gains = Vec::with_capacity(closes.len() - 1);
	let mut losses = Vec::with_capacity(closes.len() - 1);
	for pair in closes.windows(2) {
		let change = pair[1] - pair[0];
		gains.push(change.max(0.0));
		losses.push((-change).max(0.0));
	}

	let mut avg_gain: f64 = gains[..length].iter().sum::<f64>() / length as f64;
	let mut avg_loss: f64 = losses[..length].iter().sum::<f64>() / length as f64;
	for (gain, loss) in gains[length..].iter().zip(&losses[length..]) {
		avg_gain = (avg_gain * (length as f64 - 1.0) + gain) / length as f64;
		avg_loss = (avg_loss * (length as f64 - 1.0) + loss) / length as f64;
	}

	if avg_loss == 0.0 {
		return Some(100.0);
	}
	let rs = avg_gain / avg_loss;
	Some(100.0 - 100.0 / (1.0 + rs))
}

/// EMA over the whole input, seeded with the SMA of the first `period` values.
/// Returns the full series so the MACD signal line can be derived from it.
fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
	if period == 0 || values.len() < period {
		return Vec::new();
	}
	let multiplier = 2.0 / (period as f64 + 1.0);
	let mut ema = values[..period].iter().sum::<f64>() / period as f64;
	let mut series = Vec::with_capacity(values.len() - period + 1);
	series.push(ema);
	for value in &values[period..] {
		ema = (value - ema) * multiplier + ema;
		series.push(ema);
	}
	series
}

/// Returns the latest (macd line, signal line) pair.
pub(crate) fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<(f64, f64)> {
	let fast_series = ema_series(closes, fast);
	let slow_series = ema_series(closes, slow);
	if slow_series.is_empty() || fast_series.len() < slow_series.len() {
		return None;
	}

	// the fast series starts earlier; align the tails
	let offset = fast_series.len() - slow_series.len();
	let line: Vec<f64> = fast_series[offset..].iter().zip(&slow_series).map(|(f, s)| f - s).collect();

	let signal_series = ema_series(&line, signal);
	let signal_last = *signal_series.last()?;
	let line_last = *line.last()?;
	Some((line_last, signal_last))
}
