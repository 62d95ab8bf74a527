//! Folds raw trade ticks into an append-only OHLCV series.
//!
//! Every tick lands in exactly one of three buckets: the bar that is currently
//! forming, the immediately following bar, or a bar further out, in which case
//! flat zero-volume fillers are synthesized so the series never skips a
//! period. Retention is the caller's concern; nothing here truncates.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::models::{Candle, Timeframe};

/// Ticks arriving this much after their event timestamp indicate processing lag.
const TICK_LAG_WARN_MS: i64 = 2_000;

/// Outcome of feeding one tick into the series.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TickResult {
	/// The forming bar absorbed the tick.
	SameCandle,
	/// The forming bar closed and a new one opened, after `skipped` synthesized fillers.
	NewCandle { skipped: usize },
}

/// Tail of the OHLCV series for one (contract, timeframe) pair.
#[derive(Clone, Debug)]
pub struct CandleSeries {
	timeframe: Timeframe,
	candles: Vec<Candle>,
}
impl CandleSeries {
	pub fn new(timeframe: Timeframe) -> Self {
		Self { timeframe, candles: Vec::new() }
	}

	/// Seeds the series from historical bars, which must already be in
	/// ascending timestamp order (both exchanges serve them that way).
	pub fn from_history(timeframe: Timeframe, history: Vec<Candle>) -> Self {
		Self { timeframe, candles: history }
	}

	pub fn timeframe(&self) -> Timeframe {
		self.timeframe
	}

	pub fn candles(&self) -> &[Candle] {
		&self.candles
	}

	pub fn last(&self) -> Option<&Candle> {
		self.candles.last()
	}

	/// Closes of all fully closed bars, i.e. everything but the forming one.
	/// Bar-close signal evaluation reads from here.
	pub fn closed_closes(&self) -> Vec<f64> {
		match self.candles.len() {
			0 | 1 => Vec::new(),
			n => self.candles[..n - 1].iter().map(|c| c.close).collect(),
		}
	}

	/// Folds one (price, size, timestamp) tick into the series.
	pub fn update(&mut self, price: f64, size: f64, timestamp: i64) -> TickResult {
		let local_ms = Utc::now().timestamp_millis();
		if timestamp < local_ms - TICK_LAG_WARN_MS {
			warn!("Tick timestamp lags local clock by {}ms, processing anyway", local_ms - timestamp);
		}

		let period = self.timeframe.duration_ms();

		let Some(last) = self.candles.last_mut() else {
			// First tick ever seen: open a bar aligned to the period boundary.
			let start = timestamp - timestamp.rem_euclid(period);
			self.candles.push(Candle::new(start, price, price, price, price, size));
			return TickResult::NewCandle { skipped: 0 };
		};

		if timestamp < last.timestamp + period {
			// Same bar. Late out-of-order ticks also land here and fold into the forming bar.
			last.close = price;
			last.volume += size;
			if price > last.high {
				last.high = price;
			} else if price < last.low {
				last.low = price;
			}
			return TickResult::SameCandle;
		}

		let skipped = ((timestamp - last.timestamp) / period - 1) as usize;
		if skipped > 0 {
			info!("Filling {} missing candles ({} vs last bar {})", skipped, timestamp, last.timestamp);
		}
		let mut prev_ts = last.timestamp;
		let prev_close = last.close;
		for _ in 0..skipped {
			prev_ts += period;
			self.candles.push(Candle::new(prev_ts, prev_close, prev_close, prev_close, prev_close, 0.0));
		}
		self.candles.push(Candle::new(prev_ts + period, price, price, price, price, size));
		debug!("New candle at {}", prev_ts + period);

		TickResult::NewCandle { skipped }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const PERIOD: i64 = 60_000;

	fn series() -> CandleSeries {
		CandleSeries::new(Timeframe::M1)
	}

	#[test]
	fn ticks_within_period_update_the_forming_bar() {
		let mut s = series();
		let t0 = 60_000;
		assert_eq!(s.update(100.0, 1.0, t0), TickResult::NewCandle { skipped: 0 });
		assert_eq!(s.update(101.0, 1.0, t0 + PERIOD / 2), TickResult::SameCandle);
		assert_eq!(s.update(99.0, 1.0, t0 + PERIOD + 1), TickResult::NewCandle { skipped: 0 });

		insta::assert_json_snapshot!(s.candles(), @r###"
  [
    {
      "timestamp": 60000,
      "open": 100.0,
      "high": 101.0,
      "low": 100.0,
      "close": 101.0,
      "volume": 2.0
    },
    {
      "timestamp": 120000,
      "open": 99.0,
      "high": 99.0,
      "low": 99.0,
      "close": 99.0,
      "volume": 1.0
    }
  ]
  "###);
	}

	#[test]
	fn gaps_are_filled_with_flat_zero_volume_bars() {
		let mut s = series();
		s.update(100.0, 1.0, 0);
		s.update(105.0, 2.0, PERIOD / 4);
		// tick lands 5 periods after the open bar: 4 bars were silent
		assert_eq!(s.update(110.0, 3.0, 5 * PERIOD + 10), TickResult::NewCandle { skipped: 4 });

		let candles = s.candles();
		assert_eq!(candles.len(), 6);
		for filler in &candles[1..5] {
			assert_eq!(filler.open, 105.0);
			assert_eq!(filler.high, 105.0);
			assert_eq!(filler.low, 105.0);
			assert_eq!(filler.close, 105.0);
			assert_eq!(filler.volume, 0.0);
		}
		assert_eq!(candles[5].open, 110.0);
		assert_eq!(candles[5].volume, 3.0);
	}

	#[test]
	fn timestamps_stay_strictly_increasing_and_gap_free() {
		let mut s = series();
		let ticks = [(100.0, 0i64), (101.0, 30_000), (103.0, 61_000), (99.0, 240_500), (98.0, 241_000), (102.0, 600_000)];
		for (price, ts) in ticks {
			s.update(price, 1.0, ts);
		}
		let candles = s.candles();
		for pair in candles.windows(2) {
			assert_eq!(pair[1].timestamp - pair[0].timestamp, PERIOD);
		}
	}

	#[test]
	fn first_tick_opens_a_bar_aligned_to_the_period() {
		let mut s = series();
		s.update(100.0, 1.0, 90_500);
		assert_eq!(s.last().unwrap().timestamp, 60_000);
	}

	#[test]
	fn out_of_order_tick_folds_into_forming_bar() {
		let mut s = series();
		s.update(100.0, 1.0, 60_000);
		s.update(101.0, 1.0, 62_000);
		// arrives late, still belongs to the forming bar
		assert_eq!(s.update(95.0, 1.0, 61_000), TickResult::SameCandle);
		let last = s.last().unwrap();
		assert_eq!(last.low, 95.0);
		assert_eq!(last.close, 95.0);
		assert_eq!(last.volume, 3.0);
	}

	#[test]
	fn closed_closes_excludes_the_forming_bar() {
		let mut s = series();
		s.update(100.0, 1.0, 0);
		s.update(101.0, 1.0, PERIOD);
		s.update(102.0, 1.0, 2 * PERIOD);
		assert_eq!(s.closed_closes(), vec![100.0, 101.0]);
	}
}
