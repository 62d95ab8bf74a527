use std::{io::Write, path::Path};

use serde::de::DeserializeOwned;
use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;

use crate::exchange_apis::ApiError;

/// Opt-in subscriber setup for the hosting process. The core itself only emits
/// `tracing` events and never installs a global subscriber on its own.
///
/// # Panics
pub fn init_subscriber(log_path: Option<Box<Path>>) {
	let setup = |make_writer: Box<dyn Fn() -> Box<dyn Write> + Send + Sync>| {
		let formatting_layer = tracing_subscriber::fmt::layer().with_writer(make_writer).with_file(true).with_line_number(true);

		let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or(tracing_subscriber::EnvFilter::new("info"));

		let error_layer = ErrorLayer::default();

		let subscriber = tracing_subscriber::Registry::default().with(env_filter).with(formatting_layer).with(error_layer);

		tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
	};

	match log_path {
		Some(path) => {
			let path = path.to_owned();
			setup(Box::new(move || {
				let file = std::fs::OpenOptions::new().create(true).append(true).open(&path).expect("Failed to open log file");
				Box::new(file) as Box<dyn Write>
			}));
		}
		None => {
			setup(Box::new(|| Box::new(std::io::stdout())));
		}
	}
}

/// Basically reqwest's `json()`, but reports the offending body on deserialization error.
pub async fn deser_reqwest<T: DeserializeOwned>(r: reqwest::Response) -> Result<T, ApiError> {
	let text = r.text().await?;

	match serde_json::from_str::<T>(&text) {
		Ok(deserialized) => Ok(deserialized),
		Err(_) => Err(unexpected_response_str(&text)),
	}
}

pub fn unexpected_response_str(s: &str) -> ApiError {
	let s = match serde_json::from_str::<serde_json::Value>(s) {
		Ok(v) => serde_json::to_string_pretty(&v).unwrap_or_else(|_| s.to_owned()),
		Err(_) => s.to_owned(),
	};
	ApiError::Decode(s)
}

/// Rounds `value` to the nearest integer multiple of `step`, ties to even.
///
/// Exchanges reject prices and quantities that are not exact multiples of the
/// contract's tick/lot size, so every outgoing order value passes through here.
pub fn round_to_step(value: f64, step: f64) -> f64 {
	debug_assert!(step > 0.0);
	let stepped = (value / step).round_ties_even() * step;
	// kill float dust so the formatted value is an exact multiple
	(stepped * 1e8).round() / 1e8
}

/// Number of decimal places needed to represent `step` (e.g. 0.001 -> 3).
pub fn decimals_for_step(step: f64) -> u32 {
	let mut decimals = 0u32;
	let mut s = step;
	while s.fract().abs() > 1e-9 && decimals < 8 {
		s *= 10.0;
		decimals += 1;
	}
	decimals
}
