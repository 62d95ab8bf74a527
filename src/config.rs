use std::path::Path;

use color_eyre::eyre::{eyre, Result};
use config::File;
use serde::Deserialize;

use crate::exchange_apis::ExchangeName;

/// API credentials and environment selection for one exchange.
#[derive(Clone, Deserialize)]
pub struct ExchangeKeys {
	pub public_key: String,
	pub secret_key: String,
	#[serde(default)]
	pub testnet: bool,
}
impl std::fmt::Debug for ExchangeKeys {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ExchangeKeys")
			.field("public_key", &self.public_key)
			.field("secret_key", &"[REDACTED]")
			.field("testnet", &self.testnet)
			.finish()
	}
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
	#[serde(default)]
	pub binance: Option<ExchangeKeys>,
	#[serde(default)]
	pub bitmex: Option<ExchangeKeys>,
}

impl AppConfig {
	pub fn read(path: &Path) -> Result<Self> {
		let builder = config::Config::builder().add_source(File::from(path));

		let settings: config::Config = builder.build()?;
		let settings: Self = settings.try_deserialize()?;

		Ok(settings)
	}

	pub fn keys(&self, exchange: ExchangeName) -> Result<&ExchangeKeys> {
		let keys = match exchange {
			ExchangeName::Binance => self.binance.as_ref(),
			ExchangeName::Bitmex => self.bitmex.as_ref(),
		};
		keys.ok_or_else(|| eyre!("{} credentials not found in config", exchange))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn secret_is_redacted_in_debug() {
		let keys = ExchangeKeys {
			public_key: "pub".to_string(),
			secret_key: "very_secret".to_string(),
			testnet: true,
		};
		let rendered = format!("{:?}", keys);
		assert!(rendered.contains("pub"));
		assert!(!rendered.contains("very_secret"));
	}

	#[test]
	fn missing_exchange_is_an_error() {
		let config = AppConfig { binance: None, bitmex: None };
		assert!(config.keys(ExchangeName::Binance).is_err());
	}
}
