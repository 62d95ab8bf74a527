//! BitMEX: signed REST access and the websocket stream protocol. The
//! signature covers `verb + path [+ "?" + query] + expires` where `expires`
//! is a unix-seconds deadline a few seconds ahead of the local clock.
//! Balances arrive denominated in satoshis and are normalized on ingestion.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, error, instrument, warn};

use super::{
	ws::{Channel, StreamEvent, StreamProtocol},
	ApiError, ApiResult, ExchangeName, ExchangeRest,
};
use crate::{
	config::ExchangeKeys,
	models::{Balance, BidAsk, Candle, Contract, OrderKind, OrderState, OrderStatus, Side, TimeInForce, Timeframe},
	utils::{decimals_for_step, deser_reqwest},
};

type HmacSha256 = Hmac<Sha256>;

/// 1 satoshi in XBT; BitMEX margins are reported in satoshis.
const SATOSHI_MULTIPLIER: f64 = 0.00000001;
const HISTORY_LIMIT: usize = 500;
/// Signature deadline offset, seconds ahead of the local clock.
const EXPIRES_OFFSET_S: i64 = 5;
const REST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

pub(crate) fn sign(secret: &str, verb: &str, path: &str, query: &str, expires: &str) -> String {
	let message = match query.is_empty() {
		true => format!("{verb}{path}{expires}"),
		false => format!("{verb}{path}?{query}{expires}"),
	};
	let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
	mac.update(message.as_bytes());
	hex::encode(mac.finalize().into_bytes())
}

pub struct BitmexRest {
	base_url: String,
	key: String,
	secret: String,
	client: reqwest::Client,
}

impl BitmexRest {
	pub fn new(keys: &ExchangeKeys) -> ApiResult<Self> {
		let base_url = match keys.testnet {
			true => "https://testnet.bitmex.com".to_string(),
			false => "https://www.bitmex.com".to_string(),
		};
		let client = reqwest::Client::builder().timeout(REST_TIMEOUT).build()?;

		Ok(Self {
			base_url,
			key: keys.public_key.clone(),
			secret: keys.secret_key.clone(),
			client,
		})
	}

	/// Every BitMEX endpoint we touch requires authentication headers, so
	/// there is no unsigned variant.
	#[instrument(skip(self, params))]
	async fn request<T: serde::de::DeserializeOwned>(&self, method: Method, path: &str, params: Vec<(&'static str, String)>) -> ApiResult<T> {
		let query = serde_urlencoded::to_string(&params).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
		let expires = (Utc::now().timestamp() + EXPIRES_OFFSET_S).to_string();
		let signature = sign(&self.secret, method.as_str(), path, &query, &expires);

		let url = match query.is_empty() {
			true => format!("{}{}", self.base_url, path),
			false => format!("{}{}?{}", self.base_url, path, query),
		};

		let r = self
			.client
			.request(method.clone(), &url)
			.header("api-expires", &expires)
			.header("api-key", &self.key)
			.header("api-signature", &signature)
			.send()
			.await?;
		if !r.status().is_success() {
			let status = r.status().as_u16();
			let body = r.text().await.unwrap_or_default();
			error!("Error while making {} request to {}: {} (error code {})", method, path, body, status);
			return Err(ApiError::Http { status, body });
		}
		deser_reqwest(r).await
	}
}

#[async_trait]
impl ExchangeRest for BitmexRest {
	fn exchange(&self) -> ExchangeName {
		ExchangeName::Bitmex
	}

	async fn get_contracts(&self) -> ApiResult<HashMap<String, Arc<Contract>>> {
		let instruments: Vec<BitmexInstrument> = self.request(Method::GET, "/api/v1/instrument/active", Vec::new()).await?;

		let mut contracts = HashMap::new();
		for instrument in instruments {
			let contract = contract_from_instrument(instrument);
			if !contract.is_valid() {
				warn!("Skipping {}: non-positive tick or lot size", contract.symbol);
				continue;
			}
			contracts.insert(contract.symbol.clone(), Arc::new(contract));
		}
		Ok(contracts)
	}

	async fn get_balances(&self) -> ApiResult<HashMap<String, Balance>> {
		let params = vec![("currency", "all".to_string())];
		let margins: Vec<BitmexMargin> = self.request(Method::GET, "/api/v1/user/margin", params).await?;

		let mut balances = HashMap::new();
		for margin in margins {
			let scale = |v: i64| v as f64 * SATOSHI_MULTIPLIER;
			balances.insert(
				margin.currency.clone(),
				Balance::new(
					scale(margin.init_margin),
					scale(margin.maint_margin),
					scale(margin.margin_balance),
					scale(margin.wallet_balance),
					scale(margin.unrealised_pnl),
				),
			);
		}
		Ok(balances)
	}

	async fn get_historical_candles(&self, contract: &Contract, timeframe: Timeframe) -> ApiResult<Vec<Candle>> {
		let bin_size = timeframe
			.bitmex_label()
			.ok_or_else(|| ApiError::InvalidRequest(format!("BitMEX serves no {timeframe} buckets")))?;
		let params = vec![
			("symbol", contract.symbol.clone()),
			("partial", "true".to_string()),
			("binSize", bin_size.to_string()),
			("count", HISTORY_LIMIT.to_string()),
			("reverse", "true".to_string()),
		];
		let buckets: Vec<BitmexBucket> = self.request(Method::GET, "/api/v1/trade/bucketed", params).await?;

		candles_from_buckets(buckets, timeframe.duration_ms())
	}

	async fn get_bid_ask(&self, contract: &Contract) -> ApiResult<BidAsk> {
		let params = vec![("symbol", contract.symbol.clone()), ("count", "1".to_string())];
		let instruments: Vec<BitmexInstrument> = self.request(Method::GET, "/api/v1/instrument", params).await?;
		let instrument = instruments
			.into_iter()
			.next()
			.ok_or_else(|| ApiError::Domain(format!("No instrument data for {}", contract.symbol)))?;
		Ok(BidAsk {
			bid: instrument.bid_price,
			ask: instrument.ask_price,
		})
	}

	#[instrument(skip(self, contract), fields(symbol = %contract.symbol))]
	async fn place_order(&self, contract: &Contract, kind: OrderKind, quantity: f64, side: Side, price: Option<f64>, tif: Option<TimeInForce>) -> ApiResult<OrderStatus> {
		let mut params = vec![
			("symbol", contract.symbol.clone()),
			("side", side.to_string()),
			("orderQty", contract.format_quantity(contract.round_quantity(quantity))),
			("ordType", order_kind_label(kind).to_string()),
		];
		if let Some(price) = price {
			params.push(("price", contract.format_price(contract.round_price(price))));
		}
		if let Some(tif) = tif {
			params.push(("timeInForce", tif_label(tif).to_string()));
		}

		let response: BitmexOrder = self.request(Method::POST, "/api/v1/order", params).await?;
		debug!("Order placed: {:?}", response);
		Ok(response.into())
	}

	async fn cancel_order(&self, _contract: &Contract, order_id: &str) -> ApiResult<OrderStatus> {
		let params = vec![("orderID", order_id.to_string())];
		// the endpoint cancels a batch and answers with a list
		let mut responses: Vec<BitmexOrder> = self.request(Method::DELETE, "/api/v1/order", params).await?;
		match responses.is_empty() {
			true => Err(ApiError::Domain(format!("Order {order_id} not found"))),
			false => Ok(responses.remove(0).into()),
		}
	}

	async fn get_order_status(&self, contract: &Contract, order_id: &str) -> ApiResult<OrderStatus> {
		let params = vec![("symbol", contract.symbol.clone()), ("reverse", "true".to_string())];
		let responses: Vec<BitmexOrder> = self.request(Method::GET, "/api/v1/order", params).await?;

		responses
			.into_iter()
			.find(|o| o.order_id == order_id)
			.map(Into::into)
			.ok_or_else(|| ApiError::Domain(format!("Order {order_id} not found on {}", contract.symbol)))
	}
}

fn order_kind_label(kind: OrderKind) -> &'static str {
	match kind {
		OrderKind::Market => "Market",
		OrderKind::Limit => "Limit",
	}
}

fn tif_label(tif: TimeInForce) -> &'static str {
	match tif {
		TimeInForce::Gtc => "GoodTillCancel",
		TimeInForce::Ioc => "ImmediateOrCancel",
		TimeInForce::Fok => "FillOrKill",
	}
}

fn contract_from_instrument(i: BitmexInstrument) -> Contract {
	let margin_asset = i.settl_currency.unwrap_or_else(|| "XBt".to_string());
	// multiplier carries the settlement direction as its sign; the canonical
	// model keeps the magnitude (scaled out of satoshis) and the inverse flag
	let multiplier = match i.multiplier {
		Some(m) if m != 0 && margin_asset == "XBt" => (m.abs() as f64) * SATOSHI_MULTIPLIER,
		Some(m) if m != 0 => m.abs() as f64,
		_ => 1.0,
	};
	Contract {
		symbol: i.symbol,
		base_asset: i.root_symbol,
		quote_asset: i.quote_currency,
		margin_asset,
		price_decimals: decimals_for_step(i.tick_size),
		quantity_decimals: decimals_for_step(i.lot_size),
		tick_size: i.tick_size,
		lot_size: i.lot_size,
		inverse: i.is_inverse,
		quanto: i.is_quanto,
		multiplier,
	}
}

/// Buckets arrive newest-first and stamped with the bucket *end*; the
/// canonical series is ascending and stamped with the bar open.
fn candles_from_buckets(buckets: Vec<BitmexBucket>, period_ms: i64) -> ApiResult<Vec<Candle>> {
	let mut candles = Vec::with_capacity(buckets.len());
	for bucket in buckets.into_iter().rev() {
		let (Some(open), Some(high), Some(low), Some(close)) = (bucket.open, bucket.high, bucket.low, bucket.close) else {
			debug!("Skipping empty bucket at {}", bucket.timestamp);
			continue;
		};
		let ts = parse_timestamp_ms(&bucket.timestamp)?;
		candles.push(Candle::new(ts - period_ms, open, high, low, close, bucket.volume.unwrap_or(0.0)));
	}
	Ok(candles)
}

fn parse_timestamp_ms(raw: &str) -> ApiResult<i64> {
	let dt: DateTime<chrono::FixedOffset> = DateTime::parse_from_rfc3339(raw).map_err(|e| ApiError::Decode(format!("timestamp {raw:?}: {e}")))?;
	Ok(dt.timestamp_millis())
}

//=============================================================================
// Stream protocol
//=============================================================================

pub struct BitmexStream {
	wss_url: String,
}

impl BitmexStream {
	pub fn new(testnet: bool) -> Self {
		let wss_url = match testnet {
			true => "wss://testnet.bitmex.com/realtime".to_string(),
			false => "wss://www.bitmex.com/realtime".to_string(),
		};
		Self { wss_url }
	}
}

#[derive(Serialize)]
struct ControlFrame<'a> {
	op: &'a str,
	args: &'a [String],
}

impl StreamProtocol for BitmexStream {
	fn exchange(&self) -> ExchangeName {
		ExchangeName::Bitmex
	}

	fn ws_url(&self) -> String {
		self.wss_url.clone()
	}

	/// BitMEX feeds are per-table, not per-symbol: subscribing any symbol to a
	/// channel subscribes the whole table, and the topic strings collapse.
	fn topic(&self, _symbol: &str, channel: Channel) -> String {
		match channel {
			Channel::BookTicker => "instrument".to_string(),
			Channel::Trades => "trade".to_string(),
		}
	}

	fn subscribe_frame(&self, topics: &[String]) -> String {
		serde_json::to_string(&ControlFrame { op: "subscribe", args: topics }).unwrap()
	}

	fn unsubscribe_frame(&self, topics: &[String]) -> String {
		serde_json::to_string(&ControlFrame { op: "unsubscribe", args: topics }).unwrap()
	}

	fn max_topics(&self) -> usize {
		// no documented per-connection cap on table subscriptions
		usize::MAX
	}

	fn decode(&self, raw: &str) -> ApiResult<Vec<StreamEvent>> {
		let value: Value = serde_json::from_str(raw).map_err(|e| ApiError::Decode(format!("{e}: {raw}")))?;
		let table = value.get("table").and_then(Value::as_str).map(str::to_owned);

		match table.as_deref() {
			Some("instrument") => {
				let msg: TableMessage<InstrumentRow> = serde_json::from_value(value).map_err(|e| ApiError::Decode(format!("instrument: {e}")))?;
				Ok(msg
					.data
					.into_iter()
					.filter(|row| row.bid_price.is_some() || row.ask_price.is_some())
					.map(|row| StreamEvent::InstrumentPartial {
						symbol: row.symbol,
						bid: row.bid_price,
						ask: row.ask_price,
					})
					.collect())
			}
			Some("trade") => {
				let msg: TableMessage<TradeRow> = serde_json::from_value(value).map_err(|e| ApiError::Decode(format!("trade: {e}")))?;
				let mut events = Vec::with_capacity(msg.data.len());
				for row in msg.data {
					events.push(StreamEvent::Trade {
						symbol: row.symbol,
						price: row.price,
						size: row.size,
						timestamp: parse_timestamp_ms(&row.timestamp)?,
					});
				}
				Ok(events)
			}
			// welcome banner, subscription acks, unhandled tables
			_ => Ok(Vec::new()),
		}
	}
}

//=============================================================================
// Response structs {{{
//=============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BitmexInstrument {
	symbol: String,
	root_symbol: String,
	quote_currency: String,
	#[serde(default)]
	settl_currency: Option<String>,
	tick_size: f64,
	lot_size: f64,
	#[serde(default)]
	is_inverse: bool,
	#[serde(default)]
	is_quanto: bool,
	#[serde(default)]
	multiplier: Option<i64>,
	#[serde(default)]
	bid_price: Option<f64>,
	#[serde(default)]
	ask_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BitmexMargin {
	currency: String,
	#[serde(default)]
	init_margin: i64,
	#[serde(default)]
	maint_margin: i64,
	#[serde(default)]
	margin_balance: i64,
	#[serde(default)]
	wallet_balance: i64,
	#[serde(default)]
	unrealised_pnl: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BitmexBucket {
	timestamp: String,
	#[serde(default)]
	open: Option<f64>,
	#[serde(default)]
	high: Option<f64>,
	#[serde(default)]
	low: Option<f64>,
	#[serde(default)]
	close: Option<f64>,
	#[serde(default)]
	volume: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BitmexOrder {
	#[serde(rename = "orderID")]
	order_id: String,
	ord_status: String,
	#[serde(default)]
	avg_px: Option<f64>,
	#[serde(default)]
	cum_qty: f64,
}

impl From<BitmexOrder> for OrderStatus {
	fn from(o: BitmexOrder) -> Self {
		let avg_price = o.avg_px.filter(|p| *p > 0.0);
		OrderStatus::new(o.order_id, OrderState::parse(&o.ord_status), avg_price, o.cum_qty)
	}
}

#[derive(Debug, Deserialize)]
struct TableMessage<T> {
	#[serde(default = "Vec::new")]
	data: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentRow {
	symbol: String,
	#[serde(default)]
	bid_price: Option<f64>,
	#[serde(default)]
	ask_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TradeRow {
	symbol: String,
	price: f64,
	size: f64,
	timestamp: String,
}
//,}}}
