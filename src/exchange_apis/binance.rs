//! Binance USDⓈ-M Futures: signed REST access and the websocket stream
//! protocol. Authentication is an HMAC-SHA256 signature over the url-encoded
//! query string (which carries a local-clock timestamp, so the host must be
//! time-synchronized or the exchange rejects the request).

use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
};

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{
	header::{HeaderMap, HeaderValue, CONTENT_TYPE},
	Method,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DisplayFromStr};
use sha2::Sha256;
use tracing::{debug, error, instrument, warn};
use url::Url;

use super::{
	ws::{Channel, StreamEvent, StreamProtocol},
	ApiError, ApiResult, ExchangeName, ExchangeRest,
};
use crate::{
	config::ExchangeKeys,
	models::{Balance, BidAsk, Candle, Contract, OrderKind, OrderState, OrderStatus, Side, TimeInForce, Timeframe},
	utils::deser_reqwest,
};

type HmacSha256 = Hmac<Sha256>;

const HISTORY_LIMIT: usize = 1000;
/// Streams per connection before Binance starts dropping the socket.
const MAX_STREAMS_PER_CONNECTION: usize = 200;
const REST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

pub(crate) fn sign(secret: &str, payload: &str) -> String {
	let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
	mac.update(payload.as_bytes());
	hex::encode(mac.finalize().into_bytes())
}

pub struct BinanceRest {
	base_url: Url,
	secret: String,
	client: reqwest::Client,
}

impl BinanceRest {
	pub fn new(keys: &ExchangeKeys) -> ApiResult<Self> {
		let base_url = match keys.testnet {
			true => Url::parse("https://testnet.binancefuture.com")?,
			false => Url::parse("https://fapi.binance.com")?,
		};

		let mut headers = HeaderMap::new();
		headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json;charset=utf-8"));
		headers.insert("X-MBX-APIKEY", HeaderValue::from_str(&keys.public_key).map_err(|e| ApiError::InvalidRequest(e.to_string()))?);
		let client = reqwest::Client::builder().default_headers(headers).timeout(REST_TIMEOUT).build()?;

		Ok(Self {
			base_url,
			secret: keys.secret_key.clone(),
			client,
		})
	}

	#[instrument(skip(self, params))]
	async fn request<T: serde::de::DeserializeOwned>(&self, method: Method, endpoint: &str, mut params: Vec<(&'static str, String)>, signed: bool) -> ApiResult<T> {
		let url = self.base_url.join(endpoint)?;
		let url = if signed {
			params.push(("timestamp", Utc::now().timestamp_millis().to_string()));
			let query = serde_urlencoded::to_string(&params).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
			let signature = sign(&self.secret, &query);
			format!("{url}?{query}&signature={signature}")
		} else {
			let query = serde_urlencoded::to_string(&params).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
			match query.is_empty() {
				true => url.to_string(),
				false => format!("{url}?{query}"),
			}
		};

		let r = self.client.request(method.clone(), &url).send().await?;
		if !r.status().is_success() {
			let status = r.status().as_u16();
			let body = r.text().await.unwrap_or_default();
			error!("Error while making {} request to {}: {} (error code {})", method, endpoint, body, status);
			return Err(ApiError::Http { status, body });
		}
		deser_reqwest(r).await
	}
}

#[async_trait]
impl ExchangeRest for BinanceRest {
	fn exchange(&self) -> ExchangeName {
		ExchangeName::Binance
	}

	async fn get_contracts(&self) -> ApiResult<HashMap<String, Arc<Contract>>> {
		let info: FuturesExchangeInfo = self.request(Method::GET, "/fapi/v1/exchangeInfo", Vec::new(), false).await?;

		let mut contracts = HashMap::new();
		for symbol in info.symbols {
			let contract = contract_from_symbol(symbol);
			if !contract.is_valid() {
				warn!("Skipping {}: non-positive tick or lot size", contract.symbol);
				continue;
			}
			contracts.insert(contract.symbol.clone(), Arc::new(contract));
		}
		Ok(contracts)
	}

	async fn get_balances(&self) -> ApiResult<HashMap<String, Balance>> {
		let account: FuturesAccount = self.request(Method::GET, "/fapi/v2/account", Vec::new(), true).await?;

		let mut balances = HashMap::new();
		for asset in account.assets {
			balances.insert(
				asset.asset.clone(),
				Balance::new(asset.initial_margin, asset.maint_margin, asset.margin_balance, asset.wallet_balance, asset.unrealized_profit),
			);
		}
		Ok(balances)
	}

	async fn get_historical_candles(&self, contract: &Contract, timeframe: Timeframe) -> ApiResult<Vec<Candle>> {
		let params = vec![
			("symbol", contract.symbol.clone()),
			("interval", timeframe.binance_label().to_string()),
			("limit", HISTORY_LIMIT.to_string()),
		];
		let raw_candles: Vec<RawKline> = self.request(Method::GET, "/fapi/v1/klines", params, false).await?;

		raw_candles.into_iter().map(Candle::try_from).collect()
	}

	async fn get_bid_ask(&self, contract: &Contract) -> ApiResult<BidAsk> {
		let params = vec![("symbol", contract.symbol.clone())];
		let book: BookTickerResponse = self.request(Method::GET, "/fapi/v1/ticker/bookTicker", params, false).await?;
		Ok(BidAsk {
			bid: Some(book.bid_price),
			ask: Some(book.ask_price),
		})
	}

	#[instrument(skip(self, contract), fields(symbol = %contract.symbol))]
	async fn place_order(&self, contract: &Contract, kind: OrderKind, quantity: f64, side: Side, price: Option<f64>, tif: Option<TimeInForce>) -> ApiResult<OrderStatus> {
		let mut params = vec![
			("symbol", contract.symbol.clone()),
			("side", side.to_string().to_uppercase()),
			("quantity", contract.format_quantity(contract.round_quantity(quantity))),
			("type", order_kind_label(kind).to_string()),
		];
		if let Some(price) = price {
			params.push(("price", contract.format_price(contract.round_price(price))));
		}
		if let Some(tif) = tif {
			params.push(("timeInForce", tif_label(tif).to_string()));
		}

		let response: FuturesOrderResponse = self.request(Method::POST, "/fapi/v1/order", params, true).await?;
		debug!("Order placed: {:?}", response);
		Ok(response.into())
	}

	async fn cancel_order(&self, contract: &Contract, order_id: &str) -> ApiResult<OrderStatus> {
		let params = vec![("symbol", contract.symbol.clone()), ("orderId", order_id.to_string())];
		let response: FuturesOrderResponse = self.request(Method::DELETE, "/fapi/v1/order", params, true).await?;
		Ok(response.into())
	}

	async fn get_order_status(&self, contract: &Contract, order_id: &str) -> ApiResult<OrderStatus> {
		let params = vec![("symbol", contract.symbol.clone()), ("orderId", order_id.to_string())];
		let response: FuturesOrderResponse = self.request(Method::GET, "/fapi/v1/order", params, true).await?;
		Ok(response.into())
	}
}

fn order_kind_label(kind: OrderKind) -> &'static str {
	match kind {
		OrderKind::Market => "MARKET",
		OrderKind::Limit => "LIMIT",
	}
}

fn tif_label(tif: TimeInForce) -> &'static str {
	match tif {
		TimeInForce::Gtc => "GTC",
		TimeInForce::Ioc => "IOC",
		TimeInForce::Fok => "FOK",
	}
}

fn contract_from_symbol(s: FuturesSymbol) -> Contract {
	// Binance reports decimal precisions rather than step sizes.
	let tick_size = 10f64.powi(-(s.price_precision as i32));
	let lot_size = 10f64.powi(-(s.quantity_precision as i32));
	Contract {
		symbol: s.symbol,
		base_asset: s.base_asset,
		quote_asset: s.quote_asset,
		margin_asset: s.margin_asset,
		price_decimals: s.price_precision,
		quantity_decimals: s.quantity_precision,
		tick_size,
		lot_size,
		inverse: false,
		quanto: false,
		multiplier: 1.0,
	}
}

//=============================================================================
// Stream protocol
//=============================================================================

pub struct BinanceStream {
	wss_url: String,
	next_id: AtomicU64,
}

impl BinanceStream {
	pub fn new(testnet: bool) -> Self {
		let wss_url = match testnet {
			true => "wss://stream.binancefuture.com/ws".to_string(),
			false => "wss://fstream.binance.com/ws".to_string(),
		};
		Self { wss_url, next_id: AtomicU64::new(1) }
	}
}

#[derive(Serialize)]
struct ControlFrame<'a> {
	method: &'a str,
	params: &'a [String],
	id: u64,
}

impl StreamProtocol for BinanceStream {
	fn exchange(&self) -> ExchangeName {
		ExchangeName::Binance
	}

	fn ws_url(&self) -> String {
		self.wss_url.clone()
	}

	fn topic(&self, symbol: &str, channel: Channel) -> String {
		let channel = match channel {
			Channel::BookTicker => "bookTicker",
			Channel::Trades => "aggTrade",
		};
		format!("{}@{}", symbol.to_lowercase(), channel)
	}

	fn subscribe_frame(&self, topics: &[String]) -> String {
		let frame = ControlFrame {
			method: "SUBSCRIBE",
			params: topics,
			id: self.next_id.fetch_add(1, Ordering::Relaxed),
		};
		serde_json::to_string(&frame).unwrap()
	}

	fn unsubscribe_frame(&self, topics: &[String]) -> String {
		let frame = ControlFrame {
			method: "UNSUBSCRIBE",
			params: topics,
			id: self.next_id.fetch_add(1, Ordering::Relaxed),
		};
		serde_json::to_string(&frame).unwrap()
	}

	fn max_topics(&self) -> usize {
		MAX_STREAMS_PER_CONNECTION
	}

	fn decode(&self, raw: &str) -> ApiResult<Vec<StreamEvent>> {
		let value: Value = serde_json::from_str(raw).map_err(|e| ApiError::Decode(format!("{e}: {raw}")))?;
		let event_type = match value.get("e").and_then(Value::as_str) {
			Some(e) => Some(e.to_owned()),
			// spot book tickers carry no event tag, only the update id and sizes
			None if value.get("u").is_some() && value.get("A").is_some() => Some("bookTicker".to_owned()),
			None => None,
		};

		match event_type.as_deref() {
			Some("bookTicker") => {
				let ev: BookTickerEvent = serde_json::from_value(value).map_err(|e| ApiError::Decode(format!("bookTicker: {e}")))?;
				Ok(vec![StreamEvent::BookTicker {
					symbol: ev.symbol,
					bid: ev.bid,
					ask: ev.ask,
				}])
			}
			Some("aggTrade") => {
				let ev: AggTradeEvent = serde_json::from_value(value).map_err(|e| ApiError::Decode(format!("aggTrade: {e}")))?;
				Ok(vec![StreamEvent::Trade {
					symbol: ev.symbol,
					price: ev.price,
					size: ev.size,
					timestamp: ev.timestamp,
				}])
			}
			// subscription acks and unhandled event types
			_ => Ok(Vec::new()),
		}
	}
}

//=============================================================================
// Response structs {{{
//=============================================================================

#[derive(Debug, Deserialize)]
struct FuturesExchangeInfo {
	symbols: Vec<FuturesSymbol>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesSymbol {
	symbol: String,
	base_asset: String,
	quote_asset: String,
	margin_asset: String,
	price_precision: u32,
	quantity_precision: u32,
}

#[derive(Debug, Deserialize)]
struct FuturesAccount {
	assets: Vec<FuturesAssetBalance>,
}

#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesAssetBalance {
	asset: String,
	#[serde_as(as = "DisplayFromStr")]
	initial_margin: f64,
	#[serde_as(as = "DisplayFromStr")]
	maint_margin: f64,
	#[serde_as(as = "DisplayFromStr")]
	margin_balance: f64,
	#[serde_as(as = "DisplayFromStr")]
	wallet_balance: f64,
	#[serde_as(as = "DisplayFromStr")]
	unrealized_profit: f64,
}

/// Klines come as positional arrays.
#[allow(dead_code)]
#[derive(Debug, Deserialize)]
struct RawKline(i64, String, String, String, String, String, i64, String, i64, String, String, String);

impl TryFrom<RawKline> for Candle {
	type Error = ApiError;

	fn try_from(k: RawKline) -> ApiResult<Self> {
		let parse = |s: &str| s.parse::<f64>().map_err(|e| ApiError::Decode(format!("kline field {s:?}: {e}")));
		Ok(Candle::new(k.0, parse(&k.1)?, parse(&k.2)?, parse(&k.3)?, parse(&k.4)?, parse(&k.5)?))
	}
}

#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookTickerResponse {
	#[serde_as(as = "DisplayFromStr")]
	bid_price: f64,
	#[serde_as(as = "DisplayFromStr")]
	ask_price: f64,
}

#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesOrderResponse {
	order_id: i64,
	status: String,
	#[serde(default)]
	avg_price: Option<String>,
	#[serde_as(as = "DisplayFromStr")]
	executed_qty: f64,
}

impl From<FuturesOrderResponse> for OrderStatus {
	fn from(r: FuturesOrderResponse) -> Self {
		let avg_price = r.avg_price.and_then(|p| p.parse::<f64>().ok()).filter(|p| *p > 0.0);
		OrderStatus::new(r.order_id.to_string(), OrderState::parse(&r.status), avg_price, r.executed_qty)
	}
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct BookTickerEvent {
	#[serde(rename = "s")]
	symbol: String,
	#[serde_as(as = "DisplayFromStr")]
	#[serde(rename = "b")]
	bid: f64,
	#[serde_as(as = "DisplayFromStr")]
	#[serde(rename = "a")]
	ask: f64,
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct AggTradeEvent {
	#[serde(rename = "s")]
	symbol: String,
	#[serde_as(as = "DisplayFromStr")]
	#[serde(rename = "p")]
	price: f64,
	#[serde_as(as = "DisplayFromStr")]
	#[serde(rename = "q")]
	size: f64,
	#[serde(rename = "T")]
	timestamp: i64,
}
//,}}}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn signature_matches_known_vector() {
		let signature = sign("secret_key", "symbol=BTCUSDT&timestamp=1700000000000");
		assert_eq!(signature, "56afe1d6390a020a71097d0f5ccb9a61782d041634dfa58a1709bdad42108e54");
	}

	#[test]
	fn decodes_book_ticker_frame() {
		let stream = BinanceStream::new(false);
		let raw = r#"{"e":"bookTicker","u":400900217,"s":"BTCUSDT","b":"25.35190000","B":"31.21000000","a":"25.36520000","A":"40.66000000","T":1568014460891,"E":1568014460893}"#;
		let events = stream.decode(raw).unwrap();
		assert_eq!(events, vec![StreamEvent::BookTicker {
			symbol: "BTCUSDT".to_string(),
			bid: 25.3519,
			ask: 25.3652,
		}]);
	}

	#[test]
	fn decodes_agg_trade_frame() {
		let stream = BinanceStream::new(false);
		let raw = r#"{"e":"aggTrade","E":123456789,"s":"BTCUSDT","a":5933014,"p":"0.001","q":"100","f":100,"l":105,"T":123456785,"m":true}"#;
		let events = stream.decode(raw).unwrap();
		assert_eq!(events, vec![StreamEvent::Trade {
			symbol: "BTCUSDT".to_string(),
			price: 0.001,
			size: 100.0,
			timestamp: 123456785,
		}]);
	}

	#[test]
	fn untagged_spot_book_ticker_is_normalized() {
		let stream = BinanceStream::new(false);
		let raw = r#"{"u":400900217,"s":"BNBUSDT","b":"25.35190000","B":"31.21000000","a":"25.36520000","A":"40.66000000"}"#;
		let events = stream.decode(raw).unwrap();
		assert_eq!(events, vec![StreamEvent::BookTicker {
			symbol: "BNBUSDT".to_string(),
			bid: 25.3519,
			ask: 25.3652,
		}]);
	}

	#[test]
	fn subscription_ack_decodes_to_nothing() {
		let stream = BinanceStream::new(false);
		assert_eq!(stream.decode(r#"{"result":null,"id":1}"#).unwrap(), Vec::new());
	}

	#[test]
	fn malformed_frame_is_a_decode_error() {
		let stream = BinanceStream::new(false);
		assert!(stream.decode("not json").is_err());
		assert!(stream.decode(r#"{"e":"bookTicker","s":"BTCUSDT"}"#).is_err());
	}

	#[test]
	fn subscribe_frames_carry_incrementing_ids() {
		let stream = BinanceStream::new(false);
		let topic = stream.topic("BTCUSDT", Channel::BookTicker);
		insta::assert_snapshot!(stream.subscribe_frame(&[topic.clone()]), @r###"{"method":"SUBSCRIBE","params":["btcusdt@bookTicker"],"id":1}"###);
		insta::assert_snapshot!(stream.unsubscribe_frame(&[topic]), @r###"{"method":"UNSUBSCRIBE","params":["btcusdt@bookTicker"],"id":2}"###);
	}

	#[test]
	fn contract_derives_steps_from_precisions() {
		let symbol = FuturesSymbol {
			symbol: "BTCUSDT".to_string(),
			base_asset: "BTC".to_string(),
			quote_asset: "USDT".to_string(),
			margin_asset: "USDT".to_string(),
			price_precision: 2,
			quantity_precision: 3,
		};
		let contract = contract_from_symbol(symbol);
		assert!((contract.tick_size - 0.01).abs() < 1e-12);
		assert!((contract.lot_size - 0.001).abs() < 1e-12);
		assert!(contract.is_valid());
		assert!(!contract.inverse);
	}

	#[test]
	fn order_response_normalizes_status_and_avg_price() {
		let unfilled = FuturesOrderResponse {
			order_id: 42,
			status: "NEW".to_string(),
			avg_price: Some("0".to_string()),
			executed_qty: 0.0,
		};
		let status: OrderStatus = unfilled.into();
		assert_eq!(status.order_id, "42");
		assert_eq!(status.status, OrderState::New);
		assert_eq!(status.avg_price, None);

		let filled = FuturesOrderResponse {
			order_id: 42,
			status: "FILLED".to_string(),
			avg_price: Some("50123.46".to_string()),
			executed_qty: 2.0,
		};
		let status: OrderStatus = filled.into();
		assert_eq!(status.status, OrderState::Filled);
		assert_eq!(status.avg_price, Some(50123.46));
	}
}
