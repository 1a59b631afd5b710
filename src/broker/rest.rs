//! A concrete `BrokerPort` adapter over a generic HMAC-signed REST trading API, modeled on
//! the pattern of a typical retail broker (paper/live endpoint split, key+secret request
//! signing). Performs the asset-class order-type translation spec §4.3 calls "the hard part":
//! crypto venues in this broker's class reject stop/stop-limit/trailing-stop orders, so the
//! adapter maps the core's abstract `submit_entry`/`submit_protective` calls onto whatever
//! order type the venue actually accepts for that asset class.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

use crate::config::BROKER_RPC_TIMEOUT_SECONDS;
use crate::error::BrokerError;
use crate::types::{AssetClass, Money, OrderStatus, OrderType, Side, Symbol, TimeInForce};

use super::{AccountSnapshot, BrokerFill, BrokerOrder, BrokerPort, PositionSnapshot, Quote};

const LIVE_URL: &str = "https://api.broker.example.com";
const PAPER_URL: &str = "https://paper-api.broker.example.com";

type HmacSha256 = Hmac<Sha256>;

pub struct RestBroker {
    api_key: String,
    api_secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl RestBroker {
    pub fn new(api_key: String, api_secret: String, live: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(BROKER_RPC_TIMEOUT_SECONDS))
            .build()
            .expect("reqwest client builds with a fixed timeout");
        RestBroker {
            api_key,
            api_secret,
            base_url: if live { LIVE_URL } else { PAPER_URL }.to_string(),
            client,
        }
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.api_secret.as_bytes()).expect("HMAC accepts a key of any size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_post(&self, path: &str, body: &str) -> reqwest::RequestBuilder {
        let signature = self.sign(body);
        self.client
            .post(format!("{}{}", self.base_url, path))
            .header("X-API-KEY", &self.api_key)
            .header("X-API-SIGNATURE", signature)
            .header("Content-Type", "application/json")
            .body(body.to_string())
    }

    /// Translates the abstract entry request into the concrete order this venue's asset
    /// class actually accepts (spec §4.3).
    fn entry_order_request(
        &self,
        symbol: &Symbol,
        asset_class: AssetClass,
        qty: Money,
        stop_trigger: Money,
        limit_offset_pct: Option<Money>,
        tif: TimeInForce,
    ) -> WireOrderRequest {
        let qty = qty.to_f64();
        match asset_class {
            AssetClass::Equity => {
                if let Some(slip) = limit_offset_pct {
                    let limit_price = stop_trigger * (Money::ONE + slip / Money::from_f64(100.0));
                    WireOrderRequest {
                        symbol: symbol.as_str().to_string(),
                        side: "buy".to_string(),
                        order_type: "stop_limit".to_string(),
                        qty,
                        stop_price: Some(stop_trigger.round_to_tick().to_f64()),
                        limit_price: Some(limit_price.round_to_tick().to_f64()),
                        trail_percent: None,
                        time_in_force: tif_str(tif).to_string(),
                    }
                } else {
                    WireOrderRequest {
                        symbol: symbol.as_str().to_string(),
                        side: "buy".to_string(),
                        order_type: "stop".to_string(),
                        qty,
                        stop_price: Some(stop_trigger.round_to_tick().to_f64()),
                        limit_price: None,
                        trail_percent: None,
                        time_in_force: tif_str(tif).to_string(),
                    }
                }
            }
            AssetClass::Crypto => WireOrderRequest {
                symbol: symbol.as_str().to_string(),
                side: "buy".to_string(),
                order_type: "limit".to_string(),
                qty,
                stop_price: None,
                limit_price: Some(stop_trigger.round_to_tick().to_f64()),
                trail_percent: None,
                time_in_force: "gtc".to_string(),
            },
        }
    }

    fn protective_order_request(
        &self,
        symbol: &Symbol,
        asset_class: AssetClass,
        qty: Money,
        trail_pct_or_fixed_stop: Money,
        entry_fill_price: Option<Money>,
        tif: TimeInForce,
    ) -> WireOrderRequest {
        let qty = qty.to_f64();
        match asset_class {
            AssetClass::Equity => WireOrderRequest {
                symbol: symbol.as_str().to_string(),
                side: "sell".to_string(),
                order_type: "trailing_stop".to_string(),
                qty,
                stop_price: None,
                limit_price: None,
                trail_percent: Some(trail_pct_or_fixed_stop.to_f64()),
                time_in_force: tif_str(tif).to_string(),
            },
            AssetClass::Crypto => {
                // Documented limitation (spec §4.3, §9): a fixed protective level, not a
                // trailing one. entry_fill_price x (1 - trail_pct) computed once at
                // submission time.
                let entry = entry_fill_price.unwrap_or(Money::ZERO);
                let fixed_stop = entry * (Money::ONE - trail_pct_or_fixed_stop / Money::from_f64(100.0));
                WireOrderRequest {
                    symbol: symbol.as_str().to_string(),
                    side: "sell".to_string(),
                    order_type: "limit".to_string(),
                    qty,
                    stop_price: None,
                    limit_price: Some(fixed_stop.round_to_tick().to_f64()),
                    trail_percent: None,
                    time_in_force: "gtc".to_string(),
                }
            }
        }
    }
}

fn tif_str(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::Day => "day",
        TimeInForce::Gtc => "gtc",
    }
}

#[derive(Debug, Serialize)]
struct WireOrderRequest {
    symbol: String,
    side: String,
    order_type: String,
    qty: f64,
    stop_price: Option<f64>,
    limit_price: Option<f64>,
    trail_percent: Option<f64>,
    time_in_force: String,
}

#[derive(Debug, Deserialize)]
struct WireOrderResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireQuote {
    price: f64,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct WireAccount {
    equity: f64,
    cash: f64,
    buying_power: f64,
    position_value: f64,
}

#[derive(Debug, Deserialize)]
struct WireOrder {
    id: String,
    symbol: String,
    side: String,
    order_type: String,
    status: String,
    qty: f64,
    filled_qty: f64,
    filled_avg_price: Option<f64>,
    stop_price: Option<f64>,
    limit_price: Option<f64>,
    parent_id: Option<String>,
    created_at: String,
    updated_at: String,
    #[serde(default)]
    fills: Vec<WireFill>,
}

#[derive(Debug, Deserialize)]
struct WireFill {
    exec_id: String,
    qty: f64,
    price: f64,
    timestamp: String,
}

#[derive(Debug, Deserialize)]
struct WirePosition {
    symbol: String,
    qty: f64,
    avg_entry_price: f64,
}

fn parse_side(s: &str) -> Side {
    if s.eq_ignore_ascii_case("buy") {
        Side::Buy
    } else {
        Side::Sell
    }
}

fn parse_order_type(s: &str) -> OrderType {
    match s {
        "limit" => OrderType::Limit,
        "stop" => OrderType::Stop,
        "stop_limit" => OrderType::StopLimit,
        "trailing_stop" => OrderType::TrailingStop,
        _ => OrderType::Market,
    }
}

fn parse_status(s: &str) -> OrderStatus {
    match s {
        "filled" => OrderStatus::Filled,
        "partially_filled" => OrderStatus::PartiallyFilled,
        "canceled" | "cancelled" => OrderStatus::Canceled,
        "rejected" => OrderStatus::Rejected,
        "expired" => OrderStatus::Expired,
        _ => OrderStatus::Open,
    }
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl From<WireOrder> for BrokerOrder {
    fn from(wire: WireOrder) -> Self {
        BrokerOrder {
            order_id: wire.id,
            symbol: Symbol::new(&wire.symbol),
            side: parse_side(&wire.side),
            order_type: parse_order_type(&wire.order_type),
            status: parse_status(&wire.status),
            quantity: Money::from_f64(wire.qty),
            filled_quantity: Money::from_f64(wire.filled_qty),
            average_fill_price: wire.filled_avg_price.map(Money::from_f64),
            stop_price: wire.stop_price.map(Money::from_f64),
            limit_price: wire.limit_price.map(Money::from_f64),
            parent_id: wire.parent_id,
            created_at: parse_dt(&wire.created_at),
            updated_at: parse_dt(&wire.updated_at),
            fills: wire
                .fills
                .into_iter()
                .map(|f| BrokerFill {
                    exec_id: f.exec_id,
                    quantity: Money::from_f64(f.qty),
                    price: Money::from_f64(f.price),
                    timestamp: parse_dt(&f.timestamp),
                })
                .collect(),
        }
    }
}

fn map_transport_err(err: reqwest::Error) -> BrokerError {
    BrokerError::Transport(err.to_string())
}

async fn parse_or_validation_error<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> Result<T, BrokerError> {
    let status = response.status();
    if status.is_client_error() {
        let body = response.text().await.unwrap_or_default();
        return Err(BrokerError::Validation(body));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BrokerError::Transport(format!("status {}: {}", status, body)));
    }
    response.json::<T>().await.map_err(map_transport_err)
}

#[async_trait]
impl BrokerPort for RestBroker {
    async fn last_price(&self, symbol: &Symbol) -> Result<Quote, BrokerError> {
        let response = self
            .client
            .get(format!("{}/v1/quotes/{}", self.base_url, symbol.as_str()))
            .send()
            .await
            .map_err(map_transport_err)?;
        let quote: WireQuote = parse_or_validation_error(response).await?;
        Ok(Quote {
            price: Money::from_f64(quote.price),
            timestamp: DateTime::from_timestamp_millis(quote.timestamp).unwrap_or_else(Utc::now),
        })
    }

    async fn account_snapshot(&self) -> Result<AccountSnapshot, BrokerError> {
        let response = self
            .client
            .get(format!("{}/v1/account", self.base_url))
            .header("X-API-KEY", &self.api_key)
            .send()
            .await
            .map_err(map_transport_err)?;
        let account: WireAccount = parse_or_validation_error(response).await?;
        Ok(AccountSnapshot {
            equity: Money::from_f64(account.equity),
            cash: Money::from_f64(account.cash),
            buying_power: Money::from_f64(account.buying_power),
            position_value: Money::from_f64(account.position_value),
        })
    }

    async fn open_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
        let response = self
            .client
            .get(format!("{}/v1/orders?status=open", self.base_url))
            .header("X-API-KEY", &self.api_key)
            .send()
            .await
            .map_err(map_transport_err)?;
        let orders: Vec<WireOrder> = parse_or_validation_error(response).await?;
        Ok(orders.into_iter().map(Into::into).collect())
    }

    async fn closed_orders(&self, since: DateTime<Utc>) -> Result<Vec<BrokerOrder>, BrokerError> {
        let response = self
            .client
            .get(format!(
                "{}/v1/orders?status=closed&since={}",
                self.base_url,
                since.to_rfc3339()
            ))
            .header("X-API-KEY", &self.api_key)
            .send()
            .await
            .map_err(map_transport_err)?;
        let orders: Vec<WireOrder> = parse_or_validation_error(response).await?;
        Ok(orders.into_iter().map(Into::into).collect())
    }

    async fn positions(&self) -> Result<Vec<PositionSnapshot>, BrokerError> {
        let response = self
            .client
            .get(format!("{}/v1/positions", self.base_url))
            .header("X-API-KEY", &self.api_key)
            .send()
            .await
            .map_err(map_transport_err)?;
        let positions: Vec<WirePosition> = parse_or_validation_error(response).await?;
        Ok(positions
            .into_iter()
            .map(|p| PositionSnapshot {
                symbol: Symbol::new(&p.symbol),
                qty: Money::from_f64(p.qty),
                avg_entry_price: Money::from_f64(p.avg_entry_price),
            })
            .collect())
    }

    async fn submit_entry(
        &self,
        symbol: &Symbol,
        asset_class: AssetClass,
        qty: Money,
        stop_trigger: Money,
        limit_offset_pct: Option<Money>,
        tif: TimeInForce,
    ) -> Result<String, BrokerError> {
        let request = self.entry_order_request(symbol, asset_class, qty, stop_trigger, limit_offset_pct, tif);
        let body = serde_json::to_string(&request).map_err(|e| BrokerError::Validation(e.to_string()))?;
        let response = self
            .signed_post("/v1/orders", &body)
            .send()
            .await
            .map_err(map_transport_err)?;
        let order: WireOrderResponse = parse_or_validation_error(response).await?;
        Ok(order.id)
    }

    async fn submit_protective(
        &self,
        symbol: &Symbol,
        asset_class: AssetClass,
        qty: Money,
        trail_pct_or_fixed_stop: Money,
        tif: TimeInForce,
    ) -> Result<String, BrokerError> {
        // The fixed crypto stop is computed off the entry fill price, which the core does not
        // pass explicitly; re-derive it from the current quote (equal to the entry fill price
        // immediately after an entry fills, since this is called right after fill attribution).
        let entry_fill_price = if asset_class == AssetClass::Crypto {
            Some(self.last_price(symbol).await?.price)
        } else {
            None
        };
        let request = self.protective_order_request(
            symbol,
            asset_class,
            qty,
            trail_pct_or_fixed_stop,
            entry_fill_price,
            tif,
        );
        let body = serde_json::to_string(&request).map_err(|e| BrokerError::Validation(e.to_string()))?;
        let response = self
            .signed_post("/v1/orders", &body)
            .send()
            .await
            .map_err(map_transport_err)?;
        let order: WireOrderResponse = parse_or_validation_error(response).await?;
        Ok(order.id)
    }

    async fn cancel(&self, order_id: &str) -> Result<bool, BrokerError> {
        let response = self
            .signed_post(&format!("/v1/orders/{}/cancel", order_id), "{}")
            .send()
            .await
            .map_err(map_transport_err)?;
        match response.status().as_u16() {
            200..=299 => Ok(true),
            404 | 409 => Ok(false),
            status if (400..500).contains(&status) => {
                let body = response.text().await.unwrap_or_default();
                Err(BrokerError::Validation(body))
            }
            status => Err(BrokerError::Transport(format!("status {}", status))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> RestBroker {
        RestBroker::new("key".to_string(), "secret".to_string(), false)
    }

    #[test]
    fn equity_entry_translates_to_stop_order() {
        let request = broker().entry_order_request(
            &Symbol::new("TSLA"),
            AssetClass::Equity,
            Money::from_f64(4.0),
            Money::from_f64(262.50),
            None,
            TimeInForce::Day,
        );
        assert_eq!(request.order_type, "stop");
        assert_eq!(request.stop_price, Some(262.5));
        assert_eq!(request.time_in_force, "day");
    }

    #[test]
    fn equity_entry_with_slippage_cap_becomes_stop_limit() {
        let request = broker().entry_order_request(
            &Symbol::new("TSLA"),
            AssetClass::Equity,
            Money::from_f64(4.0),
            Money::from_f64(262.50),
            Some(Money::from_f64(0.5)),
            TimeInForce::Day,
        );
        assert_eq!(request.order_type, "stop_limit");
        assert!(request.limit_price.unwrap() > request.stop_price.unwrap());
    }

    #[test]
    fn crypto_entry_translates_to_limit_order() {
        let request = broker().entry_order_request(
            &Symbol::new("BTC/USD"),
            AssetClass::Crypto,
            Money::from_f64(0.01),
            Money::from_f64(100_000.0),
            None,
            TimeInForce::Gtc,
        );
        assert_eq!(request.order_type, "limit");
        assert_eq!(request.limit_price, Some(100_000.0));
        assert_eq!(request.time_in_force, "gtc");
    }

    #[test]
    fn equity_protective_translates_to_trailing_stop() {
        let request = broker().protective_order_request(
            &Symbol::new("TSLA"),
            AssetClass::Equity,
            Money::from_f64(4.0),
            Money::from_f64(10.0),
            None,
            TimeInForce::Gtc,
        );
        assert_eq!(request.order_type, "trailing_stop");
        assert_eq!(request.trail_percent, Some(10.0));
    }

    #[test]
    fn crypto_protective_translates_to_fixed_limit() {
        let request = broker().protective_order_request(
            &Symbol::new("BTC/USD"),
            AssetClass::Crypto,
            Money::from_f64(0.01),
            Money::from_f64(8.0),
            Some(Money::from_f64(100_000.0)),
            TimeInForce::Gtc,
        );
        assert_eq!(request.order_type, "limit");
        assert_eq!(request.limit_price, Some(92_000.0));
    }
}
