//! The Broker Port: a narrow capability interface over a remote broker's REST trading API.
//! The core depends on these operations only — any adapter implementing `BrokerPort` for a
//! real venue can be substituted without touching the controller, sizer, or event engine.

pub mod rest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::types::{AssetClass, Money, OrderStatus, OrderType, Side, Symbol, TimeInForce};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub price: Money,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub equity: Money,
    pub cash: Money,
    pub buying_power: Money,
    pub position_value: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub quantity: Money,
    pub filled_quantity: Money,
    pub average_fill_price: Option<Money>,
    pub stop_price: Option<Money>,
    pub limit_price: Option<Money>,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub fills: Vec<BrokerFill>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerFill {
    pub exec_id: String,
    pub quantity: Money,
    pub price: Money,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: Symbol,
    pub qty: Money,
    pub avg_entry_price: Money,
}

/// The capability interface the core depends on (spec §4.3). A REST broker adapter implements
/// this trait; the core never speaks to `reqwest` directly.
#[async_trait]
pub trait BrokerPort: Send + Sync {
    async fn last_price(&self, symbol: &Symbol) -> Result<Quote, BrokerError>;

    async fn account_snapshot(&self) -> Result<AccountSnapshot, BrokerError>;

    async fn open_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError>;

    async fn closed_orders(&self, since: DateTime<Utc>) -> Result<Vec<BrokerOrder>, BrokerError>;

    async fn positions(&self) -> Result<Vec<PositionSnapshot>, BrokerError>;

    /// Submits a breakout entry. The adapter translates to the broker's concrete order type
    /// per the asset class (spec §4.3): equity -> STOP/STOP_LIMIT DAY; crypto -> LIMIT GTC at
    /// the stop-trigger price.
    #[allow(clippy::too_many_arguments)]
    async fn submit_entry(
        &self,
        symbol: &Symbol,
        asset_class: AssetClass,
        qty: Money,
        stop_trigger: Money,
        limit_offset_pct: Option<Money>,
        tif: TimeInForce,
    ) -> Result<String, BrokerError>;

    /// Submits (or re-submits, cancel+replace) a protective order for `qty`. Equity ->
    /// TRAILING_STOP GTC; crypto -> fixed-price LIMIT sell GTC (no client-side trailing).
    async fn submit_protective(
        &self,
        symbol: &Symbol,
        asset_class: AssetClass,
        qty: Money,
        trail_pct_or_fixed_stop: Money,
        tif: TimeInForce,
    ) -> Result<String, BrokerError>;

    /// `Ok(true)` if the order was canceled, `Ok(false)` if it was already done (filled,
    /// already canceled, etc.) — not an error in either case.
    async fn cancel(&self, order_id: &str) -> Result<bool, BrokerError>;
}
