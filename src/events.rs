//! The Event Engine: a pull-based poller that turns broker order/fill snapshots into Store
//! writes and controller callbacks. Polls `open_orders()` and `closed_orders(since)` with a
//! lookback window wider than the poll interval so a fill landing between two polls is never
//! missed (spec §4.6), and relies on the Store's `exec_id` uniqueness for exactly-once
//! dispatch (invariant I3).

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::broker::{BrokerOrder, BrokerPort};
use crate::controller::SymbolController;
use crate::error::AppError;
use crate::store::SqliteStore;
use crate::types::{Fill, Order, Side, Symbol};

/// Lookback multiplier applied to the polling interval when fetching closed orders, so a fill
/// that lands just after one poll is still covered by the next (spec §4.6).
const LOOKBACK_MULTIPLIER: i64 = 2;

pub struct EventEngine {
    last_poll: DateTime<Utc>,
}

impl EventEngine {
    pub fn new() -> Self {
        EventEngine { last_poll: Utc::now() }
    }

    /// One pass: fetch open + recently-closed orders, upsert every order row, dedup and
    /// dispatch fills in timestamp order per symbol, and detect entry/protective orders that
    /// closed with no fill attributed.
    pub async fn poll(
        &mut self,
        store: &SqliteStore,
        broker: &dyn BrokerPort,
        controllers: &HashMap<Symbol, SymbolController>,
        config: &crate::config::Config,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let since = self.last_poll - Duration::seconds(config.polling.event_check_seconds as i64 * LOOKBACK_MULTIPLIER);

        let open = broker.open_orders().await?;
        let closed = broker.closed_orders(since).await?;

        let mut by_order_id: HashMap<String, BrokerOrder> = HashMap::new();
        for order in open.into_iter().chain(closed.into_iter()) {
            by_order_id.insert(order.order_id.clone(), order);
        }

        let mut fills_by_symbol: HashMap<Symbol, Vec<Fill>> = HashMap::new();
        let mut closed_without_fill: Vec<Order> = Vec::new();

        for broker_order in by_order_id.values() {
            let order = to_domain_order(broker_order);
            let previously_known = store.get_order(&order.order_id)?;
            store.upsert_order(&order, None)?;

            for broker_fill in &broker_order.fills {
                if store.fill_exists(&broker_fill.exec_id)? {
                    continue;
                }
                let fill = Fill {
                    exec_id: broker_fill.exec_id.clone(),
                    order_id: order.order_id.clone(),
                    symbol: order.symbol.clone(),
                    side: order.side,
                    quantity: broker_fill.quantity,
                    price: broker_fill.price,
                    timestamp: broker_fill.timestamp,
                };
                if store.insert_fill(&fill)? {
                    fills_by_symbol.entry(order.symbol.clone()).or_default().push(fill);
                }
            }

            let was_open = previously_known.as_ref().map(|o| o.status.is_open()).unwrap_or(true);
            if was_open && order.status.is_terminal() && order.filled_quantity.is_zero() && order.is_entry() {
                closed_without_fill.push(order);
            }
        }

        for (symbol, mut fills) in fills_by_symbol {
            fills.sort_by_key(|f| f.timestamp);
            let Some(controller) = controllers.get(&symbol) else {
                warn!(%symbol, "fill received for symbol with no active controller");
                continue;
            };
            for fill in fills {
                self.dispatch_fill(store, broker, controller, config, &symbol, &fill, now).await?;
            }
        }

        for order in closed_without_fill {
            if let Some(controller) = controllers.get(&order.symbol) {
                let state = store.get_or_create_state(&order.symbol)?;
                if state.last_parent_id.as_deref() == Some(order.order_id.as_str()) {
                    controller.on_entry_closed_without_fill(store, &state).await?;
                    info!(symbol = %order.symbol, order_id = %order.order_id, "entry order closed without a fill");
                }
            }
        }

        self.last_poll = now;
        Ok(())
    }

    async fn dispatch_fill(
        &self,
        store: &SqliteStore,
        broker: &dyn BrokerPort,
        controller: &SymbolController,
        config: &crate::config::Config,
        symbol: &Symbol,
        fill: &Fill,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let positions = broker.positions().await?;
        let position_qty_after = positions
            .iter()
            .find(|p| &p.symbol == symbol)
            .map(|p| p.qty)
            .unwrap_or(crate::types::Money::ZERO);

        let state = store.get_or_create_state(symbol)?;

        match fill.side {
            Side::Buy => {
                controller.on_entry_filled(store, broker, &state, config, position_qty_after).await?;
                info!(%symbol, exec_id = %fill.exec_id, qty = %fill.quantity, "entry fill attributed, protective placed");
            }
            Side::Sell => {
                if position_qty_after.is_zero() {
                    let is_stopout = is_stopout_fill(&state, fill);
                    controller.on_position_closed(store, &state, config, now, is_stopout).await?;
                    info!(%symbol, exec_id = %fill.exec_id, is_stopout, "position closed, cooldown evaluated");
                }
            }
        }
        Ok(())
    }
}

impl Default for EventEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// A SELL fill closes the position via the stopout mechanism when it belongs to the tracked
/// protective order (§4.5): the protective order is the only standing SELL side, so a fill
/// against it — trailing stop or fixed crypto stop alike — is what `cooldown_until` gates on,
/// regardless of whether the exit happened to land above or below the entry price.
fn is_stopout_fill(state: &crate::types::SymbolState, exit_fill: &Fill) -> bool {
    state.last_trail_id.as_deref() == Some(exit_fill.order_id.as_str())
}

fn to_domain_order(broker_order: &BrokerOrder) -> Order {
    Order {
        order_id: broker_order.order_id.clone(),
        symbol: broker_order.symbol.clone(),
        side: broker_order.side,
        order_type: broker_order.order_type,
        status: broker_order.status,
        quantity: broker_order.quantity,
        filled_quantity: broker_order.filled_quantity,
        stop_price: broker_order.stop_price,
        limit_price: broker_order.limit_price,
        trailing_pct: None,
        parent_id: broker_order.parent_id.clone(),
        created_at: broker_order.created_at,
        updated_at: broker_order.updated_at,
    }
}
