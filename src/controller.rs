//! The per-symbol state machine (spec §4.5). Status is derived every tick from the Store and
//! the broker snapshot — never trusted from memory — which is what makes restart recovery
//! free. Decisions are pure functions over a `TickContext`; only `apply` touches the Store or
//! the Broker Port.

use chrono::{DateTime, Utc};

use crate::broker::{AccountSnapshot, BrokerPort, Quote};
use crate::config::Config;
use crate::error::BrokerError;
use crate::sizer::{self, SizerInputs};
use crate::store::SqliteStore;
use crate::types::{AssetClass, ControllerStatus, Event, Money, Order, Side, Symbol, SymbolState, TimeInForce};

/// The single action a tick decides on, per spec §4.5 ("it decides a single action").
#[derive(Debug, Clone, PartialEq)]
pub enum TickAction {
    None,
    SkipStaleQuote,
    GateClosed,
    AdmissionRejected(String),
    PlaceEntry {
        qty: Money,
        trigger_price: Money,
    },
    PlaceProtective {
        qty: Money,
    },
    ReplaceProtective {
        cancel_order_id: String,
        new_qty: Money,
    },
    CancelDuplicateProtectives {
        keep_order_id: String,
        cancel_order_ids: Vec<String>,
    },
    ClearExpiredCooldown,
}

pub struct TickContext<'a> {
    pub now: DateTime<Utc>,
    pub state: &'a SymbolState,
    pub position_qty: Money,
    pub open_orders: &'a [Order],
    pub last_price: Option<Quote>,
    pub calendar_open: bool,
    pub config: &'a Config,
    pub account: &'a AccountSnapshot,
    pub current_exposure_by_symbol: &'a std::collections::HashMap<String, Money>,
}

pub struct SymbolController {
    pub symbol: Symbol,
    pub asset_class: AssetClass,
}

impl SymbolController {
    pub fn new(symbol: Symbol, asset_class: AssetClass) -> Self {
        SymbolController { symbol, asset_class }
    }

    /// Status derivation, done every tick (spec §4.5): the broker snapshot and the persisted
    /// cooldown are authoritative; local state is advisory.
    pub fn derive_status(state: &SymbolState, position_qty: Money, open_orders: &[Order], now: DateTime<Utc>) -> ControllerStatus {
        if position_qty.is_positive() {
            return ControllerStatus::PositionOpen;
        }
        if state.in_cooldown(now) {
            return ControllerStatus::Cooldown;
        }
        let has_open_entry = open_orders
            .iter()
            .any(|o| o.side == Side::Buy && o.parent_id.is_none() && o.status.is_open());
        if has_open_entry {
            return ControllerStatus::EntryPending;
        }
        ControllerStatus::NoPosition
    }

    /// Pure decision function: no I/O, fully testable.
    pub fn decide(&self, ctx: &TickContext) -> TickAction {
        let status = Self::derive_status(ctx.state, ctx.position_qty, ctx.open_orders, ctx.now);
        match status {
            ControllerStatus::NoPosition => self.decide_entry(ctx),
            ControllerStatus::EntryPending => TickAction::None,
            ControllerStatus::PositionOpen => self.reconcile_protective(ctx),
            ControllerStatus::Cooldown => {
                if !ctx.state.in_cooldown(ctx.now) {
                    TickAction::ClearExpiredCooldown
                } else {
                    TickAction::None
                }
            }
        }
    }

    fn decide_entry(&self, ctx: &TickContext) -> TickAction {
        if !ctx.calendar_open {
            return TickAction::GateClosed;
        }
        let quote = match ctx.last_price {
            Some(q) => q,
            None => return TickAction::SkipStaleQuote,
        };
        let staleness = ctx.now.signed_duration_since(quote.timestamp).num_seconds();
        if staleness > crate::config::STALENESS_WINDOW_SECONDS {
            return TickAction::SkipStaleQuote;
        }

        let entry_pct = Money::from_f64(ctx.config.entries.buy_stop_pct_above_last);
        let trigger = (quote.price * (Money::ONE + entry_pct / Money::from_f64(100.0))).round_to_tick();

        let sizer_inputs = SizerInputs {
            symbol: &self.symbol,
            last_price: quote.price,
            allocation: &ctx.config.allocation,
            max_symbol_exposure_usd: Money::from_f64(ctx.config.risk.max_symbol_exposure_usd),
            max_total_exposure_usd: Money::from_f64(ctx.config.risk.max_total_exposure_usd),
            account: ctx.account,
            current_exposure_by_symbol: ctx.current_exposure_by_symbol,
        };

        match sizer::size(&sizer_inputs) {
            Ok(qty) => TickAction::PlaceEntry { qty, trigger_price: trigger },
            Err(BrokerError::AdmissionRejected(reason)) => TickAction::AdmissionRejected(reason),
            Err(_) => TickAction::None,
        }
    }

    fn reconcile_protective(&self, ctx: &TickContext) -> TickAction {
        if let Some(submitted_at) = ctx.state.last_protective_submitted_at {
            let age = ctx.now.signed_duration_since(submitted_at).num_seconds();
            if age < crate::config::STABILIZATION_WINDOW_SECONDS {
                return TickAction::None;
            }
        }

        let protectives: Vec<&Order> = ctx.open_orders.iter().filter(|o| o.is_protective()).collect();

        match protectives.len() {
            0 => TickAction::PlaceProtective { qty: ctx.position_qty },
            1 => {
                let p = protectives[0];
                if p.quantity != ctx.position_qty {
                    TickAction::ReplaceProtective {
                        cancel_order_id: p.order_id.clone(),
                        new_qty: ctx.position_qty,
                    }
                } else {
                    TickAction::None
                }
            }
            _ => {
                let keep = protectives
                    .iter()
                    .filter(|o| o.quantity == ctx.position_qty)
                    .min_by_key(|o| o.created_at)
                    .or_else(|| protectives.iter().min_by_key(|o| o.created_at))
                    .expect("protectives is non-empty in this branch");
                let cancel_order_ids = protectives
                    .iter()
                    .filter(|o| o.order_id != keep.order_id)
                    .map(|o| o.order_id.clone())
                    .collect();
                TickAction::CancelDuplicateProtectives {
                    keep_order_id: keep.order_id.clone(),
                    cancel_order_ids,
                }
            }
        }
    }

    /// Executes the decided action: the only place in the controller that touches the Store
    /// or the Broker Port.
    pub async fn apply(
        &self,
        action: TickAction,
        store: &SqliteStore,
        broker: &dyn BrokerPort,
        state: &SymbolState,
        config: &Config,
    ) -> Result<(), BrokerError> {
        match action {
            TickAction::None | TickAction::SkipStaleQuote | TickAction::GateClosed => Ok(()),
            TickAction::AdmissionRejected(reason) => {
                store
                    .append_event(&Event::new(
                        "admission_rejected",
                        Some(self.symbol.clone()),
                        serde_json::json!({ "reason": reason }),
                    ))
                    .map_err(|e| BrokerError::Transport(e.to_string()))
            }
            TickAction::PlaceEntry { qty, trigger_price } => {
                let tif = match config.entries.tif {
                    crate::config::Tif::Day => TimeInForce::Day,
                    crate::config::Tif::Gtc => TimeInForce::Gtc,
                };
                let limit_offset = matches!(config.entries.entry_type, crate::config::EntryType::BuyStopLimit)
                    .then(|| Money::from_f64(config.entries.stop_limit_max_slip_pct));
                let order_id = broker
                    .submit_entry(&self.symbol, self.asset_class, qty, trigger_price, limit_offset, tif)
                    .await?;
                let mut new_state = state.clone();
                new_state.last_parent_id = Some(order_id.clone());
                store
                    .upsert_state(
                        &new_state,
                        Event::new(
                            "entry_order_placed",
                            Some(self.symbol.clone()),
                            serde_json::json!({ "order_id": order_id, "qty": qty.to_f64(), "trigger": trigger_price.to_f64() }),
                        ),
                    )
                    .map_err(|e| BrokerError::Transport(e.to_string()))
            }
            TickAction::PlaceProtective { qty } => {
                // Reached whenever POSITION_OPEN reconciliation finds zero protective orders:
                // either none was ever placed, or one was canceled externally. Both are a
                // recreation, not the initial post-entry placement (spec §4.5, §6).
                self.submit_protective(store, broker, state, config, qty, "protective_recreated").await
            }
            TickAction::ReplaceProtective { cancel_order_id, new_qty } => {
                broker.cancel(&cancel_order_id).await?;
                store
                    .append_event(&Event::new(
                        "protective_requantified",
                        Some(self.symbol.clone()),
                        serde_json::json!({ "canceled_order_id": cancel_order_id }),
                    ))
                    .map_err(|e| BrokerError::Transport(e.to_string()))?;
                self.submit_protective(store, broker, state, config, new_qty, "trailing_stop_placed_after_entry").await
            }
            TickAction::CancelDuplicateProtectives { keep_order_id, cancel_order_ids } => {
                for order_id in &cancel_order_ids {
                    broker.cancel(order_id).await?;
                    store
                        .append_event(&Event::new(
                            "duplicate_stop_cancelled",
                            Some(self.symbol.clone()),
                            serde_json::json!({ "canceled_order_id": order_id, "kept_order_id": keep_order_id }),
                        ))
                        .map_err(|e| BrokerError::Transport(e.to_string()))?;
                }
                Ok(())
            }
            TickAction::ClearExpiredCooldown => store
                .clear_cooldown(&self.symbol)
                .map_err(|e| BrokerError::Transport(e.to_string())),
        }
    }

    async fn submit_protective(
        &self,
        store: &SqliteStore,
        broker: &dyn BrokerPort,
        state: &SymbolState,
        config: &Config,
        qty: Money,
        event_type: &str,
    ) -> Result<(), BrokerError> {
        let tif = match config.stops.tif {
            crate::config::Tif::Day => TimeInForce::Day,
            crate::config::Tif::Gtc => TimeInForce::Gtc,
        };
        let order_id = broker
            .submit_protective(&self.symbol, self.asset_class, qty, Money::from_f64(config.stops.trailing_stop_pct), tif)
            .await?;
        let mut new_state = state.clone();
        new_state.last_trail_id = Some(order_id.clone());
        new_state.last_protective_submitted_at = Some(Utc::now());
        store
            .upsert_state(
                &new_state,
                Event::new(
                    event_type,
                    Some(self.symbol.clone()),
                    serde_json::json!({ "order_id": order_id, "qty": qty.to_f64() }),
                ),
            )
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }

    /// Called by the Event Engine when a BUY fill brings the position from flat to positive
    /// (ENTRY_PENDING -> POSITION_OPEN), or adds to an already-open position (additive fill).
    pub async fn on_entry_filled(
        &self,
        store: &SqliteStore,
        broker: &dyn BrokerPort,
        state: &SymbolState,
        config: &Config,
        position_qty_after_fill: Money,
    ) -> Result<(), BrokerError> {
        let existing_protective = store
            .open_orders(&self.symbol)
            .map_err(|e| BrokerError::Transport(e.to_string()))?
            .into_iter()
            .find(|o| o.is_protective());

        if let Some(existing) = existing_protective {
            broker.cancel(&existing.order_id).await?;
        }
        self.submit_protective(store, broker, state, config, position_qty_after_fill, "trailing_stop_placed_after_entry").await
    }

    /// Called by the Event Engine when a SELL fill brings the position to zero
    /// (POSITION_OPEN -> COOLDOWN). `is_stopout` follows spec invariant I3: cooldown is set iff
    /// the closing SELL fill belongs to the tracked protective order, not whether the exit
    /// happened to land above or below entry price.
    pub async fn on_position_closed(
        &self,
        store: &SqliteStore,
        state: &SymbolState,
        config: &Config,
        now: DateTime<Utc>,
        is_stopout: bool,
    ) -> Result<(), BrokerError> {
        let mut new_state = state.clone();
        new_state.last_trail_id = None;
        if is_stopout {
            new_state.cooldown_until = Some(now + chrono::Duration::minutes(config.cooldowns.after_stopout_minutes));
        }
        store
            .upsert_state(
                &new_state,
                Event::new(
                    "stopout_cooldown_started",
                    Some(self.symbol.clone()),
                    serde_json::json!({ "cooldown_until": new_state.cooldown_until.map(|t| t.to_rfc3339()) }),
                ),
            )
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }

    /// Called by the Event Engine when the tracked entry order reaches a terminal status
    /// (canceled, rejected, expired) with no fill attributed (ENTRY_PENDING -> NO_POSITION).
    /// No cooldown.
    pub async fn on_entry_closed_without_fill(&self, store: &SqliteStore, state: &SymbolState) -> Result<(), BrokerError> {
        let mut new_state = state.clone();
        new_state.last_parent_id = None;
        store
            .upsert_state(
                &new_state,
                Event::new("entry_order_closed_without_fill", Some(self.symbol.clone()), serde_json::json!({})),
            )
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }
}
