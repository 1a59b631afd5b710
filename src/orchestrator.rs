//! The tick loop: gates on the calendar, runs the Event Engine, then every symbol controller,
//! handles EOD cancellation, keepalive pings, and the daily performance snapshot. Shuts down
//! gracefully on SIGINT/SIGTERM — finishes the in-flight tick and flushes the Store, but never
//! cancels open orders on exit (spec §4.7: a restart must recover the same state it left).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::interval;
use tracing::{info, warn};

use crate::broker::BrokerPort;
use crate::clock::{Calendar, NyseCalendar};
use crate::config::Config;
use crate::controller::{SymbolController, TickContext};
use crate::error::AppError;
use crate::events::EventEngine;
use crate::store::SqliteStore;
use crate::types::{AssetClass, Money, PerformanceSnapshot, Symbol};

pub struct Orchestrator {
    config: Config,
    store: SqliteStore,
    broker: Arc<dyn BrokerPort>,
    calendar: NyseCalendar,
    controllers: HashMap<Symbol, SymbolController>,
    events: EventEngine,
}

impl Orchestrator {
    pub fn new(config: Config, store: SqliteStore, broker: Arc<dyn BrokerPort>) -> Self {
        let controllers = config
            .all_symbols()
            .into_iter()
            .map(|entry| (entry.symbol.clone(), SymbolController::new(entry.symbol, entry.asset_class)))
            .collect();

        Orchestrator {
            config,
            store,
            broker,
            calendar: NyseCalendar::new(),
            controllers,
            events: EventEngine::new(),
        }
    }

    /// Runs until SIGINT/SIGTERM. On startup, warns (does not fail) if the config hash changed
    /// since the last run (spec §C).
    pub async fn run(mut self) -> Result<(), AppError> {
        if let Some(previous_hash) = self.store.get_config_hash()? {
            if previous_hash != self.config.config_hash() {
                warn!("configuration changed since last run; continuing with the new configuration");
            }
        }
        self.store.set_config_hash(self.config.config_hash())?;

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        let mut price_tick = interval(StdDuration::from_secs(self.config.polling.price_seconds));
        let mut keepalive_tick = interval(StdDuration::from_secs(self.config.polling.keepalive_seconds));

        let mut last_snapshot_date = self.store.last_snapshot_date()?;

        info!("orchestrator started");

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("SIGTERM received, shutting down after the in-flight tick");
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT received, shutting down after the in-flight tick");
                    break;
                }
                _ = price_tick.tick() => {
                    // The Event Engine must complete before any controller runs this round
                    // (spec §5): controllers read order rows the Event Engine's upsert pass
                    // populates, so a poll failure here means skipping the controller pass
                    // rather than deciding against stale data.
                    if let Err(e) = self.events.poll(&self.store, self.broker.as_ref(), &self.controllers, &self.config, Utc::now()).await {
                        warn!(error = %e, "event engine poll failed");
                        continue;
                    }
                    if let Err(e) = self.run_symbol_ticks().await {
                        warn!(error = %e, "symbol tick pass failed");
                    }
                    if let Err(e) = self.maybe_cancel_at_eod().await {
                        warn!(error = %e, "EOD cancel pass failed");
                    }
                    if let Err(e) = self.maybe_record_daily_snapshot(&mut last_snapshot_date).await {
                        warn!(error = %e, "daily snapshot failed");
                    }
                }
                _ = keepalive_tick.tick() => {
                    if let Err(e) = self.broker.account_snapshot().await {
                        warn!(error = %e, "keepalive ping failed");
                    }
                }
            }
        }

        self.store.export_json()?;
        info!("orchestrator stopped cleanly");
        Ok(())
    }

    async fn run_symbol_ticks(&self) -> Result<(), AppError> {
        let account = self.broker.account_snapshot().await?;
        let positions = self.broker.positions().await?;
        let current_exposure: HashMap<String, Money> = positions
            .iter()
            .map(|p| (p.symbol.as_str().to_string(), p.qty * p.avg_entry_price))
            .collect();

        for (symbol, controller) in &self.controllers {
            let state = self.store.get_or_create_state(symbol)?;
            let open_orders = self.store.open_orders(symbol)?;
            let position_qty = positions.iter().find(|p| &p.symbol == symbol).map(|p| p.qty).unwrap_or(Money::ZERO);
            let last_price = self.broker.last_price(symbol).await.ok();
            let calendar_open = self.calendar.is_tradable_now(symbol, controller.asset_class, Utc::now());

            let ctx = TickContext {
                now: Utc::now(),
                state: &state,
                position_qty,
                open_orders: &open_orders,
                last_price,
                calendar_open,
                config: &self.config,
                account: &account,
                current_exposure_by_symbol: &current_exposure,
            };

            let action = controller.decide(&ctx);
            if let Err(e) = controller.apply(action, &self.store, self.broker.as_ref(), &state, &self.config).await {
                warn!(%symbol, error = %e, "tick action failed");
            }
        }
        Ok(())
    }

    /// Cancels open equity entry orders inside the EOD cancel window (spec §4.7). Crypto never
    /// closes, so this is a no-op for crypto symbols.
    async fn maybe_cancel_at_eod(&self) -> Result<(), AppError> {
        if !self.config.entries.cancel_at_close {
            return Ok(());
        }
        let now = Utc::now();
        for (symbol, controller) in &self.controllers {
            if controller.asset_class != AssetClass::Equity {
                continue;
            }
            let minutes_left = self.calendar.minutes_until_close(symbol, controller.asset_class, now);
            if let Some(minutes_left) = minutes_left {
                if minutes_left <= crate::config::EOD_CANCEL_MINUTES && minutes_left >= 0 {
                    let open_orders = self.store.open_orders(symbol)?;
                    for order in open_orders.iter().filter(|o| o.is_entry()) {
                        self.broker.cancel(&order.order_id).await?;
                        info!(%symbol, order_id = %order.order_id, "entry canceled at end of day");
                    }
                }
            }
        }
        Ok(())
    }

    /// Records one performance snapshot on the first tick of each new calendar date in the
    /// exchange timezone (spec §C / Open Question 3).
    async fn maybe_record_daily_snapshot(&self, last_snapshot_date: &mut Option<chrono::NaiveDate>) -> Result<(), AppError> {
        let today = crate::clock::to_ny_date(Utc::now());
        if *last_snapshot_date == Some(today) {
            return Ok(());
        }

        let account = self.broker.account_snapshot().await?;
        let open_orders_count: usize = self
            .controllers
            .keys()
            .map(|s| self.store.open_orders(s).map(|v| v.len()))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .sum();
        let positions = self.broker.positions().await?;

        let snapshot = PerformanceSnapshot {
            date: today,
            account_value: account.equity,
            cash: account.cash,
            position_value: account.position_value,
            realized_pnl: Money::ZERO,
            unrealized_pnl: Money::ZERO,
            daily_pnl: Money::ZERO,
            open_position_count: positions.len(),
            open_order_count: open_orders_count,
        };
        self.store.record_daily_snapshot(&snapshot)?;
        *last_snapshot_date = Some(today);
        info!(date = %today, "daily performance snapshot recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eod_window_is_inclusive_of_the_boundary() {
        assert!(crate::config::EOD_CANCEL_MINUTES >= 0);
    }
}
