//! Durable, restart-safe persistence: five tables (state, orders, fills, events,
//! performance_snapshots) with idempotent writes keyed on `symbol`, `order_id`, and
//! `exec_id`. Every write that changes observable state commits atomically with its
//! corresponding event-log append — a crash between the two is not permitted.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::types::{Event, Fill, Money, Order, OrderStatus, OrderType, PerformanceSnapshot, Side, Symbol, SymbolState};

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    json_export_path: PathBuf,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(db_path: P, json_export_path: P) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = json_export_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
            json_export_path: json_export_path.as_ref().to_path_buf(),
        };
        store.create_tables()?;
        info!("store initialized");
        Ok(store)
    }

    /// In-memory database, for tests and the mock-broker integration harness.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
            json_export_path: PathBuf::from("state_export.json"),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS state (
                symbol TEXT PRIMARY KEY,
                cooldown_until TEXT,
                last_parent_id TEXT,
                last_trail_id TEXT,
                last_protective_submitted_at TEXT,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS orders (
                order_id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                status TEXT NOT NULL,
                quantity TEXT NOT NULL,
                filled_quantity TEXT NOT NULL,
                stop_price TEXT,
                limit_price TEXT,
                trailing_pct TEXT,
                parent_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS fills (
                exec_id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                symbol TEXT,
                payload TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS performance_snapshots (
                date TEXT PRIMARY KEY,
                account_value TEXT NOT NULL,
                cash TEXT NOT NULL,
                position_value TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                unrealized_pnl TEXT NOT NULL,
                daily_pnl TEXT NOT NULL,
                open_position_count INTEGER NOT NULL,
                open_order_count INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS housekeeping (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute("CREATE INDEX IF NOT EXISTS idx_orders_symbol ON orders(symbol)", [])?;
        conn.execute("CREATE INDEX IF NOT EXISTS idx_fills_symbol ON fills(symbol)", [])?;
        conn.execute("CREATE INDEX IF NOT EXISTS idx_events_symbol ON events(symbol)", [])?;

        debug!("store schema verified");
        Ok(())
    }

    // ------------------------------------------------------------------
    // state
    // ------------------------------------------------------------------

    pub fn get_state(&self, symbol: &Symbol) -> Result<Option<SymbolState>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT symbol, cooldown_until, last_parent_id, last_trail_id, last_protective_submitted_at
             FROM state WHERE symbol = ?1",
            params![symbol.as_str()],
            row_to_state,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Returns the existing row, or creates and persists a fresh one. Called lazily on a
    /// symbol's first tick; the row is never deleted afterward.
    pub fn get_or_create_state(&self, symbol: &Symbol) -> Result<SymbolState, StoreError> {
        if let Some(state) = self.get_state(symbol)? {
            return Ok(state);
        }
        let state = SymbolState::new(symbol.clone());
        self.upsert_state(&state, Event::new("symbol_state_created", Some(symbol.clone()), serde_json::json!({})))?;
        Ok(state)
    }

    /// Upserts the state row and appends the event atomically in one transaction.
    pub fn upsert_state(&self, state: &SymbolState, event: Event) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO state (symbol, cooldown_until, last_parent_id, last_trail_id, last_protective_submitted_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, CURRENT_TIMESTAMP)
             ON CONFLICT(symbol) DO UPDATE SET
                cooldown_until = excluded.cooldown_until,
                last_parent_id = excluded.last_parent_id,
                last_trail_id = excluded.last_trail_id,
                last_protective_submitted_at = excluded.last_protective_submitted_at,
                updated_at = CURRENT_TIMESTAMP",
            params![
                state.symbol.as_str(),
                state.cooldown_until.map(|t| t.to_rfc3339()),
                state.last_parent_id,
                state.last_trail_id,
                state.last_protective_submitted_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        insert_event(&tx, &event)?;
        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // orders
    // ------------------------------------------------------------------

    /// Upserts an order by `order_id` and appends the event atomically.
    pub fn upsert_order(&self, order: &Order, event: Option<Event>) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO orders (order_id, symbol, side, order_type, status, quantity, filled_quantity,
                stop_price, limit_price, trailing_pct, parent_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(order_id) DO UPDATE SET
                status = excluded.status,
                filled_quantity = excluded.filled_quantity,
                updated_at = excluded.updated_at",
            params![
                order.order_id,
                order.symbol.as_str(),
                side_str(order.side),
                order_type_str(order.order_type),
                status_str(order.status),
                order.quantity.inner().to_string(),
                order.filled_quantity.inner().to_string(),
                order.stop_price.map(|m| m.inner().to_string()),
                order.limit_price.map(|m| m.inner().to_string()),
                order.trailing_pct.map(|m| m.inner().to_string()),
                order.parent_id,
                order.created_at.to_rfc3339(),
                order.updated_at.to_rfc3339(),
            ],
        )?;
        if let Some(event) = event {
            insert_event(&tx, &event)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_order(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM orders WHERE order_id = ?1", params![order_id], row_to_order)
            .optional()
            .map_err(StoreError::from)
    }

    pub fn open_orders(&self, symbol: &Symbol) -> Result<Vec<Order>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM orders WHERE symbol = ?1 AND status IN ('open', 'partially_filled')",
        )?;
        let rows = stmt
            .query_map(params![symbol.as_str()], row_to_order)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // fills
    // ------------------------------------------------------------------

    pub fn fill_exists(&self, exec_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM fills WHERE exec_id = ?1", params![exec_id], |row| row.get(0))
            .optional()?;
        Ok(exists.is_some())
    }

    /// Inserts the fill and appends `fill_received` atomically. Returns `false` without
    /// writing anything if `exec_id` was already recorded (idempotence, spec invariant I3).
    pub fn insert_fill(&self, fill: &Fill) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let already_exists: Option<i64> = tx
            .query_row("SELECT 1 FROM fills WHERE exec_id = ?1", params![fill.exec_id], |row| row.get(0))
            .optional()?;
        if already_exists.is_some() {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO fills (exec_id, order_id, symbol, side, quantity, price, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                fill.exec_id,
                fill.order_id,
                fill.symbol.as_str(),
                side_str(fill.side),
                fill.quantity.inner().to_string(),
                fill.price.inner().to_string(),
                fill.timestamp.to_rfc3339(),
            ],
        )?;
        let event = Event::new(
            "fill_received",
            Some(fill.symbol.clone()),
            serde_json::json!({ "exec_id": fill.exec_id, "order_id": fill.order_id, "quantity": fill.quantity.to_f64(), "price": fill.price.to_f64() }),
        );
        insert_event(&tx, &event)?;
        tx.commit()?;
        Ok(true)
    }

    pub fn recent_fills(&self, limit: usize) -> Result<Vec<Fill>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let limit = limit.min(200);
        let mut stmt = conn.prepare("SELECT * FROM fills ORDER BY timestamp DESC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_fill)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // events
    // ------------------------------------------------------------------

    /// Appends a standalone event not tied to a state/order/fill write (e.g. an
    /// admission-control rejection, which is not an error and does not mutate the Store).
    pub fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        insert_event(&conn, event)
    }

    pub fn recent_events(&self, limit: usize) -> Result<Vec<Event>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let limit = limit.min(200);
        let mut stmt = conn.prepare("SELECT event_type, symbol, payload, timestamp FROM events ORDER BY id DESC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let payload_text: String = row.get(2)?;
                Ok(Event {
                    event_type: row.get(0)?,
                    symbol: row.get::<_, Option<String>>(1)?.map(Symbol::new),
                    payload: serde_json::from_str(&payload_text).unwrap_or(serde_json::Value::Null),
                    timestamp: parse_dt(&row.get::<_, String>(3)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // performance snapshots
    // ------------------------------------------------------------------

    pub fn record_daily_snapshot(&self, snapshot: &PerformanceSnapshot) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO performance_snapshots (date, account_value, cash, position_value,
                realized_pnl, unrealized_pnl, daily_pnl, open_position_count, open_order_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(date) DO UPDATE SET
                account_value = excluded.account_value,
                cash = excluded.cash,
                position_value = excluded.position_value,
                realized_pnl = excluded.realized_pnl,
                unrealized_pnl = excluded.unrealized_pnl,
                daily_pnl = excluded.daily_pnl,
                open_position_count = excluded.open_position_count,
                open_order_count = excluded.open_order_count",
            params![
                snapshot.date.to_string(),
                snapshot.account_value.inner().to_string(),
                snapshot.cash.inner().to_string(),
                snapshot.position_value.inner().to_string(),
                snapshot.realized_pnl.inner().to_string(),
                snapshot.unrealized_pnl.inner().to_string(),
                snapshot.daily_pnl.inner().to_string(),
                snapshot.open_position_count as i64,
                snapshot.open_order_count as i64,
            ],
        )?;
        Ok(())
    }

    pub fn last_snapshot_date(&self) -> Result<Option<NaiveDate>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let date: Option<String> = conn
            .query_row("SELECT date FROM performance_snapshots ORDER BY date DESC LIMIT 1", [], |row| row.get(0))
            .optional()?;
        Ok(date.and_then(|d| d.parse().ok()))
    }

    pub fn daily_snapshots(&self, limit: usize) -> Result<Vec<PerformanceSnapshot>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let limit = limit.min(90);
        let mut stmt = conn.prepare("SELECT * FROM performance_snapshots ORDER BY date DESC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_snapshot)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // housekeeping
    // ------------------------------------------------------------------

    /// Clears an expired cooldown without an event append (spec §4.5: this transition is
    /// silent — the stopout itself was already logged by `stopout_cooldown_started`).
    pub fn clear_cooldown(&self, symbol: &Symbol) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE state SET cooldown_until = NULL, updated_at = CURRENT_TIMESTAMP WHERE symbol = ?1",
            params![symbol.as_str()],
        )?;
        Ok(())
    }

    pub fn get_config_hash(&self) -> Result<Option<u64>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let value: Option<String> = conn
            .query_row("SELECT value FROM housekeeping WHERE key = 'config_hash'", [], |row| row.get(0))
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    pub fn set_config_hash(&self, hash: u64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO housekeeping (key, value) VALUES ('config_hash', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![hash.to_string()],
        )?;
        Ok(())
    }

    /// Point-in-time JSON dump of state/orders/fills for operator debugging, feeding the
    /// read-only monitoring surface without building the HTTP endpoint itself.
    pub fn export_json(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();

        let mut state_stmt = conn.prepare("SELECT symbol, cooldown_until, last_parent_id, last_trail_id, last_protective_submitted_at FROM state")?;
        let states: Vec<SymbolState> = state_stmt.query_map([], row_to_state)?.collect::<Result<Vec<_>, _>>()?;

        let mut orders_stmt = conn.prepare("SELECT * FROM orders")?;
        let orders: Vec<Order> = orders_stmt.query_map([], row_to_order)?.collect::<Result<Vec<_>, _>>()?;

        let mut fills_stmt = conn.prepare("SELECT * FROM fills ORDER BY timestamp DESC LIMIT 200")?;
        let fills: Vec<Fill> = fills_stmt.query_map([], row_to_fill)?.collect::<Result<Vec<_>, _>>()?;

        let snapshot = serde_json::json!({
            "exported_at": Utc::now().to_rfc3339(),
            "state": states,
            "orders": orders,
            "fills": fills,
        });

        drop(conn);
        std::fs::write(&self.json_export_path, serde_json::to_string_pretty(&snapshot)?)?;
        Ok(())
    }
}

fn insert_event(conn: &Connection, event: &Event) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO events (event_type, symbol, payload, timestamp) VALUES (?1, ?2, ?3, ?4)",
        params![
            event.event_type,
            event.symbol.as_ref().map(|s| s.as_str()),
            serde_json::to_string(&event.payload)?,
            event.timestamp.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Buy => "buy",
        Side::Sell => "sell",
    }
}

fn parse_side(s: &str) -> Side {
    match s {
        "buy" => Side::Buy,
        _ => Side::Sell,
    }
}

fn order_type_str(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
        OrderType::Stop => "STOP",
        OrderType::StopLimit => "STOP_LIMIT",
        OrderType::TrailingStop => "TRAILING_STOP",
    }
}

fn parse_order_type(s: &str) -> OrderType {
    match s {
        "LIMIT" => OrderType::Limit,
        "STOP" => OrderType::Stop,
        "STOP_LIMIT" => OrderType::StopLimit,
        "TRAILING_STOP" => OrderType::TrailingStop,
        _ => OrderType::Market,
    }
}

fn status_str(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::Open => "open",
        OrderStatus::Filled => "filled",
        OrderStatus::PartiallyFilled => "partially_filled",
        OrderStatus::Canceled => "canceled",
        OrderStatus::Rejected => "rejected",
        OrderStatus::Expired => "expired",
    }
}

fn parse_status(s: &str) -> OrderStatus {
    match s {
        "filled" => OrderStatus::Filled,
        "partially_filled" => OrderStatus::PartiallyFilled,
        "canceled" => OrderStatus::Canceled,
        "rejected" => OrderStatus::Rejected,
        "expired" => OrderStatus::Expired,
        _ => OrderStatus::Open,
    }
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

fn parse_money(s: &str) -> Money {
    Money::from_f64(s.parse().unwrap_or(0.0))
}

fn row_to_state(row: &rusqlite::Row) -> rusqlite::Result<SymbolState> {
    Ok(SymbolState {
        symbol: Symbol::new(row.get::<_, String>(0)?),
        cooldown_until: row.get::<_, Option<String>>(1)?.map(|s| parse_dt(&s)),
        last_parent_id: row.get(2)?,
        last_trail_id: row.get(3)?,
        last_protective_submitted_at: row.get::<_, Option<String>>(4)?.map(|s| parse_dt(&s)),
    })
}

fn row_to_order(row: &rusqlite::Row) -> rusqlite::Result<Order> {
    Ok(Order {
        order_id: row.get(0)?,
        symbol: Symbol::new(row.get::<_, String>(1)?),
        side: parse_side(&row.get::<_, String>(2)?),
        order_type: parse_order_type(&row.get::<_, String>(3)?),
        status: parse_status(&row.get::<_, String>(4)?),
        quantity: parse_money(&row.get::<_, String>(5)?),
        filled_quantity: parse_money(&row.get::<_, String>(6)?),
        stop_price: row.get::<_, Option<String>>(7)?.map(|s| parse_money(&s)),
        limit_price: row.get::<_, Option<String>>(8)?.map(|s| parse_money(&s)),
        trailing_pct: row.get::<_, Option<String>>(9)?.map(|s| parse_money(&s)),
        parent_id: row.get(10)?,
        created_at: parse_dt(&row.get::<_, String>(11)?),
        updated_at: parse_dt(&row.get::<_, String>(12)?),
    })
}

fn row_to_fill(row: &rusqlite::Row) -> rusqlite::Result<Fill> {
    Ok(Fill {
        exec_id: row.get(0)?,
        order_id: row.get(1)?,
        symbol: Symbol::new(row.get::<_, String>(2)?),
        side: parse_side(&row.get::<_, String>(3)?),
        quantity: parse_money(&row.get::<_, String>(4)?),
        price: parse_money(&row.get::<_, String>(5)?),
        timestamp: parse_dt(&row.get::<_, String>(6)?),
    })
}

fn row_to_snapshot(row: &rusqlite::Row) -> rusqlite::Result<PerformanceSnapshot> {
    Ok(PerformanceSnapshot {
        date: row.get::<_, String>(0)?.parse().unwrap_or_default(),
        account_value: parse_money(&row.get::<_, String>(1)?),
        cash: parse_money(&row.get::<_, String>(2)?),
        position_value: parse_money(&row.get::<_, String>(3)?),
        realized_pnl: parse_money(&row.get::<_, String>(4)?),
        unrealized_pnl: parse_money(&row.get::<_, String>(5)?),
        daily_pnl: parse_money(&row.get::<_, String>(6)?),
        open_position_count: row.get::<_, i64>(7)? as usize,
        open_order_count: row.get::<_, i64>(8)? as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_order(order_id: &str, symbol: &str) -> Order {
        let now = Utc::now();
        Order {
            order_id: order_id.to_string(),
            symbol: Symbol::new(symbol),
            side: Side::Buy,
            order_type: OrderType::Stop,
            status: OrderStatus::Open,
            quantity: Money::from_f64(4.0),
            filled_quantity: Money::ZERO,
            stop_price: Some(Money::from_f64(262.50)),
            limit_price: None,
            trailing_pct: None,
            parent_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn state_round_trips_through_upsert() {
        let store = SqliteStore::open_in_memory().unwrap();
        let symbol = Symbol::new("TSLA");
        let mut state = store.get_or_create_state(&symbol).unwrap();
        state.last_parent_id = Some("P1".to_string());
        store
            .upsert_state(&state, Event::new("test", Some(symbol.clone()), serde_json::json!({})))
            .unwrap();
        let reloaded = store.get_state(&symbol).unwrap().unwrap();
        assert_eq!(reloaded.last_parent_id.as_deref(), Some("P1"));
    }

    #[test]
    fn fill_insertion_is_idempotent_on_exec_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        let fill = Fill {
            exec_id: "E1".to_string(),
            order_id: "O1".to_string(),
            symbol: Symbol::new("TSLA"),
            side: Side::Buy,
            quantity: Money::from_f64(4.0),
            price: Money::from_f64(262.50),
            timestamp: Utc::now(),
        };
        assert!(store.insert_fill(&fill).unwrap());
        assert!(!store.insert_fill(&fill).unwrap());
        assert_eq!(store.recent_fills(10).unwrap().len(), 1);
    }

    #[test]
    fn open_orders_filters_by_symbol_and_status() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut order = sample_order("O1", "TSLA");
        store.upsert_order(&order, None).unwrap();
        let other = sample_order("O2", "AAPL");
        store.upsert_order(&other, None).unwrap();

        assert_eq!(store.open_orders(&Symbol::new("TSLA")).unwrap().len(), 1);

        order.status = OrderStatus::Filled;
        store.upsert_order(&order, None).unwrap();
        assert_eq!(store.open_orders(&Symbol::new("TSLA")).unwrap().len(), 0);
    }

    #[test]
    fn event_appended_alongside_state_write() {
        let store = SqliteStore::open_in_memory().unwrap();
        let symbol = Symbol::new("TSLA");
        let state = store.get_or_create_state(&symbol).unwrap();
        store
            .upsert_state(&state, Event::new("cooldown_started", Some(symbol.clone()), serde_json::json!({})))
            .unwrap();
        let events = store.recent_events(10).unwrap();
        assert!(events.iter().any(|e| e.event_type == "cooldown_started"));
    }
}
