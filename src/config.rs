//! Configuration loading: a JSON file for strategy/risk parameters plus environment
//! variables for broker credentials, which are never part of the file and never logged.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::types::{AssetClass, Money, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Paper,
    Live,
}

/// One watchlist entry with its asset class resolved once, at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub symbol: Symbol,
    pub asset_class: AssetClass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mode: Mode,
    pub watchlist: Vec<String>,
    pub crypto_watchlist: Vec<String>,
    pub allocation: AllocationConfig,
    pub entries: EntriesConfig,
    pub stops: StopsConfig,
    pub risk: RiskConfig,
    pub hours: HoursConfig,
    pub cooldowns: CooldownsConfig,
    pub polling: PollingConfig,

    #[serde(skip, default)]
    pub broker_api_key: Option<String>,
    #[serde(skip, default)]
    pub broker_api_secret: Option<String>,
}

impl Config {
    /// Load configuration from a JSON file, then overlay broker credentials from the
    /// environment. Credentials are intentionally absent from the file format.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("failed to parse config JSON")?;

        config.broker_api_key = std::env::var("BROKER_API_KEY").ok();
        config.broker_api_secret = std::env::var("BROKER_API_SECRET").ok();

        Ok(config)
    }

    /// All watchlist entries, equities and crypto, with `AssetClass` resolved once here.
    pub fn all_symbols(&self) -> Vec<WatchlistEntry> {
        let equities = self.watchlist.iter().map(|s| WatchlistEntry {
            symbol: Symbol::new(s),
            asset_class: AssetClass::Equity,
        });
        let crypto = self.crypto_watchlist.iter().map(|s| WatchlistEntry {
            symbol: Symbol::new(s),
            asset_class: AssetClass::Crypto,
        });
        equities.chain(crypto).collect()
    }

    /// Stable hash of the parts of config that affect trading behavior, used to warn (not
    /// fail) on restart if the config changed since the last run.
    pub fn config_hash(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let serialized = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = DefaultHasher::new();
        serialized.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationConfig {
    pub total_usd_cap: f64,
    pub per_symbol_usd: f64,
    #[serde(default)]
    pub per_symbol_override: std::collections::HashMap<String, f64>,
    pub min_cash_reserve_percent: f64,
    pub allow_fractional: bool,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        AllocationConfig {
            total_usd_cap: 10_000.0,
            per_symbol_usd: 1_000.0,
            per_symbol_override: Default::default(),
            min_cash_reserve_percent: 10.0,
            allow_fractional: false,
        }
    }
}

impl AllocationConfig {
    pub fn budget_for(&self, symbol: &Symbol) -> Money {
        self.per_symbol_override
            .get(symbol.as_str())
            .copied()
            .unwrap_or(self.per_symbol_usd)
            .into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    BuyStop,
    BuyStopLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tif {
    Day,
    Gtc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntriesConfig {
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub buy_stop_pct_above_last: f64,
    pub stop_limit_max_slip_pct: f64,
    pub tif: Tif,
    pub cancel_at_close: bool,
    pub rearm_next_session: bool,
}

impl Default for EntriesConfig {
    fn default() -> Self {
        EntriesConfig {
            entry_type: EntryType::BuyStop,
            buy_stop_pct_above_last: 5.0,
            stop_limit_max_slip_pct: 0.5,
            tif: Tif::Day,
            cancel_at_close: true,
            rearm_next_session: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopsConfig {
    pub trailing_stop_pct: f64,
    pub use_trailing_limit: bool,
    pub trail_limit_offset_pct: f64,
    pub tif: Tif,
}

impl Default for StopsConfig {
    fn default() -> Self {
        StopsConfig {
            trailing_stop_pct: 10.0,
            use_trailing_limit: false,
            trail_limit_offset_pct: 0.1,
            tif: Tif::Gtc,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub max_total_exposure_usd: f64,
    pub max_symbol_exposure_usd: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        RiskConfig {
            max_total_exposure_usd: 10_000.0,
            max_symbol_exposure_usd: 2_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoursConfig {
    pub calendar: String,
    pub allow_pre_market: bool,
    pub allow_after_hours: bool,
}

impl Default for HoursConfig {
    fn default() -> Self {
        HoursConfig {
            calendar: "XNYS".to_string(),
            allow_pre_market: false,
            allow_after_hours: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownsConfig {
    pub after_stopout_minutes: i64,
}

impl Default for CooldownsConfig {
    fn default() -> Self {
        CooldownsConfig {
            after_stopout_minutes: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    pub price_seconds: u64,
    pub orders_seconds: u64,
    pub keepalive_seconds: u64,
    pub event_check_seconds: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        PollingConfig {
            price_seconds: 5,
            orders_seconds: 5,
            keepalive_seconds: 300,
            event_check_seconds: 5,
        }
    }
}

/// Default staleness window for quote freshness (§4.5): a quote older than this is skipped
/// for entry placement but does not block protective reconciliation.
pub const STALENESS_WINDOW_SECONDS: i64 = 30;

/// Default grace period after a protective submission during which reconciliation tolerates
/// transient disagreement with the broker snapshot (§4.5).
pub const STABILIZATION_WINDOW_SECONDS: i64 = 10;

/// Default minutes before session close at which open equity entry orders are canceled
/// (§4.7).
pub const EOD_CANCEL_MINUTES: i64 = 15;

/// Broker RPC timeout (§5).
pub const BROKER_RPC_TIMEOUT_SECONDS: u64 = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_falls_back_to_per_symbol_usd() {
        let config = AllocationConfig::default();
        assert_eq!(config.budget_for(&Symbol::new("TSLA")), Money::from_f64(1_000.0));
    }

    #[test]
    fn budget_override_takes_precedence() {
        let mut config = AllocationConfig::default();
        config.per_symbol_override.insert("TSLA".to_string(), 2_500.0);
        assert_eq!(config.budget_for(&Symbol::new("TSLA")), Money::from_f64(2_500.0));
    }

    #[test]
    fn all_symbols_resolves_asset_class_once() {
        let config = Config {
            mode: Mode::Paper,
            watchlist: vec!["TSLA".to_string()],
            crypto_watchlist: vec!["BTC/USD".to_string()],
            allocation: AllocationConfig::default(),
            entries: EntriesConfig::default(),
            stops: StopsConfig::default(),
            risk: RiskConfig::default(),
            hours: HoursConfig::default(),
            cooldowns: CooldownsConfig::default(),
            polling: PollingConfig::default(),
            broker_api_key: None,
            broker_api_secret: None,
        };
        let entries = config.all_symbols();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].asset_class, AssetClass::Equity);
        assert_eq!(entries[1].asset_class, AssetClass::Crypto);
    }
}
