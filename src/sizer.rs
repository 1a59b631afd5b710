//! Admission control: converts a dollar allocation, the live price, the account snapshot,
//! and current exposure into a quantity, or a rejection reason. Every check is a hard
//! gate — fail any one and the whole submission is rejected (spec §4.4). Rejections are not
//! errors: the controller simply does not place an order this tick.

use crate::broker::AccountSnapshot;
use crate::config::AllocationConfig;
use crate::error::BrokerError;
use crate::types::{Money, Symbol};

pub struct SizerInputs<'a> {
    pub symbol: &'a Symbol,
    pub last_price: Money,
    pub allocation: &'a AllocationConfig,
    pub max_symbol_exposure_usd: Money,
    pub max_total_exposure_usd: Money,
    pub account: &'a AccountSnapshot,
    pub current_exposure_by_symbol: &'a std::collections::HashMap<String, Money>,
}

/// Broker-minimum lot size: 1 share for equities, a small fraction for crypto.
pub fn min_qty(allow_fractional: bool) -> Money {
    if allow_fractional {
        Money::from_f64(0.0001)
    } else {
        Money::ONE
    }
}

/// Runs the full admission-control ladder. On success, returns the quantity to submit; on
/// failure, the `BrokerError::AdmissionRejected` reason to log and emit as an event.
pub fn size(inputs: &SizerInputs) -> Result<Money, BrokerError> {
    let budget = inputs.allocation.budget_for(inputs.symbol);

    if inputs.last_price.is_zero() {
        return Err(BrokerError::AdmissionRejected("last_price is zero".to_string()));
    }

    let raw_qty = budget / inputs.last_price;
    let qty = if inputs.allocation.allow_fractional {
        raw_qty.round_dp(8)
    } else {
        raw_qty.floor()
    };

    let floor = min_qty(inputs.allocation.allow_fractional);
    if qty < floor {
        return Err(BrokerError::AdmissionRejected("quantity_too_small".to_string()));
    }

    let notional = qty * inputs.last_price;

    let existing_symbol_exposure = inputs
        .current_exposure_by_symbol
        .get(inputs.symbol.as_str())
        .copied()
        .unwrap_or(Money::ZERO);
    let symbol_exposure_after = existing_symbol_exposure + notional;
    if symbol_exposure_after > inputs.max_symbol_exposure_usd {
        return Err(BrokerError::AdmissionRejected("symbol_exposure_exceeded".to_string()));
    }

    let total_existing_exposure: Money = inputs.current_exposure_by_symbol.values().copied().sum();
    let total_exposure_after = total_existing_exposure + notional;
    if total_exposure_after > inputs.max_total_exposure_usd {
        return Err(BrokerError::AdmissionRejected("total_exposure_exceeded".to_string()));
    }

    let cash_after = inputs.account.cash - notional;
    let min_reserve = inputs.account.equity * Money::from_f64(inputs.allocation.min_cash_reserve_percent / 100.0);
    if cash_after < min_reserve {
        return Err(BrokerError::AdmissionRejected("cash_reserve_violated".to_string()));
    }

    Ok(qty)
}
