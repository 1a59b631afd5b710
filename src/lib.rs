//! Breakout Sentinel
//!
//! An autonomous breakout-entry and trailing-protection trading controller. Watches a
//! symbol's last price for a breakout above a stop trigger, enters with a broker-native stop
//! order, and immediately protects the fill with a trailing (or, for venues that lack one,
//! fixed) stop — all driven by state derived from the Store and the broker's own order/fill
//! snapshots, never trusted from local memory alone.

pub mod broker;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod sizer;
pub mod store;
pub mod types;

pub use config::Config;
pub use types::*;
