//! Market Data Value Objects
//!
//! Tick and option snapshot types handed to the batcher by the market data
//! ingestion layer. They are built upstream and only serialized here.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Option right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OptionType {
    /// Call option.
    #[serde(alias = "CE")]
    Call,
    /// Put option.
    #[serde(alias = "PE")]
    Put,
}

/// One market data update for an underlying instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnderlyingTick {
    /// Instrument symbol.
    pub symbol: String,
    /// Broker instrument token.
    pub instrument_token: u64,
    /// Last traded price.
    pub last_price: Decimal,
    /// Cumulative traded volume.
    pub volume: u64,
    /// Change from previous close, in percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_percent: Option<Decimal>,
    /// Exchange timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of an option contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionSnapshot {
    /// Contract symbol.
    pub symbol: String,
    /// Broker instrument token.
    pub instrument_token: u64,
    /// Underlying symbol.
    pub underlying: String,
    /// Strike price.
    pub strike: Decimal,
    /// Call or put.
    pub option_type: OptionType,
    /// Expiry date (exchange local).
    pub expiry: chrono::NaiveDate,
    /// Last traded price.
    pub last_price: Decimal,
    /// Best bid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<Decimal>,
    /// Best ask.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<Decimal>,
    /// Cumulative traded volume.
    pub volume: u64,
    /// Open interest.
    pub open_interest: u64,
    /// Implied volatility, if computed upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implied_volatility: Option<Decimal>,
    /// Exchange timestamp.
    pub timestamp: DateTime<Utc>,
}
