//! Inbound price ticks
//!
//! Step 1.1: The Feed Boundary
//!
//! Ticks arrive as JSON objects shaped like
//! `{"exchange": "gemini", "pair": "ETH/BTC", "price": 0.0873, "fee": 0.0, "timestamp": 1518996767361}`
//! where `fee` and `timestamp` are optional.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{GraphError, Timestamp};

/// Split `"BASE/QUOTE"` on the first `/`
pub fn split_pair(pair: &str) -> Result<(String, String), GraphError> {
    let Some((base, quote)) = pair.split_once('/') else {
        return Err(GraphError::InvalidPair(pair.to_string()));
    };
    if base.is_empty() || quote.is_empty() {
        return Err(GraphError::InvalidPair(pair.to_string()));
    }
    Ok((base.to_string(), quote.to_string()))
}

/// Wire shape of a tick
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawRateUpdate {
    exchange: String,
    pair: String,
    price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fee: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<Timestamp>,
}

/// One best-price observation for a pair on an exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRateUpdate", into = "RawRateUpdate")]
pub struct RateUpdate {
    pub exchange: String,
    pub base: String,
    pub quote: String,
    pub price: f64,
    /// Overrides the exchange's [`FeeSchedule`] entry when present
    pub fee: Option<f64>,
    pub timestamp: Option<Timestamp>,
}

impl RateUpdate {
    pub fn new(exchange: &str, base: &str, quote: &str, price: f64, timestamp: Option<Timestamp>) -> Self {
        Self {
            exchange: exchange.to_string(),
            base: base.to_string(),
            quote: quote.to_string(),
            price,
            fee: None,
            timestamp,
        }
    }

    pub fn with_fee(mut self, fee: f64) -> Self {
        self.fee = Some(fee);
        self
    }

    /// Parse from a `"BASE/QUOTE"` pair string
    pub fn from_pair(exchange: &str, pair: &str, price: f64, timestamp: Option<Timestamp>) -> Result<Self, GraphError> {
        let (base, quote) = split_pair(pair)?;
        Ok(Self::new(exchange, &base, &quote, price, timestamp))
    }

    pub fn pair(&self) -> String {
        format!("{}/{}", self.base, self.quote)
    }

    /// Parse one JSON tick
    pub fn from_json(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

impl TryFrom<RawRateUpdate> for RateUpdate {
    type Error = GraphError;

    fn try_from(raw: RawRateUpdate) -> Result<Self, Self::Error> {
        let (base, quote) = split_pair(&raw.pair)?;
        Ok(Self {
            exchange: raw.exchange,
            base,
            quote,
            price: raw.price,
            fee: raw.fee,
            timestamp: raw.timestamp,
        })
    }
}

impl From<RateUpdate> for RawRateUpdate {
    fn from(update: RateUpdate) -> Self {
        Self {
            pair: update.pair(),
            exchange: update.exchange,
            price: update.price,
            fee: update.fee,
            timestamp: update.timestamp,
        }
    }
}

/// Per-exchange fee adjustment, resolved on the feed side.
///
/// The graph applies a fee as `price * (1 + fee)`, so a 0.25% taker fee is
/// stored as `-0.0025`. Fees must stay above -1.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    #[serde(default)]
    pub default_fee: f64,
    #[serde(default)]
    pub per_exchange: HashMap<String, f64>,
}

impl FeeSchedule {
    pub fn new(default_fee: f64) -> Self {
        Self {
            default_fee,
            per_exchange: HashMap::new(),
        }
    }

    pub fn with_exchange(mut self, exchange: &str, fee: f64) -> Self {
        self.per_exchange.insert(exchange.to_string(), fee);
        self
    }

    pub fn fee_for(&self, exchange: &str) -> f64 {
        self.per_exchange
            .get(exchange)
            .copied()
            .unwrap_or(self.default_fee)
    }

    /// Fee for a tick: explicit tick fee first, then the schedule
    pub fn resolve(&self, update: &RateUpdate) -> f64 {
        update.fee.unwrap_or_else(|| self.fee_for(&update.exchange))
    }

    /// Parse `"gemini:-0.0025,kraken:-0.0026"`
    pub fn parse_entries(entries: &str) -> Result<HashMap<String, f64>, String> {
        let mut out = HashMap::new();
        for entry in entries.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (exchange, fee) = entry
                .split_once(':')
                .ok_or_else(|| format!("expected exchange:fee, got {:?}", entry))?;
            let fee: f64 = fee
                .trim()
                .parse()
                .map_err(|e| format!("bad fee for {}: {}", exchange, e))?;
            out.insert(exchange.trim().to_string(), fee);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_pair() {
        assert_eq!(split_pair("ETH/BTC").unwrap(), ("ETH".to_string(), "BTC".to_string()));
        // Only the first slash splits
        assert_eq!(split_pair("A/B/C").unwrap(), ("A".to_string(), "B/C".to_string()));
        assert!(split_pair("ETHBTC").is_err());
        assert!(split_pair("/BTC").is_err());
        assert!(split_pair("ETH/").is_err());
    }

    #[test]
    fn test_parse_tick_json() {
        let tick = RateUpdate::from_json(
            r#"{"exchange":"gemini","pair":"ETH/USD","price":924.99,"timestamp":1518996767361}"#,
        )
        .unwrap();
        assert_eq!(tick.exchange, "gemini");
        assert_eq!(tick.base, "ETH");
        assert_eq!(tick.quote, "USD");
        assert_eq!(tick.price, 924.99);
        assert_eq!(tick.fee, None);
        assert_eq!(tick.timestamp, Some(1518996767361));

        let tick = RateUpdate::from_json(r#"{"exchange":"kraken","pair":"BTC/EUR","price":1.5,"fee":-0.002}"#).unwrap();
        assert_eq!(tick.fee, Some(-0.002));
        assert_eq!(tick.timestamp, None);

        assert!(RateUpdate::from_json(r#"{"exchange":"kraken","pair":"BTCEUR","price":1.5}"#).is_err());
        assert!(RateUpdate::from_json(r#"{"exchange":"kraken","price":1.5}"#).is_err());
    }

    #[test]
    fn test_tick_serializes_with_pair() {
        let tick = RateUpdate::new("gemini", "ETH", "BTC", 0.05, None);
        let json = serde_json::to_string(&tick).unwrap();
        assert!(json.contains(r#""pair":"ETH/BTC""#));
        assert!(!json.contains("timestamp"));
    }

    #[test]
    fn test_fee_schedule() {
        let fees = FeeSchedule::new(-0.001).with_exchange("kraken", -0.0026);
        assert_eq!(fees.fee_for("kraken"), -0.0026);
        assert_eq!(fees.fee_for("gemini"), -0.001);

        let tick = RateUpdate::new("kraken", "ETH", "BTC", 0.05, None);
        assert_eq!(fees.resolve(&tick), -0.0026);
        assert_eq!(fees.resolve(&tick.with_fee(0.0)), 0.0);
    }

    #[test]
    fn test_parse_fee_entries() {
        let parsed = FeeSchedule::parse_entries("gemini:-0.0025, kraken:-0.0026").unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["kraken"], -0.0026);

        assert!(FeeSchedule::parse_entries("gemini").is_err());
        assert!(FeeSchedule::parse_entries("gemini:abc").is_err());
        assert!(FeeSchedule::parse_entries("").unwrap().is_empty());
    }
}
