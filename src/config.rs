//! Configuration for the rate graph engine
//!
//! Loaded from environment variables (with `.env` support) or a TOML file.
//! Which exchanges and pairs are fed in is decided by whoever produces the
//! ticks; this only covers how the core treats them.

use chrono::{DateTime, Utc};
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::brain::{Opportunity, Tolerance};
use crate::cartographer::FeeSchedule;

/// Main configuration struct
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // ========== Opportunity Lifecycle ==========
    /// Milliseconds an opportunity survives without being seen again
    pub expire_time_ms: i64,

    /// Opportunities at or below this gain are not tracked
    pub min_gain: f64,

    /// Shortest cycle reported (A -> B -> A round trips are always ignored)
    pub min_cycle_hops: usize,

    /// Label attached to opportunities from this graph
    pub venue: String,

    // ========== Fees ==========
    /// Fee for exchanges without their own entry, applied as `price * (1 + fee)`
    pub default_fee: f64,

    // ========== Numerics ==========
    /// Relative tolerance for Bellman-Ford relaxations
    pub rel_tolerance: f64,

    /// Absolute tolerance for Bellman-Ford relaxations
    pub abs_tolerance: f64,

    // ========== Engine ==========
    /// Bound of the inbound tick channel
    pub channel_capacity: usize,

    /// Ranked opportunities printed at the end of a run
    pub top_n: usize,

    /// tracing filter directive
    pub log_filter: String,

    /// Append new opportunities as JSON lines here
    pub opportunity_log_path: Option<String>,

    // TOML tables must come after plain keys
    /// Per-exchange fee overrides
    pub exchange_fees: HashMap<String, f64>,
}

impl Config {
    /// Load configuration from environment variables and .env file
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let exchange_fees = match env::var("EXCHANGE_FEES") {
            Ok(entries) => FeeSchedule::parse_entries(&entries).map_err(|e| eyre!("EXCHANGE_FEES: {}", e))?,
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            expire_time_ms: env::var("EXPIRE_TIME_MS")
                .unwrap_or_else(|_| "20000".to_string())
                .parse()
                .unwrap_or(defaults.expire_time_ms),
            min_gain: env::var("MIN_GAIN")
                .unwrap_or_else(|_| "1.0".to_string())
                .parse()
                .unwrap_or(defaults.min_gain),
            min_cycle_hops: env::var("MIN_CYCLE_HOPS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .unwrap_or(defaults.min_cycle_hops),
            venue: env::var("VENUE").unwrap_or(defaults.venue),

            default_fee: env::var("DEFAULT_FEE")
                .unwrap_or_else(|_| "0.0".to_string())
                .parse()
                .unwrap_or(defaults.default_fee),
            exchange_fees,

            rel_tolerance: env::var("REL_TOLERANCE")
                .unwrap_or_else(|_| "1e-9".to_string())
                .parse()
                .unwrap_or(defaults.rel_tolerance),
            abs_tolerance: env::var("ABS_TOLERANCE")
                .unwrap_or_else(|_| "1e-12".to_string())
                .parse()
                .unwrap_or(defaults.abs_tolerance),

            channel_capacity: env::var("CHANNEL_CAPACITY")
                .unwrap_or_else(|_| "1024".to_string())
                .parse()
                .unwrap_or(defaults.channel_capacity),
            top_n: env::var("TOP_N")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(defaults.top_n),
            log_filter: env::var("LOG_FILTER").unwrap_or(defaults.log_filter),
            opportunity_log_path: env::var("OPPORTUNITY_LOG_PATH").ok(),
        })
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn fee_schedule(&self) -> FeeSchedule {
        FeeSchedule {
            default_fee: self.default_fee,
            per_exchange: self.exchange_fees.clone(),
        }
    }

    pub fn tolerance(&self) -> Tolerance {
        Tolerance {
            rel: self.rel_tolerance,
            abs: self.abs_tolerance,
        }
    }

    /// Validate configuration before starting a worker
    pub fn validate(&self) -> Result<()> {
        if self.expire_time_ms <= 0 {
            return Err(eyre!("EXPIRE_TIME_MS must be positive (currently {})", self.expire_time_ms));
        }
        if self.min_cycle_hops < 3 {
            return Err(eyre!(
                "MIN_CYCLE_HOPS must be at least 3 (currently {})",
                self.min_cycle_hops
            ));
        }
        if !self.min_gain.is_finite() || self.min_gain <= 0.0 {
            return Err(eyre!("MIN_GAIN must be a positive number (currently {})", self.min_gain));
        }

        for (name, tol) in [("REL_TOLERANCE", self.rel_tolerance), ("ABS_TOLERANCE", self.abs_tolerance)] {
            if !tol.is_finite() || tol < 0.0 {
                return Err(eyre!("{} must be finite and >= 0 (currently {})", name, tol));
            }
        }

        if self.default_fee.is_nan() || self.default_fee <= -1.0 {
            return Err(eyre!("DEFAULT_FEE must be above -1 (currently {})", self.default_fee));
        }
        for (exchange, fee) in &self.exchange_fees {
            if fee.is_nan() || *fee <= -1.0 {
                return Err(eyre!("Fee for {} must be above -1 (currently {})", exchange, fee));
            }
        }

        if self.channel_capacity == 0 {
            return Err(eyre!("CHANNEL_CAPACITY must be at least 1"));
        }

        Ok(())
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("╔════════════════════════════════════════════════════════════╗");
        println!("║              ARBGRAPH - CONFIGURATION                      ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ OPPORTUNITIES                                              ║");
        println!("║ • Expire After:    {:>35} ms ║", self.expire_time_ms);
        println!("║ • Min Gain:        {:>38.6}x ║", self.min_gain);
        println!("║ • Min Cycle Hops:  {:^40} ║", self.min_cycle_hops);
        println!("║ • Venue:           {:^40} ║", self.venue);
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ FEES                                                       ║");
        println!("║ • Default Fee:     {:>38.4}% ║", self.default_fee * 100.0);
        println!("║ • Exchange Entries:{:^40} ║", self.exchange_fees.len());
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ NUMERICS                                                   ║");
        println!("║ • Rel Tolerance:   {:^40e} ║", self.rel_tolerance);
        println!("║ • Abs Tolerance:   {:^40e} ║", self.abs_tolerance);
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ ENGINE                                                     ║");
        println!("║ • Channel Size:    {:^40} ║", self.channel_capacity);
        println!("║ • Opportunity Log: {:^40} ║",
            if self.opportunity_log_path.is_some() { "✓ Enabled" } else { "✗ Disabled" }
        );
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            expire_time_ms: 20_000,
            min_gain: 1.0,
            min_cycle_hops: 3,
            venue: "all".to_string(),
            default_fee: 0.0,
            exchange_fees: HashMap::new(),
            rel_tolerance: 1e-9,
            abs_tolerance: 1e-12,
            channel_capacity: 1024,
            top_n: 10,
            log_filter: "arbgraph=info".to_string(),
            opportunity_log_path: None,
        }
    }
}

// ============================================
// OPPORTUNITY LOGGER
// ============================================

/// One line of the opportunity log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpportunityLog {
    pub timestamp: DateTime<Utc>,
    pub venue: String,
    pub path: Vec<String>,
    pub gain: f64,
    pub gain_pct: f64,
    pub discovered_at: i64,
    pub updated_at: i64,
}

impl OpportunityLog {
    pub fn from_opportunity(op: &Opportunity) -> Self {
        Self {
            timestamp: Utc::now(),
            venue: op.venue.clone(),
            path: op.path(),
            gain: op.gain,
            gain_pct: op.gain_pct(),
            discovered_at: op.discovered_at,
            updated_at: op.updated_at,
        }
    }

    /// Append this log to a file
    pub fn append_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        // Create parent directories if needed
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        let json = serde_json::to_string(self)?;
        writeln!(file, "{}", json)?;

        Ok(())
    }
}

// ============================================
// TESTS
// ============================================
