//! Engine policy parameters and ladder definitions

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::{GridError, GridResult};

/// Engine policy: cadences, latency bound, placement bands and cancel rules.
///
/// All bands are ratios of the current quote. An open order is placed when
/// `bid * open_band_low <= open_price <= bid * open_band_high`, a close order
/// when `ask * close_band_low <= close_price <= ask * close_band_high`. Both
/// ends are inclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Baseline interval between cycles (milliseconds)
    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,

    /// Interval used after a cycle that triggered at least one grid (milliseconds)
    #[serde(default = "default_quick_recheck_interval")]
    pub quick_recheck_interval_ms: u64,

    /// Quotes that take longer than this to fetch are discarded (milliseconds)
    #[serde(default = "default_max_quote_latency")]
    pub max_quote_latency_ms: u64,

    #[serde(default = "default_open_band_low")]
    pub open_band_low: f64,

    #[serde(default = "default_open_band_high")]
    pub open_band_high: f64,

    #[serde(default = "default_close_band_low")]
    pub close_band_low: f64,

    #[serde(default = "default_close_band_high")]
    pub close_band_high: f64,

    /// Resting open orders priced below `bid * open_cancel_ratio` are cancelled
    #[serde(default = "default_open_cancel_ratio")]
    pub open_cancel_ratio: f64,

    /// Resting close orders priced above `ask * close_cancel_ratio` are cancelled
    #[serde(default = "default_close_cancel_ratio")]
    pub close_cancel_ratio: f64,

    /// Minimum time between two cancel attempts on the same order (seconds)
    #[serde(default = "default_cancel_cooldown")]
    pub cancel_cooldown_secs: u64,

    /// Interval between open-order polls (milliseconds)
    #[serde(default = "default_sync_interval")]
    pub sync_interval_ms: u64,

    /// Orders without an update for this long are queried one by one (milliseconds)
    #[serde(default = "default_order_stale_after")]
    pub order_stale_after_ms: u64,

    /// Capacity of the inbound event queue
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    #[serde(default = "default_post_only_open")]
    pub post_only_open: bool,

    #[serde(default)]
    pub post_only_close: bool,

    /// Consecutive skipped cycles (stale or failed quotes) before an alert is sent
    #[serde(default = "default_skip_alert_after")]
    pub skip_alert_after: u32,
}

fn default_check_interval() -> u64 {
    1500
}

fn default_quick_recheck_interval() -> u64 {
    500
}

fn default_max_quote_latency() -> u64 {
    3000
}

fn default_open_band_low() -> f64 {
    0.86
}

fn default_open_band_high() -> f64 {
    1.0
}

fn default_close_band_low() -> f64 {
    1.0
}

fn default_close_band_high() -> f64 {
    1.14
}

fn default_open_cancel_ratio() -> f64 {
    0.85
}

fn default_close_cancel_ratio() -> f64 {
    1.15
}

fn default_cancel_cooldown() -> u64 {
    20
}

fn default_sync_interval() -> u64 {
    5000
}

fn default_order_stale_after() -> u64 {
    3000
}

fn default_event_queue_capacity() -> usize {
    1000
}

fn default_post_only_open() -> bool {
    true
}

fn default_skip_alert_after() -> u32 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval(),
            quick_recheck_interval_ms: default_quick_recheck_interval(),
            max_quote_latency_ms: default_max_quote_latency(),
            open_band_low: default_open_band_low(),
            open_band_high: default_open_band_high(),
            close_band_low: default_close_band_low(),
            close_band_high: default_close_band_high(),
            open_cancel_ratio: default_open_cancel_ratio(),
            close_cancel_ratio: default_close_cancel_ratio(),
            cancel_cooldown_secs: default_cancel_cooldown(),
            sync_interval_ms: default_sync_interval(),
            order_stale_after_ms: default_order_stale_after(),
            event_queue_capacity: default_event_queue_capacity(),
            post_only_open: default_post_only_open(),
            post_only_close: false,
            skip_alert_after: default_skip_alert_after(),
        }
    }
}

impl EngineConfig {
    /// Builder: set the open placement band
    pub fn with_open_band(mut self, low: f64, high: f64) -> Self {
        self.open_band_low = low;
        self.open_band_high = high;
        self
    }

    /// Builder: set the close placement band
    pub fn with_close_band(mut self, low: f64, high: f64) -> Self {
        self.close_band_low = low;
        self.close_band_high = high;
        self
    }

    /// Builder: set both cancel ratios
    pub fn with_cancel_ratios(mut self, open: f64, close: f64) -> Self {
        self.open_cancel_ratio = open;
        self.close_cancel_ratio = close;
        self
    }

    /// Builder: set the cancel cooldown
    pub fn with_cancel_cooldown(mut self, secs: u64) -> Self {
        self.cancel_cooldown_secs = secs;
        self
    }

    pub fn with_skip_alert_after(mut self, cycles: u32) -> Self {
        self.skip_alert_after = cycles;
        self
    }

    /// Builder: set the quote latency bound
    pub fn with_max_quote_latency(mut self, ms: u64) -> Self {
        self.max_quote_latency_ms = ms;
        self
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn quick_recheck_interval(&self) -> Duration {
        Duration::from_millis(self.quick_recheck_interval_ms)
    }

    pub fn max_quote_latency(&self) -> Duration {
        Duration::from_millis(self.max_quote_latency_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn cancel_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cancel_cooldown_secs as i64)
    }

    pub fn order_stale_after(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.order_stale_after_ms as i64)
    }

    /// Validate the configuration
    pub fn validate(&self) -> GridResult<()> {
        if self.check_interval_ms == 0 || self.quick_recheck_interval_ms == 0 {
            return Err(GridError::InvalidConfig(
                "check intervals must be positive".into(),
            ));
        }

        if self.max_quote_latency_ms == 0 {
            return Err(GridError::InvalidConfig(
                "max_quote_latency_ms must be positive".into(),
            ));
        }

        let ratios = [
            self.open_band_low,
            self.open_band_high,
            self.close_band_low,
            self.close_band_high,
            self.open_cancel_ratio,
            self.close_cancel_ratio,
        ];
        if ratios.iter().any(|r| !r.is_finite() || *r <= 0.0) {
            return Err(GridError::InvalidConfig(
                "band and cancel ratios must be positive".into(),
            ));
        }

        if self.open_band_low > self.open_band_high {
            return Err(GridError::InvalidConfig(
                "open_band_low must not exceed open_band_high".into(),
            ));
        }

        if self.close_band_low > self.close_band_high {
            return Err(GridError::InvalidConfig(
                "close_band_low must not exceed close_band_high".into(),
            ));
        }

        // A freshly placed order must not be eligible for cancellation
        if self.open_cancel_ratio > self.open_band_low {
            return Err(GridError::InvalidConfig(
                "open_cancel_ratio must not exceed open_band_low".into(),
            ));
        }

        if self.close_cancel_ratio < self.close_band_high {
            return Err(GridError::InvalidConfig(
                "close_cancel_ratio must not be below close_band_high".into(),
            ));
        }

        if self.event_queue_capacity == 0 {
            return Err(GridError::InvalidConfig(
                "event_queue_capacity must be positive".into(),
            ));
        }

        Ok(())
    }
}

/// One rung of the ladder as supplied by the operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelConfig {
    pub open_price: f64,
    pub close_price: f64,
    /// Initial open-side budget (contracts)
    #[serde(default)]
    pub open_chance: f64,
    /// Initial close-side budget (contracts)
    #[serde(default)]
    pub close_chance: f64,
}

impl LevelConfig {
    pub fn new(open_price: f64, close_price: f64, open_chance: f64, close_chance: f64) -> Self {
        Self {
            open_price,
            close_price,
            open_chance,
            close_chance,
        }
    }
}

/// Ladder definition: one instrument and its price levels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LadderConfig {
    /// Instrument to trade (e.g., "BTC-PERP")
    pub instrument: String,
    pub levels: Vec<LevelConfig>,
}

impl LadderConfig {
    pub fn new(instrument: impl Into<String>, levels: Vec<LevelConfig>) -> Self {
        Self {
            instrument: instrument.into(),
            levels,
        }
    }

    /// Validate the ladder; a malformed ladder must never be traded
    pub fn validate(&self) -> GridResult<()> {
        if self.instrument.is_empty() {
            return Err(GridError::InvalidConfig("instrument cannot be empty".into()));
        }

        if self.levels.is_empty() {
            return Err(GridError::InvalidConfig("ladder has no levels".into()));
        }

        for (index, level) in self.levels.iter().enumerate() {
            validate_level(
                index,
                level.open_price,
                level.close_price,
                level.open_chance,
                level.close_chance,
            )
            .map_err(GridError::InvalidConfig)?;
        }

        Ok(())
    }

    /// Load ladder from JSON file
    pub fn load_from_file(path: impl AsRef<Path>) -> GridResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let ladder: Self = serde_json::from_str(&content)?;
        ladder.validate()?;
        Ok(ladder)
    }
}

/// Shared level checks for configured and persisted ladders
pub(crate) fn validate_level(
    index: usize,
    open_price: f64,
    close_price: f64,
    open_chance: f64,
    close_chance: f64,
) -> Result<(), String> {
    if !open_price.is_finite() || !close_price.is_finite() || open_price <= 0.0 {
        return Err(format!("level {}: prices must be positive numbers", index));
    }

    if open_price >= close_price {
        return Err(format!(
            "level {}: open_price {} must be below close_price {}",
            index, open_price, close_price
        ));
    }

    if !open_chance.is_finite() || !close_chance.is_finite() || open_chance < 0.0 || close_chance < 0.0 {
        return Err(format!("level {}: chances must be non-negative numbers", index));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ladder() -> LadderConfig {
        LadderConfig::new(
            "BTC-PERP",
            vec![
                LevelConfig::new(90.0, 95.0, 10.0, 0.0),
                LevelConfig::new(85.0, 90.0, 10.0, 0.0),
            ],
        )
    }

    #[test]
    fn test_engine_config_defaults_validate() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_quote_latency(), Duration::from_millis(3000));
        assert_eq!(config.cancel_cooldown(), chrono::Duration::seconds(20));
    }

    #[test]
    fn test_engine_config_rejects_inverted_band() {
        let config = EngineConfig::default().with_open_band(1.0, 0.9);
        assert!(config.validate().is_err());

        let config = EngineConfig::default().with_close_band(1.2, 1.1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_engine_config_rejects_cancel_inside_band() {
        // Cancel threshold above the placement floor would cancel fresh orders
        let config = EngineConfig::default().with_cancel_ratios(0.9, 1.15);
        assert!(config.validate().is_err());

        let config = EngineConfig::default().with_cancel_ratios(0.85, 1.1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_engine_config_serde_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"check_interval_ms": 2000}"#).unwrap();
        assert_eq!(config.check_interval_ms, 2000);
        assert_eq!(config.quick_recheck_interval_ms, 500);
        assert_eq!(config.open_band_low, 0.86);
        assert!(config.post_only_open);
        assert!(!config.post_only_close);
    }

    #[test]
    fn test_ladder_validation() {
        assert!(sample_ladder().validate().is_ok());

        let mut ladder = sample_ladder();
        ladder.levels[1] = LevelConfig::new(90.0, 85.0, 1.0, 0.0);
        assert!(ladder.validate().is_err());

        let mut ladder = sample_ladder();
        ladder.levels[0].open_chance = -1.0;
        assert!(ladder.validate().is_err());

        let mut ladder = sample_ladder();
        ladder.levels[0].close_price = f64::NAN;
        assert!(ladder.validate().is_err());

        let ladder = LadderConfig::new("", vec![LevelConfig::new(1.0, 2.0, 1.0, 0.0)]);
        assert!(ladder.validate().is_err());

        let ladder = LadderConfig::new("BTC-PERP", vec![]);
        assert!(ladder.validate().is_err());
    }

    #[test]
    fn test_ladder_file_load() {
        let path = std::env::temp_dir().join(format!("ladder_{}.json", uuid::Uuid::new_v4()));
        let ladder = sample_ladder();
        std::fs::write(&path, serde_json::to_string_pretty(&ladder).unwrap()).unwrap();

        let loaded = LadderConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, ladder);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_ladder_file_rejects_malformed_ordering() {
        let path = std::env::temp_dir().join(format!("ladder_{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"{"instrument":"BTC-PERP","levels":[{"open_price":100.0,"close_price":99.0,"open_chance":1.0}]}"#,
        )
        .unwrap();

        let result = LadderConfig::load_from_file(&path);
        assert!(matches!(result, Err(GridError::InvalidConfig(_))));

        std::fs::remove_file(&path).ok();
    }
}
