use config::{Config, Environment, File};
pub use config::ConfigError;
use serde::Deserialize;

use crate::grid::EngineConfig;
use crate::market::PaperExchangeInput;
use crate::notify::WebhookConfig;

/// Main configuration struct
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Ladder definition and state file locations
    pub ladder: LadderFiles,
    /// Engine cadences, bands and reconciliation thresholds
    #[serde(default)]
    pub engine: EngineConfig,
    /// Chat webhook alerts
    #[serde(default)]
    pub notify: WebhookConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// Paper venue used when no live client is wired in
    #[serde(default)]
    pub paper: PaperExchangeInput,
}

#[derive(Debug, Deserialize)]
pub struct LadderFiles {
    /// JSON ladder definition (instrument and levels)
    pub ladder_file: String,
    /// Where ledger snapshots are kept
    #[serde(default = "default_state_file")]
    pub state_file: String,
    /// Readable per-level view rewritten after every check; unset disables it
    #[serde(default)]
    pub runtime_file: Option<String>,
}

fn default_state_file() -> String {
    "grid_state.json".to_string()
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Settings {
    /// Load settings from a configuration file
    pub fn new(config_path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(config_path))
            // Environment overrides the file, e.g. GRID__NOTIFY__URL=...
            .add_source(Environment::with_prefix("GRID").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_settings_use_defaults() {
        let path = std::env::temp_dir().join("grid_ladder_settings_minimal.toml");
        std::fs::write(&path, "[ladder]\nladder_file = \"ladder.json\"\n").unwrap();

        let settings = Settings::new(path.to_str().unwrap()).unwrap();
        assert_eq!(settings.ladder.ladder_file, "ladder.json");
        assert_eq!(settings.ladder.state_file, "grid_state.json");
        assert!(settings.ladder.runtime_file.is_none());
        assert_eq!(settings.engine.check_interval_ms, 1500);
        assert!(!settings.notify.is_enabled());
        assert_eq!(settings.log.level, "info");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_empty_log_section_keeps_default_level() {
        let path = std::env::temp_dir().join("grid_ladder_settings_empty_log.toml");
        std::fs::write(&path, "[ladder]\nladder_file = \"ladder.json\"\n\n[log]\n").unwrap();

        let settings = Settings::new(path.to_str().unwrap()).unwrap();
        assert_eq!(settings.log.level, "info");
        assert_eq!(LogConfig::default().level, "info");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_sections_override_defaults() {
        let path = std::env::temp_dir().join("grid_ladder_settings_full.toml");
        std::fs::write(
            &path,
            r#"
[ladder]
ladder_file = "btc.json"
state_file = "btc_state.json"
runtime_file = "btc_runtime.json"

[engine]
check_interval_ms = 2000
open_band_low = 0.9

[notify]
url = "https://chat.example/hook"
name = "btc-ladder"

[log]
level = "debug"

[paper]
mid = 30000.0
"#,
        )
        .unwrap();

        let settings = Settings::new(path.to_str().unwrap()).unwrap();
        assert_eq!(settings.ladder.runtime_file.as_deref(), Some("btc_runtime.json"));
        assert_eq!(settings.engine.check_interval_ms, 2000);
        assert_eq!(settings.engine.open_band_low, 0.9);
        assert_eq!(settings.engine.quick_recheck_interval_ms, 500);
        assert!(settings.notify.is_enabled());
        assert_eq!(settings.notify.flush_interval_secs, 10);
        assert_eq!(settings.paper.mid, 30000.0);

        std::fs::remove_file(&path).ok();
    }
}
