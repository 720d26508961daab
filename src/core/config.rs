use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long silence on the player's output is considered normal, per state.
/// `None` means silence is expected (the watchdog does not complain).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReadIntervals {
    pub loading_ms: Option<u64>,
    pub playing_ms: Option<u64>,
    pub buffering_ms: Option<u64>,
    pub paused_ms: Option<u64>,
}

impl Default for ReadIntervals {
    fn default() -> Self {
        Self {
            loading_ms: Some(2000),
            playing_ms: Some(1000),
            buffering_ms: Some(3000),
            paused_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub player_path: PathBuf,
    pub baseline_args: Vec<String>,

    // Write throttling
    pub min_write_interval_ms: u64,
    pub max_silence_ms: u64,
    pub large_queue_threshold: usize,
    pub hard_queue_cap: usize,

    // Latency watchdog
    pub watchdog_period_ms: u64,
    pub read_intervals: ReadIntervals,
    pub expected_read_after_write_ms: u64,
    pub escalation_multiplier: f64,

    // Position tracking
    pub distrust_window_ms: u64,
    pub closeness_tolerance: f64,
    pub min_notify_delta: f64,
    pub length_overflow_tolerance: f64,
    /// A-V desync (seconds, scaled by speed) above which a corrective seek is
    /// issued. Negative disables the correction.
    pub av_desync_threshold: f64,

    // Load / teardown
    pub preload_byte_limit: usize,
    pub preload_timeout_ms: u64,
    pub load_timeout_ms: u64,
    pub stop_flush_ms: u64,
    pub quit_timeout_ms: u64,
    pub max_restart_crashes: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            player_path: PathBuf::from("mplayer"),
            baseline_args: [
                "-slave",
                "-idle",
                "-identify",
                "-noconfig",
                "all",
                "-nomouseinput",
                "-input",
                "nodefault-bindings",
                "-msglevel",
                "global=6:statusline=5",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            min_write_interval_ms: 100,
            max_silence_ms: 1500,
            large_queue_threshold: 8,
            hard_queue_cap: 64,
            watchdog_period_ms: 250,
            read_intervals: ReadIntervals::default(),
            expected_read_after_write_ms: 1000,
            escalation_multiplier: 10.0,
            distrust_window_ms: 2000,
            closeness_tolerance: 1.5,
            min_notify_delta: 0.5,
            length_overflow_tolerance: 5.0,
            av_desync_threshold: 5.0,
            preload_byte_limit: 64 * 1024,
            preload_timeout_ms: 5000,
            load_timeout_ms: 20000,
            stop_flush_ms: 50,
            quit_timeout_ms: 1000,
            max_restart_crashes: 3,
        }
    }
}

impl ControllerConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        if config_path.exists() {
            match Self::load_from(&config_path) {
                Ok(config) => {
                    log::info!("Loaded existing config from {}", config_path.display());
                    Ok(config)
                }
                Err(e) => {
                    log::warn!("Config file exists but has issues ({}), creating new one with defaults", e);
                    let new_config = Self::default();
                    new_config.save_to(&config_path)
                        .map_err(|save_err| anyhow::anyhow!("Failed to save new config: {}", save_err))?;
                    log::info!("Created new config file at {}", config_path.display());
                    Ok(new_config)
                }
            }
        } else {
            log::info!("No config file found, creating default config");
            let config = Self::default();
            config.save_to(&config_path)
                .map_err(|e| anyhow::anyhow!("Failed to save default config: {}", e))?;
            log::info!("Created new config file at {}", config_path.display());
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {}: {}", path.display(), e))?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("slave-player")
            .join("config.json")
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.escalation_multiplier < 1.0 {
            return Err(anyhow::anyhow!(
                "escalation_multiplier must be at least 1.0, got {}",
                self.escalation_multiplier
            ));
        }
        if self.large_queue_threshold == 0 || self.hard_queue_cap <= self.large_queue_threshold {
            return Err(anyhow::anyhow!(
                "hard_queue_cap ({}) must exceed large_queue_threshold ({}) which must be non-zero",
                self.hard_queue_cap,
                self.large_queue_threshold
            ));
        }
        if self.watchdog_period_ms == 0 {
            return Err(anyhow::anyhow!("watchdog_period_ms must be non-zero"));
        }
        Ok(())
    }

    pub fn min_write_interval(&self) -> Duration {
        Duration::from_millis(self.min_write_interval_ms)
    }

    pub fn max_silence(&self) -> Duration {
        Duration::from_millis(self.max_silence_ms)
    }

    pub fn watchdog_period(&self) -> Duration {
        Duration::from_millis(self.watchdog_period_ms)
    }

    pub fn expected_read_after_write(&self) -> Duration {
        Duration::from_millis(self.expected_read_after_write_ms)
    }

    pub fn distrust_window(&self) -> Duration {
        Duration::from_millis(self.distrust_window_ms)
    }

    pub fn preload_timeout(&self) -> Duration {
        Duration::from_millis(self.preload_timeout_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn stop_flush(&self) -> Duration {
        Duration::from_millis(self.stop_flush_ms)
    }

    pub fn quit_timeout(&self) -> Duration {
        Duration::from_millis(self.quit_timeout_ms)
    }
}
