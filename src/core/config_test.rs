#[cfg(test)]
mod tests {

    use crate::core::{ControllerConfig, ReadIntervals};

    #[test]
    fn test_controller_config_default() {
        let config = ControllerConfig::default();
        assert_eq!(config.escalation_multiplier, 10.0);
        assert!(config.baseline_args.iter().any(|a| a == "-slave"));
        assert!(config.baseline_args.iter().any(|a| a == "-idle"));
        assert!(config.hard_queue_cap > config.large_queue_threshold);
        assert!(config.read_intervals.paused_ms.is_none()); // Silence is normal when paused
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_controller_config_serialization() {
        let mut config = ControllerConfig::default();
        config.av_desync_threshold = -1.0;
        config.read_intervals.playing_ms = Some(250);
        config.max_restart_crashes = 7;

        let serialized = serde_json::to_string(&config).expect("Failed to serialize config");
        let deserialized: ControllerConfig = serde_json::from_str(&serialized).expect("Failed to deserialize config");

        assert_eq!(config.av_desync_threshold, deserialized.av_desync_threshold);
        assert_eq!(config.read_intervals, deserialized.read_intervals);
        assert_eq!(config.max_restart_crashes, deserialized.max_restart_crashes);
        assert_eq!(config.player_path, deserialized.player_path);
    }

    #[test]
    fn test_config_backward_compatibility() {
        // Old config files without newer fields still load
        let old_config_json = r#"{
            "player_path": "/usr/local/bin/mplayer",
            "min_write_interval_ms": 40,
            "read_intervals": { "playing_ms": 500 }
        }"#;

        let config: ControllerConfig = serde_json::from_str(old_config_json).expect("Failed to parse old config");

        assert_eq!(config.min_write_interval_ms, 40);
        assert_eq!(config.read_intervals.playing_ms, Some(500));
        assert_eq!(config.read_intervals.loading_ms, ReadIntervals::default().loading_ms);
        assert_eq!(config.escalation_multiplier, 10.0);
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("nested").join("config.json");

        let mut config = ControllerConfig::default();
        config.load_timeout_ms = 1234;
        config.save_to(&path).expect("Failed to save config");

        let loaded = ControllerConfig::load_from(&path).expect("Failed to load config");
        assert_eq!(loaded.load_timeout_ms, 1234);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "escalation_multiplier": 0.5 }"#).unwrap();

        assert!(ControllerConfig::load_from(&path).is_err());

        let mut config = ControllerConfig::default();
        config.hard_queue_cap = config.large_queue_threshold;
        assert!(config.validate().is_err());
    }
}
