use std::fs;
use std::path::Path;

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "MEMKEEPER_";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub memkeeper: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const MEMKEEPER_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            memkeeper: Self::MEMKEEPER_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        let str_original = self.memkeeper.clone();
        self.memkeeper = self.memkeeper.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.memkeeper.as_str()) {
            eprintln!(
                "Config error: memkeeper log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::MEMKEEPER_LEVEL
            );
            self.memkeeper = Self::MEMKEEPER_LEVEL.to_owned();
        }
    }
}

/// Limits and windows for the job queue
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub max_concurrent_jobs: usize,
    pub max_queue_depth: usize,
    pub pending_job_expiration_ms: i64,
    pub deduplication_window_ms: i64,
    pub enable_merging: bool,
    pub job_retention_ms: i64,
}

impl QueueConfig {
    const MAX_CONCURRENT_JOBS: usize = 2;
    const MAX_QUEUE_DEPTH: usize = 100;
    const PENDING_JOB_EXPIRATION_MS: i64 = 24 * 60 * 60 * 1000;
    const DEDUPLICATION_WINDOW_MS: i64 = 60 * 60 * 1000;
    const JOB_RETENTION_MS: i64 = 7 * 24 * 60 * 60 * 1000;

    /// Smallest pending count at or above 80% of depth
    pub fn warning_depth(&self) -> usize {
        (self.max_queue_depth * 4).div_ceil(5)
    }

    /// True when the pending count moving from `before` to `after` reaches the warning depth
    pub fn crosses_warning_depth(&self, before: usize, after: usize) -> bool {
        let warning_depth = self.warning_depth();
        before < warning_depth && after >= warning_depth
    }

    fn ensure_valid(&mut self) {
        if self.max_concurrent_jobs == 0 {
            eprintln!(
                "Config error: queue.max_concurrent_jobs must be at least 1 - using default of {}",
                Self::MAX_CONCURRENT_JOBS
            );
            self.max_concurrent_jobs = Self::MAX_CONCURRENT_JOBS;
        }
        if self.max_queue_depth == 0 {
            eprintln!(
                "Config error: queue.max_queue_depth must be at least 1 - using default of {}",
                Self::MAX_QUEUE_DEPTH
            );
            self.max_queue_depth = Self::MAX_QUEUE_DEPTH;
        }
        if self.pending_job_expiration_ms <= 0 {
            eprintln!(
                "Config error: queue.pending_job_expiration_ms must be positive - using default of {}",
                Self::PENDING_JOB_EXPIRATION_MS
            );
            self.pending_job_expiration_ms = Self::PENDING_JOB_EXPIRATION_MS;
        }
        if self.deduplication_window_ms < 0 {
            eprintln!(
                "Config error: queue.deduplication_window_ms must not be negative - using default of {}",
                Self::DEDUPLICATION_WINDOW_MS
            );
            self.deduplication_window_ms = Self::DEDUPLICATION_WINDOW_MS;
        }
        if self.job_retention_ms <= 0 {
            eprintln!(
                "Config error: queue.job_retention_ms must be positive - using default of {}",
                Self::JOB_RETENTION_MS
            );
            self.job_retention_ms = Self::JOB_RETENTION_MS;
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_concurrent_jobs: Self::MAX_CONCURRENT_JOBS,
            max_queue_depth: Self::MAX_QUEUE_DEPTH,
            pending_job_expiration_ms: Self::PENDING_JOB_EXPIRATION_MS,
            deduplication_window_ms: Self::DEDUPLICATION_WINDOW_MS,
            enable_merging: true,
            job_retention_ms: Self::JOB_RETENTION_MS,
        }
    }
}

/// Thresholds and caps for outcome recording and batch analysis
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutcomeConfig {
    pub tool_count_threshold: i64,
    pub min_confidence: f64,
    pub max_input_chars: usize,
    pub max_message_chars: usize,
}

impl OutcomeConfig {
    const TOOL_COUNT_THRESHOLD: i64 = 20;
    const MIN_CONFIDENCE: f64 = 0.7;
    const MAX_INPUT_CHARS: usize = 500;
    const MAX_MESSAGE_CHARS: usize = 1000;

    fn ensure_valid(&mut self) {
        if self.tool_count_threshold < 1 {
            eprintln!(
                "Config error: outcomes.tool_count_threshold must be at least 1 - using default of {}",
                Self::TOOL_COUNT_THRESHOLD
            );
            self.tool_count_threshold = Self::TOOL_COUNT_THRESHOLD;
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            eprintln!(
                "Config error: outcomes.min_confidence of {} is outside 0.0-1.0 - using default of {}",
                self.min_confidence,
                Self::MIN_CONFIDENCE
            );
            self.min_confidence = Self::MIN_CONFIDENCE;
        }
    }
}

impl Default for OutcomeConfig {
    fn default() -> Self {
        OutcomeConfig {
            tool_count_threshold: Self::TOOL_COUNT_THRESHOLD,
            min_confidence: Self::MIN_CONFIDENCE,
            max_input_chars: Self::MAX_INPUT_CHARS,
            max_message_chars: Self::MAX_MESSAGE_CHARS,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub queue: QueueConfig,
    pub outcomes: OutcomeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            queue: QueueConfig::default(),
            outcomes: OutcomeConfig::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from a TOML file located in the app's data directory.
    /// If the file is missing or fails to parse, defaults are used.
    /// Additionally, writes the default config to disk if no file exists.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        let config_path = project_dirs.data_local_dir().join("config.toml");
        Self::load_from(&config_path)
    }

    /// Same as `load_config`, with an explicit config file path
    pub fn load_from(config_path: &Path) -> Self {
        let default_config = Config::default();

        // If the config file doesn't exist, write the default configuration to disk.
        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    eprintln!(
                        "Failed to create configuration directory {}: {}",
                        parent.display(),
                        e
                    );
                }
            }
            if let Ok(toml_string) = toml::to_string_pretty(&default_config) {
                if let Err(e) = fs::write(config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            } else {
                eprintln!("Failed to serialize default config.");
            }
        }

        // Defaults, then the TOML file, then MEMKEEPER_* environment overrides
        // (e.g. MEMKEEPER_QUEUE__MAX_CONCURRENT_JOBS=4)
        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        config.ensure_valid();

        config
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.queue.ensure_valid();
        self.outcomes.ensure_valid();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_missing_file_writes_defaults() {
        Jail::expect_with(|jail| {
            let path = jail.directory().join("nested").join("config.toml");
            let config = Config::load_from(&path);

            assert_eq!(config, Config::default());
            assert!(path.exists(), "default config should be written to disk");
            Ok(())
        });
    }

    #[test]
    fn test_file_values_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                [logging]
                memkeeper = "DEBUG"

                [queue]
                max_concurrent_jobs = 4
                max_queue_depth = 10
                pending_job_expiration_ms = 1000
                deduplication_window_ms = 500
                enable_merging = false
                job_retention_ms = 2000

                [outcomes]
                tool_count_threshold = 5
                min_confidence = 0.9
                max_input_chars = 100
                max_message_chars = 200
                "#,
            )?;

            let config = Config::load_from(&jail.directory().join("config.toml"));
            assert_eq!(config.logging.memkeeper, "debug");
            assert_eq!(config.queue.max_concurrent_jobs, 4);
            assert_eq!(config.queue.max_queue_depth, 10);
            assert!(!config.queue.enable_merging);
            assert_eq!(config.outcomes.tool_count_threshold, 5);
            assert_eq!(config.outcomes.max_message_chars, 200);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                [queue]
                max_concurrent_jobs = 4
                "#,
            )?;
            jail.set_env("MEMKEEPER_QUEUE__MAX_CONCURRENT_JOBS", "7");

            let config = Config::load_from(&jail.directory().join("config.toml"));
            assert_eq!(config.queue.max_concurrent_jobs, 7);
            // Keys absent from the file keep their defaults
            assert_eq!(config.queue.max_queue_depth, QueueConfig::default().max_queue_depth);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                [logging]
                memkeeper = "verbose"

                [queue]
                max_concurrent_jobs = 0

                [outcomes]
                tool_count_threshold = 0
                min_confidence = 1.5
                "#,
            )?;

            let config = Config::load_from(&jail.directory().join("config.toml"));
            assert_eq!(config.logging.memkeeper, "info");
            assert_eq!(config.queue.max_concurrent_jobs, 2);
            assert_eq!(config.outcomes.tool_count_threshold, 20);
            assert_eq!(config.outcomes.min_confidence, 0.7);
            Ok(())
        });
    }

    #[test]
    fn test_warning_depth_is_eighty_percent() {
        let queue = QueueConfig {
            max_queue_depth: 10,
            ..QueueConfig::default()
        };
        assert_eq!(queue.warning_depth(), 8);
    }

    #[test]
    fn test_warning_fires_on_first_count_at_eighty_percent() {
        // (depth, pending count after the insert that should warn)
        for (depth, warn_at) in [(1, 1), (2, 2), (3, 3), (4, 4), (5, 4), (10, 8)] {
            let queue = QueueConfig {
                max_queue_depth: depth,
                ..QueueConfig::default()
            };
            assert_eq!(queue.warning_depth(), warn_at, "depth {}", depth);

            for after in 1..=depth {
                assert_eq!(
                    queue.crosses_warning_depth(after - 1, after),
                    after == warn_at,
                    "depth {} after {}",
                    depth,
                    after
                );
            }
        }
    }
}
