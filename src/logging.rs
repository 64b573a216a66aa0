use flexi_logger::{
    Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming, WriteMode,
};
use std::path::Path;

use crate::config::LoggingConfig;
use crate::error::MemKeeperError;

const LOG_BASENAME: &str = "memkeeper";
const LOG_ROTATE_BYTES: u64 = 10_000_000;
const LOG_FILES_KEPT: usize = 7;

/// Start file logging into `log_dir`. Warnings and errors are mirrored to stderr.
///
/// Keep the returned handle alive for the life of the process; dropping it flushes
/// and stops the logger.
pub fn start_logging(log_dir: &Path, config: &LoggingConfig) -> Result<LoggerHandle, MemKeeperError> {
    Logger::try_with_str(log_spec(config))
        .and_then(|logger| {
            logger
                .log_to_file(
                    FileSpec::default()
                        .directory(log_dir)
                        .basename(LOG_BASENAME),
                )
                .rotate(
                    Criterion::Size(LOG_ROTATE_BYTES),
                    Naming::Timestamps,
                    Cleanup::KeepLogFiles(LOG_FILES_KEPT),
                )
                .write_mode(WriteMode::BufferAndFlush)
                .duplicate_to_stderr(Duplicate::Warn)
                .format_for_files(flexi_logger::detailed_format)
                .start()
        })
        .map_err(|e| MemKeeperError::Error(format!("Failed to start logging: {}", e)))
}

/// Only this crate logs at the configured level; dependencies stay at warn
fn log_spec(config: &LoggingConfig) -> String {
    format!("warn, memkeeper={}", config.memkeeper)
}
