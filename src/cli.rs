use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use log::info;
use serde::Serialize;
use std::path::PathBuf;

use crate::config::Config;
use crate::database::Database;
use crate::error::MemKeeperError;
use crate::jobs::{Job, JobCounts, JobQueueManager, JobStatus, JobStore};
use crate::logging;
use crate::outcomes::{SessionCounter, SessionCounterRow};

#[derive(Parser)]
#[command(
    name = "memkeeper",
    version,
    about = "memkeeper: maintenance for the agent-memory job queue and outcome log"
)]
pub struct Cli {
    /// Data directory holding memkeeper.db, config.toml and logs (default: platform data dir)
    #[arg(long = "data-dir", short = 'd', global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show job counts, active jobs and session counters (default if no command specified)
    Status,

    /// Prune finished jobs past retention and cancel expired pending jobs
    Cleanup,

    /// Fail jobs left running by a process that is gone
    Recover,
}

#[derive(Serialize)]
struct StatusReport {
    jobs: JobCounts,
    running: Vec<Job>,
    pending: Vec<Job>,
    sessions: Vec<SessionCounterRow>,
}

impl Cli {
    pub fn handle_command_line() -> Result<(), MemKeeperError> {
        let args = Cli::parse();

        let project_dirs = ProjectDirs::from("", "", "memkeeper").ok_or_else(|| {
            MemKeeperError::Error("Could not determine the platform data directory".into())
        })?;

        let (data_dir, config) = match args.data_dir {
            Some(dir) => {
                let config = Config::load_from(&dir.join("config.toml"));
                (dir, config)
            }
            None => (
                project_dirs.data_local_dir().to_path_buf(),
                Config::load_config(&project_dirs),
            ),
        };

        let _logger = logging::start_logging(&data_dir.join("logs"), &config.logging)?;
        let db = Database::connect(&data_dir)?;

        match args.command.unwrap_or(Command::Status) {
            Command::Status => Self::print_status(&db),
            Command::Cleanup => Self::run_with_manager(db, config, |manager| {
                let report = manager.cleanup()?;
                println!(
                    "Pruned {} finished job(s), cancelled {} expired job(s)",
                    report.pruned, report.expired
                );
                Ok(())
            }),
            Command::Recover => Self::run_with_manager(db, config, |manager| {
                let recovered = manager.initialize()?;
                println!("Recovered {} orphaned job(s)", recovered);
                Ok(())
            }),
        }
    }

    fn print_status(db: &Database) -> Result<(), MemKeeperError> {
        let conn = db.get_connection()?;

        let report = StatusReport {
            jobs: JobStore::counts(&conn)?,
            running: JobStore::list_by_status(&conn, JobStatus::Running)?,
            pending: JobStore::list_by_status(&conn, JobStatus::Pending)?,
            sessions: SessionCounter::list(&conn)?,
        };

        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }

    /// Build a runtime, run `f` against a manager, then wait for its detached work
    fn run_with_manager<F>(db: Database, config: Config, f: F) -> Result<(), MemKeeperError>
    where
        F: FnOnce(&std::sync::Arc<JobQueueManager>) -> Result<(), MemKeeperError>,
    {
        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| MemKeeperError::Error(format!("Failed to create runtime: {}", e)))?;

        rt.block_on(async {
            let manager = JobQueueManager::new(db, config.queue)?;
            let result = f(&manager);
            manager.shutdown().await;
            info!("Maintenance command finished");
            result
        })
    }
}
