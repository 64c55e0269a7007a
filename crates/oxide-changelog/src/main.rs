//! oxide-changelog CLI
//!
//! Command-line tool for applying changelog migrations.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

use oxide_changelog::prelude::*;

/// Changelog-driven database migrations.
#[derive(Parser)]
#[command(name = "oxide-changelog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database URL (SQLite path or connection string).
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:db.sqlite3")]
    database: String,

    /// Root changelog file.
    #[arg(
        short,
        long,
        env = "CHANGELOG_FILE",
        default_value = "db/changelog/db.changelog-master.json"
    )]
    changelog: PathBuf,

    /// Seconds to wait for the migration lock.
    #[arg(long, env = "LOCK_TIMEOUT_SECS", default_value_t = 60)]
    lock_timeout_secs: u64,

    /// What to do when an applied changeset has changed (fail or allow).
    #[arg(long, env = "CHECKSUM_POLICY", default_value = "fail")]
    checksum_policy: ChecksumPolicy,

    /// Ledger table name.
    #[arg(long, default_value = oxide_changelog::config::DEFAULT_LEDGER_TABLE)]
    ledger_table: String,

    /// Lock table name.
    #[arg(long, default_value = oxide_changelog::config::DEFAULT_LOCK_TABLE)]
    lock_table: String,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending changesets.
    Migrate {
        /// Comma separated contexts (all if not specified).
        #[arg(long)]
        contexts: Option<String>,

        /// Comma separated labels (all if not specified).
        #[arg(long)]
        labels: Option<String>,
    },

    /// Roll back the most recently applied changesets.
    Rollback {
        /// Number of changesets to roll back.
        #[arg(short = 'n', long, default_value_t = 1, value_parser = clap::value_parser!(i64).range(1..))]
        count: i64,
    },

    /// Show how many changesets are pending.
    Status {
        /// Comma separated contexts (all if not specified).
        #[arg(long)]
        contexts: Option<String>,
    },

    /// Check the changelog against the ledger.
    Validate,

    /// List pending changesets.
    Pending {
        /// Comma separated contexts (all if not specified).
        #[arg(long)]
        contexts: Option<String>,

        /// Comma separated labels (all if not specified).
        #[arg(long)]
        labels: Option<String>,
    },

    /// Forcibly remove a stale migration lock.
    ReleaseLocks,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = EngineConfig::new()
        .ledger_table(cli.ledger_table)
        .lock_table(cli.lock_table)
        .lock_timeout(Duration::from_secs(cli.lock_timeout_secs))
        .checksum_policy(cli.checksum_policy);

    // Connect to database
    let options = cli
        .database
        .parse::<SqliteConnectOptions>()?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    debug!(database = %cli.database, "Connected to database");

    let engine = Arc::new(MigrationEngine::new(pool, config)?);
    let api = MigrationApi::new(Arc::clone(&engine), &cli.changelog);

    let response = match cli.command {
        Commands::Migrate { contexts, labels } => {
            api.dispatch(ApiRequest::Run { contexts, labels }).await
        }
        Commands::Rollback { count } => api.dispatch(ApiRequest::Rollback { count }).await,
        Commands::Status { contexts } => api.dispatch(ApiRequest::Status { contexts }).await,
        Commands::Validate => api.dispatch(ApiRequest::Validate).await,
        Commands::Pending { contexts, labels } => {
            let filter = ChangeFilter::parse(contexts.as_deref(), labels.as_deref());
            match engine.pending_change_sets(&cli.changelog, &filter).await {
                Ok(pending) => ApiResponse {
                    status: 200,
                    body: json!({
                        "status": "SUCCESS",
                        "pendingChangesets": pending.len(),
                        "changesets": pending
                            .iter()
                            .map(|cs| cs.identity.to_string())
                            .collect::<Vec<_>>(),
                    }),
                },
                Err(err) => failed(&err),
            }
        }
        Commands::ReleaseLocks => match engine.release_locks().await {
            Ok(released) => ApiResponse {
                status: 200,
                body: json!({
                    "status": "SUCCESS",
                    "message": if released { "Lock released" } else { "Lock was not held" },
                }),
            },
            Err(err) => failed(&err),
        },
    };

    println!("{}", serde_json::to_string_pretty(&response.body)?);
    Ok(if response.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn failed(err: &MigrateError) -> ApiResponse {
    ApiResponse {
        status: 500,
        body: json!({
            "status": "FAILED",
            "message": err.to_string(),
            "error": err.chain(),
            "errorKind": err.kind(),
        }),
    }
}
