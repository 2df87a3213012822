//! pg-sync CLI - PostgreSQL migration via pg_dump/pg_restore.

use clap::{Parser, Subcommand, ValueEnum};
use pg_sync::{
    check, progress_channel, CheckStatus, EstimationResult, Estimator, HistoryStore,
    MigrationConfig, MigrationOptions, MigrationStats, MigrationType, Migrator, PgToolRunner,
    ProgressUpdate, ToolRunner,
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pg-sync")]
#[command(about = "PostgreSQL migration via pg_dump/pg_restore with preflight checks and rollback")]
#[command(version)]
struct Cli {
    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate a database from source to target
    Run {
        /// Source endpoint (postgres:// URL)
        #[arg(long)]
        source: String,

        /// Target endpoint (postgres:// URL)
        #[arg(long)]
        target: String,

        /// What to migrate
        #[arg(long, value_enum, default_value_t = MigrationTypeArg::SchemaAndData)]
        migration_type: MigrationTypeArg,

        /// Restrict the migration to a table (repeatable); omit to migrate everything
        #[arg(short = 't', long = "table")]
        tables: Vec<String>,

        /// Parallel restore jobs [default: 4]
        #[arg(long)]
        jobs: Option<usize>,

        /// Skip the safety backup of the target
        #[arg(long)]
        no_backup: bool,

        /// Skip preflight estimation
        #[arg(long)]
        skip_preflight: bool,
    },

    /// Run preflight diagnostics without migrating
    Estimate {
        /// Source endpoint (postgres:// URL)
        #[arg(long)]
        source: String,

        /// Target endpoint (postgres:// URL)
        #[arg(long)]
        target: String,
    },

    /// List tables in the public schema of an endpoint
    Tables {
        /// Endpoint (postgres:// URL)
        url: String,
    },

    /// Show recent migration history
    History {
        /// Maximum records to print
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Check that both endpoints accept connections
    HealthCheck {
        /// Source endpoint (postgres:// URL)
        #[arg(long)]
        source: String,

        /// Target endpoint (postgres:// URL)
        #[arg(long)]
        target: String,
    },
}

/// Migration type as a command-line value.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum MigrationTypeArg {
    SchemaAndData,
    SchemaOnly,
    DataOnly,
}

impl From<MigrationTypeArg> for MigrationType {
    fn from(arg: MigrationTypeArg) -> Self {
        match arg {
            MigrationTypeArg::SchemaAndData => MigrationType::SchemaAndData,
            MigrationTypeArg::SchemaOnly => MigrationType::SchemaOnly,
            MigrationTypeArg::DataOnly => MigrationType::DataOnly,
        }
    }
}

fn init_logging(format: &str, verbosity: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(verbosity));
    if format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_format, &cli.verbosity);

    match cli.command {
        Commands::Run {
            source,
            target,
            migration_type,
            tables,
            jobs,
            no_backup,
            skip_preflight,
        } => {
            let options = MigrationOptions {
                selected_tables: tables,
                parallel_jobs: jobs,
                auto_backup: !no_backup,
            };
            cmd_run(
                source,
                target,
                migration_type.into(),
                options,
                skip_preflight,
                cli.progress,
            )
            .await
        }
        Commands::Estimate { source, target } => cmd_estimate(&source, &target).await,
        Commands::Tables { url } => cmd_tables(&url).await,
        Commands::History { limit } => cmd_history(limit),
        Commands::HealthCheck { source, target } => cmd_health_check(&source, &target).await,
    }
}

async fn cmd_run(
    source: String,
    target: String,
    migration_type: MigrationType,
    options: MigrationOptions,
    skip_preflight: bool,
    progress_json: bool,
) -> ExitCode {
    let runner: Arc<dyn ToolRunner> = Arc::new(PgToolRunner);

    if let Err(e) = check::check_client_tools(runner.as_ref()).await {
        eprintln!("PostgreSQL client tools are not usable: {e}");
        return ExitCode::FAILURE;
    }

    if !skip_preflight {
        match Estimator::new(runner.clone()).estimate(&source, &target).await {
            Ok(report) => print_estimation(&report),
            Err(e) => {
                eprintln!("Preflight failed: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    let engine = match Migrator::new(MigrationConfig {
        source,
        target,
        migration_type,
        options,
    }) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let (tx, mut rx) = progress_channel();
    let run = tokio::spawn(engine.with_runner(runner).with_progress(tx).run());

    // Cooperative pull: re-arm recv after every event until a terminal event
    // arrives or the channel closes. A closed channel without a terminal
    // event also means the run is over.
    while let Some(update) = rx.recv().await {
        if progress_json {
            if let Ok(line) = serde_json::to_string(&update) {
                eprintln!("{line}");
            }
        } else {
            print_update(&update);
        }
        if update.is_terminal() {
            break;
        }
    }

    match run.await {
        Ok(outcome) => {
            print_stats(&outcome.stats);
            match outcome.error {
                None => ExitCode::SUCCESS,
                Some(e) => {
                    eprintln!("\nMigration failed: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Err(e) => {
            error!("migration task panicked: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn cmd_estimate(source: &str, target: &str) -> ExitCode {
    let runner: Arc<dyn ToolRunner> = Arc::new(PgToolRunner);
    match Estimator::new(runner).estimate(source, target).await {
        Ok(report) => {
            print_estimation(&report);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Estimation failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn cmd_tables(url: &str) -> ExitCode {
    if let Err(e) = pg_sync::validate_url(url) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }
    match check::list_tables(&PgToolRunner, url).await {
        Ok(tables) => {
            for table in tables {
                println!("{table}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Could not list tables: {e}");
            ExitCode::FAILURE
        }
    }
}

fn cmd_history(limit: usize) -> ExitCode {
    let store = match HistoryStore::open_default() {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Could not open history: {e}");
            return ExitCode::FAILURE;
        }
    };
    match store.load() {
        Ok(records) => {
            if records.is_empty() {
                println!("No migrations recorded yet.");
            }
            for record in records.iter().take(limit) {
                let status = match record.status {
                    pg_sync::RunStatus::Success => "success",
                    pg_sync::RunStatus::Failed => "failed",
                };
                print!(
                    "{}  {:7}  {:15}  {:6.1}s  {} -> {}",
                    record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    status,
                    record.migration_type,
                    record.duration_seconds,
                    record.source,
                    record.target,
                );
                match &record.error {
                    Some(error) => println!("  ({error})"),
                    None => println!(),
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Could not read history: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn cmd_health_check(source: &str, target: &str) -> ExitCode {
    let runner = PgToolRunner;
    let mut healthy = true;

    for (url, name) in [(source, "source"), (target, "target")] {
        match check::check_connection(&runner, url, name).await {
            Ok(()) => println!("{name}: ok"),
            Err(e) => {
                healthy = false;
                println!("{name}: {e}");
            }
        }
    }

    if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_update(update: &ProgressUpdate) {
    if update.percentage < 0.0 {
        eprintln!("ERROR  {}", update.message);
        return;
    }
    eprintln!("[{:>3.0}%] {}", update.percentage * 100.0, update.message);
    if let Some(command) = &update.command {
        eprintln!("       $ {command}");
    }
}

fn print_estimation(report: &EstimationResult) {
    println!("Source version : {}", report.source_version);
    println!("Target version : {}", report.target_version);
    println!("Database size  : {}", report.db_size);
    println!("Tables         : {}", report.table_count);
    for check in &report.checks {
        let tag = match check.status {
            CheckStatus::Green => " OK ",
            CheckStatus::Yellow => "WARN",
            CheckStatus::Red => "FAIL",
        };
        println!("  [{tag}] {}: {}", check.name, check.message);
    }
}

fn print_stats(stats: &MigrationStats) {
    println!("\nRun {} ({})", stats.run_id, stats.migration_type);
    println!("  duration: {:.1}s", stats.duration_seconds);
    if stats.tables_migrated > 0 {
        println!("  tables:   {}", stats.tables_migrated);
    }
    if let Some(path) = &stats.backup_path {
        println!("  backup:   {}", path.display());
    }
    if stats.did_rollback {
        let outcome = if stats.rollback_success { "succeeded" } else { "failed" };
        println!("  rollback: attempted, {outcome}");
    }
    for warning in &stats.warnings {
        println!("  warning:  {warning}");
    }
    if let Some(path) = &stats.log_path {
        println!("  log:      {}", path.display());
    }
}
