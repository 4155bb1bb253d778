//! guid-migrate CLI - identity-stable export and import between databases.

use clap::{Parser, Subcommand};
use guid_migrate::{Config, LogProgress, MigrateError, Orchestrator, Registry};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "guid-migrate")]
#[command(about = "Identity-stable export and import between databases")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Override the user of both connections
    #[arg(long)]
    user: Option<String>,

    /// Override the password of both connections
    #[arg(long, env = "GUID_MIGRATE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export the source database to portable files
    Export {
        /// Override the export directory
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Leave out the LabDE tables
        #[arg(long)]
        no_labde: bool,

        /// Leave out a table (repeatable)
        #[arg(long = "exclude", value_name = "TABLE")]
        exclude: Vec<String>,

        /// Also export fixed-vocabulary tables such as db_info
        #[arg(long)]
        include_settings: bool,
    },

    /// Import portable files into the target database
    Import {
        /// Override the export directory
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Leave out the LabDE tables
        #[arg(long)]
        no_labde: bool,

        /// Leave out a table (repeatable)
        #[arg(long = "exclude", value_name = "TABLE")]
        exclude: Vec<String>,

        /// Dry run: reconcile everything, then roll back instead of committing
        #[arg(long)]
        dry_run: bool,
    },

    /// List migratable tables in import order
    Tables {
        /// Leave out the LabDE tables
        #[arg(long)]
        no_labde: bool,
    },

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    // The catalogue is static; no config or connection needed.
    if let Commands::Tables { no_labde } = cli.command {
        return print_tables(!no_labde, cli.output_json);
    }

    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = Config::load(&cli.config)?.with_credentials(cli.user, cli.password);
    info!("Loaded configuration from {:?}", cli.config);

    // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
    let cancel_token = setup_signal_handler();

    match cli.command {
        Commands::Tables { .. } => unreachable!(), // Handled above
        Commands::Export {
            dir,
            no_labde,
            exclude,
            include_settings,
        } => {
            if include_settings {
                config.transfer.include_fixed_vocabulary = true;
            }
            apply_overrides(&mut config, dir, no_labde, exclude)?;
            let orchestrator = Orchestrator::new(config)?.with_cancellation(cancel_token);
            let summary = orchestrator.export(&LogProgress).await?;

            if cli.output_json {
                println!("{}", summary.to_json()?);
            } else {
                println!("\nExport completed!");
                println!("  Run ID: {}", summary.run_id);
                println!("  Directory: {}", summary.directory.display());
                println!("  Duration: {:.2}s", summary.duration_seconds);
                println!("  Tables: {}", summary.tables.len());
                println!("  Records: {}", summary.records);
                let legacy: u64 = summary.tables.iter().map(|t| t.legacy_rows).sum();
                if legacy > 0 {
                    println!("  Rows without identity (assigned for this export): {}", legacy);
                }
            }
        }

        Commands::Import {
            dir,
            no_labde,
            exclude,
            dry_run,
        } => {
            apply_overrides(&mut config, dir, no_labde, exclude)?;
            let orchestrator = Orchestrator::new(config)?.with_cancellation(cancel_token);
            let report = orchestrator.import(dry_run, &LogProgress).await?;

            if cli.output_json {
                println!("{}", report.to_json()?);
            } else {
                let status_msg = if dry_run {
                    "Dry run completed (rolled back)!"
                } else {
                    "Import committed!"
                };
                println!("\n{}", status_msg);
                println!("  Duration: {:.2}s", report.summary.duration_seconds);
                for table in &report.summary.tables {
                    println!(
                        "  {}: {} inserted, {} updated",
                        table.table, table.inserted, table.updated
                    );
                }
                for skipped in &report.summary.skipped {
                    println!("  {}: skipped ({})", skipped.table, skipped.reason);
                }
                println!(
                    "  Total: {} inserted, {} updated",
                    report.summary.inserted, report.summary.updated
                );
            }
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::new(config)?;
            let result = orchestrator.health_check().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source: {} ({}ms)",
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target: {} ({}ms)",
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MigrateError::connection(
                    "one or more databases are unreachable",
                    "health check",
                ));
            }
        }
    }

    Ok(())
}

/// Apply per-run command line overrides and re-validate.
fn apply_overrides(
    config: &mut Config,
    dir: Option<PathBuf>,
    no_labde: bool,
    exclude: Vec<String>,
) -> Result<(), MigrateError> {
    if let Some(dir) = dir {
        config.transfer.directory = dir;
    }
    if no_labde {
        config.transfer.include_labde = false;
    }
    for table in exclude {
        if !config.transfer.exclude_tables.contains(&table) {
            config.transfer.exclude_tables.push(table);
        }
    }
    config.validate()
}

fn print_tables(include_labde: bool, output_json: bool) -> Result<(), MigrateError> {
    let registry = Registry::standard()?;
    let tables = registry.ordered(include_labde);

    if output_json {
        println!("{}", serde_json::to_string_pretty(tables)?);
        return Ok(());
    }

    for (i, table) in tables.iter().enumerate() {
        let mut notes = Vec::new();
        if table.is_labde() {
            notes.push("LabDE".to_string());
        }
        if !table.insertable {
            notes.push("update only".to_string());
        }
        for fk in &table.foreign_keys {
            let required = if fk.nullable { "" } else { ", required" };
            notes.push(format!("{} -> {}{}", fk.column, fk.references, required));
        }

        if notes.is_empty() {
            println!("{:>3}. {}", i + 1, table.name);
        } else {
            println!("{:>3}. {} ({})", i + 1, table.name, notes.join("; "));
        }
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) {
    // RUST_LOG, when set, takes precedence over --verbosity.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity_directive(verbosity)));

    // Logs go to stderr so --output-json keeps stdout clean.
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Filter directive for a --verbosity value; unknown values fall back to info.
fn verbosity_directive(verbosity: &str) -> &'static str {
    match verbosity.to_lowercase().as_str() {
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!("\nReceived {}. Stopping after the current batch...", name);
                    token.cancel();
                });
            }
            Err(e) => eprintln!("Failed to install {} handler: {}", name, e),
        }
    }

    cancel_token
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Stopping after the current batch...");
            token.cancel();
        }
    });

    cancel_token
}
