mod commands;
mod config;
mod logging;
mod serve;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};

use crate::commands::ingest::{cmd_ingest, IngestArgs};
use crate::commands::settings::{cmd_settings_get, cmd_settings_set};
use crate::config::Config;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Replay recorded CPEE process logs as live service endpoints.
#[derive(Parser)]
#[command(
    name = "logreplay",
    version,
    about = "Replay recorded CPEE process logs as live service endpoints"
)]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    /// Log filter directive when RUST_LOG is unset (e.g. "debug")
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the SQLite event store
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve recorded responses over HTTP
    Serve {
        /// Interface to bind
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
        /// Table to replay (default: replay_table, then active_table setting)
        #[arg(long)]
        table: Option<String>,
    },

    /// Load a directory of XES-YAML traces into a call table
    Ingest {
        /// Directory containing *.xes.yaml files
        dir: PathBuf,
        /// Target table (default: active_table setting, then "calls")
        #[arg(long)]
        table: Option<String>,
        /// Keep existing rows instead of replacing them
        #[arg(long)]
        append: bool,
        /// Records written per insert batch
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Read or write service settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },
}

#[derive(Subcommand)]
enum SettingsCommands {
    /// Print the value of a setting
    Get {
        /// Setting key (e.g. replay_table)
        key: String,
    },
    /// Set a setting
    Set {
        /// Setting key (e.g. replay_table)
        key: String,
        /// New value
        value: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            report_error(&e.to_string(), cli.output, cli.quiet);
            process::exit(1);
        }
    };
    logging::init(cli.log_level.as_deref(), cli.quiet, &config.log);

    let db = cli
        .db
        .clone()
        .unwrap_or_else(|| config.database.path.clone());

    match cli.command {
        Commands::Serve { host, port, table } => {
            let options = serve::ServeOptions {
                host: host.unwrap_or_else(|| config.server.host.clone()),
                port: port.unwrap_or(config.server.port),
                db,
                table,
                delivery: config.delivery.to_delivery_config(),
            };
            let rt = runtime(cli.output, cli.quiet);
            if let Err(e) = rt.block_on(serve::start_server(options)) {
                report_error(&format!("server error: {}", e), cli.output, cli.quiet);
                process::exit(1);
            }
        }
        Commands::Ingest {
            dir,
            table,
            append,
            batch_size,
        } => {
            cmd_ingest(
                IngestArgs {
                    dir: &dir,
                    db: &db,
                    table: table.as_deref(),
                    append,
                    batch_size: batch_size.unwrap_or(config.ingest.batch_size),
                },
                cli.output,
                cli.quiet,
            );
        }
        Commands::Settings { command } => match command {
            SettingsCommands::Get { key } => cmd_settings_get(&db, &key, cli.output, cli.quiet),
            SettingsCommands::Set { key, value } => {
                cmd_settings_set(&db, &key, &value, cli.output, cli.quiet)
            }
        },
    }
}

/// Multi-threaded runtime for a command; exits on failure.
pub(crate) fn runtime(output: OutputFormat, quiet: bool) -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            report_error(&format!("failed to start async runtime: {}", e), output, quiet);
            process::exit(1);
        }
    }
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => eprintln!("error: {}", msg),
        OutputFormat::Json => {
            eprintln!("{}", serde_json::json!({ "error": msg }));
        }
    }
}
