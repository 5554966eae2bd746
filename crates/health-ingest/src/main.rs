use std::path::PathBuf;

use clap::{Parser, Subcommand};
use health_ingest::cli::{commands, Context};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "health-ingest")]
#[command(author, version, about = "Ingest personal health records into partitioned Parquet", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ~/.config/health-ingest/config.toml)
    #[arg(short, long, global = true, env = "HEALTH_INGEST_CONFIG")]
    config: Option<PathBuf>,

    /// Storage root, overriding the configured data directory
    #[arg(short, long, global = true, env = "HEALTH_INGEST_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a JSON-lines batch into a table
    Ingest {
        /// Target table
        #[arg(short, long)]
        table: String,
        /// JSON-lines input file
        #[arg(short, long)]
        input: PathBuf,
    },
    /// List a table's partitions
    Partitions {
        /// Table name
        #[arg(short, long)]
        table: String,
    },
    /// Check a table for duplicate keys, misplaced rows and leftover files
    Validate {
        /// Table name
        #[arg(short, long)]
        table: String,
    },
    /// Drop the partitions of one date bucket
    Drop {
        /// Table name
        #[arg(short, long)]
        table: String,
        /// Date bucket (YYYY-MM-DD for daily tables, YYYY-MM for monthly)
        #[arg(long)]
        date: String,
        /// Only drop this source's partition
        #[arg(short, long)]
        source: Option<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = Context::load(cli.config, cli.data_dir).and_then(|ctx| match cli.command {
        Commands::Ingest { table, input } => commands::ingest(&ctx, &table, &input),
        Commands::Partitions { table } => commands::list_partitions(&ctx, &table),
        Commands::Validate { table } => commands::validate(&ctx, &table).map(|consistent| {
            if !consistent {
                std::process::exit(2);
            }
        }),
        Commands::Drop {
            table,
            date,
            source,
        } => commands::drop_partitions(&ctx, &table, &date, source.as_deref()),
    });

    if let Err(e) = result {
        eprintln!("Error: {}", health_ingest::error::format_user_error(&e));
        std::process::exit(1);
    }
}
