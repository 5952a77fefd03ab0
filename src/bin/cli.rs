//! AtlasPage CLI
//!
//! Command-line interface for inspecting and editing an AtlasPage database.

use std::path::PathBuf;
use std::process::ExitCode;

use atlaspage::{Config, Engine, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// AtlasPage CLI
#[derive(Parser, Debug)]
#[command(name = "atlaspage-cli")]
#[command(about = "CLI for the AtlasPage storage engine")]
struct Args {
    /// Database directory
    #[arg(short, long, default_value = "./atlaspage_data")]
    dir: PathBuf,

    /// Replay the log only up to this commit timestamp
    #[arg(long)]
    until: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List tables
    Tables,

    /// Create a table
    AddTable {
        /// Table name
        name: String,
    },

    /// Drop a table and its data
    DropTable {
        /// Table name
        name: String,
    },

    /// Store a value
    Put {
        table: String,
        key: String,
        value: String,

        /// Keep an existing value instead of replacing it
        #[arg(long)]
        keep: bool,
    },

    /// Print a value
    Get { table: String, key: String },

    /// Delete a key
    Del { table: String, key: String },

    /// Print rows in key order
    Scan {
        table: String,

        /// First key to print
        #[arg(long)]
        from: Option<String>,

        /// Descending order
        #[arg(long)]
        reverse: bool,

        /// Stop after this many rows
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Print the number of records in a table
    Count { table: String },

    /// Run a checkpoint
    Checkpoint {
        /// Start a new log file
        #[arg(long)]
        rotate: bool,
    },

    /// Copy the database to another directory
    Backup {
        path: PathBuf,

        /// Keep retired log files in the backup
        #[arg(long)]
        incremental: bool,
    },

    /// List the timestamps a backup can be restored to
    RestorePoints { path: PathBuf },
}

fn run(args: Args) -> Result<()> {
    if let Commands::RestorePoints { path } = &args.command {
        for point in Engine::restore_points(path)? {
            println!("{}", point);
        }
        return Ok(());
    }

    let mut builder = Config::builder().data_dir(&args.dir).checkpoint_period_ms(0);
    if let Some(until) = args.until {
        builder = builder.recover_until(until);
    }
    let engine = Engine::open(builder.build())?;

    match args.command {
        Commands::Tables => {
            for name in engine.table_names() {
                println!("{}", name);
            }
        }
        Commands::AddTable { name } => engine.add_tables(&[&name])?,
        Commands::DropTable { name } => engine.remove_tables(&[&name])?,
        Commands::Put { table, key, value, keep } => {
            let table = engine.open_table(&table)?;
            if !table.put(key.as_bytes(), value.as_bytes(), !keep)? {
                println!("(exists)");
            }
        }
        Commands::Get { table, key } => match engine.open_table(&table)?.get(key.as_bytes())? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(nil)"),
        },
        Commands::Del { table, key } => match engine.open_table(&table)?.remove(key.as_bytes())? {
            Some(_) => println!("(deleted)"),
            None => println!("(nil)"),
        },
        Commands::Scan {
            table,
            from,
            reverse,
            limit,
        } => {
            let table = engine.open_table(&table)?;
            let mut left = limit;
            let print = |key: &[u8], value: &[u8]| {
                println!("{}\t{}", String::from_utf8_lossy(key), String::from_utf8_lossy(value));
                left -= 1;
                left > 0
            };
            if limit > 0 {
                match (from, reverse) {
                    (Some(from), false) => table.walk_from(from.as_bytes(), print)?,
                    (Some(from), true) => table.rwalk_from(from.as_bytes(), print)?,
                    (None, false) => table.walk(print)?,
                    (None, true) => table.rwalk(print)?,
                }
            }
        }
        Commands::Count { table } => println!("{}", engine.open_table(&table)?.record_count()),
        Commands::Checkpoint { rotate } => engine.checkpoint(rotate)?,
        Commands::Backup { path, incremental } => engine.backup(&path, incremental)?,
        Commands::RestorePoints { .. } => {}
    }
    engine.close()
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,atlaspage=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
