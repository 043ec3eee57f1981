//! FalconKV CLI
//!
//! Runs single operations against a local workspace.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use falconkv::log::LogRecovery;
use falconkv::workspace::SEGMENTS_DIR;
use falconkv::{Config, ConfigCorruptPolicy, Engine};
use tracing_subscriber::{fmt, EnvFilter};

/// Key found and operation succeeded
const EXIT_OK: u8 = 0;
/// Key absent
const EXIT_NOT_FOUND: u8 = 1;
/// Any error
const EXIT_ERROR: u8 = 2;

/// FalconKV CLI
#[derive(Parser, Debug)]
#[command(name = "falconkv")]
#[command(about = "Operate on a FalconKV workspace")]
#[command(version)]
struct Args {
    /// Workspace directory
    #[arg(short, long, default_value = "./falconkv_data")]
    workspace: PathBuf,

    /// Running-config file (defaults to <workspace>/running_config.json)
    #[arg(short, long)]
    config_file: Option<PathBuf>,

    /// Refuse to start if the running config is corrupt instead of replaying
    #[arg(long)]
    strict: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Set a key-value pair
    Put {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Delete a key
    Delete {
        /// The key to delete
        key: String,
    },

    /// Print the length of a key's value
    Len {
        /// The key to measure
        key: String,
    },

    /// Checkpoint and compact sealed segments
    Compact,

    /// Print engine statistics
    Stats,

    /// Check the log without modifying it (no lock taken)
    Verify,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::from(EXIT_ERROR)
        }
    }
}

fn run(args: Args) -> falconkv::Result<u8> {
    if let Commands::Verify = args.command {
        let result = LogRecovery::verify(&args.workspace.join(SEGMENTS_DIR))?;
        println!("entries:        {}", result.entries_recovered);
        println!("last sequence:  {}", result.last_sequence);
        println!("corrupted:      {}", result.entries_corrupted);
        println!("torn tail:      {}", result.was_truncated);
        println!("bytes past end: {}", result.bytes_discarded);
        return Ok(if result.was_truncated { EXIT_ERROR } else { EXIT_OK });
    }

    let mut builder = Config::builder().workspace(&args.workspace);
    if let Some(path) = &args.config_file {
        builder = builder.running_config_path(path);
    }
    if args.strict {
        builder = builder.on_config_corrupt(ConfigCorruptPolicy::Fail);
    }
    let engine = Engine::open(builder.build())?;
    if let Some(reason) = &engine.recovery_report().config_error {
        eprintln!("warning: running config ignored: {}", reason);
    }

    let code = match &args.command {
        Commands::Put { key, value } => {
            engine.put(key.as_bytes(), value.as_bytes())?;
            EXIT_OK
        }
        Commands::Get { key } => match engine.get(key.as_bytes())? {
            Some(value) => {
                println!("{}", String::from_utf8_lossy(&value));
                EXIT_OK
            }
            None => EXIT_NOT_FOUND,
        },
        Commands::Delete { key } => {
            if engine.delete(key.as_bytes())? {
                EXIT_OK
            } else {
                EXIT_NOT_FOUND
            }
        }
        Commands::Len { key } => match engine.value_len(key.as_bytes())? {
            Some(len) => {
                println!("{}", len);
                EXIT_OK
            }
            None => EXIT_NOT_FOUND,
        },
        Commands::Compact => {
            let stats = engine.compact()?;
            println!("segments compacted: {}", stats.segments_compacted);
            println!("entries kept:       {}", stats.entries_kept);
            println!("entries dropped:    {}", stats.entries_dropped);
            println!("bytes before:       {}", stats.bytes_before);
            println!("bytes after:        {}", stats.bytes_after);
            EXIT_OK
        }
        Commands::Stats => {
            let stats = engine.stats()?;
            println!("keys:           {}", stats.keys);
            println!("segments:       {}", stats.segments);
            println!("active segment: {}", stats.active_segment);
            println!("log bytes:      {}", stats.log_bytes);
            println!("next sequence:  {}", stats.next_sequence);
            EXIT_OK
        }
        Commands::Verify => EXIT_OK,
    };

    engine.shutdown()?;
    Ok(code)
}
