use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::types::format_timestamp;
use facegate_core::{AccessLog, Enroller, EnrollmentError, EnrollmentStore, Gate};
use facegate_hw::V4lOpener;
use facegate_vision::OnnxExtractor;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod config;
mod terminal;

use config::Config;
use terminal::{CrlfWriter, KeyboardControls, RawMode, StatusLine, TerminalPrompt};

#[derive(Parser)]
#[command(name = "facegate", about = "Webcam face recognition access gate")]
struct Cli {
    /// Configuration file (default: $XDG_CONFIG_HOME/facegate/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the access gate (a: register a new user, q: quit)
    Run,
    /// Register a user from the camera (SPACE: capture, q: cancel)
    Enroll {
        /// Name to register; asked interactively when omitted
        #[arg(short, long)]
        name: Option<String>,
        /// Replace existing records for the name without asking
        #[arg(short, long)]
        yes: bool,
    },
    /// List enrolled users
    List,
    /// Remove every record enrolled under NAME
    Remove {
        /// Exact, case-sensitive user name
        name: String,
    },
    /// Print the access log
    Log {
        /// Only the last N entries
        #[arg(short, long)]
        tail: Option<usize>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(|| CrlfWriter::new(std::io::stderr()))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => run(&config),
        Commands::Enroll { name, yes } => enroll(&config, name, yes),
        Commands::List => list(&config),
        Commands::Remove { name } => remove(&config, &name),
        Commands::Log { tail } => log(&config, tail),
    }
}

fn enroller(config: &Config) -> Result<Enroller> {
    let path = config.db_path();
    let store = EnrollmentStore::open(&path)
        .with_context(|| format!("opening enrollment store {}", path.display()))?;
    Ok(Enroller::new(store, config.train_path()))
}

fn extractor(config: &Config) -> Result<OnnxExtractor> {
    let dir = config.model_path();
    OnnxExtractor::load(&dir).with_context(|| format!("loading face models from {}", dir.display()))
}

fn run(config: &Config) -> Result<()> {
    let enroller = enroller(config)?;
    let log_path = config.log_path();
    let log = AccessLog::open(&log_path)
        .with_context(|| format!("opening access log {}", log_path.display()))?;
    let extractor = extractor(config)?;
    let opener = V4lOpener::new(config.camera_device.clone(), config.mirror);

    let mut gate = Gate::new(opener, extractor, enroller, log, config.gate_config());
    tracing::info!(
        camera = %config.camera_device,
        threshold = config.match_threshold,
        "starting access control"
    );

    let _raw = RawMode::enable().context("entering raw terminal mode")?;
    gate.run(
        &mut KeyboardControls,
        &mut StatusLine::new(),
        &mut TerminalPrompt::default(),
    )
    .context("access control stopped")?;
    Ok(())
}

fn enroll(config: &Config, name: Option<String>, yes: bool) -> Result<()> {
    let enroller = enroller(config)?;
    let mut extractor = extractor(config)?;
    let opener = V4lOpener::new(config.camera_device.clone(), config.mirror);
    let mut prompt = TerminalPrompt::new(name, yes);

    match enroller.run_interactive(&opener, &mut extractor, &mut prompt) {
        Ok(enrolled) => {
            println!("Registration Process Completed");
            println!(
                "  {} ({} dims), reference image {}",
                enrolled.record.name,
                enrolled.record.descriptor.dim(),
                enrolled.image_path.display()
            );
            if enrolled.replaced > 0 {
                println!("  replaced {} earlier record(s)", enrolled.replaced);
            }
            Ok(())
        }
        Err(EnrollmentError::Cancelled) => {
            println!("Registration Cancelled");
            Ok(())
        }
        Err(e) => Err(e).context("Registration Failed"),
    }
}

fn list(config: &Config) -> Result<()> {
    let store = EnrollmentStore::new(config.db_path());
    let names = store.names();
    if names.is_empty() {
        println!("No users enrolled ({})", store.path().display());
        return Ok(());
    }
    println!("{:<24} {:>7}  LAST ENROLLED", "NAME", "RECORDS");
    for entry in names {
        println!(
            "{:<24} {:>7}  {}",
            entry.name,
            entry.records,
            format_timestamp(&entry.latest)
        );
    }
    Ok(())
}

fn remove(config: &Config, name: &str) -> Result<()> {
    let store = EnrollmentStore::new(config.db_path());
    let removed = store
        .remove_by_name(name)
        .with_context(|| format!("removing '{name}' from {}", store.path().display()))?;
    if removed == 0 {
        println!("No user named '{name}'");
    } else {
        println!("Removed {removed} record(s) for '{name}'");
    }
    Ok(())
}

fn log(config: &Config, tail: Option<usize>) -> Result<()> {
    let log = AccessLog::new(config.log_path());
    let entries = match tail {
        Some(n) => log.tail(n),
        None => log.read_all(),
    }
    .with_context(|| format!("reading access log {}", log.path().display()))?;

    for entry in entries {
        println!(
            "{}  {:<8} {}",
            format_timestamp(&entry.timestamp),
            entry.status.to_string(),
            entry.observed_name
        );
    }
    Ok(())
}
