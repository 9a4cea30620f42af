use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod access;
mod app;
mod config;
mod menu;
mod registration;
mod stop;

use app::App;
use config::Config;

#[derive(Parser)]
#[command(name = "facegate", about = "Facial-recognition access control")]
struct Cli {
    /// SQLite database path (overrides FACEGATE_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Run recognition every N frames (overrides FACEGATE_CHECK_INTERVAL)
    #[arg(long, global = true)]
    check_interval: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new identity
    Register {
        /// Unique display name
        #[arg(short, long)]
        name: String,
        /// Contact email
        #[arg(short, long)]
        email: Option<String>,
        /// Existing reference photo; captures from the camera when omitted
        #[arg(short, long)]
        photo: Option<PathBuf>,
    },
    /// Run the live access-control loop
    Run,
    /// Show access statistics
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// List registered identities
    Users {
        #[arg(long)]
        json: bool,
    },
    /// Interactive menu (the default)
    Menu,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let json_logs = std::env::var("FACEGATE_LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json_logs {
        builder.with_target(false).json().init();
    } else {
        builder.init();
    }
}

fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    let mut config = Config::load().context("loading configuration")?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(interval) = cli.check_interval {
        config.check_interval = interval;
    }
    config.validate().context("invalid command-line override")?;
    tracing::debug!(?config, "configuration loaded");

    let app = App::open(config)?;

    match cli.command.unwrap_or(Commands::Menu) {
        Commands::Register { name, email, photo } => {
            let registered = app.register(&name, email.as_deref(), photo.as_deref())?;
            println!(
                "Registered '{}' with id {} ({}).",
                registered.name,
                registered.id,
                registered.reference_photo.display()
            );
        }
        Commands::Run => app.run()?,
        Commands::Stats { json } => app.stats(json)?,
        Commands::Users { json } => app.users(json)?,
        Commands::Menu => menu::run(&app)?,
    }

    Ok(())
}
