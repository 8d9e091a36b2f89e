mod commands;
mod config;
mod remote;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process;
use tracing_subscriber::EnvFilter;

use crate::commands::{
    LogArgs, MacroArgs, UpdateArgs, cmd_delete, cmd_goal_set, cmd_goal_show, cmd_history,
    cmd_log, cmd_stats, cmd_status, cmd_summary, cmd_update, cmd_watch, connect,
};
use crate::config::Config;
use nibble_core::session::SyncSession;
use nibble_core::sqlite_store::SqliteStore;

#[derive(Parser)]
#[command(
    name = "nibble",
    version,
    about = "A small nutrition tracker with live sync",
    long_about = "A small nutrition tracker with live sync.\n\n\
        Entries live in a local SQLite database by default. Point NIBBLE_URL at a\n\
        `nibble serve` instance (with NIBBLE_API_KEY) to share them across devices."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show store, user and connection status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Log a food entry
    Log {
        /// What you ate
        name: String,
        /// Calories (kcal)
        calories: String,
        /// Protein in grams
        #[arg(short, long)]
        protein: Option<String>,
        /// Carbs in grams
        #[arg(short, long)]
        carbs: Option<String>,
        /// Fat in grams
        #[arg(short, long)]
        fat: Option<String>,
        /// Meal: breakfast, lunch, dinner, snacks
        #[arg(short, long, default_value = "snacks")]
        meal: String,
        /// Free-form quantity (e.g. "1 bowl", "200g")
        #[arg(short, long)]
        quantity: Option<String>,
        /// Notes
        #[arg(long)]
        notes: Option<String>,
        /// Date to log for (YYYY-MM-DD or today/yesterday/tomorrow, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Update an entry
    Update {
        /// Entry ID to update
        entry_id: String,
        /// New name
        #[arg(long)]
        name: Option<String>,
        /// New calories
        #[arg(long)]
        calories: Option<String>,
        /// New protein in grams
        #[arg(long)]
        protein: Option<String>,
        /// New carbs in grams
        #[arg(long)]
        carbs: Option<String>,
        /// New fat in grams
        #[arg(long)]
        fat: Option<String>,
        /// New meal: breakfast, lunch, dinner, snacks
        #[arg(long)]
        meal: Option<String>,
        /// New quantity
        #[arg(long)]
        quantity: Option<String>,
        /// New notes
        #[arg(long)]
        notes: Option<String>,
        /// Remove the notes
        #[arg(long)]
        clear_notes: bool,
        /// Move to another date (YYYY-MM-DD or today/yesterday/tomorrow)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete an entry by ID
    Delete {
        /// Entry ID to delete
        entry_id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show daily summary (defaults to today)
    Summary {
        /// Date to show (YYYY-MM-DD or today/yesterday/tomorrow, default: today)
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show totals for the last N days (7 to 30)
    History {
        /// Number of days to show
        #[arg(short, long, default_value = "7")]
        days: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show streaks, weekly trends and achievements
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Follow a day's summary live as entries change
    Watch {
        /// Date to follow (YYYY-MM-DD or today/yesterday/tomorrow, default: today)
        date: Option<String>,
        /// Output one JSON summary per line
        #[arg(long)]
        json: bool,
    },
    /// Manage the daily calorie/macro goal
    Goal {
        #[command(subcommand)]
        command: GoalCommands,
    },
    /// Serve the local database over HTTP for other devices
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "7400")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication (for development/testing)
        #[arg(long)]
        no_auth: bool,
    },
}

#[derive(Subcommand)]
enum GoalCommands {
    /// Set the daily goal
    Set {
        /// Daily calorie goal
        calories: f64,
        /// Protein percentage (requires --carbs and --fat)
        #[arg(long)]
        protein: Option<i64>,
        /// Carbs percentage (requires --protein and --fat)
        #[arg(long)]
        carbs: Option<i64>,
        /// Fat percentage (requires --protein and --carbs)
        #[arg(long)]
        fat: Option<i64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the daily goal
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("NIBBLE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn finish(session: SyncSession, result: Result<()>) -> Result<()> {
    session.shutdown().await;
    result
}

#[allow(clippy::too_many_lines)]
async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load()?;

    match cli.command {
        Commands::Status { json } => cmd_status(&config, json).await,
        Commands::Log {
            name,
            calories,
            protein,
            carbs,
            fat,
            meal,
            quantity,
            notes,
            date,
            json,
        } => {
            let args = LogArgs {
                name,
                macros: MacroArgs {
                    calories: Some(calories),
                    protein,
                    carbs,
                    fat,
                },
                meal,
                quantity,
                notes,
                date,
            };
            let session = connect(&config).await?;
            let result = cmd_log(&session, args, json).await;
            finish(session, result).await
        }
        Commands::Update {
            entry_id,
            name,
            calories,
            protein,
            carbs,
            fat,
            meal,
            quantity,
            notes,
            clear_notes,
            date,
            json,
        } => {
            let args = UpdateArgs {
                name,
                macros: MacroArgs {
                    calories,
                    protein,
                    carbs,
                    fat,
                },
                meal,
                quantity,
                notes,
                clear_notes,
                date,
            };
            let session = connect(&config).await?;
            let result = cmd_update(&session, &entry_id, args, json).await;
            finish(session, result).await
        }
        Commands::Delete { entry_id, json } => {
            let session = connect(&config).await?;
            let result = cmd_delete(&session, &entry_id, json).await;
            finish(session, result).await
        }
        Commands::Summary { date, json } => {
            let session = connect(&config).await?;
            let result = cmd_summary(&session, config.goal(), date, json).await;
            finish(session, result).await
        }
        Commands::History { days, json } => {
            let session = connect(&config).await?;
            let result = cmd_history(&session, config.goal(), days, json).await;
            finish(session, result).await
        }
        Commands::Stats { json } => {
            let session = connect(&config).await?;
            let result = cmd_stats(&session, &config, json).await;
            finish(session, result).await
        }
        Commands::Watch { date, json } => {
            let session = connect(&config).await?;
            let result = cmd_watch(&session, config.goal(), date, json).await;
            finish(session, result).await
        }
        Commands::Goal { command } => match command {
            GoalCommands::Set {
                calories,
                protein,
                carbs,
                fat,
                json,
            } => cmd_goal_set(&mut config, calories, protein, carbs, fat, json),
            GoalCommands::Show { json } => cmd_goal_show(&config, json),
        },
        Commands::Serve {
            port,
            bind,
            no_auth,
        } => {
            let api_key = if no_auth {
                None
            } else {
                Some(config.load_or_create_api_key()?.0)
            };
            let store = SqliteStore::open(&config.db_path)?;
            server::start_server(store, port, &bind, api_key).await
        }
    }
}
