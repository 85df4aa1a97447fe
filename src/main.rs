mod commands;
mod logging;
mod render;

use anyhow::Result;
use clap::{Parser, Subcommand};
use stagecal_core::{Config, Reconciler};

#[derive(Parser)]
#[command(name = "stagecal")]
#[command(about = "Reconcile your calendars into a staged plan and let a planner move what you delegate")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconciliation now
    Run {
        /// Window start (YYYY-MM-DD or RFC 3339), requires --to
        #[arg(long, requires = "to")]
        from: Option<String>,

        /// Window end (YYYY-MM-DD or RFC 3339), requires --from
        #[arg(long, requires = "from")]
        to: Option<String>,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run scheduled reconciliations every sync.interval_secs
    Watch,
    /// List recent runs
    Runs {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Show audit records, newest first
    Audit {
        /// Only records of this run
        #[arg(long)]
        run: Option<String>,

        #[arg(short, long, default_value_t = 50)]
        limit: usize,

        /// Include record details
        #[arg(short, long)]
        verbose: bool,
    },
    /// Restore the event snapshot held by an apply_ai_change record
    Undo { audit_id: i64 },
    /// Give a user-layer event a new instruction for the planner
    Reinstruct {
        uid: String,

        /// Instruction text; empty clears the intent
        text: String,
    },
    /// List calendars with their roles
    Calendars,
    /// List models offered by the inference service
    Models,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_json);

    let config = Config::load()?;
    let reconciler = Reconciler::from_config(config)?;

    match cli.command {
        Commands::Run { from, to, json } => commands::run::run(&reconciler, from, to, json).await,
        Commands::Watch => commands::watch::run(&reconciler).await,
        Commands::Runs { limit } => commands::runs::run(&reconciler, limit),
        Commands::Audit { run, limit, verbose } => commands::audit::run(&reconciler, run.as_deref(), limit, verbose),
        Commands::Undo { audit_id } => commands::undo::run(&reconciler, audit_id).await,
        Commands::Reinstruct { uid, text } => commands::reinstruct::run(&reconciler, &uid, &text).await,
        Commands::Calendars => commands::calendars::run(&reconciler).await,
        Commands::Models => commands::models::run(&reconciler).await,
    }
}
