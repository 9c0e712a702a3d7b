//! Courier - outbox delivery, dead-letter replay and idempotency maintenance.

mod app;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use courier_core::{init_logging, Config, Paths};

/// Courier command-line interface.
#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Reliable side-effect delivery and request idempotency")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error). Defaults to the configured level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for runtime files (config, database, logs). Defaults to ~/.courier
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the delivery, replay and idempotency sweep loops until Ctrl-C
    Run,
    /// Run one delivery sweep over outbox and export events
    Process,
    /// Run one auto-replay pass for an org
    Replay {
        #[arg(long)]
        org: String,
    },
    /// Sweep expired idempotency claims and purge old responses
    SweepIdempotency,
    /// Print delivery counts per status
    Status {
        #[arg(long)]
        org: Option<String>,
    },
    /// Move one dead outbox event back to pending
    Requeue {
        #[arg(long)]
        org: String,
        #[arg(long)]
        event: String,
        /// Recorded as the audit actor
        #[arg(long, default_value = "operator")]
        actor: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let config = Config::load(&paths)?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    init_logging(level, &paths)?;

    let ctx = app::Context::open(config, &paths).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => app::run(ctx).await?,
        Commands::Process => app::print_json(&ctx.processor.process_all().await?)?,
        Commands::Replay { org } => app::print_json(&ctx.scheduler.run_auto_replay(&org).await?)?,
        Commands::SweepIdempotency => {
            app::print_json(&ctx.ledger.run_maintenance(chrono::Utc::now()).await?)?
        }
        Commands::Status { org } => app::print_json(&app::status(&ctx, org).await?)?,
        Commands::Requeue { org, event, actor } => {
            let event = ctx.store.requeue_dead(&ctx.db, &org, &event, &actor).await?;
            app::print_json(&event)?
        }
    }

    Ok(())
}
