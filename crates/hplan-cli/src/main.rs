//! hplan CLI entry point.
//!
//! Thin dispatcher over `commands/*`: database lifecycle, layered config
//! inspection, and manual C9 dispatch/recommendation-queue operations. The
//! planning cycle itself (C1-C8) is triggered by the daemon, which owns the
//! repository implementations the orchestrator needs — this binary is an
//! operator tool, not a second orchestrator host.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "hplan")]
#[command(about = "Holistic planner core CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database lifecycle commands.
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute the layered config hash + print canonical JSON (§6).
    ConfigHash {
        /// TOML file paths in merge order (base -> env -> overlay...).
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Manually drive the event-based trade dispatcher (C9, §4.9).
    Dispatch {
        #[command(subcommand)]
        cmd: DispatchCmd,
    },

    /// Inspect the pending recommendation queue (C7, §6).
    Recommendations {
        #[command(subcommand)]
        cmd: RecommendationsCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Subcommand)]
enum DispatchCmd {
    /// Run one dispatcher invocation against the paper execution boundary.
    Run {
        #[arg(long, default_value_t = hplan_dispatcher::DEFAULT_THROTTLE_WINDOW_MINUTES)]
        throttle_window_minutes: i64,
        #[arg(long, default_value_t = hplan_dispatcher::DEFAULT_MAX_RETRIES)]
        max_retries: i32,
    },
}

#[derive(Subcommand)]
enum RecommendationsCmd {
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => match cmd {
            DbCmd::Status => commands::db::status().await?,
            DbCmd::Migrate => commands::db::migrate().await?,
        },

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = hplan_config::load_layered_toml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Dispatch { cmd } => match cmd {
            DispatchCmd::Run {
                throttle_window_minutes,
                max_retries,
            } => commands::dispatch::run(throttle_window_minutes, max_retries).await?,
        },

        Commands::Recommendations { cmd } => match cmd {
            RecommendationsCmd::List => commands::recommendations::list().await?,
        },
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
