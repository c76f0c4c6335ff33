mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use grader_worker::engine::EntrypointOptions;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "grader-cli")]
#[command(about = "Grader CLI - Inspect submission records and evaluate submissions locally", long_about = None)]
struct Cli {
    /// Redis URL (falls back to REDIS_URL, then the local default)
    #[arg(long, global = true)]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump every submission record to a JSON file
    Export {
        /// Output file
        #[arg(short, long, default_value = "submissions.json")]
        out: PathBuf,
    },

    /// Show the most recent record for a team
    Latest {
        /// Team (repository identifier, e.g. org/team-a)
        #[arg(short, long)]
        team: String,
    },

    /// Show the record for one team commit
    Show {
        #[arg(short, long)]
        team: String,

        /// Full commit hash
        #[arg(short, long)]
        commit: String,
    },

    /// Run a submission directory through the sandbox and print the result
    Evaluate {
        /// Directory containing the submission (with its Dockerfile)
        #[arg(short, long)]
        source: PathBuf,

        /// Policy class to evaluate
        #[arg(long)]
        class_name: Option<String>,

        /// Policy parameter override, NAME=VALUE (repeatable)
        #[arg(long = "param")]
        params: Vec<String>,

        /// Policy parameter schemas
        #[arg(long, default_value = "config/policies.json")]
        policies: PathBuf,

        /// Number of trials (entrypoint default when omitted)
        #[arg(long)]
        trials: Option<u32>,

        /// Random seed, for reproducible runs
        #[arg(long)]
        seed: Option<u64>,

        /// Market data CSV, as a path inside the submission image
        #[arg(long)]
        data: Option<PathBuf>,

        /// Grader configuration supplying sandbox settings
        #[arg(long)]
        config: Option<PathBuf>,

        /// Also write the summary to this file
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let redis_url = commands::resolve_redis_url(cli.redis_url);

    match cli.command {
        Commands::Export { out } => {
            commands::export(&redis_url, &out).await?;
        }
        Commands::Latest { team } => {
            commands::latest(&redis_url, &team).await?;
        }
        Commands::Show { team, commit } => {
            commands::show(&redis_url, &team, &commit).await?;
        }
        Commands::Evaluate {
            source,
            class_name,
            params,
            policies,
            trials,
            seed,
            data,
            config,
            out,
        } => {
            let options = EntrypointOptions {
                trials,
                seed,
                data: data.map(|d| d.display().to_string()),
            };
            commands::evaluate(
                &source,
                class_name.as_deref(),
                &params,
                &policies,
                &options,
                config.as_deref(),
                out.as_deref(),
            )
            .await?;
        }
    }

    Ok(())
}
