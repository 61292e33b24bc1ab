use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratekeeper::config::{LoggingConfig, RateKeeperConfig};
use ratekeeper::RateKeeper;

/// Inspect and operate rate limits.
#[derive(Debug, Parser)]
#[command(name = "ratekeeper", version, about)]
struct Cli {
    /// Configuration file (YAML); RATEKEEPER__* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level or filter directive, overriding the configuration
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit JSON formatted logs
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run checks against a limit and print each decision
    Check {
        limit: String,
        identifier: String,
        /// Number of checks to run
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },
    /// Clear recorded usage for an identifier
    Reset { limit: String, identifier: String },
    /// List configured limits
    Limits,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = RateKeeperConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging, cli.log_level.as_deref(), cli.json);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let service = RateKeeper::from_config(&config).await?;

    match cli.command {
        Command::Check {
            limit,
            identifier,
            count,
        } => {
            for attempt in 1..=count {
                let decision = service.check_limit(&limit, &identifier).await?;
                let output = json!({
                    "attempt": attempt,
                    "decision": decision,
                    "headers": decision
                        .headers()
                        .into_iter()
                        .map(|(name, value)| (name.to_string(), value))
                        .collect::<std::collections::BTreeMap<_, _>>(),
                });
                println!("{}", output);
            }
        }
        Command::Reset { limit, identifier } => {
            service.reset(&limit, &identifier).await?;
            println!("{}", json!({ "limit": limit, "identifier": identifier, "reset": true }));
        }
        Command::Limits => {
            for name in service.limiter().limit_names() {
                if let Some(limit) = service.limiter().limit(name) {
                    println!(
                        "{}",
                        json!({
                            "name": limit.name,
                            "max_requests": limit.max_requests,
                            "window_secs": limit.window.as_secs(),
                            "fail_policy": limit.fail_policy,
                            "message": limit.message,
                        })
                    );
                }
            }
        }
    }

    Ok(())
}

/// Install the global subscriber. `RUST_LOG` wins over both flag and configuration.
fn init_tracing(logging: &LoggingConfig, level_override: Option<&str>, json_override: bool) {
    let level = level_override.unwrap_or(&logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if json_override || logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
