use agentcache::cli::{Args, Command};
use agentcache::config::Config;
use agentcache::demo::{self, DemoParams};
use agentcache::logging::setup_logging;
use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args = Args::parse();

    // Load config before anything else so logging is set up for startup
    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err:#}");
            return ExitCode::FAILURE;
        }
    };
    setup_logging(&config, args.tracing);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = if cfg!(debug_assertions) {
            "development"
        } else {
            "production"
        },
        "starting agentcache"
    );

    match run(args.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = format!("{err:#}"), "agentcache failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: &Config) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received ctrl-c, shutting down");
                shutdown.cancel();
            }
        });
    }

    match command {
        Command::Demo { events, watchers } => {
            let mut params = DemoParams::from_config(config);
            if let Some(events) = events {
                params.events = events;
            }
            if let Some(watchers) = watchers {
                params.watchers = watchers;
            }
            let summary = demo::run(config, params, shutdown)
                .await
                .context("demo workload failed")?;
            info!(
                updates = summary.updates,
                interrupted = summary.interrupted,
                "demo complete"
            );
        }
    }
    Ok(())
}
