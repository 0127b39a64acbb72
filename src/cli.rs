use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Agent-side read-through cache with streaming materialized views.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Log formatter to use
    #[arg(long, value_enum, default_value_t = default_tracing_format())]
    pub tracing: TracingFormat,

    /// Path to a TOML config file (defaults to ./agentcache.toml if present)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run a synthetic workload: a streamed service catalog watched through the cache
    Demo {
        /// Override the number of events published per service
        #[arg(long)]
        events: Option<u64>,

        /// Override the number of watchers per service
        #[arg(long)]
        watchers: Option<usize>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TracingFormat {
    /// Human-readable output
    Pretty,
    /// One JSON object per line
    Json,
}

fn default_tracing_format() -> TracingFormat {
    if cfg!(debug_assertions) {
        TracingFormat::Pretty
    } else {
        TracingFormat::Json
    }
}
