mod calibrate;
mod cancel;
mod cli;
mod commands;
mod inference;
mod lock;
mod os;
mod paths;
mod progress;
mod retry;
mod store;
mod util;
mod vector;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

fn main() {
    init_tracing();

    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "command failed");
            for cause in err.chain().skip(1) {
                error!(cause = %cause, "caused by");
            }
            1
        }
    };

    let terminated = inference::registry::terminate_all();
    if terminated > 0 {
        debug!(terminated, "stopped leftover inference servers");
    }
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.as_deref();

    match cli.command {
        Commands::Embed(args) => commands::embed::run(args, data_dir),
        Commands::Status(args) => commands::status::run(args, data_dir),
        Commands::EmbedQuery(args) => commands::embed_query::run(args, data_dir),
        Commands::Preflight(args) => commands::preflight::run(args),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
