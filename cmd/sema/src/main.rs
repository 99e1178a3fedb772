mod cli;

use clap::Parser;
use tracing_subscriber::filter::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    init_tracing();
    let parsed = cli::Cli::parse();
    if let Err(error) = cli::run(parsed) {
        tracing::error!("{error:#}");
        std::process::exit(1);
    }
}
