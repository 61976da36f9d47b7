use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod client;
mod commands;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;
    init_logging(&config.log_level, cli.verbose);
    commands::run_command(cli, config).await
}

/// Logs go to stderr: stdout carries frames when serving over stdio.
fn init_logging(level: &str, verbose: bool) {
    let default = if verbose { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
