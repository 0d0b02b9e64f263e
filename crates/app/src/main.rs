use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sitechat::app::{Cli, run};

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so streamed replies on stdout stay clean.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "sitechat exited with an error");
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}
