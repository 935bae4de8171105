use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;
mod signals;
mod ui;

#[tokio::main]
async fn main() -> Result<()> {
    let parsed = cli::Cli::parse();

    match parsed.dispatch().await {
        Ok(()) => Ok(()),
        Err(err) => {
            // A finished run with recorded failures has already printed its report
            if let Some(failed) = err.downcast_ref::<commands::run::RunFailed>() {
                std::process::exit(failed.exit_code());
            }
            Err(err)
        }
    }
}
