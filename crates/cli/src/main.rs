mod app;
mod args;
mod logging;

use anyhow::Result;
use clap::Parser;
use tracing::error;

use crate::args::{Cli, Command};

fn main() {
    let cli = Cli::parse();
    logging::init(cli.quiet);
    if let Err(err) = try_run(cli.command) {
        error!(error = %err, "captioner failed");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn try_run(command: Command) -> Result<()> {
    match command {
        Command::Prepare(args) => app::run_prepare(args),
        Command::Train(args) => app::run_train(args),
    }
}
