use std::process::ExitCode;

use clap::Parser;
use ephemeral_mysql::cli;

fn main() -> anyhow::Result<ExitCode> {
    let cli = cli::Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level())
        .with_writer(std::io::stderr)
        .init();
    cli.run()
}
