use clap::Parser;

use crate::cli::CLI;
use crate::initializers::init_tracing;

mod cli;
mod initializers;

fn main() -> eyre::Result<()> {
    let CLI { opts, command } = CLI::parse();

    init_tracing(&opts);

    command.run(&opts)
}
