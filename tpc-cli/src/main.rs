use clap::Parser;
use tpc_cli::Cli;

fn main() -> miette::Result<()> {
    Cli::parse().run()
}
