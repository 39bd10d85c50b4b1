mod cli;
mod inspect;

pub use cli::Cli;
