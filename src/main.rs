use std::process::ExitCode;

use clap::Parser;
use paintcore::cli::{self, CliArgs};

fn main() -> ExitCode {
    let args = CliArgs::parse();
    let default_level = if args.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();
    cli::run(args)
}
