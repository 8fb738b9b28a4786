use clap::Parser;

mod cli;
mod command;
mod error;
mod linux;
mod profile;
mod record_cache;

use cli::{Action, Opt};

fn main() {
    let opt = Opt::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if opt.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    } else {
        builder.filter_level(log::LevelFilter::Info);
    }
    builder.format_timestamp(None).init();

    let result = match &opt.action {
        Action::List(args) => command::list::run(args),
        Action::Stat(args) => command::stat::run(args),
        Action::Record(args) => command::record::run(args),
        Action::Report(args) => command::report::run(args),
        Action::DebugUnwind(args) => command::debug_unwind::run(args),
    };

    if let Err(err) = result {
        // One line per cause.
        eprintln!("error: {err}");
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            eprintln!("caused by: {cause}");
            source = cause.source();
        }
        std::process::exit(1);
    }
}
