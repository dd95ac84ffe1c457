use clap::Parser;
use testdata_core::AppConfig;

mod cli;
mod commands;

use cli::{Cli, Command};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    let mut config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(2);
        }
    };
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let result = match cli.command {
        Command::Ingest(args) => commands::ingest(&config, args).await,
        Command::Query(args) => commands::query(&config, args),
        Command::Stats(args) => commands::stats(&config, args),
        Command::Distinct(args) => commands::distinct(&config, args),
        Command::Count => commands::count(&config),
        Command::Clear => commands::clear(&config),
        Command::Stations(args) => commands::stations(&config, args).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
