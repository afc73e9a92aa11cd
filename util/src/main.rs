use clap::{App, Arg};
use shoal_core::{Context, PoolConfig};
use shoal_support::logging::{self, LogSpec};
use slog::{error, info};
use std::fs;
use std::process;

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let matches = App::new("shoal")
        .version("0.1.0")
        .author("SleepingPills")
        .about("A single-threaded memcached proxy.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the pool's TOML config file")
                .required(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log at debug level instead of info"),
        )
        .arg(
            Arg::with_name("quiet")
                .short("q")
                .long("quiet")
                .conflicts_with("verbose")
                .help("Log at warning level instead of info"),
        )
        .get_matches();

    let level = if matches.is_present("verbose") {
        "debug"
    } else if matches.is_present("quiet") {
        "warning"
    } else {
        "info"
    };
    let logger = logging::init(&LogSpec::terminal(level));

    let config_path = matches.value_of("CONFIG_FILE").unwrap();
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(reason) => {
            error!(logger, "failed to load config"; "path" => config_path, "error" => %reason);
            return 1;
        }
    };

    let mut context = match Context::create(&config, logger.clone()) {
        Ok(context) => context,
        Err(err) => {
            error!(logger, "failed to start"; "error" => %err);
            return 1;
        }
    };

    info!(logger, "listening"; "address" => %config.listen);

    match context.run() {
        Ok(()) => {
            info!(logger, "shut down cleanly");
            0
        }
        Err(err) => {
            error!(logger, "event loop terminated"; "error" => %err);
            1
        }
    }
}

fn load_config(path: &str) -> Result<PoolConfig, String> {
    let text = fs::read_to_string(path).map_err(|e| format!("reading {}: {}", path, e))?;
    PoolConfig::from_toml_str(&text).map_err(|e| e.to_string())
}
