use serdeconv;
use slog::Logger;
use sloggers::{Config, LoggerConfig};

/// Destination/level description for the root logger. Mirrors the shape of
/// `sloggers::LoggerConfig` so it can be embedded directly in a pool's TOML
/// configuration under a `[logging]` table.
#[derive(Debug, Clone)]
pub struct LogSpec {
    toml: String,
}

impl LogSpec {
    pub fn terminal(level: &str) -> LogSpec {
        LogSpec {
            toml: format!(
                "type = \"terminal\"\nlevel = \"{}\"\ndestination = \"stderr\"\n",
                level
            ),
        }
    }

    pub fn from_toml_table(toml: &str) -> LogSpec {
        LogSpec {
            toml: toml.to_owned(),
        }
    }
}

impl Default for LogSpec {
    fn default() -> LogSpec {
        LogSpec::terminal("info")
    }
}

/// Builds the process-wide root logger. Called exactly once, at startup,
/// before any component that wants a child logger is constructed.
pub fn init(spec: &LogSpec) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(&spec.toml)
        .expect("invalid logging configuration");

    config.build_logger().expect("failed to build logger")
}
