use clap::{Parser, ValueEnum};
use log::LevelFilter;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

/// Okta SAML login for GlobalProtect portals.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    /// Configuration file (`key = value` per line)
    pub config: PathBuf,

    /// Log verbosity; `debug = 1` in the configuration also enables debug
    #[arg(short, long, value_enum, default_value_t = LogLevel::Info)]
    pub level: LogLevel,
}
