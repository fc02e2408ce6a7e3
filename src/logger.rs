use colored::Colorize;
use log::{Level, LevelFilter};
use std::io::Write;

/// Installs the colored stderr logger. The backend accepts everything; the
/// effective level is the global max level, so it can be raised later.
pub fn init_logger(level: LevelFilter) {
    env_logger::Builder::new()
        .filter(None, LevelFilter::Trace)
        .target(env_logger::Target::Stderr)
        .format(|buf, record| {
            let level = match record.level() {
                Level::Error => "ERROR".red(),
                Level::Warn => "WARN".yellow(),
                Level::Info => "INFO".green(),
                Level::Debug => "DEBUG".blue(),
                Level::Trace => "TRACE".purple(),
            };
            writeln!(buf, "[{}] {}", level, record.args())
        })
        .init();
    log::set_max_level(level);
}

/// Turns on debug output if the configuration asks for it.
pub fn raise_to_debug() {
    if log::max_level() < LevelFilter::Debug {
        log::set_max_level(LevelFilter::Debug);
    }
}
