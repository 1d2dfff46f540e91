//! Console logging for Chaperone's own diagnostics — distinct from the
//! syslog ingestor in [`crate::syslog`], which carries supervised services'
//! stdout/stderr, not the supervisor's own log records.
//!
//! Grounded on the teacher's fern-based colored console logger; adapted to
//! take an explicit level and an enable/disable switch for `--no-console-log`
//! and `--task` (spec.md §6).

/// Install the global logger. `console` is false under `--no-console-log`
/// or `--task`, in which case only the syslog ingestor sees records a
/// service logging route chooses to carry.
pub fn setup_logging(level: log::LevelFilter, console: bool) -> Result<(), String> {
    let logger = fern::Dispatch::new()
        .format(|out, message, record| {
            let level = record.level();
            let colored_level = match level {
                log::Level::Error => format!("\x1b[31m{}\x1b[0m", level),
                log::Level::Warn => format!("\x1b[33m{}\x1b[0m", level),
                log::Level::Info => format!("\x1b[32m{}\x1b[0m", level),
                log::Level::Debug => format!("\x1b[34m{}\x1b[0m", level),
                log::Level::Trace => format!("\x1b[36m{}\x1b[0m", level),
            };
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                colored_level,
                message
            ));
        })
        .level(level);

    let logger = if console {
        logger.chain(std::io::stderr())
    } else {
        logger
    };

    logger
        .apply()
        .map_err(|e| format!("error while setting up logger: {e}"))
}

/// Parse `--log-level` values (`error`, `warn`, `info`, `debug`, `trace`),
/// falling back to `info` on anything else rather than failing startup.
#[must_use]
pub fn parse_level(name: &str) -> log::LevelFilter {
    match name.to_lowercase().as_str() {
        "error" => log::LevelFilter::Error,
        "warn" => log::LevelFilter::Warn,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    }
}
