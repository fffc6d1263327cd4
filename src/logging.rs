use std::io::Write;

use chrono::Local;
use env_logger::{Builder, Env};
use log::{Level, LevelFilter, SetLoggerError};

fn level_filter(level: Level) -> LevelFilter {
    match level {
        Level::Error => LevelFilter::Error,
        Level::Warn => LevelFilter::Warn,
        Level::Info => LevelFilter::Info,
        Level::Debug => LevelFilter::Debug,
        Level::Trace => LevelFilter::Trace,
    }
}

/// Installs the global logger writing `timestamp [LEVEL] target: message` to stderr.
///
/// `RUST_LOG` takes precedence over `level` when it is set.
pub fn init(level: Level) -> Result<(), SetLoggerError> {
    let mut builder = Builder::new();
    builder.filter_level(level_filter(level));
    builder.parse_env(Env::default());
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] {}: {}",
            Local::now().to_rfc3339(),
            record.level(),
            record.target(),
            record.args()
        )
    });
    builder.try_init()?;
    log::info!("Logging initialized at {}", level);
    Ok(())
}
