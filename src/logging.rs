//! Logging setup and the logger handle passed to restore
//!
//! The binary installs env_logger once with dmesg-style timestamps. Library
//! code that must be observable in tests takes a `&dyn log::Log` and reports
//! through [`emit`] instead of the global macros.

use log::{Level, Log, Record};
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Instant;

use crate::error::Result;

pub const TARGET: &str = "crest";

// Start of the run, for elapsed-time stamps
static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Install the global logger. Fails if one is already installed.
///
/// `debug` lowers the default filter to debug; `RUST_LOG` still wins.
/// With `output`, records go to that file (truncated) instead of stderr.
pub fn init(debug: bool, output: Option<&Path>) -> Result<()> {
    let start = *START_TIME.get_or_init(Instant::now);

    let level = if debug { "debug" } else { "info" };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    builder.format(move |buf, record| {
        let elapsed = start.elapsed();
        // [  123.456789] LEVEL message
        writeln!(
            buf,
            "[{:5}.{:06}] {} {}",
            elapsed.as_secs(),
            elapsed.subsec_micros(),
            record.level(),
            record.args()
        )
    });

    if let Some(path) = output {
        let file = File::create(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.try_init()?;
    Ok(())
}

/// Send one record to `logger`.
pub fn emit(logger: &dyn Log, level: Level, args: fmt::Arguments<'_>) {
    logger.log(
        &Record::builder()
            .level(level)
            .target(TARGET)
            .module_path_static(Some(module_path!()))
            .args(args)
            .build(),
    );
}
