//! Logging setup (SPEC_FULL.md §1 "Ambient stack"), adapted from the
//! teacher's `setup_logging` in `main.rs`: same `log` + `log4rs` stack and
//! the same `{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}` pattern, but targeting
//! stderr instead of a per-run file. A worker's stdout is the IPC transport
//! (SPEC_FULL.md §4.1); logging there must never share that stream, so both
//! gateway and worker processes log to stderr here.

use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

/// Initialize process-wide logging. Safe to call once per process; a second
/// call returns an error from `log4rs::init_config`, which callers should
/// treat as non-fatal (it means logging is already initialized, e.g. in a
/// test harness that starts several gateways in one process).
pub fn init(level: LevelFilter) -> Result<(), Box<dyn std::error::Error>> {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}",
        )))
        .build();

    let config = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(level))?;

    log4rs::init_config(config)?;
    Ok(())
}
