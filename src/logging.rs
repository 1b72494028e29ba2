//! Tracing initialization for the binary.
//! Compact or JSON output on stderr; `RUST_LOG` wins over the verbosity flag.

use chrono::Local;
use std::fmt as stdfmt;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt as tsfmt;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

/// Local timestamp, `HH:MM:SS`.
struct LocalClock;

impl FormatTime for LocalClock {
    fn format_time(&self, w: &mut tsfmt::format::Writer<'_>) -> stdfmt::Result {
        write!(w, "{}", Local::now().format("%H:%M:%S"))
    }
}

/// Maps `-v` occurrences to a level. Library events default to warnings so
/// the colored summaries stay readable.
pub fn level_for(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn env_filter(verbosity: u8) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level_for(verbosity).into())
        .from_env_lossy()
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Fails if a global subscriber is already set.
pub fn init_tracing(verbosity: u8, json: bool) -> Result<(), TryInitError> {
    let filter = env_filter(verbosity);
    if json {
        let layer = tsfmt::layer()
            .event_format(tsfmt::format().json())
            .with_timer(LocalClock)
            .with_target(true)
            .with_thread_names(true)
            .with_writer(std::io::stderr);
        registry().with(filter).with(layer).try_init()
    } else {
        let layer = tsfmt::layer()
            .with_timer(LocalClock)
            .with_target(false)
            .compact()
            .with_writer(std::io::stderr);
        registry().with(filter).with(layer).try_init()
    }
}
