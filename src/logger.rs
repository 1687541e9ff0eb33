//! Logging setup for applications embedding the sliding-window backend
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! left to the application, typically through [`init_logger`].

use tracing::Level;

/// Initialize the tracing subscriber with the default INFO level
///
/// The level can be overridden through `RUST_LOG`:
/// ```bash
/// RUST_LOG=sliding_bundle=debug cargo test
/// ```
///
/// # Example
/// ```no_run
/// use sliding_bundle::init_logger;
///
/// init_logger();
/// tracing::info!("Window backend ready");
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize the tracing subscriber with a custom default level
///
/// Events are printed with a timestamp, their level and their target module.
/// Calling this more than once (or after another subscriber was installed) is a
/// no-op.
///
/// # Example
/// ```no_run
/// use sliding_bundle::init_logger_with_level;
/// use tracing::Level;
///
/// init_logger_with_level(Level::DEBUG);
/// tracing::debug!("Scheduler decisions will be logged");
/// ```
pub fn init_logger_with_level(default_level: Level) {
    use tracing_subscriber::fmt::time::SystemTime;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_timer(SystemTime)
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}

/// Log a per-step message at `info` when `verbose` is set, at `debug` otherwise.
macro_rules! log_step {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+);
        } else {
            tracing::debug!($($arg)+);
        }
    };
}

pub(crate) use log_step;
