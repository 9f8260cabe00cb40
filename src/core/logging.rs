//! Diagnostic logging to stderr via `tracing-subscriber`.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "MONGOVISOR_LOG";

/// Install the global subscriber. `MONGOVISOR_LOG` takes precedence over `verbose`.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("mongovisor=debug")
        } else {
            EnvFilter::new("warn")
        }
    });

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
