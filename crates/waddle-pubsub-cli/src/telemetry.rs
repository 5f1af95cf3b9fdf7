//! Log setup for the command line.
//!
//! Logs go to stderr so that stdout only carries results.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the default filter of
/// `info,waddle_pubsub=debug`; `verbose` lowers the engine to `trace`.
pub fn init(verbose: bool) {
    let default_filter = if verbose {
        "info,waddle_pubsub=trace,waddle_pubsub_cli=debug"
    } else {
        "info,waddle_pubsub=debug"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
