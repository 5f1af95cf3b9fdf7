//! A frontend that only logs what it would deliver.

use tracing::info;
use waddle_pubsub::{FrontendEvent, HookSet};

/// URI scheme the logging frontend answers for.
pub const SCHEME: &str = "xmpp";

/// Hooks that log every invocation.
pub fn logging_hooks() -> HookSet {
    HookSet::new().on_all(log_event)
}

/// `to` arrives without the `xmpp:` prefix.
fn log_event(to: &str, event: &FrontendEvent) {
    let payload = serde_json::to_string(event).unwrap_or_else(|e| format!("<{}>", e));
    info!(
        to = %to,
        hook = %event.hook(),
        node = %event.node(),
        payload = %payload,
        "Frontend hook"
    );
}
