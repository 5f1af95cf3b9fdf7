//! Frontend hook registry.
//!
//! Frontends (XMPP, web push, ...) register a set of named callbacks under a
//! URI scheme. Operations address users by identity URI; the scheme picks the
//! frontend that is told about the event.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, trace};

use crate::node::NodeConfig;
use crate::path::split_scheme;
use crate::types::{PubSubItem, Subscription};

/// Events a frontend can react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookName {
    /// A subscription waits for the owner's approval
    Approve,
    /// Items were published
    Notify,
    /// Items were retracted
    Retracted,
    /// A node's configuration changed
    Configured,
    /// An owner changed a user's subscription
    SubscriptionModified,
}

impl HookName {
    /// Get the wire name of this hook.
    pub fn as_str(&self) -> &'static str {
        match self {
            HookName::Approve => "approve",
            HookName::Notify => "notify",
            HookName::Retracted => "retracted",
            HookName::Configured => "configured",
            HookName::SubscriptionModified => "subscriptionModified",
        }
    }
}

impl fmt::Display for HookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payload handed to a frontend hook.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum FrontendEvent {
    /// `user` asked to subscribe to `node`
    Approve { node: String, user: String },
    /// New items on `node`
    Notify { node: String, items: Vec<PubSubItem> },
    /// Items removed from `node`
    Retracted { node: String, item_ids: Vec<String> },
    /// New configuration of `node`
    Configured { node: String, config: NodeConfig },
    /// `user`'s subscription to `node` was changed by an owner
    #[serde(rename = "subscriptionModified")]
    SubscriptionModified {
        node: String,
        user: String,
        subscription: Subscription,
    },
}

impl FrontendEvent {
    /// The hook this event is delivered through.
    pub fn hook(&self) -> HookName {
        match self {
            FrontendEvent::Approve { .. } => HookName::Approve,
            FrontendEvent::Notify { .. } => HookName::Notify,
            FrontendEvent::Retracted { .. } => HookName::Retracted,
            FrontendEvent::Configured { .. } => HookName::Configured,
            FrontendEvent::SubscriptionModified { .. } => HookName::SubscriptionModified,
        }
    }

    /// The node the event concerns.
    pub fn node(&self) -> &str {
        match self {
            FrontendEvent::Approve { node, .. }
            | FrontendEvent::Notify { node, .. }
            | FrontendEvent::Retracted { node, .. }
            | FrontendEvent::Configured { node, .. }
            | FrontendEvent::SubscriptionModified { node, .. } => node,
        }
    }
}

/// Callback type for a single hook.
///
/// Receives the target with its scheme stripped (`bob@example.com` for
/// `xmpp:bob@example.com`) and the event.
pub type HookFn = Arc<dyn Fn(&str, &FrontendEvent) + Send + Sync>;

/// The hooks one frontend implements.
#[derive(Clone, Default)]
pub struct HookSet {
    hooks: HashMap<HookName, HookFn>,
}

impl HookSet {
    /// Create an empty hook set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a callback for `name`, replacing any earlier one.
    pub fn on<F>(mut self, name: HookName, f: F) -> Self
    where
        F: Fn(&str, &FrontendEvent) + Send + Sync + 'static,
    {
        self.hooks.insert(name, Arc::new(f));
        self
    }

    /// Add one callback for every hook.
    pub fn on_all<F>(self, f: F) -> Self
    where
        F: Fn(&str, &FrontendEvent) + Send + Sync + 'static,
    {
        let f: HookFn = Arc::new(f);
        let mut set = self;
        for name in [
            HookName::Approve,
            HookName::Notify,
            HookName::Retracted,
            HookName::Configured,
            HookName::SubscriptionModified,
        ] {
            set.hooks.insert(name, f.clone());
        }
        set
    }

    fn get(&self, name: HookName) -> Option<&HookFn> {
        self.hooks.get(&name)
    }
}

impl fmt::Debug for HookSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookSet")
            .field("hooks", &self.hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Frontend hooks keyed by URI scheme.
#[derive(Debug, Default)]
pub struct FrontendHookRegistry {
    frontends: DashMap<String, Arc<HookSet>>,
}

impl FrontendHookRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the hooks of the frontend serving `scheme`.
    ///
    /// Replaces a frontend previously registered for the same scheme.
    pub fn register(&self, scheme: impl Into<String>, hooks: HookSet) {
        let scheme = scheme.into();
        debug!(scheme = %scheme, "Registered frontend");
        self.frontends.insert(scheme, Arc::new(hooks));
    }

    /// Remove the frontend serving `scheme`.
    pub fn unregister(&self, scheme: &str) -> bool {
        self.frontends.remove(scheme).is_some()
    }

    /// Whether a frontend serves `scheme`.
    pub fn has_frontend(&self, scheme: &str) -> bool {
        self.frontends.contains_key(scheme)
    }

    /// Deliver `event` to the frontend responsible for `target`.
    ///
    /// The hook receives the part of `target` after the scheme. Targets
    /// without a registered scheme, and frontends that do not implement the
    /// hook, are skipped. Returns whether a hook ran.
    pub fn invoke(&self, target: &str, event: &FrontendEvent) -> bool {
        let name = event.hook();
        let Some((scheme, rest)) = split_scheme(target) else {
            trace!(uri = %target, hook = %name, "Target has no scheme");
            return false;
        };

        // Clone out of the map so no shard lock is held while the hook runs
        let hooks = match self.frontends.get(scheme) {
            Some(entry) => entry.value().clone(),
            None => {
                trace!(scheme = %scheme, hook = %name, "No frontend for scheme");
                return false;
            }
        };

        match hooks.get(name) {
            Some(hook) => {
                debug!(uri = %target, hook = %name, node = %event.node(), "Invoking frontend hook");
                hook(rest, event);
                true
            }
            None => {
                trace!(scheme = %scheme, hook = %name, "Frontend does not implement hook");
                false
            }
        }
    }
}
