//! PubSub features and their operations.
//!
//! Every (feature, operation) pair is an [`Operation`] registered under its
//! [`OperationKind`]. The registry is built once at startup and read-only
//! afterwards.
//!
//! | feature | operation | requires |
//! |---|---|---|
//! | create-nodes | create | owner |
//! | subscribe | subscribe, unsubscribe | - |
//! | publish | publish | publisher |
//! | retract-items | retract | publisher |
//! | retrieve-items | retrieve | member |
//! | retrieve-items | replay | - |
//! | retrieve-subscriptions | retrieve | - |
//! | retrieve-affiliations | retrieve | - |
//! | manage-subscriptions | retrieve / modify | member / owner |
//! | modify-affiliations | retrieve / modify | member / owner |
//! | config-node | retrieve / modify | member / owner |
//! | get-pending | list-nodes / get-for-node | - / owner |
//! | register | register | - |
//! | browse-nodes | list, by-user | - |

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::PubSubConfig;
use crate::error::PubSubError;
use crate::hooks::{FrontendEvent, FrontendHookRegistry};
use crate::normalize::ItemNormalizer;
use crate::request::{Feature, OperationKind, OperationResult, RequestContext};
use crate::storage::Transaction;
use crate::types::{Affiliation, Subscriber, Subscription};

mod affiliations;
mod items;
mod nodes;
mod subscriptions;

pub use affiliations::{ModifyAffiliations, RetrieveAffiliated, RetrieveAffiliations};
pub use items::{Publish, ReplayItems, Retract, RetrieveItems};
pub use nodes::{BrowseByUser, BrowseNodes, CreateNode, ModifyConfig, Register, RetrieveConfig};
pub use subscriptions::{
    GetPendingForNode, ListPendingNodes, ModifySubscriptions, RetrieveSubscribers,
    RetrieveSubscriptions, Subscribe, Unsubscribe,
};

/// One PubSub operation.
///
/// Only [`Operation::transaction`] is mandatory. The hooks run after a
/// successful commit and never affect the result.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Affiliation the requester must hold, `None` if the operation checks
    /// access itself.
    fn required_affiliation(&self) -> Option<Affiliation> {
        None
    }

    /// Run the operation inside the request's transaction.
    async fn transaction(
        &self,
        ctx: &mut RequestContext,
        txn: &mut dyn Transaction,
    ) -> Result<OperationResult, PubSubError>;

    /// Side effects after commit.
    fn after_transaction(&self, _ctx: &RequestContext, _hooks: &FrontendHookRegistry) {}

    /// Whether the node's subscribers are gathered before commit and passed
    /// to [`Operation::subscriber_notification`].
    fn notifies_subscribers(&self) -> bool {
        false
    }

    /// Notify subscribers after commit.
    ///
    /// `subscribers` holds every subscription row of the node, pending ones
    /// included. The standard operations deliver only to `subscribed` users,
    /// so a pending user hears nothing until an owner approves them.
    fn subscriber_notification(
        &self,
        _ctx: &RequestContext,
        _subscribers: &[Subscriber],
        _hooks: &FrontendHookRegistry,
    ) {
    }
}

/// Send `event` to every subscriber in the `subscribed` state.
pub(crate) fn notify_subscribed(
    hooks: &FrontendHookRegistry,
    subscribers: &[Subscriber],
    event: &FrontendEvent,
) {
    subscribers
        .iter()
        .filter(|s| s.subscription == Subscription::Subscribed)
        .for_each(|s| {
            hooks.invoke(&s.user, event);
        });
}

/// Operations by kind.
#[derive(Default, Clone)]
pub struct FeatureRegistry {
    operations: HashMap<OperationKind, Arc<dyn Operation>>,
}

impl FeatureRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The full operation set.
    pub fn standard(config: &PubSubConfig, normalizer: Arc<dyn ItemNormalizer>) -> Self {
        let node_type = config.node_type.clone();
        let mut registry = Self::new();

        registry.register(
            OperationKind::CreateNode,
            CreateNode::new(node_type.clone()),
        );
        registry.register(OperationKind::Subscribe, Subscribe);
        registry.register(OperationKind::Unsubscribe, Unsubscribe);
        registry.register(OperationKind::Publish, Publish::new(normalizer));
        registry.register(OperationKind::Retract, Retract);
        registry.register(OperationKind::RetrieveItems, RetrieveItems);
        registry.register(OperationKind::ReplayItems, ReplayItems);
        registry.register(OperationKind::RetrieveSubscriptions, RetrieveSubscriptions);
        registry.register(OperationKind::RetrieveAffiliations, RetrieveAffiliations);
        registry.register(OperationKind::RetrieveSubscribers, RetrieveSubscribers);
        registry.register(OperationKind::ModifySubscriptions, ModifySubscriptions);
        registry.register(OperationKind::RetrieveAffiliated, RetrieveAffiliated);
        registry.register(OperationKind::ModifyAffiliations, ModifyAffiliations);
        registry.register(
            OperationKind::RetrieveConfig,
            RetrieveConfig::new(node_type.clone()),
        );
        registry.register(
            OperationKind::ModifyConfig,
            ModifyConfig::new(node_type.clone()),
        );
        registry.register(OperationKind::ListPendingNodes, ListPendingNodes);
        registry.register(OperationKind::GetPendingForNode, GetPendingForNode);
        registry.register(
            OperationKind::Register,
            Register::new(config.register_nodes.clone(), node_type),
        );
        registry.register(OperationKind::BrowseNodes, BrowseNodes);
        registry.register(OperationKind::BrowseByUser, BrowseByUser);

        registry
    }

    /// Register (or replace) the implementation of `kind`.
    pub fn register(&mut self, kind: OperationKind, operation: impl Operation + 'static) {
        self.operations.insert(kind, Arc::new(operation));
    }

    /// The implementation of `kind`, if registered.
    pub fn get(&self, kind: OperationKind) -> Option<Arc<dyn Operation>> {
        self.operations.get(&kind).cloned()
    }

    /// Names of the features with at least one registered operation.
    pub fn feature_names(&self) -> Vec<&'static str> {
        Feature::ALL
            .into_iter()
            .filter(|feature| self.operations.keys().any(|kind| kind.feature() == *feature))
            .map(|feature| feature.as_str())
            .collect()
    }
}

impl std::fmt::Debug for FeatureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureRegistry")
            .field("operations", &self.operations.len())
            .finish()
    }
}
