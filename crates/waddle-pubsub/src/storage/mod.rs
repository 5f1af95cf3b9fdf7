//! PubSub storage contract.
//!
//! The engine runs every request inside exactly one [`Transaction`] opened from
//! a [`Storage`] backend. Implementations must serialize conflicting writes or
//! detect conflicts; the engine does no locking of its own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use minidom::Element;

use crate::error::PubSubError;
use crate::node::NodeConfig;
use crate::types::{
    AffiliatedUser, Affiliation, NodeAffiliation, NodeListing, NodeSubscription, ReplayedItem,
    Subscriber, Subscription,
};

pub mod memory;
pub mod sql;

pub use memory::MemoryStorage;
pub use sql::LibSqlStorage;

/// A storage backend that hands out transactions.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Open a new transaction.
    async fn begin(&self) -> Result<Box<dyn Transaction>, PubSubError>;
}

/// Operations available inside one storage transaction.
///
/// `commit` and `rollback` consume the transaction, so a handle is released
/// exactly once.
#[async_trait]
pub trait Transaction: Send {
    /// Create a node. Fails with `Conflict` if it already exists.
    async fn create_node(&mut self, node: &str) -> Result<(), PubSubError>;

    /// Succeeds if the node exists, fails with `NotFound` otherwise.
    async fn node_exists(&mut self, node: &str) -> Result<(), PubSubError>;

    /// List open-access nodes, ordered by path.
    async fn list_nodes(&mut self) -> Result<Vec<NodeListing>, PubSubError>;

    /// List open-access nodes below `/user/<user>/`, ordered by path.
    async fn list_nodes_by_user(&mut self, user: &str) -> Result<Vec<NodeListing>, PubSubError>;

    /// Get the stored configuration, `None` if the node has none.
    async fn get_config(&mut self, node: &str) -> Result<Option<NodeConfig>, PubSubError>;

    /// Replace the stored configuration wholesale.
    async fn set_config(&mut self, node: &str, config: &NodeConfig) -> Result<(), PubSubError>;

    /// Get a user's subscription, `None` if there is no row.
    async fn get_subscription(
        &mut self,
        node: &str,
        user: &str,
    ) -> Result<Subscription, PubSubError>;

    /// Set a user's subscription. `Subscription::None` deletes the row.
    async fn set_subscription(
        &mut self,
        node: &str,
        user: &str,
        subscription: Subscription,
    ) -> Result<(), PubSubError>;

    /// All subscription rows of a node (subscribed and pending).
    async fn get_subscribers(&mut self, node: &str) -> Result<Vec<Subscriber>, PubSubError>;

    /// All subscriptions of a user.
    async fn get_subscriptions(&mut self, user: &str)
        -> Result<Vec<NodeSubscription>, PubSubError>;

    /// Distinct users holding any subscription.
    async fn get_all_subscribers(&mut self) -> Result<Vec<String>, PubSubError>;

    /// Nodes owned by `user` with at least one pending subscriber.
    async fn get_pending_nodes(&mut self, user: &str) -> Result<Vec<String>, PubSubError>;

    /// Users with a pending subscription to `node`.
    async fn get_pending(&mut self, node: &str) -> Result<Vec<String>, PubSubError>;

    /// Get a user's affiliation, `None` if there is no row.
    async fn get_affiliation(&mut self, node: &str, user: &str)
        -> Result<Affiliation, PubSubError>;

    /// Set a user's affiliation. `Affiliation::None` deletes the row.
    async fn set_affiliation(
        &mut self,
        node: &str,
        user: &str,
        affiliation: Affiliation,
    ) -> Result<(), PubSubError>;

    /// All affiliations of a user.
    async fn get_affiliations(&mut self, user: &str)
        -> Result<Vec<NodeAffiliation>, PubSubError>;

    /// All users affiliated with a node.
    async fn get_affiliated(&mut self, node: &str) -> Result<Vec<AffiliatedUser>, PubSubError>;

    /// Users holding the owner affiliation on a node.
    async fn get_owners(&mut self, node: &str) -> Result<Vec<String>, PubSubError>;

    /// Insert or replace an item, stamping it with the current time.
    async fn write_item(
        &mut self,
        publisher: &str,
        node: &str,
        id: &str,
        item: &Element,
    ) -> Result<(), PubSubError>;

    /// Delete an item. Fails with `NotFound` if it did not exist.
    async fn delete_item(&mut self, node: &str, id: &str) -> Result<(), PubSubError>;

    /// Item ids of a node, newest first.
    async fn get_item_ids(&mut self, node: &str) -> Result<Vec<String>, PubSubError>;

    /// Get an item. Fails with `NotFound` if it does not exist.
    async fn get_item(&mut self, node: &str, id: &str) -> Result<Element, PubSubError>;

    /// Stream items of the nodes `subscriber` is subscribed to, oldest first,
    /// restricted to the inclusive time window. Returns when the stream ends.
    async fn get_updates_by_time(
        &mut self,
        subscriber: &str,
        time_start: Option<DateTime<Utc>>,
        time_end: Option<DateTime<Utc>>,
        on_item: &mut (dyn FnMut(ReplayedItem) + Send),
    ) -> Result<(), PubSubError>;

    /// Make all changes of this transaction durable.
    async fn commit(self: Box<Self>) -> Result<(), PubSubError>;

    /// Discard all changes of this transaction.
    async fn rollback(self: Box<Self>) -> Result<(), PubSubError>;
}
