//! In-memory implementation of PubSub storage.
//!
//! Suitable for development, tests and single-process deployments. A
//! transaction holds the store lock for its whole lifetime and works on a copy
//! of the state, which replaces the shared state on commit.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use minidom::Element;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use super::{Storage, Transaction};
use crate::error::PubSubError;
use crate::node::{AccessModel, NodeConfig};
use crate::types::{
    AffiliatedUser, Affiliation, NodeAffiliation, NodeListing, NodeSubscription, ReplayedItem,
    Subscriber, Subscription,
};

/// Stored representation of a PubSub item.
#[derive(Debug, Clone)]
struct StoredItem {
    id: String,
    publisher: String,
    payload: Element,
    published: DateTime<Utc>,
    /// Write order, breaks ties between equal timestamps
    seq: u64,
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    nodes: BTreeSet<String>,
    configs: HashMap<String, NodeConfig>,
    /// (node, user) -> affiliation
    affiliations: BTreeMap<(String, String), Affiliation>,
    /// (node, user) -> subscription
    subscriptions: BTreeMap<(String, String), Subscription>,
    items: HashMap<String, Vec<StoredItem>>,
    next_seq: u64,
}

impl StoreState {
    fn require_node(&self, node: &str) -> Result<(), PubSubError> {
        if self.nodes.contains(node) {
            Ok(())
        } else {
            Err(PubSubError::not_found("Node does not exist"))
        }
    }

    fn open_nodes<'a>(&'a self, prefix: &'a str) -> Vec<NodeListing> {
        self.nodes
            .iter()
            .filter(|node| node.starts_with(prefix))
            .filter_map(|node| {
                let config = self.configs.get(node)?;
                (config.access_model == Some(AccessModel::Open)).then(|| NodeListing {
                    node: node.clone(),
                    title: config.title.clone(),
                })
            })
            .collect()
    }
}

/// In-memory PubSub storage.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStorage {
    /// Create a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn begin(&self) -> Result<Box<dyn Transaction>, PubSubError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        trace!("Memory transaction started");
        Ok(Box::new(MemoryTransaction { guard, working }))
    }
}

/// A transaction over [`MemoryStorage`].
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<StoreState>,
    working: StoreState,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn create_node(&mut self, node: &str) -> Result<(), PubSubError> {
        if !self.working.nodes.insert(node.to_string()) {
            return Err(PubSubError::conflict("Node already exists"));
        }
        Ok(())
    }

    async fn node_exists(&mut self, node: &str) -> Result<(), PubSubError> {
        self.working.require_node(node)
    }

    async fn list_nodes(&mut self) -> Result<Vec<NodeListing>, PubSubError> {
        Ok(self.working.open_nodes(""))
    }

    async fn list_nodes_by_user(&mut self, user: &str) -> Result<Vec<NodeListing>, PubSubError> {
        let prefix = format!("/user/{}/", user);
        Ok(self.working.open_nodes(&prefix))
    }

    async fn get_config(&mut self, node: &str) -> Result<Option<NodeConfig>, PubSubError> {
        self.working.require_node(node)?;
        Ok(self.working.configs.get(node).cloned())
    }

    async fn set_config(&mut self, node: &str, config: &NodeConfig) -> Result<(), PubSubError> {
        self.working.require_node(node)?;
        self.working.configs.insert(node.to_string(), config.clone());
        Ok(())
    }

    async fn get_subscription(
        &mut self,
        node: &str,
        user: &str,
    ) -> Result<Subscription, PubSubError> {
        Ok(self
            .working
            .subscriptions
            .get(&(node.to_string(), user.to_string()))
            .copied()
            .unwrap_or_default())
    }

    async fn set_subscription(
        &mut self,
        node: &str,
        user: &str,
        subscription: Subscription,
    ) -> Result<(), PubSubError> {
        self.working.require_node(node)?;
        let key = (node.to_string(), user.to_string());
        if subscription == Subscription::None {
            self.working.subscriptions.remove(&key);
        } else {
            self.working.subscriptions.insert(key, subscription);
        }
        Ok(())
    }

    async fn get_subscribers(&mut self, node: &str) -> Result<Vec<Subscriber>, PubSubError> {
        Ok(self
            .working
            .subscriptions
            .iter()
            .filter(|((n, _), _)| n == node)
            .map(|((_, user), subscription)| Subscriber {
                user: user.clone(),
                subscription: *subscription,
            })
            .collect())
    }

    async fn get_subscriptions(
        &mut self,
        user: &str,
    ) -> Result<Vec<NodeSubscription>, PubSubError> {
        Ok(self
            .working
            .subscriptions
            .iter()
            .filter(|((_, u), _)| u == user)
            .map(|((node, _), subscription)| NodeSubscription {
                node: node.clone(),
                subscription: *subscription,
            })
            .collect())
    }

    async fn get_all_subscribers(&mut self) -> Result<Vec<String>, PubSubError> {
        let users: BTreeSet<&String> = self.working.subscriptions.keys().map(|(_, u)| u).collect();
        Ok(users.into_iter().cloned().collect())
    }

    async fn get_pending_nodes(&mut self, user: &str) -> Result<Vec<String>, PubSubError> {
        let state = &self.working;
        Ok(state
            .affiliations
            .iter()
            .filter(|((_, u), affiliation)| u == user && **affiliation == Affiliation::Owner)
            .map(|((node, _), _)| node)
            .filter(|node| {
                state
                    .subscriptions
                    .iter()
                    .any(|((n, _), s)| n == *node && *s == Subscription::Pending)
            })
            .cloned()
            .collect())
    }

    async fn get_pending(&mut self, node: &str) -> Result<Vec<String>, PubSubError> {
        Ok(self
            .working
            .subscriptions
            .iter()
            .filter(|((n, _), s)| n == node && **s == Subscription::Pending)
            .map(|((_, user), _)| user.clone())
            .collect())
    }

    async fn get_affiliation(
        &mut self,
        node: &str,
        user: &str,
    ) -> Result<Affiliation, PubSubError> {
        Ok(self
            .working
            .affiliations
            .get(&(node.to_string(), user.to_string()))
            .copied()
            .unwrap_or_default())
    }

    async fn set_affiliation(
        &mut self,
        node: &str,
        user: &str,
        affiliation: Affiliation,
    ) -> Result<(), PubSubError> {
        self.working.require_node(node)?;
        let key = (node.to_string(), user.to_string());
        if affiliation == Affiliation::None {
            self.working.affiliations.remove(&key);
        } else {
            self.working.affiliations.insert(key, affiliation);
        }
        Ok(())
    }

    async fn get_affiliations(
        &mut self,
        user: &str,
    ) -> Result<Vec<NodeAffiliation>, PubSubError> {
        Ok(self
            .working
            .affiliations
            .iter()
            .filter(|((_, u), _)| u == user)
            .map(|((node, _), affiliation)| NodeAffiliation {
                node: node.clone(),
                affiliation: *affiliation,
            })
            .collect())
    }

    async fn get_affiliated(&mut self, node: &str) -> Result<Vec<AffiliatedUser>, PubSubError> {
        Ok(self
            .working
            .affiliations
            .iter()
            .filter(|((n, _), _)| n == node)
            .map(|((_, user), affiliation)| AffiliatedUser {
                user: user.clone(),
                affiliation: *affiliation,
            })
            .collect())
    }

    async fn get_owners(&mut self, node: &str) -> Result<Vec<String>, PubSubError> {
        Ok(self
            .working
            .affiliations
            .iter()
            .filter(|((n, _), a)| n == node && **a == Affiliation::Owner)
            .map(|((_, user), _)| user.clone())
            .collect())
    }

    async fn write_item(
        &mut self,
        publisher: &str,
        node: &str,
        id: &str,
        item: &Element,
    ) -> Result<(), PubSubError> {
        self.working.require_node(node)?;

        let seq = self.working.next_seq;
        self.working.next_seq += 1;

        let stored_item = StoredItem {
            id: id.to_string(),
            publisher: publisher.to_string(),
            payload: item.clone(),
            published: Utc::now(),
            seq,
        };

        let items = self.working.items.entry(node.to_string()).or_default();
        // Replace an item with the same ID
        if let Some(pos) = items.iter().position(|i| i.id == id) {
            items[pos] = stored_item;
        } else {
            items.push(stored_item);
        }
        Ok(())
    }

    async fn delete_item(&mut self, node: &str, id: &str) -> Result<(), PubSubError> {
        let items = self
            .working
            .items
            .get_mut(node)
            .ok_or_else(|| PubSubError::not_found("No such item"))?;
        let original_len = items.len();
        items.retain(|i| i.id != id);
        if items.len() == original_len {
            return Err(PubSubError::not_found("No such item"));
        }
        Ok(())
    }

    async fn get_item_ids(&mut self, node: &str) -> Result<Vec<String>, PubSubError> {
        let mut items: Vec<&StoredItem> = self
            .working
            .items
            .get(node)
            .map(|items| items.iter().collect())
            .unwrap_or_default();
        items.sort_by(|a, b| (b.published, b.seq).cmp(&(a.published, a.seq)));
        Ok(items.into_iter().map(|i| i.id.clone()).collect())
    }

    async fn get_item(&mut self, node: &str, id: &str) -> Result<Element, PubSubError> {
        self.working
            .items
            .get(node)
            .and_then(|items| items.iter().find(|i| i.id == id))
            .map(|i| i.payload.clone())
            .ok_or_else(|| PubSubError::not_found("No such item"))
    }

    async fn get_updates_by_time(
        &mut self,
        subscriber: &str,
        time_start: Option<DateTime<Utc>>,
        time_end: Option<DateTime<Utc>>,
        on_item: &mut (dyn FnMut(ReplayedItem) + Send),
    ) -> Result<(), PubSubError> {
        let state = &self.working;
        let mut updates: Vec<(&String, &StoredItem)> = state
            .subscriptions
            .iter()
            .filter(|((_, u), s)| u == subscriber && **s == Subscription::Subscribed)
            .filter_map(|((node, _), _)| state.items.get(node).map(|items| (node, items)))
            .flat_map(|(node, items)| items.iter().map(move |item| (node, item)))
            .filter(|(_, item)| time_start.map_or(true, |start| item.published >= start))
            .filter(|(_, item)| time_end.map_or(true, |end| item.published <= end))
            .collect();
        updates.sort_by_key(|(_, item)| (item.published, item.seq));

        for (node, item) in updates {
            trace!(node = %node, id = %item.id, publisher = %item.publisher, "Replaying item");
            on_item(ReplayedItem {
                node: node.clone(),
                id: item.id.clone(),
                item: item.payload.clone(),
                published: item.published,
            });
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), PubSubError> {
        let MemoryTransaction { mut guard, working } = *self;
        *guard = working;
        trace!("Memory transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), PubSubError> {
        trace!("Memory transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(text: &str) -> Element {
        Element::builder("entry", "http://www.w3.org/2005/Atom")
            .append(text)
            .build()
    }

    #[tokio::test]
    async fn test_create_node_conflict() {
        let storage = MemoryStorage::new();
        let mut txn = storage.begin().await.expect("should begin");
        txn.create_node("/user/a@x/channel").await.expect("should succeed");
        let err = txn.create_node("/user/a@x/channel").await.unwrap_err();
        assert!(matches!(err, PubSubError::Conflict(_)));
        txn.rollback().await.expect("should roll back");
    }

    #[tokio::test]
    async fn test_rollback_discards_changes() {
        let storage = MemoryStorage::new();

        let mut txn = storage.begin().await.expect("should begin");
        txn.create_node("/user/a@x/channel").await.expect("should succeed");
        txn.rollback().await.expect("should roll back");

        let mut txn = storage.begin().await.expect("should begin");
        let err = txn.node_exists("/user/a@x/channel").await.unwrap_err();
        assert!(err.is_not_found());
        txn.commit().await.expect("should commit");
    }

    #[tokio::test]
    async fn test_commit_persists_changes() {
        let storage = MemoryStorage::new();

        let mut txn = storage.begin().await.expect("should begin");
        txn.create_node("/n").await.expect("should succeed");
        txn.set_affiliation("/n", "xmpp:a@x", Affiliation::Owner)
            .await
            .expect("should succeed");
        txn.commit().await.expect("should commit");

        let mut txn = storage.begin().await.expect("should begin");
        assert_eq!(
            txn.get_affiliation("/n", "xmpp:a@x").await.expect("should succeed"),
            Affiliation::Owner
        );
        assert_eq!(
            txn.get_owners("/n").await.expect("should succeed"),
            vec!["xmpp:a@x".to_string()]
        );
        txn.commit().await.expect("should commit");
    }

    #[tokio::test]
    async fn test_writes_require_node() {
        let storage = MemoryStorage::new();
        let mut txn = storage.begin().await.expect("should begin");
        let err = txn
            .set_subscription("/missing", "xmpp:a@x", Subscription::Subscribed)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        let err = txn
            .write_item("xmpp:a@x", "/missing", "1", &entry("hi"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(txn.get_config("/missing").await.unwrap_err().is_not_found());
        txn.rollback().await.expect("should roll back");
    }

    #[tokio::test]
    async fn test_none_deletes_rows() {
        let storage = MemoryStorage::new();
        let mut txn = storage.begin().await.expect("should begin");
        txn.create_node("/n").await.expect("should succeed");
        txn.set_subscription("/n", "xmpp:a@x", Subscription::Pending)
            .await
            .expect("should succeed");
        assert_eq!(txn.get_pending("/n").await.expect("should succeed").len(), 1);
        txn.set_subscription("/n", "xmpp:a@x", Subscription::None)
            .await
            .expect("should succeed");
        assert!(txn.get_subscribers("/n").await.expect("should succeed").is_empty());
        txn.commit().await.expect("should commit");
    }

    #[tokio::test]
    async fn test_item_ids_newest_first() {
        let storage = MemoryStorage::new();
        let mut txn = storage.begin().await.expect("should begin");
        txn.create_node("/n").await.expect("should succeed");
        for id in ["1", "2", "3"] {
            txn.write_item("xmpp:a@x", "/n", id, &entry(id))
                .await
                .expect("should succeed");
        }
        // Republishing moves an item to the front
        txn.write_item("xmpp:a@x", "/n", "1", &entry("again"))
            .await
            .expect("should succeed");

        let ids = txn.get_item_ids("/n").await.expect("should succeed");
        assert_eq!(ids, vec!["1", "3", "2"]);
        assert_eq!(
            txn.get_item("/n", "1").await.expect("should succeed").text(),
            "again"
        );

        txn.delete_item("/n", "2").await.expect("should succeed");
        assert!(txn.delete_item("/n", "2").await.unwrap_err().is_not_found());
        assert!(txn.get_item("/n", "2").await.unwrap_err().is_not_found());
        txn.commit().await.expect("should commit");
    }

    #[tokio::test]
    async fn test_list_nodes_only_open() {
        let storage = MemoryStorage::new();
        let mut txn = storage.begin().await.expect("should begin");
        for node in ["/user/a@x/channel", "/user/a@x/mood", "/user/ab@x/channel"] {
            txn.create_node(node).await.expect("should succeed");
            txn.set_config(node, &NodeConfig::default_for("xmpp:a@x", "atom"))
                .await
                .expect("should succeed");
        }
        let closed = NodeConfig {
            access_model: Some(AccessModel::Authorize),
            ..Default::default()
        };
        txn.set_config("/user/a@x/mood", &closed)
            .await
            .expect("should succeed");

        let all = txn.list_nodes().await.expect("should succeed");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].title.as_deref(), Some("a's node"));

        let by_user = txn.list_nodes_by_user("a@x").await.expect("should succeed");
        assert_eq!(by_user.len(), 1);
        assert_eq!(by_user[0].node, "/user/a@x/channel");
        txn.commit().await.expect("should commit");
    }

    #[tokio::test]
    async fn test_pending_nodes() {
        let storage = MemoryStorage::new();
        let mut txn = storage.begin().await.expect("should begin");
        for node in ["/n1", "/n2"] {
            txn.create_node(node).await.expect("should succeed");
            txn.set_affiliation(node, "xmpp:owner@x", Affiliation::Owner)
                .await
                .expect("should succeed");
        }
        txn.set_subscription("/n2", "xmpp:fan@x", Subscription::Pending)
            .await
            .expect("should succeed");

        let nodes = txn
            .get_pending_nodes("xmpp:owner@x")
            .await
            .expect("should succeed");
        assert_eq!(nodes, vec!["/n2".to_string()]);
        txn.commit().await.expect("should commit");
    }

    #[tokio::test]
    async fn test_updates_by_time_only_subscribed() {
        let storage = MemoryStorage::new();
        let mut txn = storage.begin().await.expect("should begin");
        for node in ["/a", "/b"] {
            txn.create_node(node).await.expect("should succeed");
            txn.write_item("xmpp:p@x", node, "1", &entry(node))
                .await
                .expect("should succeed");
        }
        txn.set_subscription("/a", "xmpp:s@x", Subscription::Subscribed)
            .await
            .expect("should succeed");
        txn.set_subscription("/b", "xmpp:s@x", Subscription::Pending)
            .await
            .expect("should succeed");

        let mut seen = Vec::new();
        txn.get_updates_by_time("xmpp:s@x", None, None, &mut |item| seen.push(item.node))
            .await
            .expect("should succeed");
        assert_eq!(seen, vec!["/a".to_string()]);

        let mut seen = Vec::new();
        let future = Utc::now() + chrono::Duration::hours(1);
        txn.get_updates_by_time("xmpp:s@x", Some(future), None, &mut |item| seen.push(item.id))
            .await
            .expect("should succeed");
        assert!(seen.is_empty());
        txn.commit().await.expect("should commit");
    }
}
