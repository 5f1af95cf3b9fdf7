//! Test utilities for driving the PubSub dispatcher end to end.
//!
//! Provides a dispatcher over in-memory storage, a frontend that records
//! every hook invocation, and helpers to build requests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use minidom::Element;
use waddle_pubsub::{
    AffiliatedUser, Affiliation, DefaultItemNormalizer, FeatureRegistry, FrontendEvent,
    FrontendHookRegistry, HookName, HookSet, MemoryStorage, NodeAffiliation, NodeConfig,
    NodeListing, NodeSubscription, OperationResult, PubSubConfig, PubSubError, ReplayedItem,
    Request, RequestDispatcher, Storage, Subscriber, Subscription, Transaction,
};

pub const ALICE: &str = "xmpp:alice@example.com";
pub const BOB: &str = "xmpp:bob@example.com";
pub const CAROL: &str = "xmpp:carol@example.com";

// What a frontend hook sees for each user: the URI without its scheme
pub const ALICE_ID: &str = "alice@example.com";
pub const BOB_ID: &str = "bob@example.com";
pub const CAROL_ID: &str = "carol@example.com";

pub const ALICE_CHANNEL: &str = "/user/alice@example.com/channel";

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("waddle_pubsub=debug")
            .with_test_writer()
            .try_init();
    });
}

/// One recorded hook invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub target: String,
    pub hook: HookName,
    pub event: FrontendEvent,
}

/// Frontend that records every hook call.
#[derive(Clone, Default)]
pub struct RecordingFrontend {
    calls: Arc<Mutex<Vec<Recorded>>>,
}

impl RecordingFrontend {
    pub fn hooks(&self) -> HookSet {
        let calls = self.calls.clone();
        HookSet::new().on_all(move |target, event| {
            calls.lock().unwrap().push(Recorded {
                target: target.to_string(),
                hook: event.hook(),
                event: event.clone(),
            });
        })
    }

    pub fn calls(&self) -> Vec<Recorded> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, hook: HookName) -> Vec<Recorded> {
        self.calls()
            .into_iter()
            .filter(|c| c.hook == hook)
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

/// In-memory storage that counts reads and fails on demand.
///
/// Failures are injected after the real commit or rollback ran, so the
/// underlying state stays consistent.
#[derive(Clone, Default)]
pub struct SpyStorage {
    inner: MemoryStorage,
    fail_commit: Arc<AtomicBool>,
    fail_rollback: Arc<AtomicBool>,
    subscription_reads: Arc<AtomicUsize>,
}

impl SpyStorage {
    /// Make every later commit discard its changes and report an error.
    pub fn fail_commits(&self) {
        self.fail_commit.store(true, Ordering::SeqCst);
    }

    /// Make every later rollback report an error.
    pub fn fail_rollbacks(&self) {
        self.fail_rollback.store(true, Ordering::SeqCst);
    }

    /// Number of `get_subscription` calls so far.
    pub fn subscription_reads(&self) -> usize {
        self.subscription_reads.load(Ordering::SeqCst)
    }

    pub fn reset_counts(&self) {
        self.subscription_reads.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl Storage for SpyStorage {
    async fn begin(&self) -> Result<Box<dyn Transaction>, PubSubError> {
        Ok(Box::new(SpyTransaction {
            inner: self.inner.begin().await?,
            spy: self.clone(),
        }))
    }
}

struct SpyTransaction {
    inner: Box<dyn Transaction>,
    spy: SpyStorage,
}

#[async_trait]
impl Transaction for SpyTransaction {
    async fn create_node(&mut self, node: &str) -> Result<(), PubSubError> {
        self.inner.create_node(node).await
    }

    async fn node_exists(&mut self, node: &str) -> Result<(), PubSubError> {
        self.inner.node_exists(node).await
    }

    async fn list_nodes(&mut self) -> Result<Vec<NodeListing>, PubSubError> {
        self.inner.list_nodes().await
    }

    async fn list_nodes_by_user(&mut self, user: &str) -> Result<Vec<NodeListing>, PubSubError> {
        self.inner.list_nodes_by_user(user).await
    }

    async fn get_config(&mut self, node: &str) -> Result<Option<NodeConfig>, PubSubError> {
        self.inner.get_config(node).await
    }

    async fn set_config(&mut self, node: &str, config: &NodeConfig) -> Result<(), PubSubError> {
        self.inner.set_config(node, config).await
    }

    async fn get_subscription(
        &mut self,
        node: &str,
        user: &str,
    ) -> Result<Subscription, PubSubError> {
        self.spy.subscription_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get_subscription(node, user).await
    }

    async fn set_subscription(
        &mut self,
        node: &str,
        user: &str,
        subscription: Subscription,
    ) -> Result<(), PubSubError> {
        self.inner.set_subscription(node, user, subscription).await
    }

    async fn get_subscribers(&mut self, node: &str) -> Result<Vec<Subscriber>, PubSubError> {
        self.inner.get_subscribers(node).await
    }

    async fn get_subscriptions(
        &mut self,
        user: &str,
    ) -> Result<Vec<NodeSubscription>, PubSubError> {
        self.inner.get_subscriptions(user).await
    }

    async fn get_all_subscribers(&mut self) -> Result<Vec<String>, PubSubError> {
        self.inner.get_all_subscribers().await
    }

    async fn get_pending_nodes(&mut self, user: &str) -> Result<Vec<String>, PubSubError> {
        self.inner.get_pending_nodes(user).await
    }

    async fn get_pending(&mut self, node: &str) -> Result<Vec<String>, PubSubError> {
        self.inner.get_pending(node).await
    }

    async fn get_affiliation(
        &mut self,
        node: &str,
        user: &str,
    ) -> Result<Affiliation, PubSubError> {
        self.inner.get_affiliation(node, user).await
    }

    async fn set_affiliation(
        &mut self,
        node: &str,
        user: &str,
        affiliation: Affiliation,
    ) -> Result<(), PubSubError> {
        self.inner.set_affiliation(node, user, affiliation).await
    }

    async fn get_affiliations(
        &mut self,
        user: &str,
    ) -> Result<Vec<NodeAffiliation>, PubSubError> {
        self.inner.get_affiliations(user).await
    }

    async fn get_affiliated(&mut self, node: &str) -> Result<Vec<AffiliatedUser>, PubSubError> {
        self.inner.get_affiliated(node).await
    }

    async fn get_owners(&mut self, node: &str) -> Result<Vec<String>, PubSubError> {
        self.inner.get_owners(node).await
    }

    async fn write_item(
        &mut self,
        publisher: &str,
        node: &str,
        id: &str,
        item: &Element,
    ) -> Result<(), PubSubError> {
        self.inner.write_item(publisher, node, id, item).await
    }

    async fn delete_item(&mut self, node: &str, id: &str) -> Result<(), PubSubError> {
        self.inner.delete_item(node, id).await
    }

    async fn get_item_ids(&mut self, node: &str) -> Result<Vec<String>, PubSubError> {
        self.inner.get_item_ids(node).await
    }

    async fn get_item(&mut self, node: &str, id: &str) -> Result<Element, PubSubError> {
        self.inner.get_item(node, id).await
    }

    async fn get_updates_by_time(
        &mut self,
        subscriber: &str,
        time_start: Option<DateTime<Utc>>,
        time_end: Option<DateTime<Utc>>,
        on_item: &mut (dyn FnMut(ReplayedItem) + Send),
    ) -> Result<(), PubSubError> {
        self.inner
            .get_updates_by_time(subscriber, time_start, time_end, on_item)
            .await
    }

    async fn commit(self: Box<Self>) -> Result<(), PubSubError> {
        if self.spy.fail_commit.load(Ordering::SeqCst) {
            self.inner.rollback().await?;
            return Err(PubSubError::storage("Injected commit failure"));
        }
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), PubSubError> {
        self.inner.rollback().await?;
        if self.spy.fail_rollback.load(Ordering::SeqCst) {
            return Err(PubSubError::storage("Injected rollback failure"));
        }
        Ok(())
    }
}

/// A dispatcher wired to in-memory storage and a recording `xmpp` frontend.
pub struct Harness {
    pub dispatcher: RequestDispatcher,
    pub storage: MemoryStorage,
    /// The same storage as the dispatcher sees it.
    pub spy: SpyStorage,
    pub frontend: RecordingFrontend,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(PubSubConfig::default())
    }

    pub fn with_config(config: PubSubConfig) -> Self {
        init_tracing();

        let storage = MemoryStorage::new();
        let spy = SpyStorage {
            inner: storage.clone(),
            ..Default::default()
        };
        let frontend = RecordingFrontend::default();
        let hooks = FrontendHookRegistry::new();
        hooks.register("xmpp", frontend.hooks());

        let features = FeatureRegistry::standard(&config, Arc::new(DefaultItemNormalizer));
        let dispatcher = RequestDispatcher::new(
            Arc::new(spy.clone()),
            Arc::new(features),
            Arc::new(hooks),
        );
        Self {
            dispatcher,
            storage,
            spy,
            frontend,
        }
    }

    /// Create a node as its structural owner.
    pub async fn create(&self, owner: &str, node: &str) {
        self.dispatcher
            .handle(Request::new(owner, "create-nodes", "create").with_node(node))
            .await
            .expect("should create node");
    }

    /// Set a config field as `owner`.
    pub async fn configure(&self, owner: &str, node: &str, access_model: &str, publish_model: &str) {
        let update = waddle_pubsub::ConfigUpdate {
            access_model: Some(access_model.to_string()),
            publish_model: Some(publish_model.to_string()),
            ..Default::default()
        };
        self.dispatcher
            .handle(
                Request::new(owner, "config-node", "modify")
                    .with_node(node)
                    .with_config(update),
            )
            .await
            .expect("should configure node");
    }

    pub async fn subscribe(&self, from: &str, node: &str) -> Subscription {
        match self
            .dispatcher
            .handle(Request::new(from, "subscribe", "subscribe").with_node(node))
            .await
            .expect("should subscribe")
        {
            OperationResult::Subscription(s) => s,
            other => panic!("unexpected result {other:?}"),
        }
    }

    pub async fn publish(&self, from: &str, node: &str, id: &str, text: &str) {
        self.dispatcher
            .handle(
                Request::new(from, "publish", "publish")
                    .with_node(node)
                    .with_item(Some(id), entry(text)),
            )
            .await
            .expect("should publish");
    }

    /// Read the stored affiliation, bypassing the dispatcher.
    pub async fn affiliation(&self, node: &str, user: &str) -> Affiliation {
        let mut txn = self.storage.begin().await.expect("should begin");
        let affiliation = txn.get_affiliation(node, user).await.expect("should read");
        txn.commit().await.expect("should commit");
        affiliation
    }

    /// Read the stored subscription, bypassing the dispatcher.
    pub async fn subscription(&self, node: &str, user: &str) -> Subscription {
        let mut txn = self.storage.begin().await.expect("should begin");
        let subscription = txn.get_subscription(node, user).await.expect("should read");
        txn.commit().await.expect("should commit");
        subscription
    }

    /// Stored item ids, newest first, bypassing the dispatcher.
    pub async fn item_ids(&self, node: &str) -> Vec<String> {
        let mut txn = self.storage.begin().await.expect("should begin");
        let ids = txn.get_item_ids(node).await.unwrap_or_default();
        txn.commit().await.expect("should commit");
        ids
    }
}

/// An Atom entry with the given text.
pub fn entry(text: &str) -> Element {
    Element::builder("entry", "http://www.w3.org/2005/Atom")
        .append(Element::builder("title", "http://www.w3.org/2005/Atom").append(text))
        .build()
}
