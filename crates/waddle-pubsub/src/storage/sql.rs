//! libSQL implementation of PubSub storage.
//!
//! One connection is shared by all transactions; a transaction keeps the
//! connection locked between `BEGIN` and `COMMIT`/`ROLLBACK`.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::Connection;
use minidom::Element;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument, trace, warn};

use super::{Storage, Transaction};
use crate::error::PubSubError;
use crate::node::NodeConfig;
use crate::types::{
    AffiliatedUser, Affiliation, NodeAffiliation, NodeListing, NodeSubscription, ReplayedItem,
    Subscriber, Subscription,
};

/// SQL schema for PubSub storage.
pub const PUBSUB_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pubsub_nodes (
    node TEXT PRIMARY KEY
);

-- One row per configured option
CREATE TABLE IF NOT EXISTS pubsub_node_config (
    node TEXT NOT NULL,
    "key" TEXT NOT NULL,
    "value" TEXT NOT NULL,
    PRIMARY KEY (node, "key")
);

CREATE TABLE IF NOT EXISTS pubsub_affiliations (
    node TEXT NOT NULL,
    user TEXT NOT NULL,
    affiliation TEXT NOT NULL,
    PRIMARY KEY (node, user)
);

CREATE TABLE IF NOT EXISTS pubsub_subscriptions (
    node TEXT NOT NULL,
    user TEXT NOT NULL,
    subscription TEXT NOT NULL,
    PRIMARY KEY (node, user)
);

-- rowid orders items published within the same microsecond
CREATE TABLE IF NOT EXISTS pubsub_items (
    node TEXT NOT NULL,
    id TEXT NOT NULL,
    xml TEXT NOT NULL,
    publisher TEXT NOT NULL,
    -- RFC 3339 UTC with microseconds, sorts lexically
    published TEXT NOT NULL,
    UNIQUE (node, id)
);

CREATE INDEX IF NOT EXISTS idx_pubsub_items_published
    ON pubsub_items(node, published DESC);

CREATE INDEX IF NOT EXISTS idx_pubsub_subscriptions_user
    ON pubsub_subscriptions(user, subscription);

CREATE INDEX IF NOT EXISTS idx_pubsub_affiliations_user
    ON pubsub_affiliations(user, affiliation);
"#;

/// libSQL-based PubSub storage.
#[derive(Clone)]
pub struct LibSqlStorage {
    conn: Arc<Mutex<Connection>>,
    initialized: Arc<AtomicBool>,
}

impl LibSqlStorage {
    /// Create a storage over the given connection.
    pub fn new(conn: Connection) -> Self {
        Self::from_shared(Arc::new(Mutex::new(conn)))
    }

    /// Create from a connection shared with other components.
    pub fn from_shared(conn: Arc<Mutex<Connection>>) -> Self {
        Self {
            conn,
            initialized: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Open (or create) a local database file and initialize the schema.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PubSubError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                PubSubError::storage(format!("Failed to create database directory: {}", e))
            })?;
        }

        let db = libsql::Builder::new_local(path).build().await?;
        let storage = Self::new(db.connect()?);
        storage.initialize().await?;
        Ok(storage)
    }

    /// Initialize the database schema if not already done.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), PubSubError> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let conn = self.conn.lock().await;
        conn.execute_batch(PUBSUB_SCHEMA).await?;

        self.initialized.store(true, Ordering::Release);
        debug!("PubSub storage schema initialized");
        Ok(())
    }
}

#[async_trait]
impl Storage for LibSqlStorage {
    async fn begin(&self) -> Result<Box<dyn Transaction>, PubSubError> {
        self.initialize().await?;

        let conn = self.conn.clone().lock_owned().await;
        if !conn.is_autocommit() {
            // A transaction was dropped outside a runtime and never closed
            warn!("Rolling back transaction left open on the shared connection");
            conn.execute("ROLLBACK", ()).await?;
        }
        conn.execute("BEGIN", ()).await?;
        trace!("SQL transaction started");
        Ok(Box::new(SqlTransaction { conn: Some(conn) }))
    }
}

/// A transaction over [`LibSqlStorage`].
///
/// Dropping an unfinished transaction rolls it back before the connection
/// is released to the next caller.
pub struct SqlTransaction {
    /// `None` once committed or rolled back.
    conn: Option<OwnedMutexGuard<Connection>>,
}

impl Drop for SqlTransaction {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        debug!("Unfinished SQL transaction dropped, rolling back");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                // The guard moves into the task so nobody else can BEGIN first
                handle.spawn(async move {
                    if let Err(e) = conn.execute("ROLLBACK", ()).await {
                        warn!(error = %e, "Failed to roll back dropped transaction");
                    }
                });
            }
            Err(_) => {
                warn!("No runtime to roll back dropped transaction, deferring to next begin");
            }
        }
    }
}

fn timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, PubSubError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PubSubError::storage(format!("Invalid timestamp: {}", e)))
}

fn parse_item(xml: &str) -> Result<Element, PubSubError> {
    xml.parse::<Element>()
        .map_err(|e| PubSubError::storage(format!("Invalid stored item: {}", e)))
}

fn parse_affiliation(value: &str) -> Result<Affiliation, PubSubError> {
    Affiliation::from_str(value)
        .ok_or_else(|| PubSubError::storage(format!("Invalid stored affiliation: {}", value)))
}

fn parse_subscription(value: &str) -> Result<Subscription, PubSubError> {
    Subscription::from_str(value)
        .ok_or_else(|| PubSubError::storage(format!("Invalid stored subscription: {}", value)))
}

impl SqlTransaction {
    fn conn(&self) -> Result<&Connection, PubSubError> {
        self.conn
            .as_deref()
            .ok_or_else(|| PubSubError::storage("Transaction already finished"))
    }

    async fn strings(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<String>, PubSubError> {
        let mut rows = self.conn()?.query(sql, params).await?;
        let mut values = Vec::new();
        while let Some(row) = rows.next().await? {
            values.push(row.get::<String>(0)?);
        }
        Ok(values)
    }

    async fn listings(
        &self,
        prefix: &str,
    ) -> Result<Vec<NodeListing>, PubSubError> {
        let mut rows = self
            .conn()?
            .query(
                r#"
                SELECT n.node, t."value"
                FROM pubsub_nodes n
                JOIN pubsub_node_config a
                    ON a.node = n.node AND a."key" = 'accessModel' AND a."value" = 'open'
                LEFT JOIN pubsub_node_config t
                    ON t.node = n.node AND t."key" = 'title'
                WHERE substr(n.node, 1, length(?1)) = ?1
                ORDER BY n.node
                "#,
                [prefix],
            )
            .await?;

        let mut listings = Vec::new();
        while let Some(row) = rows.next().await? {
            listings.push(NodeListing {
                node: row.get(0)?,
                title: row.get::<String>(1).ok(),
            });
        }
        Ok(listings)
    }
}

#[async_trait]
impl Transaction for SqlTransaction {
    async fn create_node(&mut self, node: &str) -> Result<(), PubSubError> {
        let inserted = self
            .conn()?
            .execute(
                "INSERT INTO pubsub_nodes (node) VALUES (?1) ON CONFLICT (node) DO NOTHING",
                [node],
            )
            .await?;
        if inserted == 0 {
            return Err(PubSubError::conflict("Node already exists"));
        }
        Ok(())
    }

    async fn node_exists(&mut self, node: &str) -> Result<(), PubSubError> {
        let found = self
            .strings("SELECT node FROM pubsub_nodes WHERE node = ?1", [node])
            .await?;
        if found.is_empty() {
            return Err(PubSubError::not_found("Node does not exist"));
        }
        Ok(())
    }

    async fn list_nodes(&mut self) -> Result<Vec<NodeListing>, PubSubError> {
        self.listings("").await
    }

    async fn list_nodes_by_user(&mut self, user: &str) -> Result<Vec<NodeListing>, PubSubError> {
        self.listings(&format!("/user/{}/", user)).await
    }

    async fn get_config(&mut self, node: &str) -> Result<Option<NodeConfig>, PubSubError> {
        self.node_exists(node).await?;

        let mut rows = self
            .conn()?
            .query(
                r#"SELECT "key", "value" FROM pubsub_node_config WHERE node = ?1"#,
                [node],
            )
            .await?;
        let mut pairs = Vec::new();
        while let Some(row) = rows.next().await? {
            pairs.push((row.get::<String>(0)?, row.get::<String>(1)?));
        }

        if pairs.is_empty() {
            return Ok(None);
        }
        NodeConfig::from_pairs(pairs).map(Some)
    }

    async fn set_config(&mut self, node: &str, config: &NodeConfig) -> Result<(), PubSubError> {
        self.node_exists(node).await?;

        self.conn()?
            .execute("DELETE FROM pubsub_node_config WHERE node = ?1", [node])
            .await?;
        for (key, value) in config.to_pairs() {
            self.conn()?
                .execute(
                    r#"INSERT INTO pubsub_node_config (node, "key", "value") VALUES (?1, ?2, ?3)"#,
                    (node, key, value.as_str()),
                )
                .await?;
        }
        Ok(())
    }

    async fn get_subscription(
        &mut self,
        node: &str,
        user: &str,
    ) -> Result<Subscription, PubSubError> {
        let found = self
            .strings(
                "SELECT subscription FROM pubsub_subscriptions WHERE node = ?1 AND user = ?2",
                (node, user),
            )
            .await?;
        match found.first() {
            Some(value) => parse_subscription(value),
            None => Ok(Subscription::None),
        }
    }

    async fn set_subscription(
        &mut self,
        node: &str,
        user: &str,
        subscription: Subscription,
    ) -> Result<(), PubSubError> {
        self.node_exists(node).await?;

        if subscription == Subscription::None {
            self.conn()?
                .execute(
                    "DELETE FROM pubsub_subscriptions WHERE node = ?1 AND user = ?2",
                    (node, user),
                )
                .await?;
        } else {
            self.conn()?
                .execute(
                    r#"
                    INSERT INTO pubsub_subscriptions (node, user, subscription)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT (node, user) DO UPDATE SET subscription = excluded.subscription
                    "#,
                    (node, user, subscription.as_str()),
                )
                .await?;
        }
        Ok(())
    }

    async fn get_subscribers(&mut self, node: &str) -> Result<Vec<Subscriber>, PubSubError> {
        let mut rows = self
            .conn()?
            .query(
                "SELECT user, subscription FROM pubsub_subscriptions WHERE node = ?1 ORDER BY user",
                [node],
            )
            .await?;
        let mut subscribers = Vec::new();
        while let Some(row) = rows.next().await? {
            subscribers.push(Subscriber {
                user: row.get(0)?,
                subscription: parse_subscription(&row.get::<String>(1)?)?,
            });
        }
        Ok(subscribers)
    }

    async fn get_subscriptions(
        &mut self,
        user: &str,
    ) -> Result<Vec<NodeSubscription>, PubSubError> {
        let mut rows = self
            .conn()?
            .query(
                "SELECT node, subscription FROM pubsub_subscriptions WHERE user = ?1 ORDER BY node",
                [user],
            )
            .await?;
        let mut subscriptions = Vec::new();
        while let Some(row) = rows.next().await? {
            subscriptions.push(NodeSubscription {
                node: row.get(0)?,
                subscription: parse_subscription(&row.get::<String>(1)?)?,
            });
        }
        Ok(subscriptions)
    }

    async fn get_all_subscribers(&mut self) -> Result<Vec<String>, PubSubError> {
        self.strings(
            "SELECT DISTINCT user FROM pubsub_subscriptions ORDER BY user",
            (),
        )
        .await
    }

    async fn get_pending_nodes(&mut self, user: &str) -> Result<Vec<String>, PubSubError> {
        self.strings(
            r#"
            SELECT DISTINCT a.node
            FROM pubsub_affiliations a
            JOIN pubsub_subscriptions s ON s.node = a.node
            WHERE a.user = ?1 AND a.affiliation = 'owner' AND s.subscription = 'pending'
            ORDER BY a.node
            "#,
            [user],
        )
        .await
    }

    async fn get_pending(&mut self, node: &str) -> Result<Vec<String>, PubSubError> {
        self.strings(
            r#"
            SELECT user FROM pubsub_subscriptions
            WHERE node = ?1 AND subscription = 'pending'
            ORDER BY user
            "#,
            [node],
        )
        .await
    }

    async fn get_affiliation(
        &mut self,
        node: &str,
        user: &str,
    ) -> Result<Affiliation, PubSubError> {
        let found = self
            .strings(
                "SELECT affiliation FROM pubsub_affiliations WHERE node = ?1 AND user = ?2",
                (node, user),
            )
            .await?;
        match found.first() {
            Some(value) => parse_affiliation(value),
            None => Ok(Affiliation::None),
        }
    }

    async fn set_affiliation(
        &mut self,
        node: &str,
        user: &str,
        affiliation: Affiliation,
    ) -> Result<(), PubSubError> {
        self.node_exists(node).await?;

        if affiliation == Affiliation::None {
            self.conn()?
                .execute(
                    "DELETE FROM pubsub_affiliations WHERE node = ?1 AND user = ?2",
                    (node, user),
                )
                .await?;
        } else {
            self.conn()?
                .execute(
                    r#"
                    INSERT INTO pubsub_affiliations (node, user, affiliation)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT (node, user) DO UPDATE SET affiliation = excluded.affiliation
                    "#,
                    (node, user, affiliation.as_str()),
                )
                .await?;
        }
        Ok(())
    }

    async fn get_affiliations(
        &mut self,
        user: &str,
    ) -> Result<Vec<NodeAffiliation>, PubSubError> {
        let mut rows = self
            .conn()?
            .query(
                "SELECT node, affiliation FROM pubsub_affiliations WHERE user = ?1 ORDER BY node",
                [user],
            )
            .await?;
        let mut affiliations = Vec::new();
        while let Some(row) = rows.next().await? {
            affiliations.push(NodeAffiliation {
                node: row.get(0)?,
                affiliation: parse_affiliation(&row.get::<String>(1)?)?,
            });
        }
        Ok(affiliations)
    }

    async fn get_affiliated(&mut self, node: &str) -> Result<Vec<AffiliatedUser>, PubSubError> {
        let mut rows = self
            .conn()?
            .query(
                "SELECT user, affiliation FROM pubsub_affiliations WHERE node = ?1 ORDER BY user",
                [node],
            )
            .await?;
        let mut affiliated = Vec::new();
        while let Some(row) = rows.next().await? {
            affiliated.push(AffiliatedUser {
                user: row.get(0)?,
                affiliation: parse_affiliation(&row.get::<String>(1)?)?,
            });
        }
        Ok(affiliated)
    }

    async fn get_owners(&mut self, node: &str) -> Result<Vec<String>, PubSubError> {
        self.strings(
            r#"
            SELECT user FROM pubsub_affiliations
            WHERE node = ?1 AND affiliation = 'owner'
            ORDER BY user
            "#,
            [node],
        )
        .await
    }

    async fn write_item(
        &mut self,
        publisher: &str,
        node: &str,
        id: &str,
        item: &Element,
    ) -> Result<(), PubSubError> {
        self.node_exists(node).await?;

        // Replacing gives the item a fresh rowid, so it sorts as newest
        self.conn()?
            .execute(
                "DELETE FROM pubsub_items WHERE node = ?1 AND id = ?2",
                (node, id),
            )
            .await?;

        let xml = String::from(item);
        let published = timestamp(&Utc::now());
        self.conn()?
            .execute(
                r#"
                INSERT INTO pubsub_items (node, id, xml, publisher, published)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                (node, id, xml.as_str(), publisher, published.as_str()),
            )
            .await?;
        trace!(node = %node, id = %id, "Item written");
        Ok(())
    }

    async fn delete_item(&mut self, node: &str, id: &str) -> Result<(), PubSubError> {
        let deleted = self
            .conn()?
            .execute(
                "DELETE FROM pubsub_items WHERE node = ?1 AND id = ?2",
                (node, id),
            )
            .await?;
        if deleted == 0 {
            return Err(PubSubError::not_found("No such item"));
        }
        Ok(())
    }

    async fn get_item_ids(&mut self, node: &str) -> Result<Vec<String>, PubSubError> {
        self.strings(
            r#"
            SELECT id FROM pubsub_items
            WHERE node = ?1
            ORDER BY published DESC, rowid DESC
            "#,
            [node],
        )
        .await
    }

    async fn get_item(&mut self, node: &str, id: &str) -> Result<Element, PubSubError> {
        let found = self
            .strings(
                "SELECT xml FROM pubsub_items WHERE node = ?1 AND id = ?2",
                (node, id),
            )
            .await?;
        match found.first() {
            Some(xml) => parse_item(xml),
            None => Err(PubSubError::not_found("No such item")),
        }
    }

    async fn get_updates_by_time(
        &mut self,
        subscriber: &str,
        time_start: Option<DateTime<Utc>>,
        time_end: Option<DateTime<Utc>>,
        on_item: &mut (dyn FnMut(ReplayedItem) + Send),
    ) -> Result<(), PubSubError> {
        let start = time_start.as_ref().map(timestamp);
        let end = time_end.as_ref().map(timestamp);

        let mut rows = self
            .conn()?
            .query(
                r#"
                SELECT i.node, i.id, i.xml, i.published
                FROM pubsub_items i
                JOIN pubsub_subscriptions s ON s.node = i.node
                WHERE s.user = ?1
                    AND s.subscription = 'subscribed'
                    AND (?2 IS NULL OR i.published >= ?2)
                    AND (?3 IS NULL OR i.published <= ?3)
                ORDER BY i.published ASC, i.rowid ASC
                "#,
                (subscriber, start.as_deref(), end.as_deref()),
            )
            .await?;

        while let Some(row) = rows.next().await? {
            let node: String = row.get(0)?;
            let id: String = row.get(1)?;
            let item = match parse_item(&row.get::<String>(2)?) {
                Ok(item) => item,
                Err(e) => {
                    warn!(node = %node, id = %id, error = %e, "Skipping unreadable item");
                    continue;
                }
            };
            on_item(ReplayedItem {
                node,
                id,
                item,
                published: parse_timestamp(&row.get::<String>(3)?)?,
            });
        }
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), PubSubError> {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| PubSubError::storage("Transaction already finished"))?;
        if let Err(e) = conn.execute("COMMIT", ()).await {
            if !conn.is_autocommit() {
                if let Err(rollback) = conn.execute("ROLLBACK", ()).await {
                    warn!(error = %rollback, "Rollback after failed commit also failed");
                }
            }
            return Err(e.into());
        }
        trace!("SQL transaction committed");
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), PubSubError> {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| PubSubError::storage("Transaction already finished"))?;
        conn.execute("ROLLBACK", ()).await?;
        trace!("SQL transaction rolled back");
        Ok(())
    }
}
