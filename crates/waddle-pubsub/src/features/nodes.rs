//! Node lifecycle: creation, registration, configuration and browsing.

use async_trait::async_trait;
use tracing::debug;

use super::{notify_subscribed, Operation};
use crate::error::PubSubError;
use crate::hooks::{FrontendEvent, FrontendHookRegistry};
use crate::node::NodeConfig;
use crate::path::{browse_user, registration_user, user_node};
use crate::request::{OperationResult, RequestContext};
use crate::storage::Transaction;
use crate::types::{Affiliation, Subscriber, Subscription};

/// Write the defaults of a freshly created node and make `owner` its
/// subscribed owner.
async fn initialize_node(
    txn: &mut dyn Transaction,
    node: &str,
    owner: &str,
    config: &NodeConfig,
) -> Result<(), PubSubError> {
    txn.set_config(node, config).await?;
    txn.set_affiliation(node, owner, Affiliation::Owner).await?;
    txn.set_subscription(node, owner, Subscription::Subscribed)
        .await
}

/// `create-nodes/create`
#[derive(Debug, Clone)]
pub struct CreateNode {
    node_type: String,
}

impl CreateNode {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
        }
    }
}

#[async_trait]
impl Operation for CreateNode {
    fn required_affiliation(&self) -> Option<Affiliation> {
        Some(Affiliation::Owner)
    }

    async fn transaction(
        &self,
        ctx: &mut RequestContext,
        txn: &mut dyn Transaction,
    ) -> Result<OperationResult, PubSubError> {
        let node = ctx.node()?;
        txn.create_node(node).await?;

        let config = NodeConfig::default_for(ctx.from(), &self.node_type);
        initialize_node(txn, node, ctx.from(), &config).await?;
        Ok(OperationResult::Empty)
    }
}

/// `register/register`: create the well-known nodes of the requester.
#[derive(Debug, Clone)]
pub struct Register {
    nodes: Vec<String>,
    node_type: String,
}

impl Register {
    pub fn new(nodes: Vec<String>, node_type: impl Into<String>) -> Self {
        Self {
            nodes,
            node_type: node_type.into(),
        }
    }
}

#[async_trait]
impl Operation for Register {
    async fn transaction(
        &self,
        ctx: &mut RequestContext,
        txn: &mut dyn Transaction,
    ) -> Result<OperationResult, PubSubError> {
        let from = ctx.from();
        let user = registration_user(from);
        let nodes: Vec<String> = self.nodes.iter().map(|name| user_node(user, name)).collect();

        for node in &nodes {
            txn.create_node(node).await?;
        }
        for node in &nodes {
            let config = NodeConfig::default_for(from, &self.node_type);
            initialize_node(txn, node, from, &config).await?;
        }

        debug!(user = %user, count = nodes.len(), "Registered user nodes");
        Ok(OperationResult::Nodes(nodes))
    }
}

/// `config-node/retrieve`
#[derive(Debug, Clone)]
pub struct RetrieveConfig {
    node_type: String,
}

impl RetrieveConfig {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
        }
    }
}

#[async_trait]
impl Operation for RetrieveConfig {
    fn required_affiliation(&self) -> Option<Affiliation> {
        Some(Affiliation::Member)
    }

    async fn transaction(
        &self,
        ctx: &mut RequestContext,
        txn: &mut dyn Transaction,
    ) -> Result<OperationResult, PubSubError> {
        let config = match txn.get_config(ctx.node()?).await? {
            Some(config) => config,
            None => NodeConfig::default_for(ctx.from(), &self.node_type),
        };
        Ok(OperationResult::Config(config))
    }
}

/// `config-node/modify`: merge the submitted fields over the current
/// configuration and tell subscribers about the result.
#[derive(Debug, Clone)]
pub struct ModifyConfig {
    node_type: String,
}

impl ModifyConfig {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
        }
    }
}

#[async_trait]
impl Operation for ModifyConfig {
    fn required_affiliation(&self) -> Option<Affiliation> {
        Some(Affiliation::Owner)
    }

    async fn transaction(
        &self,
        ctx: &mut RequestContext,
        txn: &mut dyn Transaction,
    ) -> Result<OperationResult, PubSubError> {
        let node = ctx.node()?.to_string();
        let current = match txn.get_config(&node).await? {
            Some(config) => config,
            None => NodeConfig::default_for(ctx.from(), &self.node_type),
        };

        let merged = current.merged(&ctx.request.config)?;
        txn.set_config(&node, &merged).await?;

        ctx.config = Some(merged.clone());
        Ok(OperationResult::Config(merged))
    }

    fn notifies_subscribers(&self) -> bool {
        true
    }

    fn subscriber_notification(
        &self,
        ctx: &RequestContext,
        subscribers: &[Subscriber],
        hooks: &FrontendHookRegistry,
    ) {
        let (Ok(node), Some(config)) = (ctx.node(), ctx.config.as_ref()) else {
            return;
        };
        let event = FrontendEvent::Configured {
            node: node.to_string(),
            config: config.clone(),
        };
        notify_subscribed(hooks, subscribers, &event);
    }
}

/// `browse-nodes/list`
#[derive(Debug, Clone, Copy)]
pub struct BrowseNodes;

#[async_trait]
impl Operation for BrowseNodes {
    async fn transaction(
        &self,
        _ctx: &mut RequestContext,
        txn: &mut dyn Transaction,
    ) -> Result<OperationResult, PubSubError> {
        Ok(OperationResult::Listings(txn.list_nodes().await?))
    }
}

/// `browse-nodes/by-user`: the node names a user as `/user/<id>`.
#[derive(Debug, Clone, Copy)]
pub struct BrowseByUser;

#[async_trait]
impl Operation for BrowseByUser {
    async fn transaction(
        &self,
        ctx: &mut RequestContext,
        txn: &mut dyn Transaction,
    ) -> Result<OperationResult, PubSubError> {
        let user = ctx
            .request
            .node
            .as_deref()
            .and_then(browse_user)
            .ok_or_else(|| PubSubError::not_found("User not found"))?;
        Ok(OperationResult::Listings(
            txn.list_nodes_by_user(user).await?,
        ))
    }
}
