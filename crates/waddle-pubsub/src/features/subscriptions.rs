//! Subscribing, subscription management and pending approvals.

use async_trait::async_trait;
use tracing::debug;

use super::Operation;
use crate::error::PubSubError;
use crate::hooks::{FrontendEvent, FrontendHookRegistry};
use crate::node::AccessModel;
use crate::path::is_structural_owner;
use crate::request::{OperationResult, RequestContext};
use crate::storage::Transaction;
use crate::types::{Affiliation, Subscription};

/// `subscribe/subscribe`
///
/// Open nodes subscribe immediately. On `authorize` nodes a new subscription
/// is pending until an owner approves it; owners are asked after commit.
#[derive(Debug, Clone, Copy)]
pub struct Subscribe;

#[async_trait]
impl Operation for Subscribe {
    async fn transaction(
        &self,
        ctx: &mut RequestContext,
        txn: &mut dyn Transaction,
    ) -> Result<OperationResult, PubSubError> {
        let node = ctx.node()?.to_string();
        let from = ctx.from().to_string();
        let config = txn.get_config(&node).await?;

        let subscription = match config.as_ref().filter(|c| !c.is_open()) {
            None => Subscription::Subscribed,
            Some(config) => match txn.get_subscription(&node, &from).await? {
                Subscription::None if config.access_model == Some(AccessModel::Authorize) => {
                    Subscription::Pending
                }
                Subscription::None => {
                    return Err(PubSubError::forbidden(
                        "Access model does not allow subscribing",
                    ))
                }
                existing => existing,
            },
        };

        txn.set_subscription(&node, &from, subscription).await?;
        if subscription == Subscription::Pending {
            ctx.owners = txn.get_owners(&node).await?;
        }

        ctx.subscription = Some(subscription);
        Ok(OperationResult::Subscription(subscription))
    }

    fn after_transaction(&self, ctx: &RequestContext, hooks: &FrontendHookRegistry) {
        if ctx.subscription != Some(Subscription::Pending) {
            return;
        }
        let Ok(node) = ctx.node() else {
            return;
        };

        let event = FrontendEvent::Approve {
            node: node.to_string(),
            user: ctx.from().to_string(),
        };
        for owner in &ctx.owners {
            hooks.invoke(owner, &event);
        }
    }
}

/// `subscribe/unsubscribe`
#[derive(Debug, Clone, Copy)]
pub struct Unsubscribe;

#[async_trait]
impl Operation for Unsubscribe {
    async fn transaction(
        &self,
        ctx: &mut RequestContext,
        txn: &mut dyn Transaction,
    ) -> Result<OperationResult, PubSubError> {
        let node = ctx.node()?;
        if is_structural_owner(node, ctx.from()) {
            return Err(PubSubError::not_allowed(
                "Owners must not abandon their channels",
            ));
        }

        txn.set_subscription(node, ctx.from(), Subscription::None)
            .await?;
        Ok(OperationResult::Empty)
    }
}

/// `retrieve-subscriptions/retrieve`
#[derive(Debug, Clone, Copy)]
pub struct RetrieveSubscriptions;

#[async_trait]
impl Operation for RetrieveSubscriptions {
    async fn transaction(
        &self,
        ctx: &mut RequestContext,
        txn: &mut dyn Transaction,
    ) -> Result<OperationResult, PubSubError> {
        Ok(OperationResult::Subscriptions(
            txn.get_subscriptions(ctx.from()).await?,
        ))
    }
}

/// `manage-subscriptions/retrieve`
#[derive(Debug, Clone, Copy)]
pub struct RetrieveSubscribers;

#[async_trait]
impl Operation for RetrieveSubscribers {
    fn required_affiliation(&self) -> Option<Affiliation> {
        Some(Affiliation::Member)
    }

    async fn transaction(
        &self,
        ctx: &mut RequestContext,
        txn: &mut dyn Transaction,
    ) -> Result<OperationResult, PubSubError> {
        Ok(OperationResult::Subscribers(
            txn.get_subscribers(ctx.node()?).await?,
        ))
    }
}

/// `manage-subscriptions/modify`
///
/// Owners may only grant (`subscribed`) or revoke (`none`) subscriptions.
/// Every value is checked before the first write.
#[derive(Debug, Clone, Copy)]
pub struct ModifySubscriptions;

#[async_trait]
impl Operation for ModifySubscriptions {
    fn required_affiliation(&self) -> Option<Affiliation> {
        Some(Affiliation::Owner)
    }

    async fn transaction(
        &self,
        ctx: &mut RequestContext,
        txn: &mut dyn Transaction,
    ) -> Result<OperationResult, PubSubError> {
        let node = ctx.node()?.to_string();

        let changes = ctx
            .request
            .subscriptions
            .iter()
            .map(|(user, value)| match Subscription::from_str(value) {
                Some(s @ (Subscription::Subscribed | Subscription::None)) => Ok((user.clone(), s)),
                _ => Err(PubSubError::bad_request(format!(
                    "{} is no subscription type",
                    value
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        for (user, subscription) in &changes {
            txn.set_subscription(&node, user, *subscription).await?;
        }

        debug!(node = %node, count = changes.len(), "Subscriptions modified");
        ctx.modified_subscriptions = changes;
        Ok(OperationResult::Empty)
    }

    fn after_transaction(&self, ctx: &RequestContext, hooks: &FrontendHookRegistry) {
        let Ok(node) = ctx.node() else {
            return;
        };
        for (user, subscription) in &ctx.modified_subscriptions {
            let event = FrontendEvent::SubscriptionModified {
                node: node.to_string(),
                user: user.clone(),
                subscription: *subscription,
            };
            hooks.invoke(user, &event);
        }
    }
}

/// `get-pending/list-nodes`
#[derive(Debug, Clone, Copy)]
pub struct ListPendingNodes;

#[async_trait]
impl Operation for ListPendingNodes {
    async fn transaction(
        &self,
        ctx: &mut RequestContext,
        txn: &mut dyn Transaction,
    ) -> Result<OperationResult, PubSubError> {
        Ok(OperationResult::Nodes(
            txn.get_pending_nodes(ctx.from()).await?,
        ))
    }
}

/// `get-pending/get-for-node`: list pending users and ask the owner about
/// each of them again.
#[derive(Debug, Clone, Copy)]
pub struct GetPendingForNode;

#[async_trait]
impl Operation for GetPendingForNode {
    fn required_affiliation(&self) -> Option<Affiliation> {
        Some(Affiliation::Owner)
    }

    async fn transaction(
        &self,
        ctx: &mut RequestContext,
        txn: &mut dyn Transaction,
    ) -> Result<OperationResult, PubSubError> {
        let pending = txn.get_pending(ctx.node()?).await?;
        ctx.pending_users = pending.clone();
        Ok(OperationResult::Users(pending))
    }

    fn after_transaction(&self, ctx: &RequestContext, hooks: &FrontendHookRegistry) {
        let Ok(node) = ctx.node() else {
            return;
        };
        for user in &ctx.pending_users {
            let event = FrontendEvent::Approve {
                node: node.to_string(),
                user: user.clone(),
            };
            hooks.invoke(ctx.from(), &event);
        }
    }
}
