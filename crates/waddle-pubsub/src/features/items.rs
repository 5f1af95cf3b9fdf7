//! Publishing, retracting and retrieving items.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::{notify_subscribed, Operation};
use crate::error::PubSubError;
use crate::hooks::{FrontendEvent, FrontendHookRegistry};
use crate::normalize::ItemNormalizer;
use crate::request::{OperationResult, RequestContext};
use crate::rsm::apply_rsm;
use crate::storage::Transaction;
use crate::types::{Affiliation, PubSubItem, RetrievedItem, Subscriber};

/// `publish/publish`
pub struct Publish {
    normalizer: Arc<dyn ItemNormalizer>,
}

impl Publish {
    pub fn new(normalizer: Arc<dyn ItemNormalizer>) -> Self {
        Self { normalizer }
    }
}

#[async_trait]
impl Operation for Publish {
    fn required_affiliation(&self) -> Option<Affiliation> {
        Some(Affiliation::Publisher)
    }

    async fn transaction(
        &self,
        ctx: &mut RequestContext,
        txn: &mut dyn Transaction,
    ) -> Result<OperationResult, PubSubError> {
        let node = ctx.node()?.to_string();
        let from = ctx.from().to_string();
        let items = ctx.request.items.clone();

        let mut published = Vec::with_capacity(items.len());
        for item in items {
            let prior = match item.id.as_deref().filter(|id| !id.is_empty()) {
                Some(id) => match txn.get_item(&node, id).await {
                    Ok(prior) => Some(prior),
                    Err(e) if e.is_not_found() => None,
                    Err(e) => return Err(e),
                },
                None => None,
            };

            let normalized = self
                .normalizer
                .normalize(ctx, item, prior.as_ref())
                .await?;
            txn.write_item(&from, &node, &normalized.id, &normalized.payload)
                .await?;
            trace!(node = %node, id = %normalized.id, "Item published");
            published.push(PubSubItem::new(Some(normalized.id), normalized.payload));
        }

        let ids = published
            .iter()
            .filter_map(|item| item.id.clone())
            .collect();
        ctx.published = published;
        Ok(OperationResult::Published(ids))
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
        let Ok(node) = ctx.node() else {
            return;
        };
        let event = FrontendEvent::Notify {
            node: node.to_string(),
            items: ctx.published.clone(),
        };
        notify_subscribed(hooks, subscribers, &event);
    }
}

/// `retract-items/retract`: a missing id aborts the whole retraction.
#[derive(Debug, Clone, Copy)]
pub struct Retract;

#[async_trait]
impl Operation for Retract {
    fn required_affiliation(&self) -> Option<Affiliation> {
        Some(Affiliation::Publisher)
    }

    async fn transaction(
        &self,
        ctx: &mut RequestContext,
        txn: &mut dyn Transaction,
    ) -> Result<OperationResult, PubSubError> {
        let node = ctx.node()?;
        for id in &ctx.request.item_ids {
            txn.delete_item(node, id).await?;
        }
        Ok(OperationResult::Empty)
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
        let Ok(node) = ctx.node() else {
            return;
        };
        let event = FrontendEvent::Retracted {
            node: node.to_string(),
            item_ids: ctx.request.item_ids.clone(),
        };
        notify_subscribed(hooks, subscribers, &event);
    }
}

/// `retrieve-items/retrieve`
///
/// Pagination runs over ids first so only the returned page is fetched.
#[derive(Debug, Clone, Copy)]
pub struct RetrieveItems;

#[async_trait]
impl Operation for RetrieveItems {
    fn required_affiliation(&self) -> Option<Affiliation> {
        Some(Affiliation::Member)
    }

    async fn transaction(
        &self,
        ctx: &mut RequestContext,
        txn: &mut dyn Transaction,
    ) -> Result<OperationResult, PubSubError> {
        let node = ctx.node()?;
        let ids = txn.get_item_ids(node).await?;
        let (page, rsm) = apply_rsm(ctx.request.rsm.as_ref(), ids);

        let mut items = Vec::with_capacity(page.len());
        for id in page {
            let item = txn.get_item(node, &id).await?;
            items.push(RetrievedItem { id, item });
        }

        debug!(node = %node, count = items.len(), total = rsm.count, "Items retrieved");
        Ok(OperationResult::Items { items, rsm })
    }
}

/// `retrieve-items/replay`: stream the requester's archive to the request's
/// replay sink.
#[derive(Debug, Clone, Copy)]
pub struct ReplayItems;

#[async_trait]
impl Operation for ReplayItems {
    async fn transaction(
        &self,
        ctx: &mut RequestContext,
        txn: &mut dyn Transaction,
    ) -> Result<OperationResult, PubSubError> {
        let sink = ctx
            .request
            .replay_sink
            .clone()
            .ok_or_else(|| PubSubError::bad_request("Replay needs a receiver"))?;

        let mut replayed = 0usize;
        txn.get_updates_by_time(
            ctx.from(),
            ctx.request.time_start,
            ctx.request.time_end,
            &mut |item| {
                replayed += 1;
                // A dropped receiver only ends delivery
                let _ = sink.send(item);
            },
        )
        .await?;

        debug!(from = %ctx.from(), replayed, "Replay done");
        Ok(OperationResult::Empty)
    }
}
