//! Effective affiliation and access control.
//!
//! The affiliation a request acts with is derived from three stored facts:
//!
//! - the affiliation row for (node, requester), `none` if absent
//! - the node's access model: on open nodes anybody is a `member`
//! - the node's publish model: with `publishers`, a subscribed member may
//!   publish
//!
//! Requesters addressing a node under their own `/user/<id>/` namespace are
//! owners without any lookup; the dispatcher checks that before calling
//! [`authorize`].

use tracing::{debug, instrument};

use crate::error::PubSubError;
use crate::node::{NodeConfig, PublishModel};
use crate::request::RequestContext;
use crate::storage::Transaction;
use crate::types::{Affiliation, Subscription};

/// Compute the affiliation a requester effectively holds.
///
/// At most one upgrade applies: `none` becomes `member` on open nodes,
/// otherwise a subscribed `member` becomes `publisher` when the node's
/// publish model is `publishers`.
pub fn effective_affiliation(
    stored: Affiliation,
    config: Option<&NodeConfig>,
    subscription: Subscription,
) -> Affiliation {
    let open = config.map_or(true, NodeConfig::is_open);
    let publishers = config.and_then(|c| c.publish_model) == Some(PublishModel::Publishers);

    match stored {
        Affiliation::None if open => Affiliation::Member,
        Affiliation::Member if publishers && subscription == Subscription::Subscribed => {
            Affiliation::Publisher
        }
        other => other,
    }
}

/// Resolve the requester's effective affiliation and check it against
/// `required`.
///
/// Records the effective affiliation on the context. Fails with
/// `AffiliationRequired` when it does not satisfy `required`.
#[instrument(skip(ctx, txn), fields(from = %ctx.from(), required = %required))]
pub async fn authorize(
    ctx: &mut RequestContext,
    required: Affiliation,
    txn: &mut dyn Transaction,
) -> Result<(), PubSubError> {
    let node = ctx.node()?.to_string();
    let from = ctx.from().to_string();

    let config = txn.get_config(&node).await?;
    let stored = txn.get_affiliation(&node, &from).await?;
    let subscription = txn.get_subscription(&node, &from).await?;

    // A structural owner keeps that role even without a stored row
    let stored = if stored == Affiliation::None {
        ctx.affiliation
    } else {
        stored
    };
    let effective = effective_affiliation(stored, config.as_ref(), subscription);
    ctx.affiliation = effective;

    if effective.satisfies(required) {
        debug!(affiliation = %effective, "Authorized");
        Ok(())
    } else {
        debug!(affiliation = %effective, "Affiliation insufficient");
        Err(PubSubError::affiliation_required(required))
    }
}
