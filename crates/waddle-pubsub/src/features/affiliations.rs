//! Affiliation listing and management.

use async_trait::async_trait;
use tracing::debug;

use super::Operation;
use crate::error::PubSubError;
use crate::request::{OperationResult, RequestContext};
use crate::storage::Transaction;
use crate::types::Affiliation;

/// `retrieve-affiliations/retrieve`
#[derive(Debug, Clone, Copy)]
pub struct RetrieveAffiliations;

#[async_trait]
impl Operation for RetrieveAffiliations {
    async fn transaction(
        &self,
        ctx: &mut RequestContext,
        txn: &mut dyn Transaction,
    ) -> Result<OperationResult, PubSubError> {
        Ok(OperationResult::Affiliations(
            txn.get_affiliations(ctx.from()).await?,
        ))
    }
}

/// `modify-affiliations/retrieve`
#[derive(Debug, Clone, Copy)]
pub struct RetrieveAffiliated;

#[async_trait]
impl Operation for RetrieveAffiliated {
    fn required_affiliation(&self) -> Option<Affiliation> {
        Some(Affiliation::Member)
    }

    async fn transaction(
        &self,
        ctx: &mut RequestContext,
        txn: &mut dyn Transaction,
    ) -> Result<OperationResult, PubSubError> {
        Ok(OperationResult::Affiliated(
            txn.get_affiliated(ctx.node()?).await?,
        ))
    }
}

/// `modify-affiliations/modify`
///
/// `none` (or an empty value) removes a user's affiliation. Unknown values
/// reject the whole request before anything is written.
#[derive(Debug, Clone, Copy)]
pub struct ModifyAffiliations;

#[async_trait]
impl Operation for ModifyAffiliations {
    fn required_affiliation(&self) -> Option<Affiliation> {
        Some(Affiliation::Owner)
    }

    async fn transaction(
        &self,
        ctx: &mut RequestContext,
        txn: &mut dyn Transaction,
    ) -> Result<OperationResult, PubSubError> {
        let node = ctx.node()?;

        let changes = ctx
            .request
            .affiliations
            .iter()
            .map(|(user, value)| {
                Affiliation::from_str(value)
                    .map(|affiliation| (user, affiliation))
                    .ok_or_else(|| PubSubError::bad_request(format!("{} is no affiliation", value)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        for (user, affiliation) in &changes {
            txn.set_affiliation(node, user, *affiliation).await?;
        }

        debug!(node = %node, count = changes.len(), "Affiliations modified");
        Ok(OperationResult::Empty)
    }
}
