//! Request dispatch pipeline.
//!
//! Every request runs through the same stages:
//!
//! 1. resolve the operation; unknown pairs fail before storage is touched
//! 2. requesters inside their own `/user/<id>/` namespace are owners
//! 3. authorize, if the operation requires an affiliation not yet held
//! 4. run the operation
//! 5. gather the node's subscribers, if the operation notifies them
//! 6. commit, or roll back on any error of stages 3 to 5
//! 7. after-transaction hook
//! 8. subscriber notification
//!
//! Stages 3 to 6 share one storage transaction. Stages 7 and 8 only run after
//! a successful commit.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::affiliation::authorize;
use crate::error::{DispatchError, PubSubError};
use crate::features::{FeatureRegistry, Operation};
use crate::hooks::FrontendHookRegistry;
use crate::path::is_structural_owner;
use crate::request::{OperationKind, OperationResult, Request, RequestContext};
use crate::storage::{Storage, Transaction};
use crate::types::{Affiliation, Subscriber};

/// Routes requests to operations inside storage transactions.
#[derive(Clone)]
pub struct RequestDispatcher {
    storage: Arc<dyn Storage>,
    features: Arc<FeatureRegistry>,
    hooks: Arc<FrontendHookRegistry>,
}

impl RequestDispatcher {
    /// Create a dispatcher over the given storage and registries.
    pub fn new(
        storage: Arc<dyn Storage>,
        features: Arc<FeatureRegistry>,
        hooks: Arc<FrontendHookRegistry>,
    ) -> Self {
        Self {
            storage,
            features,
            hooks,
        }
    }

    /// The registered operations.
    pub fn features(&self) -> &FeatureRegistry {
        &self.features
    }

    /// The frontend hooks notifications go to.
    pub fn hooks(&self) -> &FrontendHookRegistry {
        &self.hooks
    }

    /// Handle one request.
    ///
    /// On failure the original error is returned, annotated with the
    /// feature/operation it was raised in.
    #[instrument(
        skip(self, request),
        fields(from = %request.from, feature = %request.feature, operation = %request.operation)
    )]
    pub async fn handle(&self, request: Request) -> Result<OperationResult, DispatchError> {
        let feature = request.feature.clone();
        let operation = request.operation.clone();

        let result = self.dispatch(request).await;
        debug!("callback");
        result.map_err(|e| DispatchError::annotate(e, &feature, &operation))
    }

    async fn dispatch(&self, request: Request) -> Result<OperationResult, PubSubError> {
        let kind = OperationKind::resolve(&request.feature, &request.operation)
            .ok_or_else(|| PubSubError::feature_not_implemented("Operation not yet supported"))?;
        let operation = self
            .features
            .get(kind)
            .ok_or_else(|| PubSubError::feature_not_implemented("Operation not yet supported"))?;

        let mut ctx = RequestContext::new(request, kind);
        if let Some(node) = ctx.request.node.as_deref() {
            if is_structural_owner(node, &ctx.request.from) {
                ctx.affiliation = Affiliation::Owner;
            }
        }

        let mut txn = self.storage.begin().await?;
        let (result, subscribers) = match run_stages(operation.as_ref(), &mut ctx, &mut *txn).await
        {
            Ok(outcome) => {
                debug!("transaction commit");
                txn.commit().await?;
                outcome
            }
            Err(e) => {
                debug!("transaction rollback: {}", e);
                if let Err(rollback_error) = txn.rollback().await {
                    warn!(error = %rollback_error, "Rollback failed");
                }
                return Err(e);
            }
        };

        operation.after_transaction(&ctx, &self.hooks);
        if let Some(subscribers) = subscribers {
            operation.subscriber_notification(&ctx, &subscribers, &self.hooks);
        }
        Ok(result)
    }

    /// Distinct identities holding any subscription.
    pub async fn all_subscribers(&self) -> Result<Vec<String>, PubSubError> {
        let mut txn = self.storage.begin().await?;
        match txn.get_all_subscribers().await {
            Ok(subscribers) => {
                txn.commit().await?;
                Ok(subscribers)
            }
            Err(e) => {
                if let Err(rollback_error) = txn.rollback().await {
                    warn!(error = %rollback_error, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("features", &self.features)
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// The transactional stages: authorize, execute, gather subscribers.
async fn run_stages(
    operation: &dyn Operation,
    ctx: &mut RequestContext,
    txn: &mut dyn Transaction,
) -> Result<(OperationResult, Option<Vec<Subscriber>>), PubSubError> {
    if let Some(required) = operation.required_affiliation() {
        if !ctx.affiliation.satisfies(required) {
            authorize(ctx, required, txn).await?;
        }
    }

    debug!("transaction");
    let result = operation.transaction(ctx, txn).await?;
    debug!("transaction done");

    let subscribers = if operation.notifies_subscribers() {
        Some(txn.get_subscribers(ctx.node()?).await?)
    } else {
        None
    };
    Ok((result, subscribers))
}
