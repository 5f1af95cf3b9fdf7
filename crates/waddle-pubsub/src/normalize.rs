//! Item normalization applied while publishing.
//!
//! A normalizer decides the final id of an item and may rewrite or reject its
//! payload. It sees the previously stored item with the same id, if any.

use async_trait::async_trait;
use minidom::Element;
use uuid::Uuid;

use crate::error::PubSubError;
use crate::request::RequestContext;
use crate::types::PubSubItem;

/// An item ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedItem {
    /// Final item id
    pub id: String,
    /// Final payload
    pub payload: Element,
}

/// Finalizes submitted items before they are stored.
#[async_trait]
pub trait ItemNormalizer: Send + Sync {
    /// Produce the item to store, or reject the submission.
    async fn normalize(
        &self,
        ctx: &RequestContext,
        item: PubSubItem,
        prior: Option<&Element>,
    ) -> Result<NormalizedItem, PubSubError>;
}

/// Keeps payloads as submitted and assigns random ids to items without one.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultItemNormalizer;

#[async_trait]
impl ItemNormalizer for DefaultItemNormalizer {
    async fn normalize(
        &self,
        _ctx: &RequestContext,
        item: PubSubItem,
        _prior: Option<&Element>,
    ) -> Result<NormalizedItem, PubSubError> {
        if item.payload.name().is_empty() {
            return Err(PubSubError::bad_request("Item payload has no element"));
        }

        let id = item
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(NormalizedItem {
            id,
            payload: item.payload,
        })
    }
}
