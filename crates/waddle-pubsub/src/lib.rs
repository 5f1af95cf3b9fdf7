//! # waddle-pubsub
//!
//! Publish-subscribe node engine for Waddle Social (XEP-0060 / XEP-0163
//! style).
//!
//! Nodes hold a configuration, affiliations, subscriptions and published
//! items. Clients run feature-scoped operations against a node; access is
//! derived from their affiliation and the node's access and publish models.
//!
//! ## Architecture
//!
//! - **Dispatcher**: runs each request through one storage transaction
//!   (authorize, execute, gather subscribers, commit) and notifies frontends
//!   after commit
//! - **Features**: a registry of operations keyed by (feature, operation)
//! - **Frontend hooks**: best-effort notification callbacks per URI scheme
//! - **Storage**: in-memory and libSQL backends behind one transaction trait
//!
//! ## Example
//!
//! ```ignore
//! let features = FeatureRegistry::standard(&config, Arc::new(DefaultItemNormalizer));
//! let dispatcher = RequestDispatcher::new(storage, Arc::new(features), hooks);
//!
//! let request = Request::new("xmpp:alice@example.com", "register", "register");
//! let result = dispatcher.handle(request).await?;
//! ```

pub mod affiliation;
pub mod config;
pub mod dispatcher;
pub mod features;
pub mod hooks;
pub mod node;
pub mod normalize;
pub mod path;
pub mod request;
pub mod rsm;
pub mod storage;

mod error;
mod types;

pub use config::{ConfigError, PubSubConfig};
pub use dispatcher::RequestDispatcher;
pub use error::{DispatchError, ErrorCondition, PubSubError};
pub use features::{FeatureRegistry, Operation};
pub use hooks::{FrontendEvent, FrontendHookRegistry, HookName, HookSet};
pub use node::{AccessModel, ConfigUpdate, NodeConfig, PublishModel, DEFAULT_NODE_TYPE};
pub use normalize::{DefaultItemNormalizer, ItemNormalizer, NormalizedItem};
pub use request::{Feature, OperationKind, OperationResult, Request, RequestContext};
pub use rsm::{apply_rsm, RsmQuery, RsmResult};
pub use storage::{LibSqlStorage, MemoryStorage, Storage, Transaction};
pub use types::*;
