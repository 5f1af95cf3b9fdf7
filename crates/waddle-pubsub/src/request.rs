//! Inbound requests, the per-dispatch context and operation results.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use minidom::Element;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::PubSubError;
use crate::node::{ConfigUpdate, NodeConfig};
use crate::rsm::{RsmQuery, RsmResult};
use crate::types::{
    AffiliatedUser, Affiliation, NodeAffiliation, NodeListing, NodeSubscription, PubSubItem,
    ReplayedItem, RetrievedItem, Subscriber, Subscription,
};

/// Supported PubSub features, in the order they are advertised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    CreateNodes,
    Subscribe,
    Publish,
    RetractItems,
    RetrieveItems,
    RetrieveSubscriptions,
    RetrieveAffiliations,
    ManageSubscriptions,
    ModifyAffiliations,
    ConfigNode,
    GetPending,
    Register,
    BrowseNodes,
}

impl Feature {
    /// Every feature, in advertisement order.
    pub const ALL: [Feature; 13] = [
        Feature::CreateNodes,
        Feature::Subscribe,
        Feature::Publish,
        Feature::RetractItems,
        Feature::RetrieveItems,
        Feature::RetrieveSubscriptions,
        Feature::RetrieveAffiliations,
        Feature::ManageSubscriptions,
        Feature::ModifyAffiliations,
        Feature::ConfigNode,
        Feature::GetPending,
        Feature::Register,
        Feature::BrowseNodes,
    ];

    /// Parse a feature from its wire name.
    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == s)
    }

    /// Get the wire name of this feature.
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::CreateNodes => "create-nodes",
            Feature::Subscribe => "subscribe",
            Feature::Publish => "publish",
            Feature::RetractItems => "retract-items",
            Feature::RetrieveItems => "retrieve-items",
            Feature::RetrieveSubscriptions => "retrieve-subscriptions",
            Feature::RetrieveAffiliations => "retrieve-affiliations",
            Feature::ManageSubscriptions => "manage-subscriptions",
            Feature::ModifyAffiliations => "modify-affiliations",
            Feature::ConfigNode => "config-node",
            Feature::GetPending => "get-pending",
            Feature::Register => "register",
            Feature::BrowseNodes => "browse-nodes",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Every supported (feature, operation) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    CreateNode,
    Subscribe,
    Unsubscribe,
    Publish,
    Retract,
    RetrieveItems,
    ReplayItems,
    RetrieveSubscriptions,
    RetrieveAffiliations,
    RetrieveSubscribers,
    ModifySubscriptions,
    RetrieveAffiliated,
    ModifyAffiliations,
    RetrieveConfig,
    ModifyConfig,
    ListPendingNodes,
    GetPendingForNode,
    Register,
    BrowseNodes,
    BrowseByUser,
}

impl OperationKind {
    /// Every operation.
    pub const ALL: [OperationKind; 20] = [
        OperationKind::CreateNode,
        OperationKind::Subscribe,
        OperationKind::Unsubscribe,
        OperationKind::Publish,
        OperationKind::Retract,
        OperationKind::RetrieveItems,
        OperationKind::ReplayItems,
        OperationKind::RetrieveSubscriptions,
        OperationKind::RetrieveAffiliations,
        OperationKind::RetrieveSubscribers,
        OperationKind::ModifySubscriptions,
        OperationKind::RetrieveAffiliated,
        OperationKind::ModifyAffiliations,
        OperationKind::RetrieveConfig,
        OperationKind::ModifyConfig,
        OperationKind::ListPendingNodes,
        OperationKind::GetPendingForNode,
        OperationKind::Register,
        OperationKind::BrowseNodes,
        OperationKind::BrowseByUser,
    ];

    /// Look up the operation named by a request.
    pub fn resolve(feature: &str, operation: &str) -> Option<Self> {
        let feature = Feature::from_str(feature)?;
        Self::ALL
            .into_iter()
            .find(|kind| kind.feature() == feature && kind.operation() == operation)
    }

    /// The feature this operation belongs to.
    pub fn feature(&self) -> Feature {
        use OperationKind::*;
        match self {
            CreateNode => Feature::CreateNodes,
            Subscribe | Unsubscribe => Feature::Subscribe,
            Publish => Feature::Publish,
            Retract => Feature::RetractItems,
            RetrieveItems | ReplayItems => Feature::RetrieveItems,
            RetrieveSubscriptions => Feature::RetrieveSubscriptions,
            RetrieveAffiliations => Feature::RetrieveAffiliations,
            RetrieveSubscribers | ModifySubscriptions => Feature::ManageSubscriptions,
            RetrieveAffiliated | ModifyAffiliations => Feature::ModifyAffiliations,
            RetrieveConfig | ModifyConfig => Feature::ConfigNode,
            ListPendingNodes | GetPendingForNode => Feature::GetPending,
            Register => Feature::Register,
            BrowseNodes | BrowseByUser => Feature::BrowseNodes,
        }
    }

    /// The operation's wire name within its feature.
    pub fn operation(&self) -> &'static str {
        use OperationKind::*;
        match self {
            CreateNode => "create",
            Subscribe => "subscribe",
            Unsubscribe => "unsubscribe",
            Publish => "publish",
            Retract => "retract",
            RetrieveItems
            | RetrieveSubscriptions
            | RetrieveAffiliations
            | RetrieveSubscribers
            | RetrieveAffiliated
            | RetrieveConfig => "retrieve",
            ReplayItems => "replay",
            ModifySubscriptions | ModifyAffiliations | ModifyConfig => "modify",
            ListPendingNodes => "list-nodes",
            GetPendingForNode => "get-for-node",
            Register => "register",
            BrowseNodes => "list",
            BrowseByUser => "by-user",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.feature(), self.operation())
    }
}

/// A decoded PubSub request as handed over by a transport.
///
/// Subscription and affiliation maps carry raw values; operations validate
/// them before writing anything.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Feature name, e.g. `publish`
    pub feature: String,
    /// Operation name within the feature, e.g. `publish`
    pub operation: String,
    /// Target node path
    pub node: Option<String>,
    /// Requester identity URI
    pub from: String,
    /// Items to publish
    pub items: Vec<PubSubItem>,
    /// Item ids to retract
    pub item_ids: Vec<String>,
    /// Pagination for item retrieval
    pub rsm: Option<RsmQuery>,
    /// Submitted node configuration fields
    pub config: ConfigUpdate,
    /// user -> subscription value
    pub subscriptions: BTreeMap<String, String>,
    /// user -> affiliation value
    pub affiliations: BTreeMap<String, String>,
    /// Start of the replay window
    pub time_start: Option<DateTime<Utc>>,
    /// End of the replay window
    pub time_end: Option<DateTime<Utc>>,
    /// Receives replayed items
    pub replay_sink: Option<mpsc::UnboundedSender<ReplayedItem>>,
}

impl Request {
    /// Create a request for `feature`/`operation` on behalf of `from`.
    pub fn new(
        from: impl Into<String>,
        feature: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            feature: feature.into(),
            operation: operation.into(),
            ..Default::default()
        }
    }

    /// Set the target node.
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Add an item to publish.
    pub fn with_item(mut self, id: Option<&str>, payload: Element) -> Self {
        self.items
            .push(PubSubItem::new(id.map(String::from), payload));
        self
    }

    /// Add an item id to retract.
    pub fn with_item_id(mut self, id: impl Into<String>) -> Self {
        self.item_ids.push(id.into());
        self
    }

    /// Set the pagination query.
    pub fn with_rsm(mut self, rsm: RsmQuery) -> Self {
        self.rsm = Some(rsm);
        self
    }

    /// Set the submitted configuration fields.
    pub fn with_config(mut self, config: ConfigUpdate) -> Self {
        self.config = config;
        self
    }

    /// Add a subscription change.
    pub fn with_subscription(mut self, user: impl Into<String>, value: impl Into<String>) -> Self {
        self.subscriptions.insert(user.into(), value.into());
        self
    }

    /// Add an affiliation change.
    pub fn with_affiliation(mut self, user: impl Into<String>, value: impl Into<String>) -> Self {
        self.affiliations.insert(user.into(), value.into());
        self
    }

    /// Set the replay window and the channel replayed items are sent to.
    pub fn with_replay(
        mut self,
        time_start: Option<DateTime<Utc>>,
        time_end: Option<DateTime<Utc>>,
        sink: mpsc::UnboundedSender<ReplayedItem>,
    ) -> Self {
        self.time_start = time_start;
        self.time_end = time_end;
        self.replay_sink = Some(sink);
        self
    }
}

/// State of one dispatch, threaded through every pipeline stage.
///
/// Created when a request is dispatched and dropped when it completes.
#[derive(Debug)]
pub struct RequestContext {
    /// The request being handled
    pub request: Request,
    /// The resolved operation
    pub kind: OperationKind,
    /// The requester's effective affiliation on the node
    pub affiliation: Affiliation,
    /// Subscription state produced by subscribe
    pub subscription: Option<Subscription>,
    /// Owners to ask for approval of a pending subscription
    pub owners: Vec<String>,
    /// Configuration subscribers are told about
    pub config: Option<NodeConfig>,
    /// Users waiting for approval
    pub pending_users: Vec<String>,
    /// Items as written by publish
    pub published: Vec<PubSubItem>,
    /// Subscription changes applied by an owner
    pub modified_subscriptions: Vec<(String, Subscription)>,
}

impl RequestContext {
    /// Start a context for `request`, resolved to `kind`.
    pub fn new(request: Request, kind: OperationKind) -> Self {
        Self {
            request,
            kind,
            affiliation: Affiliation::None,
            subscription: None,
            owners: Vec::new(),
            config: None,
            pending_users: Vec::new(),
            published: Vec::new(),
            modified_subscriptions: Vec::new(),
        }
    }

    /// The requester identity.
    pub fn from(&self) -> &str {
        &self.request.from
    }

    /// The target node; operations on a node fail without one.
    pub fn node(&self) -> Result<&str, PubSubError> {
        self.request
            .node
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| PubSubError::bad_request("No node specified"))
    }
}

/// The result of a successful operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", content = "value", rename_all = "kebab-case")]
pub enum OperationResult {
    /// Nothing to report
    Empty,
    /// Subscription state after subscribe
    Subscription(Subscription),
    /// A page of items
    Items {
        items: Vec<RetrievedItem>,
        rsm: RsmResult,
    },
    /// Ids of the published items
    Published(Vec<String>),
    /// The requester's subscriptions
    Subscriptions(Vec<NodeSubscription>),
    /// The requester's affiliations
    Affiliations(Vec<NodeAffiliation>),
    /// Subscribers of a node
    Subscribers(Vec<Subscriber>),
    /// Users affiliated with a node
    Affiliated(Vec<AffiliatedUser>),
    /// A node configuration
    Config(NodeConfig),
    /// Node paths
    Nodes(Vec<String>),
    /// User identities
    Users(Vec<String>),
    /// Browsable nodes
    Listings(Vec<NodeListing>),
}
