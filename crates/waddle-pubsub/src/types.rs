//! Common types for the PubSub engine.

use chrono::{DateTime, Utc};
use minidom::Element;
use serde::{Deserialize, Serialize};

/// A user's role on a node.
///
/// Stored as a lowercase string; `none` (and the empty string) mean "no row".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Affiliation {
    /// No affiliation
    #[default]
    None,
    /// May retrieve items and browse the node
    Member,
    /// May publish and retract items
    Publisher,
    /// Moderates the node
    Moderator,
    /// Node owner, may configure and manage everything
    Owner,
}

impl Affiliation {
    /// Affiliations strictly contained in this one.
    pub fn implied(&self) -> &'static [Affiliation] {
        use Affiliation::*;
        match self {
            Owner => &[Moderator, Publisher, Member, None],
            Moderator => &[Publisher, Member, None],
            Publisher => &[Member, None],
            Member => &[None],
            None => &[],
        }
    }

    /// Whether holding this affiliation fulfills `required`.
    pub fn satisfies(&self, required: Affiliation) -> bool {
        *self == required || self.implied().contains(&required)
    }

    /// Parse an affiliation from its stored string.
    ///
    /// The empty string parses as [`Affiliation::None`].
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Affiliation::Owner),
            "moderator" => Some(Affiliation::Moderator),
            "publisher" => Some(Affiliation::Publisher),
            "member" => Some(Affiliation::Member),
            "none" | "" => Some(Affiliation::None),
            _ => None,
        }
    }

    /// Get the stored string for this affiliation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Affiliation::Owner => "owner",
            Affiliation::Moderator => "moderator",
            Affiliation::Publisher => "publisher",
            Affiliation::Member => "member",
            Affiliation::None => "none",
        }
    }
}

impl std::fmt::Display for Affiliation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A user's subscription state on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subscription {
    /// Not subscribed
    #[default]
    None,
    /// Waiting for owner approval
    Pending,
    /// Receiving notifications
    Subscribed,
}

impl Subscription {
    /// Parse a subscription state from its stored string.
    ///
    /// The empty string parses as [`Subscription::None`].
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "subscribed" => Some(Subscription::Subscribed),
            "pending" => Some(Subscription::Pending),
            "none" | "" => Some(Subscription::None),
            _ => None,
        }
    }

    /// Get the stored string for this subscription state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::Subscribed => "subscribed",
            Subscription::Pending => "pending",
            Subscription::None => "none",
        }
    }
}

impl std::fmt::Display for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An item submitted for publishing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PubSubItem {
    /// Item ID. If None, the normalizer assigns one.
    pub id: Option<String>,
    /// The item payload.
    #[serde(serialize_with = "xml::serialize")]
    pub payload: Element,
}

impl PubSubItem {
    /// Create a new item.
    pub fn new(id: Option<String>, payload: Element) -> Self {
        Self { id, payload }
    }
}

/// An item read back from a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedItem {
    /// Item ID.
    pub id: String,
    /// The stored payload.
    #[serde(serialize_with = "xml::serialize")]
    pub item: Element,
}

/// An item streamed during an archive replay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayedItem {
    /// Node the item was published to.
    pub node: String,
    /// Item ID.
    pub id: String,
    /// The stored payload.
    #[serde(serialize_with = "xml::serialize")]
    pub item: Element,
    /// When the item was (last) published.
    pub published: DateTime<Utc>,
}

/// A subscriber of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscriber {
    /// Subscriber identity URI.
    pub user: String,
    /// Subscription state.
    pub subscription: Subscription,
}

/// One of a user's subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSubscription {
    /// Node path.
    pub node: String,
    /// Subscription state.
    pub subscription: Subscription,
}

/// One of a user's affiliations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeAffiliation {
    /// Node path.
    pub node: String,
    /// Affiliation held.
    pub affiliation: Affiliation,
}

/// A user affiliated with a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AffiliatedUser {
    /// User identity URI.
    pub user: String,
    /// Affiliation held.
    pub affiliation: Affiliation,
}

/// A browsable node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeListing {
    /// Node path.
    pub node: String,
    /// Node title, if configured.
    pub title: Option<String>,
}

/// Serde helpers for XML payloads.
pub(crate) mod xml {
    use minidom::Element;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(element: &Element, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from(element))
    }
}
