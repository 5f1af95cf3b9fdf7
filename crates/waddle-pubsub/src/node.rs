//! PubSub node configuration.
//!
//! Defines node configuration options including access models and publish
//! models, the per-requester default configuration, and the merge applied when
//! an owner submits a partial update.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PubSubError;

/// Default `type` of a node's payloads.
pub const DEFAULT_NODE_TYPE: &str = "http://www.w3.org/2005/Atom";

/// Access model for a PubSub node.
///
/// Determines who can subscribe to and retrieve items from the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessModel {
    /// Anyone can subscribe and retrieve items.
    Open,
    /// Only entities in the owner's roster with a subscription can access.
    Presence,
    /// Only entities in specific roster groups can access.
    Roster,
    /// Only explicitly whitelisted identities can access.
    Whitelist,
    /// Subscriptions need owner approval.
    Authorize,
}

impl AccessModel {
    /// Parse an access model from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(AccessModel::Open),
            "presence" => Some(AccessModel::Presence),
            "roster" => Some(AccessModel::Roster),
            "whitelist" => Some(AccessModel::Whitelist),
            "authorize" => Some(AccessModel::Authorize),
            _ => None,
        }
    }

    /// Get the wire string for this access model.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessModel::Open => "open",
            AccessModel::Presence => "presence",
            AccessModel::Roster => "roster",
            AccessModel::Whitelist => "whitelist",
            AccessModel::Authorize => "authorize",
        }
    }
}

impl fmt::Display for AccessModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Publish model for a PubSub node.
///
/// Determines who can publish to the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishModel {
    /// Publishers, and subscribed members, can publish.
    Publishers,
    /// Only subscribers can publish.
    Subscribers,
    /// Anyone can publish.
    Open,
}

impl PublishModel {
    /// Parse a publish model from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "publishers" => Some(PublishModel::Publishers),
            "subscribers" => Some(PublishModel::Subscribers),
            "open" => Some(PublishModel::Open),
            _ => None,
        }
    }

    /// Get the wire string for this publish model.
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishModel::Publishers => "publishers",
            PublishModel::Subscribers => "subscribers",
            PublishModel::Open => "open",
        }
    }
}

impl fmt::Display for PublishModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configuration for a PubSub node.
///
/// Every field is optional because storage only holds the keys that were
/// written; an absent `access_model` is treated as open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// Human readable title.
    pub title: Option<String>,
    /// Human readable description.
    pub description: Option<String>,
    /// Payload type of the node's items.
    #[serde(rename = "type")]
    pub node_type: Option<String>,
    /// Access model (who can subscribe/retrieve).
    pub access_model: Option<AccessModel>,
    /// Publish model (who can publish).
    pub publish_model: Option<PublishModel>,
    /// When the node was created.
    pub creation_date: Option<DateTime<Utc>>,
}

/// Stored keys of a node configuration.
pub mod keys {
    pub const TITLE: &str = "title";
    pub const DESCRIPTION: &str = "description";
    pub const TYPE: &str = "type";
    pub const ACCESS_MODEL: &str = "accessModel";
    pub const PUBLISH_MODEL: &str = "publishModel";
    pub const CREATION_DATE: &str = "creationDate";
}

impl NodeConfig {
    /// Default configuration for a node created on behalf of `from`.
    pub fn default_for(from: &str, node_type: &str) -> Self {
        let owner = display_name(from);
        Self {
            title: Some(format!("{}'s node", owner)),
            description: Some(format!("Where {} publishes things", owner)),
            node_type: Some(node_type.to_string()),
            access_model: Some(AccessModel::Open),
            publish_model: Some(PublishModel::Subscribers),
            creation_date: Some(Utc::now()),
        }
    }

    /// Whether anyone may subscribe without approval.
    pub fn is_open(&self) -> bool {
        matches!(self.access_model, None | Some(AccessModel::Open))
    }

    /// Merge a partial update over this configuration.
    ///
    /// Fields the update leaves out keep their current value. `creation_date`
    /// is never taken from the update.
    pub fn merged(&self, update: &ConfigUpdate) -> Result<Self, PubSubError> {
        let access_model = match supplied(&update.access_model) {
            Some(s) => Some(AccessModel::from_str(s).ok_or_else(|| {
                PubSubError::bad_request(format!("{} is no access model", s))
            })?),
            None => self.access_model,
        };
        let publish_model = match supplied(&update.publish_model) {
            Some(s) => Some(PublishModel::from_str(s).ok_or_else(|| {
                PubSubError::bad_request(format!("{} is no publish model", s))
            })?),
            None => self.publish_model,
        };

        Ok(Self {
            title: supplied(&update.title)
                .map(String::from)
                .or_else(|| self.title.clone()),
            description: supplied(&update.description)
                .map(String::from)
                .or_else(|| self.description.clone()),
            node_type: supplied(&update.node_type)
                .map(String::from)
                .or_else(|| self.node_type.clone()),
            access_model,
            publish_model,
            creation_date: self.creation_date,
        })
    }

    /// Flatten into stored key/value pairs, skipping unset fields.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(ref title) = self.title {
            pairs.push((keys::TITLE, title.clone()));
        }
        if let Some(ref description) = self.description {
            pairs.push((keys::DESCRIPTION, description.clone()));
        }
        if let Some(ref node_type) = self.node_type {
            pairs.push((keys::TYPE, node_type.clone()));
        }
        if let Some(access_model) = self.access_model {
            pairs.push((keys::ACCESS_MODEL, access_model.to_string()));
        }
        if let Some(publish_model) = self.publish_model {
            pairs.push((keys::PUBLISH_MODEL, publish_model.to_string()));
        }
        if let Some(creation_date) = self.creation_date {
            pairs.push((
                keys::CREATION_DATE,
                creation_date.to_rfc3339_opts(SecondsFormat::Millis, true),
            ));
        }
        pairs
    }

    /// Rebuild a configuration from stored key/value pairs.
    ///
    /// Unknown keys are ignored. Unparsable model values are a storage error.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Result<Self, PubSubError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = NodeConfig::default();
        for (key, value) in pairs {
            let value = value.as_ref();
            match key.as_ref() {
                keys::TITLE => config.title = Some(value.to_string()),
                keys::DESCRIPTION => config.description = Some(value.to_string()),
                keys::TYPE => config.node_type = Some(value.to_string()),
                keys::ACCESS_MODEL => {
                    config.access_model = Some(AccessModel::from_str(value).ok_or_else(|| {
                        PubSubError::storage(format!("Invalid stored access model: {}", value))
                    })?)
                }
                keys::PUBLISH_MODEL => {
                    config.publish_model =
                        Some(PublishModel::from_str(value).ok_or_else(|| {
                            PubSubError::storage(format!("Invalid stored publish model: {}", value))
                        })?)
                }
                keys::CREATION_DATE => {
                    let date = DateTime::parse_from_rfc3339(value).map_err(|e| {
                        PubSubError::storage(format!("Invalid stored creation date: {}", e))
                    })?;
                    config.creation_date = Some(date.with_timezone(&Utc));
                }
                _ => {}
            }
        }
        Ok(config)
    }
}

/// Fields submitted with a config-node/modify request.
///
/// Absent and empty fields fall back to the stored (or default) value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub node_type: Option<String>,
    pub access_model: Option<String>,
    pub publish_model: Option<String>,
}

fn supplied(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

/// The short name of a requester: scheme prefix and domain stripped.
fn display_name(from: &str) -> &str {
    let local = from.rsplit(':').next().unwrap_or(from);
    local.split('@').next().unwrap_or(local)
}
