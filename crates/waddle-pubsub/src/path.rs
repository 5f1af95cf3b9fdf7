//! Node path and requester identity grammar.
//!
//! Personal nodes live under `/user/<user>/<name>`, requesters are identified
//! by a scheme-prefixed URI such as `xmpp:alice@example.com`.

use std::sync::LazyLock;

use regex::Regex;

static OWNED_NODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/user/(.+?)/([a-zA-Z0-9/\-]+)$").expect("valid regex"));

static IDENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+?):(.+)$").expect("valid regex"));

static USER_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/user/([^/]+)$").expect("valid regex"));

/// The user segment of a personal node path.
pub fn owning_user(node: &str) -> Option<&str> {
    OWNED_NODE
        .captures(node)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// The user part of a requester identity (scheme prefix removed).
pub fn identity_user(from: &str) -> Option<&str> {
    IDENTITY
        .captures(from)
        .and_then(|c| c.get(2))
        .map(|m| m.as_str())
}

/// Whether `node` is a personal node of the requester `from`.
///
/// Used as a fast path before any affiliation lookup.
pub fn is_structural_owner(node: &str, from: &str) -> bool {
    match (owning_user(node), identity_user(from)) {
        (Some(owner), Some(user)) => owner == user,
        _ => false,
    }
}

/// The user addressed by a `/user/<user>` browse path.
pub fn browse_user(node: &str) -> Option<&str> {
    USER_PATH
        .captures(node)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// The namespace user a registration creates nodes for.
///
/// Everything through the last `:` is treated as the scheme prefix.
pub fn registration_user(from: &str) -> &str {
    match from.rfind(':') {
        Some(pos) if pos + 1 < from.len() && pos > 0 => &from[pos + 1..],
        _ => from,
    }
}

/// Path of a personal node.
pub fn user_node(user: &str, name: &str) -> String {
    format!("/user/{}/{}", user, name)
}

/// Split a target URI into its scheme and the remaining address.
pub fn split_scheme(uri: &str) -> Option<(&str, &str)> {
    match uri.find(':') {
        Some(pos) if pos > 0 => Some((&uri[..pos], &uri[pos + 1..])),
        _ => None,
    }
}
