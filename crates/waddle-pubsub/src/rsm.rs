//! Result Set Management (XEP-0059) over ordered id lists.
//!
//! Pagination is applied to item ids before any item is fetched, so a page
//! never costs more than `count` item reads.

use serde::Serialize;

/// RSM query parameters.
///
/// Empty cursors and a zero count are treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RsmQuery {
    /// Return ids after this one
    pub after: Option<String>,
    /// Return ids before this one
    pub before: Option<String>,
    /// Maximum number of ids to return
    pub count: Option<usize>,
}

impl RsmQuery {
    fn after(&self) -> Option<&str> {
        self.after.as_deref().filter(|s| !s.is_empty())
    }

    fn before(&self) -> Option<&str> {
        self.before.as_deref().filter(|s| !s.is_empty())
    }

    fn count(&self) -> Option<usize> {
        self.count.filter(|c| *c > 0)
    }
}

/// Summary of a returned page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RsmResult {
    /// Length of the full list before slicing
    pub count: usize,
    /// First id of the page
    pub first: Option<String>,
    /// Last id of the page
    pub last: Option<String>,
}

/// Apply an RSM query to an ordered id list.
///
/// An `after` cursor that is not in the list drains it entirely. With `before`
/// and `count` both set, the page is taken from the end nearest `before`.
pub fn apply_rsm(query: Option<&RsmQuery>, ids: Vec<String>) -> (Vec<String>, RsmResult) {
    let default_query = RsmQuery::default();
    let query = query.unwrap_or(&default_query);
    let total = ids.len();
    let mut page = ids;

    if let Some(after) = query.after() {
        match page.iter().position(|id| id == after) {
            Some(pos) => {
                page.drain(..=pos);
            }
            None => page.clear(),
        }
    }

    if let Some(before) = query.before() {
        match page.iter().rposition(|id| id == before) {
            Some(pos) => page.truncate(pos),
            None => page.clear(),
        }
        if let Some(count) = query.count() {
            let start = page.len().saturating_sub(count);
            page.drain(..start);
        }
    }

    if let Some(count) = query.count() {
        page.truncate(count);
    }

    let result = RsmResult {
        count: total,
        first: page.first().cloned(),
        last: page.last().cloned(),
    };
    (page, result)
}
