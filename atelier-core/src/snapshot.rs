//! Persisted snapshot normalization.
//!
//! Snapshots come from the page storage service and have used several
//! shapes over time:
//!
//! ```text
//! { "content": { "components": [ … ] } }
//! { "content": [ … ] }
//! { "components": [ … ] }
//! ```
//!
//! Shapes are tried in that order and the first non-empty list wins. Anything
//! else normalizes to an empty list.

use serde_json::Value;

use crate::component::ComponentRecord;

/// Extract the component list from any known snapshot shape, assigning ids
/// to records that lack one.
pub fn normalize_snapshot(snapshot: &Value, author_id: &str) -> Vec<ComponentRecord> {
    let candidates = [
        snapshot.get("content").and_then(|c| c.get("components")),
        snapshot.get("content"),
        snapshot.get("components"),
    ];

    for candidate in candidates.into_iter().flatten() {
        let records = parse_list(candidate, author_id);
        if !records.is_empty() {
            return records;
        }
    }

    log::debug!("snapshot matched no known shape");
    Vec::new()
}

fn parse_list(value: &Value, author_id: &str) -> Vec<ComponentRecord> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };

    items
        .iter()
        .filter(|item| item.is_object())
        .filter_map(|item| match serde_json::from_value::<ComponentRecord>(item.clone()) {
            Ok(mut record) => {
                record.ensure_id(author_id);
                Some(record)
            }
            Err(e) => {
                log::warn!("skipping malformed snapshot component: {e}");
                None
            }
        })
        .collect()
}
