//! Element merge resolution.
//!
//! Two rules live here:
//!
//! - [`merge`]: the client-side resolver. Higher version wins; on equal
//!   versions the lower nonce wins. Pure, deterministic and independent of
//!   argument order, so every party resolving the same conflict lands on the
//!   same element without coordination.
//! - [`adopt_if_newer`]: the server-side rule. Only a strictly greater
//!   version replaces authoritative state; equal versions are left alone.
//!
//! Neither rule deletes. An element missing from the remote side is kept.

use crate::element::{Element, ElementId, ElementSet};

/// Returns true if `candidate` should replace `current`.
///
/// Exact ties on version and nonce fall back to comparing the serialized
/// payload, which keeps the choice total.
pub fn supersedes(candidate: &Element, current: &Element) -> bool {
    if candidate.version != current.version {
        return candidate.version > current.version;
    }
    if candidate.version_nonce != current.version_nonce {
        return candidate.version_nonce < current.version_nonce;
    }
    if candidate.fields == current.fields {
        return false;
    }
    payload_key(candidate) < payload_key(current)
}

fn payload_key(element: &Element) -> String {
    serde_json::to_string(&element.fields).unwrap_or_default()
}

/// Pick the winning version of one element.
pub fn resolve<'a>(a: &'a Element, b: &'a Element) -> &'a Element {
    if supersedes(b, a) {
        b
    } else {
        a
    }
}

/// Merge two candidate states of an element set.
///
/// Every identifier present in either input appears exactly once in the
/// output.
pub fn merge(local: &ElementSet, remote: &ElementSet) -> ElementSet {
    let mut merged = local.clone();
    merge_into(&mut merged, remote);
    merged
}

/// In-place form of [`merge`]. Returns the identifiers whose element was
/// replaced or added.
pub fn merge_into(local: &mut ElementSet, remote: &ElementSet) -> Vec<ElementId> {
    let mut changed = Vec::new();
    for incoming in remote {
        let take = match local.get(&incoming.id) {
            Some(existing) => supersedes(incoming, existing),
            None => true,
        };
        if take {
            local.insert(incoming.clone());
            changed.push(incoming.id.clone());
        }
    }
    changed
}

/// Server rule: adopt `incoming` only if absent or strictly newer.
///
/// Equal versions are never resolved here; clients settle those themselves.
pub fn adopt_if_newer(authoritative: &mut ElementSet, incoming: &Element) -> bool {
    let newer = authoritative
        .get(&incoming.id)
        .map_or(true, |current| incoming.version > current.version);
    if newer {
        authoritative.insert(incoming.clone());
    }
    newer
}
