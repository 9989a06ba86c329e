//! Relay wire contract: header names added to forwarded requests.
//!
//! Header matching is case-insensitive on the wire; these constants use the
//! canonical capitalization.

/// Number of relay forwards the request has undergone.
pub const HOP_COUNT: &str = "X-Hop-Count";

/// Identity of the node that forwarded (or answered) the request.
pub const RELAY_NODE: &str = "X-Relay-Node";

/// Comma-appended trail of nodes the request has visited. Diagnostic only.
pub const VISITED_NODES: &str = "X-Visited-Nodes";

/// Correlation ID of the request at the node that forwarded it.
pub const ORIGINAL_REQUEST_ID: &str = "X-Original-Request-ID";

/// Headers that describe a single connection and must not be copied onto a
/// forwarded request.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Parses an `X-Hop-Count` value. Missing or malformed values count as 0.
#[must_use]
pub fn parse_hop_count(value: Option<&str>) -> u32 {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}

/// Appends `node` to a visited-nodes trail.
#[must_use]
pub fn append_visited(trail: Option<&str>, node: &str) -> String {
    match trail {
        Some(t) if !t.is_empty() => format!("{t},{node}"),
        _ => node.to_string(),
    }
}

/// Returns `true` if `name` is a hop-by-hop header.
#[must_use]
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}
