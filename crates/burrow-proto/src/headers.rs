//! Header handling shared by both ends of the tunnel

/// Headers that describe a single transport hop and never cross the tunnel
///
/// `content-length` and `host` are included: bodies travel complete and each
/// side recomputes them for its own connection.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "content-length",
    "host",
];

/// Whether a header must be dropped when relaying a message
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Drop hop-by-hop headers, keeping the order of everything else
pub fn end_to_end<V>(headers: impl IntoIterator<Item = (String, V)>) -> Vec<(String, V)> {
    headers
        .into_iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .collect()
}
