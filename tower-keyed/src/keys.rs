use std::net::SocketAddr;

/// Derives a stable caller key from a peer address string.
///
/// `"203.0.113.7:49152"` keys as `"203.0.113.7"`, so one caller maps to
/// one key across connections regardless of the ephemeral port. Anything
/// that does not parse as a socket address is used verbatim as the key:
/// a malformed identity is the caller's problem to normalize, never a
/// reason to drop the request on the floor.
pub fn client_key(remote: &str) -> String {
    remote
        .parse::<SocketAddr>()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| remote.to_string())
}
