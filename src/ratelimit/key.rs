//! Rate limit key derivation.

use std::fmt;
use std::net::IpAddr;

/// Header carrying the caller's account identifier.
pub const ACCOUNT_HEADER: &str = "x-account-id";

/// The subject a request is limited as.
///
/// Authenticated callers are limited per account; everybody else per source
/// address. The two never share a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitKey {
    /// Caller identified by account ID
    Account(String),
    /// Anonymous caller identified by IP address
    Address(IpAddr),
}

impl RateLimitKey {
    /// Pick the key for a request from its account header and peer address.
    ///
    /// A blank account header counts as absent. Returns `None` when neither
    /// source identifies the caller.
    pub fn from_parts(account: Option<&str>, peer: Option<IpAddr>) -> Option<Self> {
        match account.map(str::trim).filter(|a| !a.is_empty()) {
            Some(account) => Some(RateLimitKey::Account(account.to_string())),
            None => peer.map(RateLimitKey::Address),
        }
    }

    /// Convert the key to the string the limiter indexes buckets by.
    pub fn to_string_key(&self) -> String {
        self.to_string()
    }

    /// Parse a key previously produced by [`to_string_key`](Self::to_string_key).
    pub fn from_string_key(key: &str) -> Option<Self> {
        if let Some(account) = key.strip_prefix("account:") {
            if account.is_empty() {
                return None;
            }
            return Some(RateLimitKey::Account(account.to_string()));
        }
        let ip = key.strip_prefix("addr:")?.parse().ok()?;
        Some(RateLimitKey::Address(ip))
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitKey::Account(id) => write!(f, "account:{}", id),
            RateLimitKey::Address(ip) => write!(f, "addr:{}", ip),
        }
    }
}
