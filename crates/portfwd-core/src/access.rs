//! Source-IP allowlist.
//!
//! Matching is literal: no CIDR blocks, no hostnames. IPv4-mapped IPv6
//! peers (`::ffff:a.b.c.d`, as seen on dual-stack sockets) are compared in
//! their IPv4 form.

use crate::error::{FwdError, FwdResult};
use std::collections::HashSet;
use std::net::IpAddr;

/// Which source addresses may use the forwarder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessPolicy {
    AllowAny,
    AllowList(HashSet<IpAddr>),
}

impl AccessPolicy {
    /// Build an explicit allowlist from textual addresses.
    ///
    /// # Errors
    ///
    /// Returns [`FwdError::Config`] for an unparsable address or an empty list.
    pub fn from_addrs<I, S>(addrs: I) -> FwdResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = HashSet::new();
        for addr in addrs {
            let addr = addr.as_ref().trim();
            let ip: IpAddr = addr
                .parse()
                .map_err(|_| FwdError::Config(format!("invalid allowlist address: {addr:?}")))?;
            set.insert(ip.to_canonical());
        }
        if set.is_empty() {
            return Err(FwdError::Config("allowlist is empty".to_string()));
        }
        Ok(AccessPolicy::AllowList(set))
    }

    /// Decide whether `ip` may connect.
    pub fn permit(&self, ip: IpAddr) -> bool {
        match self {
            AccessPolicy::AllowAny => true,
            AccessPolicy::AllowList(set) => set.contains(&ip.to_canonical()),
        }
    }
}
