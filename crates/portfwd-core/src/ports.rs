//! Listening port ranges.
//!
//! A range string is a `;`-separated list of tokens, each either a single
//! port (`9100`) or an inclusive range (`8000-8002`). Tokens that are not
//! numeric, fall outside `1..=65535`, or run backwards are dropped without
//! a diagnostic.

use crate::target::parse_port;
use std::collections::BTreeSet;
use std::fmt;

/// One socket to bind: `host:port` on the listening side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerSpec {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ListenerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Expand a port range string into a sorted, de-duplicated port set.
pub fn parse_port_range(spec: &str) -> BTreeSet<u16> {
    let mut ports = BTreeSet::new();
    for token in spec.split(';').map(str::trim).filter(|t| !t.is_empty()) {
        match token.split_once('-') {
            Some((start, end)) => {
                let bounds = (parse_port(start.trim()), parse_port(end.trim()));
                if let (Some(start), Some(end)) = bounds {
                    if start <= end {
                        ports.extend(start..=end);
                    }
                }
            }
            None => {
                if let Some(port) = parse_port(token) {
                    ports.insert(port);
                }
            }
        }
    }
    ports
}

/// Build one [`ListenerSpec`] per port in `range` on `host`.
pub fn listener_specs(host: &str, range: &str) -> Vec<ListenerSpec> {
    parse_port_range(range)
        .into_iter()
        .map(|port| ListenerSpec {
            host: host.to_string(),
            port,
        })
        .collect()
}
