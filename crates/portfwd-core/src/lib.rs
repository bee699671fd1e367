//! portfwd-core: shared building blocks for the portfwd TCP relay.
//!
//! Target list parsing, listening port ranges, the source-IP access policy
//! and the error taxonomy used by the server.

pub mod access;
pub mod error;
pub mod ports;
pub mod target;

// Re-export commonly used items at crate root.
pub use access::AccessPolicy;
pub use error::{FwdError, FwdResult};
pub use ports::{listener_specs, parse_port_range, ListenerSpec};
pub use target::{load_targets, parse_target_line, parse_target_list, TargetSpec};
