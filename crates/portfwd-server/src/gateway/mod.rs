//! Gateway module: listening, per-client target resolution, and relaying.
//!
//! # Submodule Architecture
//!
//! - **[`listener`]** — The [`ListenerManager`] binds one TCP listener per
//!   configured port and runs an accept loop for each. Every accepted
//!   connection is handed to a new session task.
//!
//! - **[`session`]** — The [`SessionHandler`] runs the per-connection
//!   pipeline and is the isolation boundary: errors are logged there and
//!   never reach the listener.
//!
//! - **[`resolver`]** — The [`TargetResolver`] picks the upstream for a
//!   client: the static target, or a random candidate from the target file
//!   pinned to the client for the cache TTL.
//!
//! - **[`forwarder`]** — [`forwarder::relay`] copies bytes both ways between the
//!   client and the upstream until either side closes or fails.
//!
//! # Data Flow
//!
//! ```text
//! TcpListener::accept (listener.rs)
//!   → spawn SessionHandler::handle
//!       → AccessPolicy::permit            (deny → close)
//!       → TargetResolver::resolve         (cache hit, or read file + draw)
//!       → TcpStream::connect (with timeout)
//!       → relay(client, upstream)         (first EOF / error wins)
//! ```

pub mod forwarder;
pub mod listener;
pub mod resolver;
pub mod session;

pub use listener::ListenerManager;
pub use resolver::TargetResolver;
pub use session::SessionHandler;
