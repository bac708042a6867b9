//! Network layer of the relay.
//!
//! - `listener`: per-broker listeners, accept, client TLS
//! - `connection`: the two relay loops of a connection pair
//! - `lifecycle`: once-only teardown shared by both loops
//! - `stream`: plain-or-TLS legs
//! - `context`: pair identity for logs

pub mod connection;
pub mod context;
pub mod lifecycle;
pub mod listener;
pub mod stream;

pub use connection::{ConnectionProxy, RelayDeps};
pub use context::ConnectionContext;
pub use lifecycle::{CloseReason, PairLifecycle, PairState};
pub use listener::ListenerManager;
pub use stream::{BrokerStream, ClientStream, Leg};
