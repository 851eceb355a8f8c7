//! In-process mock event-store node. Speaks the strom wire protocol over
//! real TCP sockets and exposes fault-injection controls so integration
//! tests can exercise reconnects, heartbeat faults and auth rejection.
mod node;
pub mod tls;

pub use node::HarnessNode;
