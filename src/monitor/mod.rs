//! Background loops of the lease protocol.
//!
//! - **Heartbeater**: extends leases of in-flight tasks, refreshes the server record
//! - **Recoverer**: moves tasks with expired leases back to pending, or archives them
//! - **Forwarder**: promotes due scheduled tasks to pending
//! - **Janitor**: deletes completed tasks past their retention
//!
//! Each loop ticks on a fixed interval until its shutdown receiver fires.

pub mod forwarder;
pub mod heartbeat;
pub mod janitor;
pub mod recoverer;

pub use forwarder::Forwarder;
pub use heartbeat::Heartbeater;
pub use janitor::Janitor;
pub use recoverer::{RecoveryReport, Recoverer, LEASE_EXPIRED};
