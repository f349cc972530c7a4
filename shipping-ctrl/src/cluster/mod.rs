//! Cluster collaborators: named locks with transactions, connected
//! satellites and the messages sent to them.

pub mod locks;
pub mod notify;
pub mod peers;

pub use locks::{ClusterState, LockMode, LockObj, LockSpec, Transaction};
pub use notify::Notifier;
pub use peers::{NodeResponse, PeerRegistry};
