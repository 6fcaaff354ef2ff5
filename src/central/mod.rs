//! Central-role GATT client
//!
//! Per peripheral: a connection state machine that owns the link and its
//! subscriptions, a dispatcher that drains notifications in arrival order,
//! and a correlator that pairs writes with their reply notifications.
//! [`GattClient`] ties them to one host adapter.

pub mod client;
pub mod correlator;
pub mod dispatcher;
pub mod scan_registry;
pub mod state_machine;

pub use client::GattClient;
pub use correlator::{PendingRequest, RequestId};
pub use dispatcher::{DispatchStats, NotificationHandler};
pub use scan_registry::ScanRegistry;
pub use state_machine::ConnectionState;
