//! efsec_engine — the client coordinator.
//!
//! Ties the crypto core to the keystore and a transport: bundle
//! publication and replenishment, pairwise session establishment, DM and
//! group send/receive paths, group key distribution and membership-change
//! reactions.

pub mod coordinator;
pub mod error;
pub mod transport;

pub use coordinator::{Coordinator, GroupRecv, Incoming, REPLENISH_BATCH, REPLENISH_THRESHOLD};
pub use error::EngineError;
pub use transport::{HttpTransport, Transport, TransportError};
