//! efsec_server — the zero-knowledge coordination server.
//!
//! Three registries behind one axum service: public key inventory with
//! atomic one-time-key claims (SKR), group membership with a monotone
//! key version (SGR), and a TTL'd ephemeral ciphertext relay (ECR).
//! Nothing stored here can decrypt anything.

pub mod error;
pub mod groups;
pub mod registry;
pub mod relay;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::router;
pub use state::{AppState, Principal, ServerEvent};
