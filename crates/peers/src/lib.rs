//! Peer registry and inbound-stream guard.
//!
//! The [`NodeStore`] is the sole source of truth for peer health: every
//! component reads it, only its owner writes. The [`Guard`] fronts all
//! inbound streams with rate limiting, optional whitelisting, hashed-token
//! auth and a constant-time shared-secret check, and runs a stoppable
//! background sweeper that purges expired tokens and stale peer stats.

pub mod ewma;
pub mod guard;
pub mod store;
pub mod tokens;

pub use ewma::Ewma;
pub use guard::{Guard, GuardConfig, GuardError};
pub use store::NodeStore;
pub use tokens::TokenRegistry;
