//! Domain layer - Gateway data model and port definitions
//!
//! Identities, service addresses and volume/status types shared by every
//! protocol, plus the storage backend port that adapters implement.

pub mod identity;
pub mod net;
pub mod ports;
pub mod volume;

pub use identity::{Iqn, Nqn, ResourceName};
pub use net::ServiceIp;
pub use ports::*;
pub use volume::*;
