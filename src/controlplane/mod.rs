//! Gateway Control Plane
//!
//! Provisions the replicated storage behind a gateway, tracks its status and
//! drives the service lifecycle through promoter configs.

pub mod backends;
pub mod lifecycle;
pub mod orchestrator;
pub mod status;
pub mod wait;

pub use backends::*;
pub use orchestrator::*;
pub use status::status_from_resources;
pub use wait::PollSettings;
