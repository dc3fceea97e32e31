//! Storage Gateway - Highly available iSCSI, NFS and NVMe-oF
//!
//! Turns a declarative description of a network storage service into a
//! replicated storage resource plus a drbd-reactor promoter config that
//! starts the service on whichever node holds the primary replica, and
//! reconstructs the description and its live status from what is deployed.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Protocol front ends                        │
//! │   ┌──────────────┐     ┌──────────────┐     ┌──────────────┐      │
//! │   │    iSCSI     │     │     NFS      │     │   NVMe-oF    │      │
//! │   └──────┬───────┘     └──────┬───────┘     └──────┬───────┘      │
//! │          └────────────────────┼────────────────────┘              │
//! │                   ┌───────────┴───────────┐                       │
//! │                   │  Gateway Orchestrator │                       │
//! │                   └───────────┬───────────┘                       │
//! ├───────────────────────────────┼──────────────────────────────────┤
//! │   ┌──────────────────┐  ┌─────┴────────────┐  ┌───────────────┐   │
//! │   │ Promoter configs │  │ Resource lifecycle│ │ Status / wait │   │
//! │   └──────────────────┘  └──────────────────┘  └───────────────┘   │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                        Storage backends                          │
//! │        ┌──────────────────┐          ┌──────────────────┐        │
//! │        │  LINSTOR (REST)  │          │    In-memory     │        │
//! │        └──────────────────┘          └──────────────────┘        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Orchestrator, resource lifecycle, status and backends
//! - [`domain`]: Identities, addresses, volumes and the backend port
//! - [`promoter`]: Promoter config model, naming and persistence
//! - [`protocols`]: iSCSI, NFS and NVMe-oF configs and front ends
//! - [`error`]: Error types and handling

pub mod controlplane;
pub mod domain;
pub mod error;
pub mod promoter;
pub mod protocols;

// Re-export commonly used types
pub use controlplane::{
    BackendConfig, BackendFactory, GatewayConfig, GatewayResource, LinstorBackend,
    LinstorConfig, MemoryBackend, Orchestrator,
};

pub use domain::identity::{Iqn, Nqn, ResourceName};
pub use domain::net::ServiceIp;
pub use domain::ports::StorageBackend;
pub use domain::volume::{
    ResourceState, ResourceStatus, ServiceState, UidGid, VolumeConfig, VolumeState,
};

pub use error::{Error, ErrorKind, Result};

pub use promoter::{PromoterConfig, Protocol, ResourceAgent, StartEntry};

pub use protocols::{iscsi::Iscsi, nfs::Nfs, nvmeof::Nvmeof};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
