//! Storage Backend Adapters
//!
//! Provides adapters for the storage backend port:
//! - LINSTOR: the controller REST API
//! - Memory: process local state for standalone use and tests

pub mod linstor;
pub mod memory;

pub use linstor::*;
pub use memory::*;

use crate::domain::ports::StorageBackend;
use crate::error::{Error, Result};
use std::sync::Arc;

/// Factory for creating storage backend adapters
pub struct BackendFactory;

impl BackendFactory {
    /// Create a backend adapter by name
    pub fn create(name: &str, config: BackendConfig) -> Result<Arc<dyn StorageBackend>> {
        match name.to_lowercase().as_str() {
            "linstor" => Ok(Arc::new(LinstorBackend::new(config.linstor)?)),
            "memory" | "standalone" => Ok(Arc::new(MemoryBackend::new(config.memory_nodes))),
            _ => Err(Error::Configuration(format!("unknown storage backend: {}", name))),
        }
    }
}

/// Combined backend configuration
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub linstor: LinstorConfig,
    /// Nodes the in-memory backend places resources on
    pub memory_nodes: Vec<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            linstor: LinstorConfig::default(),
            memory_nodes: vec!["node1".into(), "node2".into(), "node3".into()],
        }
    }
}
