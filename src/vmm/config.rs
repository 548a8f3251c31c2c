//! Machine configuration

use std::path::PathBuf;

use crate::vmm::kvm::layout;
use crate::{Error, Result};

/// Configuration for creating a [`crate::Machine`].
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Guest memory size in bytes (default: 512 MB)
    pub memory_size: u64,
    /// Path to the flat guest binary, loaded at guest-physical address 0
    pub image: PathBuf,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            memory_size: layout::DEFAULT_MEMORY_SIZE,
            image: PathBuf::from("test.bin"),
        }
    }
}

impl MachineConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the guest memory size in bytes
    pub fn memory_size(mut self, bytes: u64) -> Self {
        self.memory_size = bytes;
        self
    }

    /// Set the guest image path
    pub fn image<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.image = path.into();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.image.exists() {
            return Err(Error::Config(format!(
                "guest image not found: {}",
                self.image.display()
            )));
        }

        Ok(())
    }
}
