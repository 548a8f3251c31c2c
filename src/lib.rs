//! flatvm: a minimal KVM-backed virtual machine monitor
//!
//! flatvm opens the KVM device, creates a VM with a single flat memory
//! region at guest-physical address 0, loads a raw binary into it, and runs
//! one vCPU on a dedicated worker thread until the guest halts. Port I/O
//! writes are decoded and reported as diagnostics; there is no device
//! emulation beyond that.
//!
//! # Example
//!
//! ```no_run
//! use flatvm::{Machine, MachineConfig};
//!
//! fn main() -> flatvm::Result<()> {
//!     let config = MachineConfig::new()
//!         .memory_size(16 * 1024 * 1024)
//!         .image("guest.bin");
//!
//!     let mut machine = Machine::new(&config)?;
//!     machine.load_image(&config.image)?;
//!     machine.run()?;
//!
//!     for write in machine.drain_port_writes() {
//!         println!("port {:#x} <- {}", write.port, write.value);
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod vmm;

// Re-exports for convenience
pub use error::{Error, Result};
pub use vmm::config::MachineConfig;
pub use vmm::cpu::PortWrite;
pub use vmm::Machine;
