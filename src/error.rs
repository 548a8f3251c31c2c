//! Error types for flatvm

use thiserror::Error;

/// Result type alias using the flatvm Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while setting up or running a machine.
///
/// Every setup failure aborts initialization and surfaces here; no
/// partially-initialized handle, VM, or vCPU is ever handed back.
#[derive(Error, Debug)]
pub enum Error {
    /// The hypervisor device could not be opened
    #[error("failed to open /dev/kvm: {0}")]
    KvmOpen(#[source] kvm_ioctls::Error),

    /// The device reported an unsupported API version
    #[error(
        "unsupported KVM API version {found}, expected {}",
        kvm_bindings::KVM_API_VERSION
    )]
    ApiVersion { found: i32 },

    /// VM creation failed
    #[error("failed to create VM: {0}")]
    VmCreate(#[source] kvm_ioctls::Error),

    /// The host mapping backing guest memory could not be established
    #[error("failed to allocate guest memory: {0}")]
    MemoryAllocation(String),

    /// The memory region could not be installed into the VM
    #[error("failed to install guest memory region: {0}")]
    MemoryRegion(#[source] kvm_ioctls::Error),

    /// vCPU creation failed; covers sizing and mapping of the shared run buffer
    #[error("failed to create vCPU: {0}")]
    VcpuCreate(#[source] kvm_ioctls::Error),

    /// Reading vCPU register state failed
    #[error("failed to read vCPU registers: {0}")]
    RegisterRead(#[source] kvm_ioctls::Error),

    /// Writing vCPU register state failed
    #[error("failed to write vCPU registers: {0}")]
    RegisterWrite(#[source] kvm_ioctls::Error),

    /// The run primitive itself failed
    #[error("vCPU run failed: {0}")]
    VcpuRun(#[source] kvm_ioctls::Error),

    /// Reading the guest image from disk failed
    #[error("failed to read guest image: {0}")]
    Image(#[from] std::io::Error),

    /// The guest image does not fit in the installed memory region
    #[error("guest image does not fit in guest memory at offset {offset:#x}")]
    ImageOverflow {
        offset: u64,
        #[source]
        source: vm_memory::GuestMemoryError,
    },

    /// The guest caused an exit this monitor does not service
    #[error("unhandled VM exit: {0}")]
    UnhandledExit(String),

    /// The machine has already been started
    #[error("machine is already running")]
    AlreadyRunning,

    /// A vCPU worker thread failed outside the run loop
    #[error("vCPU thread error: {0}")]
    VcpuThread(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
}
