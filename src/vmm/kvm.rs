//! KVM handle bootstrap and VM setup

use kvm_bindings::{kvm_userspace_memory_region, KVM_API_VERSION};
use kvm_ioctls::{Kvm, VcpuFd, VmFd};
use tracing::debug;
use vm_memory::{Address, GuestMemory, GuestMemoryMmap, GuestMemoryRegion};

use crate::{Error, Result};

/// Guest memory layout constants
pub mod layout {
    use vm_memory::GuestAddress;

    /// Start of guest RAM; images are loaded and execution begins here
    pub const RAM_START: GuestAddress = GuestAddress(0);

    /// Default guest memory size in bytes
    pub const DEFAULT_MEMORY_SIZE: u64 = 512_000_000;

    /// Memory slot for the single RAM region. Only one slot is used; more
    /// regions would require slot allocation that does not exist here.
    pub const RAM_SLOT: u32 = 0;

    /// Historical code-start offset. Defined alongside the rest of the
    /// layout but never applied: images are loaded, and the vCPU starts,
    /// at address 0.
    pub const CODE_START: GuestAddress = GuestAddress(0x1000);

    /// Chunk size for streaming a guest image into memory
    pub const IMAGE_CHUNK_SIZE: usize = 4096;
}

/// Handle to the hypervisor device, validated against the supported API
/// version at construction.
pub struct KvmHandle {
    kvm: Kvm,
}

impl KvmHandle {
    /// Open /dev/kvm (read-write, close-on-exec) and check the API version.
    ///
    /// The reported version must equal `KVM_API_VERSION` exactly; anything
    /// else fails construction, so an open handle is always a valid one.
    pub fn open() -> Result<Self> {
        let kvm = Kvm::new().map_err(Error::KvmOpen)?;

        let version = kvm.get_api_version();
        if version != KVM_API_VERSION as i32 {
            return Err(Error::ApiVersion { found: version });
        }
        debug!("KVM API version: {}", version);

        Ok(Self { kvm })
    }
}

/// A KVM virtual machine with a single flat memory region at
/// guest-physical address 0.
pub struct Vm {
    /// KVM system handle; stays open for the life of the VM
    kvm: KvmHandle,
    /// VM file descriptor
    vm_fd: VmFd,
    /// Guest memory mapping
    guest_memory: GuestMemoryMmap,
    /// Memory size in bytes
    memory_size: u64,
}

impl Vm {
    /// Create a VM with `memory_size` bytes of guest RAM.
    pub fn new(handle: KvmHandle, memory_size: u64) -> Result<Self> {
        let vm_fd = handle.kvm.create_vm().map_err(Error::VmCreate)?;
        debug!("Created KVM VM");

        let guest_memory = Self::create_guest_memory(memory_size)?;
        debug!("Created guest memory: {} bytes", memory_size);

        let vm = Self {
            kvm: handle,
            vm_fd,
            guest_memory,
            memory_size,
        };
        vm.register_memory()?;

        Ok(vm)
    }

    /// Create the anonymous, zero-initialized host mapping backing guest RAM.
    fn create_guest_memory(memory_size: u64) -> Result<GuestMemoryMmap> {
        let size = usize::try_from(memory_size).map_err(|_| {
            Error::MemoryAllocation(format!("memory size {} does not fit in usize", memory_size))
        })?;

        GuestMemoryMmap::from_ranges(&[(layout::RAM_START, size)])
            .map_err(|e| Error::MemoryAllocation(format!("failed to create guest memory: {}", e)))
    }

    /// Register the memory region with KVM: slot 0, no flags, guest-physical
    /// base 0, backed by the mapped host address.
    fn register_memory(&self) -> Result<()> {
        for (slot, region) in self.guest_memory.iter().enumerate() {
            let memory_region = kvm_userspace_memory_region {
                slot: layout::RAM_SLOT + slot as u32,
                guest_phys_addr: region.start_addr().raw_value(),
                memory_size: region.len(),
                userspace_addr: self
                    .guest_memory
                    .get_host_address(region.start_addr())
                    .unwrap() as u64,
                flags: 0,
            };

            // SAFETY: the mapping stays valid for the lifetime of the VM,
            // which owns it.
            unsafe {
                self.vm_fd
                    .set_user_memory_region(memory_region)
                    .map_err(Error::MemoryRegion)?;
            }

            debug!(
                "Registered memory region {}: addr={:#x}, size={:#x}",
                memory_region.slot,
                region.start_addr().raw_value(),
                region.len()
            );
        }

        Ok(())
    }

    /// Get reference to the KVM handle
    pub fn kvm(&self) -> &KvmHandle {
        &self.kvm
    }

    /// Get reference to guest memory
    pub fn guest_memory(&self) -> &GuestMemoryMmap {
        &self.guest_memory
    }

    /// Get memory size in bytes
    pub fn memory_size(&self) -> u64 {
        self.memory_size
    }

    /// Create a vCPU for this VM. kvm-ioctls sizes and maps the
    /// kernel-shared run buffer as part of creation.
    pub fn create_vcpu(&self, id: u64) -> Result<VcpuFd> {
        self.vm_fd.create_vcpu(id).map_err(Error::VcpuCreate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_constants() {
        assert_eq!(layout::RAM_START.raw_value(), 0);
        assert_eq!(layout::RAM_SLOT, 0);
        // CODE_START is kept in the layout but not used as a load offset;
        // it must at least fall inside default guest memory.
        assert!(layout::CODE_START.raw_value() < layout::DEFAULT_MEMORY_SIZE);
    }

    #[test]
    #[ignore = "requires /dev/kvm"]
    fn test_open_validates_api_version() {
        KvmHandle::open().expect("KVM handle should open with a supported API version");
    }

    #[test]
    #[ignore = "requires /dev/kvm"]
    fn test_create_vm() {
        let handle = KvmHandle::open().expect("failed to open /dev/kvm");
        let vm = Vm::new(handle, 64 * 1024 * 1024).expect("failed to create VM");
        assert_eq!(vm.memory_size(), 64 * 1024 * 1024);
    }

    #[test]
    #[ignore = "requires /dev/kvm"]
    fn test_zero_memory_fails_allocation() {
        let handle = KvmHandle::open().expect("failed to open /dev/kvm");
        match Vm::new(handle, 0) {
            Err(Error::MemoryAllocation(_)) => {}
            Ok(_) => panic!("VM creation succeeded with zero memory"),
            Err(other) => panic!("expected MemoryAllocation, got {}", other),
        }
    }
}
