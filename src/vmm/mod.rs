//! VMM core
//!
//! This module contains the control-plane components:
//! - KVM handle bootstrap and VM creation
//! - Guest memory setup and image loading
//! - vCPU creation, register reset, and the exit-dispatch run loop

pub mod config;
pub mod cpu;
pub mod kvm;
pub mod memory;

use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};

use tracing::{debug, info};
use vm_memory::GuestMemoryMmap;

use crate::{Error, Result};

use self::config::MachineConfig;
use self::cpu::{PortWrite, VcpuHandle};
use self::kvm::{KvmHandle, Vm};

/// A machine instance: one VM, one flat memory region, one vCPU.
///
/// All setup happens on the calling thread; the vCPU run loop executes on
/// its own dedicated worker. Exit diagnostics arrive as message-passed
/// events, which is also the shape a multi-vCPU extension would use to
/// coordinate one worker per vCPU.
pub struct Machine {
    /// The underlying KVM VM and its memory
    vm: Vm,
    /// vCPU worker handles; exactly one after start
    vcpus: Vec<VcpuHandle>,
    /// Sender cloned into each vCPU worker for port-write reports
    port_writes_tx: Sender<PortWrite>,
    /// Receiver for drained port-write reports
    port_writes_rx: Receiver<PortWrite>,
    /// Set once the vCPU has been created
    started: bool,
}

impl Machine {
    /// Open the hypervisor, create the VM, and install guest memory.
    ///
    /// Any setup failure aborts construction; a machine is never returned
    /// in a partially-valid state.
    pub fn new(config: &MachineConfig) -> Result<Self> {
        config.validate()?;

        let handle = KvmHandle::open()?;
        let vm = Vm::new(handle, config.memory_size)?;
        let (port_writes_tx, port_writes_rx) = mpsc::channel();

        Ok(Self {
            vm,
            vcpus: Vec::new(),
            port_writes_tx,
            port_writes_rx,
            started: false,
        })
    }

    /// Load a flat binary into guest memory at guest-physical address 0.
    ///
    /// Only valid before [`Machine::start`]: once the guest runs, the
    /// region is shared with it and host writes are undefined.
    pub fn load_image<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        memory::load_image(self.vm.guest_memory(), path)
    }

    /// Create the vCPU and start its worker thread.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::AlreadyRunning);
        }
        self.started = true;

        let handle = cpu::spawn_vcpu(&self.vm, 0, self.port_writes_tx.clone())?;
        self.vcpus.push(handle);
        debug!("Started {} vCPU worker(s)", self.vcpus.len());

        Ok(())
    }

    /// Wait for every vCPU worker to reach a terminal exit, surfacing the
    /// first failure. Waiting again after the workers are drained is a
    /// no-op.
    pub fn wait(&mut self) -> Result<()> {
        let mut outcome = Ok(());
        for handle in self.vcpus.drain(..) {
            let result = handle.join();
            if outcome.is_ok() {
                outcome = result;
            }
        }
        outcome
    }

    /// Run the machine to completion: start the vCPU, then block until the
    /// guest halts or fails.
    pub fn run(&mut self) -> Result<()> {
        self.start()?;
        self.wait()?;
        info!("Guest halted");
        Ok(())
    }

    /// Drain the port writes reported by the exit dispatcher so far.
    pub fn drain_port_writes(&mut self) -> Vec<PortWrite> {
        let mut writes = Vec::new();
        while let Ok(write) = self.port_writes_rx.try_recv() {
            writes.push(write);
        }
        writes
    }

    /// Guest memory, for read-back and inspection.
    pub fn guest_memory(&self) -> &GuestMemoryMmap {
        self.vm.guest_memory()
    }
}
