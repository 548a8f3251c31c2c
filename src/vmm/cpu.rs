//! vCPU lifecycle: creation, register reset, and the run loop

use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};

use byteorder::{ByteOrder, LittleEndian};
use kvm_bindings::kvm_regs;
use kvm_ioctls::{VcpuExit, VcpuFd};
use tracing::{debug, error, info, trace};
use vm_memory::Address;

use crate::vmm::kvm::{layout, Vm};
use crate::{Error, Result};

/// Architecturally required reserved bit in RFLAGS; always set
const RFLAGS_RESERVED: u64 = 0x2;

/// A port write observed on a VM exit.
///
/// Diagnostic only: there are no registered device handlers. Routing these
/// events to real device models is the extension point for port I/O
/// emulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortWrite {
    /// I/O port the guest wrote to
    pub port: u16,
    /// Value written, decoded little-endian
    pub value: u32,
    /// Access width in bytes
    pub width: usize,
}

/// What the dispatcher decided after one VM exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitDisposition {
    /// Re-enter the guest
    Resume,
    /// Guest executed a halt; the run loop is done
    Halt,
}

/// Handle to a running vCPU worker thread.
pub struct VcpuHandle {
    thread: JoinHandle<Result<()>>,
    id: u64,
}

impl VcpuHandle {
    /// Wait for the vCPU worker to finish and surface its outcome.
    pub fn join(self) -> Result<()> {
        self.thread
            .join()
            .map_err(|_| Error::VcpuThread(format!("vCPU {} thread panicked", self.id)))?
    }
}

/// Create a vCPU and start its dedicated worker thread.
///
/// The worker resets registers exactly once before the first run call, then
/// drives the run loop until a terminal exit. A run-loop failure terminates
/// only this vCPU's worker; the caller observes it on join.
pub fn spawn_vcpu(vm: &Vm, vcpu_id: u64, port_writes: Sender<PortWrite>) -> Result<VcpuHandle> {
    let vcpu_fd = vm.create_vcpu(vcpu_id)?;
    debug!("Created vCPU {}", vcpu_id);

    let thread = thread::Builder::new()
        .name(format!("vcpu-{}", vcpu_id))
        .spawn(move || {
            reset_vcpu(&vcpu_fd)?;
            run_loop(vcpu_fd, vcpu_id, &port_writes)
        })
        .map_err(|e| Error::VcpuThread(format!("failed to spawn vCPU thread: {}", e)))?;

    Ok(VcpuHandle {
        thread,
        id: vcpu_id,
    })
}

/// Reset vCPU registers so execution starts at guest-physical address 0.
///
/// The code-segment base and selector are both zeroed, RFLAGS is set to the
/// reserved bit pattern, and RIP to 0. Runs exactly once, on the worker
/// thread, before the first run call.
pub fn reset_vcpu(vcpu_fd: &VcpuFd) -> Result<()> {
    let mut sregs = vcpu_fd.get_sregs().map_err(Error::RegisterRead)?;
    sregs.cs.base = 0;
    sregs.cs.selector = 0;
    vcpu_fd.set_sregs(&sregs).map_err(Error::RegisterWrite)?;

    let mut regs = kvm_regs::default();
    regs.rflags = RFLAGS_RESERVED;
    regs.rip = layout::RAM_START.raw_value();
    vcpu_fd.set_regs(&regs).map_err(Error::RegisterWrite)?;
    debug!(
        "Reset vCPU registers: RIP={:#x}, RFLAGS={:#x}",
        regs.rip, regs.rflags
    );

    Ok(())
}

/// Drive the blocking run primitive until a terminal exit.
///
/// The run call is the sole suspension point: the thread blocks in the
/// kernel until the guest causes an exit. `EINTR` is retried; any other run
/// failure ends the worker.
fn run_loop(mut vcpu_fd: VcpuFd, vcpu_id: u64, port_writes: &Sender<PortWrite>) -> Result<()> {
    debug!("vCPU {} entering run loop", vcpu_id);

    loop {
        match vcpu_fd.run() {
            Ok(exit) => match dispatch_exit(vcpu_id, exit, port_writes)? {
                ExitDisposition::Resume => {}
                ExitDisposition::Halt => {
                    debug!("vCPU {} halted", vcpu_id);
                    return Ok(());
                }
            },
            Err(e) if e.errno() == libc::EINTR => continue,
            Err(e) => {
                error!("vCPU {} run failed: {}", vcpu_id, e);
                return Err(Error::VcpuRun(e));
            }
        }
    }
}

/// Interpret one VM exit.
///
/// Port output is decoded and reported; halt ends the loop. Every other
/// reason is a terminal error, never a silent re-enter.
fn dispatch_exit(
    vcpu_id: u64,
    exit: VcpuExit<'_>,
    port_writes: &Sender<PortWrite>,
) -> Result<ExitDisposition> {
    match exit {
        VcpuExit::IoOut(port, data) => {
            let value = decode_port_value(data);
            info!(
                "vCPU {} port write: port={:#x}, value={}",
                vcpu_id, port, value
            );
            let _ = port_writes.send(PortWrite {
                port,
                value,
                width: data.len(),
            });
            Ok(ExitDisposition::Resume)
        }
        VcpuExit::IoIn(port, data) => {
            trace!(
                "vCPU {} port read: port={:#x}, len={}",
                vcpu_id,
                port,
                data.len()
            );
            data.iter_mut().for_each(|b| *b = 0);
            Ok(ExitDisposition::Resume)
        }
        VcpuExit::Hlt => Ok(ExitDisposition::Halt),
        VcpuExit::FailEntry(reason, cpu) => {
            error!(
                "vCPU {} hardware entry failure: {:#x} (cpu {})",
                vcpu_id, reason, cpu
            );
            Err(Error::UnhandledExit(format!(
                "hardware entry failure {:#x}",
                reason
            )))
        }
        VcpuExit::InternalError => {
            error!("vCPU {} internal error", vcpu_id);
            Err(Error::UnhandledExit("internal error".into()))
        }
        VcpuExit::Shutdown => Err(Error::UnhandledExit("guest shutdown".into())),
        exit => Err(Error::UnhandledExit(format!("{:?}", exit))),
    }
}

/// Decode the fixed-width little-endian value carried by a port-output exit.
fn decode_port_value(data: &[u8]) -> u32 {
    match data.len() {
        0 => 0,
        1 => u32::from(data[0]),
        2 => u32::from(LittleEndian::read_u16(data)),
        4 => LittleEndian::read_u32(data),
        n => LittleEndian::read_uint(data, n.min(4)) as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmm::kvm::KvmHandle;
    use std::sync::mpsc;

    #[test]
    fn test_dispatch_reports_four_byte_port_write() {
        let (tx, rx) = mpsc::channel();
        let data = 42u32.to_le_bytes();

        let disposition = dispatch_exit(0, VcpuExit::IoOut(0x10, &data), &tx).unwrap();
        assert_eq!(disposition, ExitDisposition::Resume);
        assert_eq!(
            rx.try_recv().unwrap(),
            PortWrite {
                port: 0x10,
                value: 42,
                width: 4,
            }
        );
    }

    #[test]
    fn test_decode_widths() {
        assert_eq!(decode_port_value(&[0xab]), 0xab);
        assert_eq!(decode_port_value(&[0x34, 0x12]), 0x1234);
        assert_eq!(decode_port_value(&[0x78, 0x56, 0x34, 0x12]), 0x1234_5678);
    }

    #[test]
    fn test_dispatch_halt_terminates_without_reporting() {
        let (tx, rx) = mpsc::channel();
        assert_eq!(
            dispatch_exit(0, VcpuExit::Hlt, &tx).unwrap(),
            ExitDisposition::Halt
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_zero_fills_port_reads() {
        let (tx, _rx) = mpsc::channel::<PortWrite>();
        let mut data = [0xffu8; 2];

        let disposition = dispatch_exit(0, VcpuExit::IoIn(0x3f8, &mut data), &tx).unwrap();
        assert_eq!(disposition, ExitDisposition::Resume);
        assert_eq!(data, [0, 0]);
    }

    #[test]
    fn test_dispatch_unknown_exit_is_an_error() {
        let (tx, _rx) = mpsc::channel::<PortWrite>();
        match dispatch_exit(0, VcpuExit::Shutdown, &tx) {
            Err(Error::UnhandledExit(_)) => {}
            other => panic!("expected UnhandledExit, got {:?}", other),
        }
    }

    #[test]
    #[ignore = "requires /dev/kvm"]
    fn test_reset_puts_execution_at_address_zero() {
        let handle = KvmHandle::open().expect("failed to open /dev/kvm");
        let vm = Vm::new(handle, 16 * 1024 * 1024).expect("failed to create VM");
        let vcpu_fd = vm.create_vcpu(0).expect("failed to create vCPU");

        reset_vcpu(&vcpu_fd).expect("reset failed");

        let regs = vcpu_fd.get_regs().expect("failed to read registers");
        assert_eq!(regs.rip, 0);
        assert_eq!(regs.rflags, RFLAGS_RESERVED);

        let sregs = vcpu_fd.get_sregs().expect("failed to read special registers");
        assert_eq!(sregs.cs.base, 0);
        assert_eq!(sregs.cs.selector, 0);
    }
}
