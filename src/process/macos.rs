#![cfg(target_os = "macos")]

use crate::error::DumpError;
use crate::process::{MemoryRegion, ProcessMemory, Protection};
use mach2::kern_return::KERN_SUCCESS;
use mach2::message::mach_msg_type_number_t;
use mach2::port::mach_port_t;
use mach2::traps::{mach_task_self, task_for_pid};
use mach2::vm::{mach_vm_read_overwrite, mach_vm_region};
use mach2::vm_region::{vm_region_basic_info_data_64_t, vm_region_info_t, VM_REGION_BASIC_INFO_64};
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};
use read_process_memory::Pid;
use std::mem;
use std::os::raw::c_int;

/// A Mach task port for the target process.
///
/// This is the reason the program must be run as root on macOS; in order to
/// get a task port to a process -- even a child process! -- we must be
/// running as root due to limitations on the `task_for_pid` call. The port
/// goes stale when the target exits; every read after that fails.
pub(crate) struct Process {
    task: mach_port_t,
}

impl Process {
    pub(crate) fn attach(pid: Pid) -> Result<Process, DumpError> {
        let mut task: mach_port_t = 0;
        let kr = unsafe { task_for_pid(mach_task_self(), pid as c_int, &mut task) };
        if kr != KERN_SUCCESS {
            // task_for_pid reports permission problems as a bare failure
            // code, so there is nothing more specific to relay here.
            return Err(DumpError::PermissionDenied { pid });
        }
        log::info!("attached to pid {}", pid);
        Ok(Process { task })
    }
}

impl ProcessMemory for Process {
    fn read_exact(&self, address: u64, size: u64) -> Result<Vec<u8>, DumpError> {
        let mut buf = vec![0u8; size as usize];
        let mut nread: mach_vm_size_t = 0;
        let kr = unsafe {
            mach_vm_read_overwrite(
                self.task,
                address,
                size,
                buf.as_mut_ptr() as mach_vm_address_t,
                &mut nread,
            )
        };
        if kr != KERN_SUCCESS {
            return Err(DumpError::ReadFailed {
                address,
                reason: format!("mach_vm_read_overwrite returned {}", kr),
            });
        }
        if nread != size {
            return Err(DumpError::PartialRead {
                address,
                requested: size,
                got: nread,
            });
        }
        Ok(buf)
    }

    fn regions(&self) -> Result<Box<dyn Iterator<Item = MemoryRegion> + '_>, DumpError> {
        Ok(Box::new(RegionIter {
            task: self.task,
            next: 0,
        }))
    }
}

/// Cursor over `mach_vm_region`. Each step asks the kernel for the region at
/// or above `next` and then advances past its end; the kernel reporting no
/// further region ends the iteration.
struct RegionIter {
    task: mach_port_t,
    next: mach_vm_address_t,
}

impl Iterator for RegionIter {
    type Item = MemoryRegion;

    fn next(&mut self) -> Option<MemoryRegion> {
        let mut address = self.next;
        let mut size: mach_vm_size_t = 0;
        let mut info: vm_region_basic_info_data_64_t = unsafe { mem::zeroed() };
        let mut count = (mem::size_of::<vm_region_basic_info_data_64_t>()
            / mem::size_of::<c_int>()) as mach_msg_type_number_t;
        let mut object_name: mach_port_t = 0;
        let kr = unsafe {
            mach_vm_region(
                self.task,
                &mut address,
                &mut size,
                VM_REGION_BASIC_INFO_64,
                &mut info as *mut vm_region_basic_info_data_64_t as vm_region_info_t,
                &mut count,
                &mut object_name,
            )
        };
        if kr != KERN_SUCCESS {
            return None;
        }
        self.next = address.saturating_add(size);
        Some(MemoryRegion {
            base: address,
            size,
            protection: Protection(info.protection as u32),
            max_protection: Protection(info.max_protection as u32),
        })
    }
}
