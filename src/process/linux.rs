#![cfg(target_os = "linux")]

use crate::error::DumpError;
use crate::process::{MemoryRegion, ProcessMemory, Protection, PROT_EXECUTE, PROT_READ, PROT_WRITE};
use read_process_memory::{CopyAddress, Pid, ProcessHandle};
use std::fs;
use std::io::ErrorKind;

/// `process_vm_readv`-backed access to the target, plus `/proc/pid/maps`
/// for the region listing.
pub(crate) struct Process {
    handle: ProcessHandle,
    pid: Pid,
}

impl Process {
    pub(crate) fn attach(pid: Pid) -> Result<Process, DumpError> {
        let handle =
            ProcessHandle::try_from(pid).map_err(|_| DumpError::PermissionDenied { pid })?;
        log::info!("attached to pid {}", pid);
        Ok(Process { handle, pid })
    }
}

impl ProcessMemory for Process {
    fn read_exact(&self, address: u64, size: u64) -> Result<Vec<u8>, DumpError> {
        let mut buf = vec![0u8; size as usize];
        match self.handle.copy_address(address as usize, &mut buf) {
            Ok(()) => Ok(buf),
            Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                Err(DumpError::PermissionDenied { pid: self.pid })
            }
            Err(err) => Err(DumpError::ReadFailed {
                address,
                reason: err.to_string(),
            }),
        }
    }

    fn regions(&self) -> Result<Box<dyn Iterator<Item = MemoryRegion> + '_>, DumpError> {
        let maps = fs::read_to_string(format!("/proc/{}/maps", self.pid))?;
        let regions: Vec<MemoryRegion> = maps.lines().filter_map(parse_maps_line).collect();
        Ok(Box::new(regions.into_iter()))
    }
}

/// Parse one `/proc/pid/maps` line: `start-end perms offset dev inode path`.
/// The kernel does not expose a separate maximum protection, so both fields
/// report the current one.
fn parse_maps_line(line: &str) -> Option<MemoryRegion> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;

    let (start, end) = range.split_once('-')?;
    let base = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;

    let mut bits = 0;
    if perms.contains('r') {
        bits |= PROT_READ;
    }
    if perms.contains('w') {
        bits |= PROT_WRITE;
    }
    if perms.contains('x') {
        bits |= PROT_EXECUTE;
    }

    Some(MemoryRegion {
        base,
        size: end.checked_sub(base)?,
        protection: Protection(bits),
        max_protection: Protection(bits),
    })
}
