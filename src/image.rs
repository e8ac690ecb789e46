//! Rebuilding an on-disk Mach-O image from a live mapping, and finding the
//! main executable image when no address was given.

use crate::error::DumpError;
use crate::macho::{self, RawHeader};
use crate::process::ProcessMemory;

/// The ASLR displacement between where the image is mapped and where it was
/// linked to load, taken from the `__TEXT` segment. Recomputed for every
/// reconstruction; never shared between calls or processes.
pub(crate) fn compute_slide(live_base: u64, text_vmaddr: u64) -> i64 {
    live_base.wrapping_sub(text_vmaddr) as i64
}

fn apply_slide(vmaddr: u64, slide: i64) -> u64 {
    vmaddr.wrapping_add(slide as u64)
}

/// Rebuild the on-disk byte image of the Mach-O mapped at `base`.
///
/// Each segment contributes exactly its `filesize` bytes in load-command
/// order; `__PAGEZERO` contributes nothing and the page-alignment slack in
/// `vmsize` is never copied, so the result matches the file the loader
/// mapped. Any failed read or parse aborts the whole reconstruction; a
/// partial image is never returned.
pub(crate) fn reconstruct<P: ProcessMemory>(process: &P, base: u64) -> Result<Vec<u8>, DumpError> {
    let header = RawHeader::parse(&process.read_exact(base, macho::HEADER_PROBE_SIZE)?)?;
    let table = process.read_exact(
        base + header.command_table_offset(),
        u64::from(header.sizeofcmds),
    )?;
    let commands = macho::walk_commands(&table, header.ncmds)?;
    if commands.total_file_size == 0 {
        return Err(DumpError::MalformedLoadCommands {
            reason: "no segment contributes any on-disk bytes".into(),
        });
    }

    let slide = commands
        .text_vmaddr
        .map_or(0, |vmaddr| compute_slide(base, vmaddr));
    log::debug!("image at {:#x} slides by {:#x}", base, slide);

    let mut image = Vec::with_capacity(commands.total_file_size as usize);
    for segment in &commands.segments {
        if segment.is_pagezero() {
            continue;
        }
        let address = apply_slide(segment.vmaddr, slide);
        log::debug!(
            "dumping {} at {:#x} ({:#x} bytes)",
            segment.name_lossy(),
            address,
            segment.filesize
        );
        image.extend_from_slice(&process.read_exact(address, segment.filesize)?);
    }
    Ok(image)
}

/// Scan the process's regions for the main executable image and return its
/// base address.
///
/// Regions whose leading bytes do not parse as a Mach-O header are skipped
/// without error; the first region marked `MH_EXECUTE` wins and the scan
/// stops there. A process is assumed to map exactly one such image; if
/// several exist the later ones are never considered, and none at all is
/// `NotFound`.
pub(crate) fn locate_main_image<P: ProcessMemory>(process: &P) -> Result<u64, DumpError> {
    for region in process.regions()? {
        let Ok(bytes) = process.read_exact(region.base, macho::HEADER_PROBE_SIZE) else {
            continue;
        };
        let Ok(header) = RawHeader::parse(&bytes) else {
            continue;
        };
        if header.is_main_executable() {
            log::debug!("main executable image found at {:#x}", region.base);
            return Ok(region.base);
        }
    }
    Err(DumpError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::testing::{image64, seg64};
    use crate::macho::MH_EXECUTE;
    use crate::process::{MemoryRegion, Protection};
    use std::cell::RefCell;

    const MH_DYLIB: u32 = 0x6;

    /// An address space made of spans of bytes, recording every read issued
    /// against it. Reads crossing a span boundary come back short, like
    /// `mach_vm_read_overwrite` against a partially unmapped range.
    struct FakeProcess {
        spans: Vec<(u64, Vec<u8>)>,
        regions: Vec<MemoryRegion>,
        reads: RefCell<Vec<(u64, u64)>>,
    }

    impl FakeProcess {
        fn new() -> FakeProcess {
            FakeProcess {
                spans: Vec::new(),
                regions: Vec::new(),
                reads: RefCell::new(Vec::new()),
            }
        }

        fn map(&mut self, base: u64, bytes: Vec<u8>) {
            self.regions.push(MemoryRegion {
                base,
                size: bytes.len() as u64,
                protection: Protection(5),
                max_protection: Protection(7),
            });
            self.spans.push((base, bytes));
        }
    }

    impl ProcessMemory for FakeProcess {
        fn read_exact(&self, address: u64, size: u64) -> Result<Vec<u8>, DumpError> {
            self.reads.borrow_mut().push((address, size));
            let span = self
                .spans
                .iter()
                .find(|(base, bytes)| {
                    address >= *base && address < *base + bytes.len() as u64
                })
                .ok_or_else(|| DumpError::ReadFailed {
                    address,
                    reason: "unmapped".into(),
                })?;
            let offset = (address - span.0) as usize;
            let available = (span.1.len() - offset) as u64;
            if available < size {
                return Err(DumpError::PartialRead {
                    address,
                    requested: size,
                    got: available,
                });
            }
            Ok(span.1[offset..offset + size as usize].to_vec())
        }

        fn regions(&self) -> Result<Box<dyn Iterator<Item = MemoryRegion> + '_>, DumpError> {
            Ok(Box::new(self.regions.clone().into_iter()))
        }
    }

    /// A three-segment image mapped at `live_base`. As in a real mapping,
    /// the header sits at the start of `__TEXT`, so with `__TEXT` linked at
    /// vmaddr 0x1000 the slide is `live_base - 0x1000` and `__DATA` (vmaddr
    /// 0x4000) lands at `live_base + 0x3000`.
    fn scenario_process(live_base: u64) -> FakeProcess {
        let mut process = FakeProcess::new();
        let mut text = image64(
            MH_EXECUTE,
            &[
                seg64(b"__PAGEZERO", 0x0, 0),
                seg64(b"__TEXT", 0x1000, 0x2000),
                seg64(b"__DATA", 0x4000, 0x1000),
            ],
        );
        text.resize(0x2000, 0xaa);
        process.map(live_base, text);
        process.map(live_base + 0x3000, vec![0xbb; 0x1000]);
        process
    }

    #[test]
    fn slide_is_base_minus_text_vmaddr() {
        assert_eq!(compute_slide(0x10_0000, 0x1000), 0xff000);
        // images can slide down as well
        assert_eq!(compute_slide(0x1000, 0x4000), -0x3000);
        assert_eq!(apply_slide(0x4000, -0x3000), 0x1000);
    }

    #[test]
    fn reconstructs_segments_at_slid_addresses() {
        let process = scenario_process(0x10_0000);
        let image = reconstruct(&process, 0x10_0000).unwrap();

        assert_eq!(image.len(), 0x3000);
        // __TEXT opens with the header itself, then the 0xaa fill
        assert_eq!(image[..4], crate::macho::MH_MAGIC_64.to_ne_bytes());
        assert!(image[0x100..0x2000].iter().all(|&b| b == 0xaa));
        assert!(image[0x2000..].iter().all(|&b| b == 0xbb));

        let reads = process.reads.borrow();
        // header, command table, then one exact-size read per mapped
        // segment at its slid address (slide = 0x100000 - 0x1000 = 0xff000)
        assert_eq!(reads[reads.len() - 2], (0x10_0000, 0x2000));
        assert_eq!(reads[reads.len() - 1], (0x10_3000, 0x1000));
    }

    #[test]
    fn reconstruction_is_slide_invariant() {
        let a = reconstruct(&scenario_process(0x10_0000), 0x10_0000).unwrap();
        let b = reconstruct(&scenario_process(0x7fff_0000), 0x7fff_0000).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn pagezero_contributes_no_bytes_and_no_reads() {
        let process = scenario_process(0x10_0000);
        reconstruct(&process, 0x10_0000).unwrap();
        let reads = process.reads.borrow();
        // __PAGEZERO's vmaddr is 0; nothing may touch the slid address 0xff000
        assert!(reads.iter().all(|&(addr, _)| addr != 0xff000));
    }

    #[test]
    fn short_segment_read_fails_without_output() {
        let mut process = FakeProcess::new();
        let mut text = image64(MH_EXECUTE, &[seg64(b"__TEXT", 0x1000, 0x2000)]);
        // only half of __TEXT is actually mapped
        text.resize(0x1000, 0xaa);
        process.map(0x10_0000, text);

        match reconstruct(&process, 0x10_0000) {
            Err(DumpError::PartialRead { requested, got, .. }) => {
                assert_eq!(requested, 0x2000);
                assert_eq!(got, 0x1000);
            }
            other => panic!("expected PartialRead, got {:?}", other),
        }
    }

    #[test]
    fn reconstruct_rejects_non_images() {
        let mut process = FakeProcess::new();
        process.map(0x1000, vec![0x90; 64]);
        assert!(matches!(
            reconstruct(&process, 0x1000),
            Err(DumpError::NotAnImage { .. })
        ));
    }

    #[test]
    fn reconstruct_rejects_images_with_no_disk_bytes() {
        let mut process = FakeProcess::new();
        let header = image64(MH_EXECUTE, &[seg64(b"__PAGEZERO", 0x0, 0)]);
        process.map(0x1000, header);
        assert!(matches!(
            reconstruct(&process, 0x1000),
            Err(DumpError::MalformedLoadCommands { .. })
        ));
    }

    #[test]
    fn locates_the_main_image_among_regions() {
        let mut process = FakeProcess::new();
        // first region is not an image, second is the main executable,
        // third is a library that must never be reached
        process.map(0x1000, vec![0u8; 0x100]);
        process.map(0x10_0000, image64(MH_EXECUTE, &[seg64(b"__TEXT", 0x1000, 0x40)]));
        process.map(0x20_0000, image64(MH_DYLIB, &[seg64(b"__TEXT", 0x1000, 0x40)]));

        assert_eq!(locate_main_image(&process).unwrap(), 0x10_0000);
    }

    #[test]
    fn locate_skips_libraries_and_unreadable_regions() {
        let mut process = FakeProcess::new();
        process.map(0x1000, image64(MH_DYLIB, &[]));
        // a region whose header read comes back short
        process.map(0x2000, vec![0u8; 8]);
        process.map(0x30_0000, image64(MH_EXECUTE, &[]));

        assert_eq!(locate_main_image(&process).unwrap(), 0x30_0000);
    }

    #[test]
    fn locate_reports_not_found_when_exhausted() {
        let mut process = FakeProcess::new();
        process.map(0x1000, image64(MH_DYLIB, &[]));
        process.map(0x2000, vec![0u8; 0x100]);
        assert!(matches!(
            locate_main_image(&process),
            Err(DumpError::NotFound)
        ));
    }
}
