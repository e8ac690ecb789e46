//! Mach-O header and load-command decoding, straight off the raw bytes read
//! out of the target process. Only the pieces needed to rebuild an on-disk
//! image are decoded: the fixed header and the two segment-command kinds.
//! Every other load command is skipped by its declared size.

use crate::error::DumpError;
use std::borrow::Cow;
use std::mem;
use zerocopy::{AsBytes, FromBytes};

pub(crate) const MH_MAGIC: u32 = 0xfeed_face;
pub(crate) const MH_MAGIC_64: u32 = 0xfeed_facf;

pub(crate) const MH_EXECUTE: u32 = 0x2;

pub(crate) const LC_SEGMENT: u32 = 0x1;
pub(crate) const LC_SEGMENT_64: u32 = 0x19;

pub(crate) const SEG_TEXT: &[u8; 16] = b"__TEXT\0\0\0\0\0\0\0\0\0\0";
pub(crate) const SEG_PAGEZERO: &[u8; 16] = b"__PAGEZERO\0\0\0\0\0\0";

/// The fields shared by `mach_header` and `mach_header_64`; the 64-bit
/// variant only appends a reserved word, which matters solely for where the
/// load commands start.
#[derive(Debug, Clone, Copy, FromBytes, AsBytes)]
#[repr(C)]
pub(crate) struct RawHeader {
    pub(crate) magic: u32,
    pub(crate) cputype: u32,
    pub(crate) cpusubtype: u32,
    pub(crate) filetype: u32,
    pub(crate) ncmds: u32,
    pub(crate) sizeofcmds: u32,
    pub(crate) flags: u32,
}

pub(crate) const HEADER_PROBE_SIZE: u64 = mem::size_of::<RawHeader>() as u64;

impl RawHeader {
    /// Decode a header from leading bytes, rejecting anything whose magic is
    /// neither recognized value.
    pub(crate) fn parse(bytes: &[u8]) -> Result<RawHeader, DumpError> {
        let header = RawHeader::read_from_prefix(bytes).ok_or(DumpError::NotAnImage {
            magic: bytes
                .get(..4)
                .map_or(0, |b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
        })?;
        match header.magic {
            MH_MAGIC | MH_MAGIC_64 => Ok(header),
            magic => Err(DumpError::NotAnImage { magic }),
        }
    }

    pub(crate) fn is_64bit(&self) -> bool {
        self.magic == MH_MAGIC_64
    }

    /// Byte offset of the first load command relative to the image base.
    pub(crate) fn command_table_offset(&self) -> u64 {
        if self.is_64bit() {
            32
        } else {
            28
        }
    }

    pub(crate) fn is_main_executable(&self) -> bool {
        self.filetype == MH_EXECUTE
    }
}

/// The common 8-byte prefix of every load command.
#[derive(Debug, Clone, Copy, FromBytes, AsBytes)]
#[repr(C)]
struct LoadCommand {
    cmd: u32,
    cmdsize: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, AsBytes)]
#[repr(C)]
pub(crate) struct SegmentCommand32 {
    pub(crate) cmd: u32,
    pub(crate) cmdsize: u32,
    pub(crate) segname: [u8; 16],
    pub(crate) vmaddr: u32,
    pub(crate) vmsize: u32,
    pub(crate) fileoff: u32,
    pub(crate) filesize: u32,
    pub(crate) maxprot: u32,
    pub(crate) initprot: u32,
    pub(crate) nsects: u32,
    pub(crate) flags: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, AsBytes)]
#[repr(C)]
pub(crate) struct SegmentCommand64 {
    pub(crate) cmd: u32,
    pub(crate) cmdsize: u32,
    pub(crate) segname: [u8; 16],
    pub(crate) vmaddr: u64,
    pub(crate) vmsize: u64,
    pub(crate) fileoff: u64,
    pub(crate) filesize: u64,
    pub(crate) maxprot: u32,
    pub(crate) initprot: u32,
    pub(crate) nsects: u32,
    pub(crate) flags: u32,
}

const _: () = assert!(mem::size_of::<RawHeader>() == 28);
const _: () = assert!(mem::size_of::<SegmentCommand32>() == 56);
const _: () = assert!(mem::size_of::<SegmentCommand64>() == 72);

/// One segment as the loader sees it: a 16-byte name compared by exact byte
/// match, the link-time virtual address, and the number of bytes the segment
/// occupies on disk (alignment slack in `vmsize` is deliberately dropped).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentDescriptor {
    pub(crate) name: [u8; 16],
    pub(crate) vmaddr: u64,
    pub(crate) filesize: u64,
}

impl SegmentDescriptor {
    pub(crate) fn is_pagezero(&self) -> bool {
        &self.name == SEG_PAGEZERO
    }

    pub(crate) fn is_text(&self) -> bool {
        &self.name == SEG_TEXT
    }

    pub(crate) fn name_lossy(&self) -> Cow<'_, str> {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(16);
        String::from_utf8_lossy(&self.name[..end])
    }
}

/// Everything the walk learned in one pass: the segments in load-command
/// order (`__PAGEZERO` included, so reconstruction can skip it in place),
/// the `__TEXT` link-time address for slide computation, and the total
/// on-disk size excluding `__PAGEZERO`.
#[derive(Debug)]
pub(crate) struct CommandTable {
    pub(crate) segments: Vec<SegmentDescriptor>,
    pub(crate) text_vmaddr: Option<u64>,
    pub(crate) total_file_size: u64,
}

/// Walk a raw load-command table of `ncmds` records.
///
/// Each record declares its own size. A declared size of zero would loop
/// forever, and one shorter than the command prefix or past the end of the
/// table would walk out of bounds, so those are rejected instead of walked.
pub(crate) fn walk_commands(table: &[u8], ncmds: u32) -> Result<CommandTable, DumpError> {
    let mut cursor = table;
    let mut segments = Vec::new();
    let mut text_vmaddr = None;
    let mut total_file_size: u64 = 0;

    let malformed = |reason: String| DumpError::MalformedLoadCommands { reason };

    for index in 0..ncmds {
        let lc = LoadCommand::read_from_prefix(cursor)
            .ok_or_else(|| malformed(format!("command {} truncated", index)))?;
        let cmdsize = lc.cmdsize as usize;
        if cmdsize < mem::size_of::<LoadCommand>() {
            return Err(malformed(format!(
                "command {} declares size {}, below the {}-byte minimum",
                index,
                cmdsize,
                mem::size_of::<LoadCommand>()
            )));
        }
        if cmdsize > cursor.len() {
            return Err(malformed(format!(
                "command {} declares size {} with only {} bytes left in the table",
                index,
                cmdsize,
                cursor.len()
            )));
        }

        let record = &cursor[..cmdsize];
        let segment = match lc.cmd {
            LC_SEGMENT => SegmentCommand32::read_from_prefix(record)
                .map(|seg| SegmentDescriptor {
                    name: seg.segname,
                    vmaddr: u64::from(seg.vmaddr),
                    filesize: u64::from(seg.filesize),
                })
                .map(Some)
                .ok_or_else(|| malformed(format!("segment command {} too short", index)))?,
            LC_SEGMENT_64 => SegmentCommand64::read_from_prefix(record)
                .map(|seg| SegmentDescriptor {
                    name: seg.segname,
                    vmaddr: seg.vmaddr,
                    filesize: seg.filesize,
                })
                .map(Some)
                .ok_or_else(|| malformed(format!("segment command {} too short", index)))?,
            // every other command kind is opaque here; its declared size is
            // all we use
            _ => None,
        };

        if let Some(segment) = segment {
            if !segment.is_pagezero() {
                if segment.is_text() {
                    text_vmaddr = Some(segment.vmaddr);
                }
                total_file_size = total_file_size
                    .checked_add(segment.filesize)
                    .ok_or_else(|| malformed(format!("segment sizes overflow at command {}", index)))?;
            }
            log::trace!(
                "segment {} vmaddr {:#x} filesize {:#x}",
                segment.name_lossy(),
                segment.vmaddr,
                segment.filesize
            );
            segments.push(segment);
        }

        cursor = &cursor[cmdsize..];
    }

    Ok(CommandTable {
        segments,
        text_vmaddr,
        total_file_size,
    })
}
