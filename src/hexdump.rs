//! Hex/ASCII console rendering of a read buffer.

use crate::process::Protection;
use std::io::{self, Write};

/// Render `data` as 16-byte rows: row start address, two-digit lowercase hex
/// bytes (blank-padded so the ASCII column stays aligned on a short final
/// row), and the printable-ASCII view with '.' for everything else.
///
/// The protection pair is printed once, ahead of the first row. It describes
/// the region containing the start address only; a read spanning several
/// regions still reports just that first one.
pub(crate) fn render<W: Write>(
    out: &mut W,
    start: u64,
    data: &[u8],
    protection: Option<(Protection, Protection)>,
) -> io::Result<()> {
    if let Some((current, max)) = protection {
        writeln!(out, "Memory protection: {}/{}\n", current, max)?;
    }
    for (row, chunk) in data.chunks(16).enumerate() {
        write!(out, "{:#x} ", start + row as u64 * 16)?;
        for byte in chunk {
            write!(out, "{:02x} ", byte)?;
        }
        for _ in chunk.len()..16 {
            write!(out, "   ")?;
        }
        for &byte in chunk {
            let c = if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '.'
            };
            write!(out, "{}", c)?;
        }
        writeln!(out)?;
    }
    Ok(())
}
