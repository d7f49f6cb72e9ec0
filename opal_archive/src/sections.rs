//! Code-section codec.
//!
//! A buffer's sections persist as a fixed-count header array followed by
//! one aligned content block per non-empty section:
//!
//! ```text
//! 3 x { u32 size; u64 origin_address; u32 offset_within_entry }
//! [align] insts bytes
//! [align] stubs bytes
//! [align] consts bytes
//! ```
//!
//! The origin addresses are not used to place code; they populate a
//! descriptor-only replica of the storing process's buffer so relocation
//! fix-up can compute how far each section moved.

use opal_code::{CodeBuffer, SectionKind, SECT_COUNT};

use crate::error::{ArchiveError, ArchiveResult, SkipReason};
use crate::io::{LoadBuffer, Reader, StoreBuffer};

/// Encoded size of one section header record.
const SECTION_HEADER_BYTES: usize = 16;

/// Append `buffer`'s sections. `entry_start` anchors the in-entry offsets.
/// Returns the total size of the block, alignment padding included.
pub fn write_code(
    buf: &mut StoreBuffer,
    buffer: &CodeBuffer,
    entry_start: usize,
) -> ArchiveResult<u32> {
    let block_start = buf.position();
    // Reserve the header array, then back-patch it as blocks land.
    for kind in SectionKind::ALL {
        let cs = buffer.section(kind);
        buf.write_u32(cs.size() as u32)?;
        buf.write_u64(cs.start())?;
        buf.write_u32(0)?; // offset, patched below
    }
    for kind in SectionKind::ALL {
        let cs = buffer.section(kind);
        if cs.is_empty() {
            continue; // skip trivial section
        }
        buf.align_write()?;
        let offset = (buf.position() - entry_start) as u32;
        buf.write_bytes(cs.bytes())?;
        buf.patch_u32_at(
            block_start + kind.index() * SECTION_HEADER_BYTES + 12,
            offset,
        );
    }
    Ok((buf.position() - block_start) as u32)
}

/// Decode sections into `buffer`, and their original placement into the
/// descriptor buffer `orig`. `r` must sit at the section header array.
pub fn read_code(
    r: &mut Reader<'_>,
    archive_buf: &LoadBuffer,
    buffer: &mut CodeBuffer,
    orig: &mut CodeBuffer,
    entry_start: usize,
) -> ArchiveResult<()> {
    let mut headers = [(0u32, 0u64, 0u32); SECT_COUNT];
    for h in headers.iter_mut() {
        *h = (r.read_u32()?, r.read_u64()?, r.read_u32()?);
    }
    for kind in SectionKind::ALL {
        let (size, origin, offset) = headers[kind.index()];
        let size = size as usize;
        if size == 0 {
            continue;
        }
        if kind != SectionKind::Insts {
            buffer.initialize_section_size(kind, size);
        }
        let cs = buffer.section(kind);
        if size > cs.capacity() {
            return Err(ArchiveError::Skip(SkipReason::SectionOverflow {
                size,
                capacity: cs.capacity(),
            }));
        }
        orig.section_mut(kind).initialize_descriptor(origin, size);

        let mut content = archive_buf.reader_at(entry_start + offset as usize)?;
        let bytes = content.read_bytes(size)?;
        buffer.section_mut(kind).emit(bytes);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit_demo_buffer() -> CodeBuffer {
        let mut cb = CodeBuffer::with_capacity("demo", 64);
        cb.section_mut(SectionKind::Insts).emit(&[0xAA; 20]);
        cb.initialize_section_size(SectionKind::Consts, 8);
        cb.section_mut(SectionKind::Consts)
            .emit(&[1, 2, 3, 4, 5, 6, 7, 8]);
        cb
    }

    #[test]
    fn sections_round_trip() {
        let src = emit_demo_buffer();
        let mut buf = StoreBuffer::with_reservation(4096);
        let code_size = write_code(&mut buf, &src, 0).unwrap();
        assert!(code_size as usize >= 28);

        let load = LoadBuffer::from_bytes(buf.as_slice());
        let mut r = load.reader_at(0).unwrap();
        let mut dst = CodeBuffer::with_capacity("demo", code_size as usize);
        let mut orig = CodeBuffer::descriptor("demo");
        read_code(&mut r, &load, &mut dst, &mut orig, 0).unwrap();

        assert_eq!(dst.section(SectionKind::Insts).bytes(), &[0xAA; 20]);
        assert_eq!(
            dst.section(SectionKind::Consts).bytes(),
            &[1, 2, 3, 4, 5, 6, 7, 8]
        );
        assert!(dst.section(SectionKind::Stubs).is_empty());

        // The descriptor buffer mirrors the storing process's placement.
        assert_eq!(
            orig.section(SectionKind::Insts).start(),
            src.section(SectionKind::Insts).start()
        );
        assert_eq!(orig.section(SectionKind::Consts).size(), 8);
        assert!(!orig.section(SectionKind::Insts).is_allocated());
    }

    #[test]
    fn oversized_section_is_artifact_local() {
        let src = emit_demo_buffer();
        let mut buf = StoreBuffer::with_reservation(4096);
        write_code(&mut buf, &src, 0).unwrap();

        let load = LoadBuffer::from_bytes(buf.as_slice());
        let mut r = load.reader_at(0).unwrap();
        // Insts capacity too small for the archived 20 bytes.
        let mut dst = CodeBuffer::with_capacity("demo", 8);
        let mut orig = CodeBuffer::descriptor("demo");
        let err = read_code(&mut r, &load, &mut dst, &mut orig, 0).unwrap_err();
        assert!(!err.is_fatal());
    }
}
