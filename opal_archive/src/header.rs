//! Archive header and entry catalog.
//!
//! The header is a fixed record at offset 0. Entries accumulate in memory
//! during a store run and are flushed, aligned, at finalization; the
//! header is then rewritten with the final counts and offsets. On load the
//! catalog is decoded once from the offsets the header names.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ArchiveError, ArchiveResult, FailureKind};
use crate::io::{Reader, StoreBuffer};

/// Encoded header size in bytes.
pub const HEADER_BYTES: usize = 24;

/// Encoded entry size in bytes.
pub const ENTRY_BYTES: usize = 52;

/// Well-known id of the single exception-blob entry.
pub const EXCEPTION_BLOB_ID: u32 = 999;

// =============================================================================
// Header
// =============================================================================

/// Fixed archive header at offset 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub entries_count: u32,
    pub total_size: u32,
    pub entries_offset: u32,
    pub strings_count: u32,
    pub strings_offset: u32,
}

impl Header {
    /// Initial header of a fresh store-mode archive.
    pub fn initial(version: u32) -> Header {
        Header {
            version,
            entries_count: 0,
            total_size: 0,
            entries_offset: 0,
            strings_count: 0,
            strings_offset: 0,
        }
    }

    pub fn encode(&self, buf: &mut StoreBuffer) -> ArchiveResult<()> {
        buf.write_u32(self.version)?;
        buf.write_u32(self.entries_count)?;
        buf.write_u32(self.total_size)?;
        buf.write_u32(self.entries_offset)?;
        buf.write_u32(self.strings_count)?;
        buf.write_u32(self.strings_offset)?;
        Ok(())
    }

    /// Rewrite an already-encoded header in place.
    pub fn patch(&self, buf: &mut StoreBuffer) {
        buf.patch_u32_at(0, self.version);
        buf.patch_u32_at(4, self.entries_count);
        buf.patch_u32_at(8, self.total_size);
        buf.patch_u32_at(12, self.entries_offset);
        buf.patch_u32_at(16, self.strings_count);
        buf.patch_u32_at(20, self.strings_offset);
    }

    pub fn decode(r: &mut Reader<'_>) -> ArchiveResult<Header> {
        Ok(Header {
            version: r.read_u32()?,
            entries_count: r.read_u32()?,
            total_size: r.read_u32()?,
            entries_offset: r.read_u32()?,
            strings_count: r.read_u32()?,
            strings_offset: r.read_u32()?,
        })
    }
}

// =============================================================================
// Entries
// =============================================================================

/// What an entry archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EntryKind {
    None = 0,
    Stub = 1,
    Blob = 2,
    Code = 3,
}

impl EntryKind {
    pub fn from_u32(v: u32) -> Option<EntryKind> {
        match v {
            0 => Some(EntryKind::None),
            1 => Some(EntryKind::Stub),
            2 => Some(EntryKind::Blob),
            3 => Some(EntryKind::Code),
            _ => None,
        }
    }
}

/// Catalog record of one archived artifact. Offsets of the name, code, and
/// relocation blocks are relative to `offset`.
#[derive(Debug)]
pub struct Entry {
    pub offset: u32,
    pub size: u32,
    pub name_offset: u32,
    pub name_size: u32,
    pub code_offset: u32,
    pub code_size: u32,
    pub reloc_offset: u32,
    pub reloc_size: u32,
    pub kind: EntryKind,
    pub id: u32,
    pub idx: u32,
    pub decompile: u32,
    not_entrant: AtomicBool,
}

impl Entry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        offset: u32,
        size: u32,
        name_offset: u32,
        name_size: u32,
        code_offset: u32,
        code_size: u32,
        reloc_offset: u32,
        reloc_size: u32,
        kind: EntryKind,
        id: u32,
        idx: u32,
        decompile: u32,
    ) -> Entry {
        Entry {
            offset,
            size,
            name_offset,
            name_size,
            code_offset,
            code_size,
            reloc_offset,
            reloc_size,
            kind,
            id,
            idx,
            decompile,
            not_entrant: AtomicBool::new(false),
        }
    }

    /// Whether this entry has been invalidated. Monotone.
    #[inline]
    pub fn not_entrant(&self) -> bool {
        self.not_entrant.load(Ordering::Acquire)
    }

    /// Mark the entry dead for all future lookups.
    #[inline]
    pub fn set_not_entrant(&self) {
        self.not_entrant.store(true, Ordering::Release);
    }

    pub fn encode(&self, buf: &mut StoreBuffer) -> ArchiveResult<()> {
        buf.write_u32(self.offset)?;
        buf.write_u32(self.size)?;
        buf.write_u32(self.name_offset)?;
        buf.write_u32(self.name_size)?;
        buf.write_u32(self.code_offset)?;
        buf.write_u32(self.code_size)?;
        buf.write_u32(self.reloc_offset)?;
        buf.write_u32(self.reloc_size)?;
        buf.write_u32(self.kind as u32)?;
        buf.write_u32(self.id)?;
        buf.write_u32(self.idx)?;
        buf.write_u32(self.decompile)?;
        buf.write_u32(self.not_entrant() as u32)?;
        Ok(())
    }

    pub fn decode(r: &mut Reader<'_>) -> ArchiveResult<Entry> {
        let offset = r.read_u32()?;
        let size = r.read_u32()?;
        let name_offset = r.read_u32()?;
        let name_size = r.read_u32()?;
        let code_offset = r.read_u32()?;
        let code_size = r.read_u32()?;
        let reloc_offset = r.read_u32()?;
        let reloc_size = r.read_u32()?;
        let kind = EntryKind::from_u32(r.read_u32()?).ok_or(ArchiveError::Failed(
            FailureKind::MalformedEntry("unknown entry kind"),
        ))?;
        let id = r.read_u32()?;
        let idx = r.read_u32()?;
        let decompile = r.read_u32()?;
        let not_entrant = r.read_u32()? != 0;
        let entry = Entry::new(
            offset,
            size,
            name_offset,
            name_size,
            code_offset,
            code_size,
            reloc_offset,
            reloc_size,
            kind,
            id,
            idx,
            decompile,
        );
        if not_entrant {
            entry.set_not_entrant();
        }
        Ok(entry)
    }

    /// Validate that every block the entry names lies inside the archive.
    pub fn check_bounds(&self, total_size: u32) -> ArchiveResult<()> {
        let end = self.offset.checked_add(self.size);
        let in_archive = self.offset < total_size && end.is_some_and(|e| e <= total_size);
        let name_ok = self
            .name_offset
            .checked_add(self.name_size)
            .is_some_and(|e| e <= self.size);
        if !in_archive || !name_ok {
            return Err(ArchiveError::Failed(FailureKind::MalformedEntry(
                "entry block out of bounds",
            )));
        }
        Ok(())
    }
}
