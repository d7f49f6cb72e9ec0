//! Code buffers and sections.
//!
//! A [`CodeBuffer`] is the unit of code emission: a fixed tuple of
//! [`CodeSection`]s (instructions, stubs, constants), each an owned byte
//! region with a stable base address, an emission cursor, and a raw
//! relocation stream. Buffers come in two flavors:
//!
//! - **Backed**: sections own their storage; the base address is the real
//!   address of the allocation, so relocation targets written into the
//!   bytes are live process addresses.
//! - **Descriptor-only**: sections carry an address and size but no bytes.
//!   These stand in for a buffer that existed in another process and are
//!   consumed when relocations compute how far each section has moved.

use crate::reloc::{self, RelocType};

// =============================================================================
// Addresses
// =============================================================================

/// A process code address. Targets embedded in instruction streams are
/// absolute little-endian `u64` values of this type.
pub type CodeAddr = u64;

/// The all-ones "no address" pattern. A call site holding this destination
/// needs no cross-process fix-up.
pub const NO_ADDRESS: CodeAddr = u64::MAX;

// =============================================================================
// Sections
// =============================================================================

/// Number of sections in every code buffer.
pub const SECT_COUNT: usize = 3;

/// Identity of a section within a [`CodeBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SectionKind {
    /// Main instruction stream.
    Insts = 0,
    /// Out-of-line stubs (slow paths, trampolines).
    Stubs = 1,
    /// Constant pool.
    Consts = 2,
}

impl SectionKind {
    /// All sections in emission order.
    pub const ALL: [SectionKind; SECT_COUNT] = [
        SectionKind::Insts,
        SectionKind::Stubs,
        SectionKind::Consts,
    ];

    /// Array index of this section.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Inverse of [`SectionKind::index`].
    #[inline]
    pub fn from_index(i: usize) -> SectionKind {
        SectionKind::ALL[i]
    }
}

/// One section of a code buffer.
///
/// Backed sections never reallocate: capacity is fixed at creation so the
/// base address stays valid for the lifetime of the buffer.
#[derive(Debug)]
pub struct CodeSection {
    storage: Option<Box<[u8]>>,
    start: CodeAddr,
    size: usize,
    capacity: usize,
    locs: Vec<u16>,
    locs_point_off: usize,
}

impl CodeSection {
    /// Create an empty, unallocated section.
    pub fn empty() -> Self {
        CodeSection {
            storage: None,
            start: 0,
            size: 0,
            capacity: 0,
            locs: Vec::new(),
            locs_point_off: 0,
        }
    }

    /// Create a backed section with the given fixed capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let storage = vec![0u8; capacity].into_boxed_slice();
        let start = storage.as_ptr() as CodeAddr;
        CodeSection {
            storage: Some(storage),
            start,
            size: 0,
            capacity,
            locs: Vec::new(),
            locs_point_off: 0,
        }
    }

    /// Whether this section owns byte storage.
    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.storage.is_some()
    }

    /// Turn an unallocated section into a descriptor for code that lived at
    /// `origin` with `size` bytes. Panics if the section already has storage.
    pub fn initialize_descriptor(&mut self, origin: CodeAddr, size: usize) {
        assert!(!self.is_allocated(), "section already backed");
        self.start = origin;
        self.size = size;
        self.capacity = size;
    }

    /// Base address of the section.
    #[inline]
    pub fn start(&self) -> CodeAddr {
        self.start
    }

    /// One past the last emitted byte.
    #[inline]
    pub fn end(&self) -> CodeAddr {
        self.start + self.size as CodeAddr
    }

    /// Emitted size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Fixed capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether `addr` falls inside the emitted bytes of this section.
    #[inline]
    pub fn contains(&self, addr: CodeAddr) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Emitted bytes.
    pub fn bytes(&self) -> &[u8] {
        match &self.storage {
            Some(s) => &s[..self.size],
            None => &[],
        }
    }

    /// Mutable view of the emitted bytes.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let size = self.size;
        match &mut self.storage {
            Some(s) => &mut s[..size],
            None => &mut [],
        }
    }

    /// Append raw bytes at the emission cursor. Panics on overflow; callers
    /// size sections up front.
    pub fn emit(&mut self, bytes: &[u8]) {
        let storage = self
            .storage
            .as_mut()
            .expect("emitting into unbacked section");
        assert!(
            self.size + bytes.len() <= self.capacity,
            "section overflow: {} + {} > {}",
            self.size,
            bytes.len(),
            self.capacity
        );
        storage[self.size..self.size + bytes.len()].copy_from_slice(bytes);
        self.size += bytes.len();
    }

    /// Append an absolute address operand.
    pub fn emit_addr(&mut self, addr: CodeAddr) {
        self.emit(&addr.to_le_bytes());
    }

    /// Copy `bytes` to `offset`, leaving the cursor alone.
    pub fn write_bytes_at(&mut self, offset: usize, bytes: &[u8]) {
        let storage = self.storage.as_mut().expect("unbacked section");
        storage[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Read the absolute `u64` operand at `offset`.
    #[inline]
    pub fn read_addr_at(&self, offset: usize) -> CodeAddr {
        let b = &self.storage.as_ref().expect("unbacked section")[offset..offset + 8];
        u64::from_le_bytes(b.try_into().unwrap())
    }

    /// Overwrite the absolute `u64` operand at `offset`.
    #[inline]
    pub fn write_addr_at(&mut self, offset: usize, addr: CodeAddr) {
        self.write_bytes_at(offset, &addr.to_le_bytes());
    }

    /// Move the emission cursor to `end`, which must point into this
    /// section's capacity. Used when code is copied in from outside.
    pub fn set_end(&mut self, end: CodeAddr) {
        assert!(end >= self.start, "end before section start");
        let size = (end - self.start) as usize;
        assert!(size <= self.capacity, "end beyond section capacity");
        self.size = size;
    }

    // -------------------------------------------------------------------------
    // Relocations
    // -------------------------------------------------------------------------

    /// Whether any relocations were recorded.
    #[inline]
    pub fn has_locs(&self) -> bool {
        !self.locs.is_empty()
    }

    /// Number of raw relocation units (including data prefixes).
    #[inline]
    pub fn locs_count(&self) -> usize {
        self.locs.len()
    }

    /// Raw relocation units.
    #[inline]
    pub fn locs(&self) -> &[u16] {
        &self.locs
    }

    /// Mutable raw relocation units. Inline payload data is patched here.
    #[inline]
    pub fn locs_mut(&mut self) -> &mut [u16] {
        &mut self.locs
    }

    /// Offset of the current relocation point (the address the next record's
    /// delta is measured from).
    #[inline]
    pub fn locs_point_off(&self) -> usize {
        self.locs_point_off
    }

    /// Install a raw relocation stream read from elsewhere.
    pub fn set_locs(&mut self, units: Vec<u16>, locs_point_off: usize) {
        self.locs = units;
        self.locs_point_off = locs_point_off;
    }

    /// Record a relocation of `ty` at byte `offset`, with optional inline
    /// data words. Offsets must be recorded in increasing order; the delta
    /// from the previous relocation must fit the record's offset field.
    pub fn add_reloc(&mut self, offset: usize, ty: RelocType, data: &[u16]) {
        assert!(offset >= self.locs_point_off, "relocations out of order");
        let delta = offset - self.locs_point_off;
        assert!(
            delta <= reloc::MAX_OFFSET_DELTA,
            "relocation delta {} too large",
            delta
        );
        if !data.is_empty() {
            assert!(data.len() <= reloc::MAX_OFFSET_DELTA, "reloc data too long");
            self.locs
                .push(reloc::pack(RelocType::DataPrefix, data.len()));
            self.locs.extend_from_slice(data);
        }
        self.locs.push(reloc::pack(ty, delta));
        self.locs_point_off = offset;
    }
}

// =============================================================================
// CodeBuffer
// =============================================================================

/// A named tuple of code sections plus the oop recorder the code's embedded
/// object references index into.
#[derive(Debug)]
pub struct CodeBuffer {
    name: String,
    sections: [CodeSection; SECT_COUNT],
}

impl CodeBuffer {
    /// Create a buffer whose instruction section has `insts_capacity` bytes.
    /// The other sections start unallocated and are sized on demand.
    pub fn with_capacity(name: &str, insts_capacity: usize) -> Self {
        CodeBuffer {
            name: name.to_string(),
            sections: [
                CodeSection::with_capacity(insts_capacity),
                CodeSection::empty(),
                CodeSection::empty(),
            ],
        }
    }

    /// Create a descriptor-only buffer: all sections unallocated. Sections
    /// are filled in with [`CodeSection::initialize_descriptor`].
    pub fn descriptor(name: &str) -> Self {
        CodeBuffer {
            name: name.to_string(),
            sections: [
                CodeSection::empty(),
                CodeSection::empty(),
                CodeSection::empty(),
            ],
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn section(&self, kind: SectionKind) -> &CodeSection {
        &self.sections[kind.index()]
    }

    #[inline]
    pub fn section_mut(&mut self, kind: SectionKind) -> &mut CodeSection {
        &mut self.sections[kind.index()]
    }

    /// Allocate backing storage for a section that is still a placeholder.
    pub fn initialize_section_size(&mut self, kind: SectionKind, size: usize) {
        let cs = self.section_mut(kind);
        assert!(!cs.is_allocated(), "section {:?} already sized", kind);
        *cs = CodeSection::with_capacity(size);
    }

    /// Find the section whose emitted bytes contain `addr`, with the byte
    /// offset of `addr` within it.
    pub fn find_section_containing(&self, addr: CodeAddr) -> Option<(SectionKind, usize)> {
        for kind in SectionKind::ALL {
            let cs = self.section(kind);
            if cs.contains(addr) {
                return Some((kind, (addr - cs.start()) as usize));
            }
        }
        None
    }

    /// Total emitted bytes across all sections.
    pub fn total_size(&self) -> usize {
        self.sections.iter().map(|s| s.size()).sum()
    }

    /// Rewrite every indexed object-reference site from the recorder.
    ///
    /// Sites whose relocation carries a non-zero oop index hold a stale
    /// handle after a cross-process move; the recorder is authoritative.
    pub fn finalize_oop_references(&mut self, recorder: &crate::oop_recorder::OopRecorder) {
        for kind in SectionKind::ALL {
            let cs = self.section_mut(kind);
            if !cs.has_locs() || !cs.is_allocated() {
                continue;
            }
            let units = cs.locs().to_vec();
            let mut iter = reloc::RelocIterator::new(&units);
            let mut patches: Vec<(usize, CodeAddr)> = Vec::new();
            while iter.next() {
                if iter.reloc_type() != RelocType::Oop {
                    continue;
                }
                let index = iter.data().first().copied().unwrap_or(0) as i32;
                if index == 0 {
                    continue; // immediate, already patched during load
                }
                let obj = recorder.oop_at(index);
                patches.push((iter.offset(), obj.handle()));
            }
            for (off, handle) in patches {
                cs.write_addr_at(off, handle);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_emit_and_bounds() {
        let mut cs = CodeSection::with_capacity(16);
        cs.emit(&[1, 2, 3, 4]);
        assert_eq!(cs.size(), 4);
        assert_eq!(cs.bytes(), &[1, 2, 3, 4]);
        assert!(cs.contains(cs.start() + 3));
        assert!(!cs.contains(cs.start() + 4));
    }

    #[test]
    fn section_addr_operands() {
        let mut cs = CodeSection::with_capacity(16);
        cs.emit(&[0x90]);
        cs.emit_addr(0xDEAD_BEEF_u64);
        assert_eq!(cs.read_addr_at(1), 0xDEAD_BEEF);
        cs.write_addr_at(1, 0x1122_3344_5566_7788);
        assert_eq!(cs.read_addr_at(1), 0x1122_3344_5566_7788);
    }

    #[test]
    fn descriptor_sections() {
        let mut buf = CodeBuffer::descriptor("orig");
        buf.section_mut(SectionKind::Insts)
            .initialize_descriptor(0x4000, 32);
        assert_eq!(
            buf.find_section_containing(0x4010),
            Some((SectionKind::Insts, 0x10))
        );
        assert_eq!(buf.find_section_containing(0x4020), None);
    }

    #[test]
    fn reloc_recording_orders_deltas() {
        let mut cs = CodeSection::with_capacity(64);
        cs.emit(&[0; 32]);
        cs.add_reloc(4, RelocType::RuntimeCall, &[]);
        cs.add_reloc(12, RelocType::InternalWord, &[]);
        assert_eq!(cs.locs_count(), 2);
        assert_eq!(cs.locs_point_off(), 12);

        let units = cs.locs().to_vec();
        let mut iter = reloc::RelocIterator::new(&units);
        assert!(iter.next());
        assert_eq!(iter.offset(), 4);
        assert!(iter.next());
        assert_eq!(iter.offset(), 12);
        assert!(!iter.next());
    }
}
