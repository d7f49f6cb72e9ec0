//! Generated-stub registry and the stub code generator.
//!
//! Stubs are small fixed-purpose pieces of machine code generated at
//! startup (intrinsics, arraycopy variants, barriers). The registry
//! answers "is this address inside generated stub code, and which stub is
//! it" for relocation encoding; the generator owns the buffer stubs are
//! emitted into.

use log::debug;
use parking_lot::RwLock;

use crate::buffer::{CodeAddr, CodeBuffer, CodeSection, SectionKind};

// =============================================================================
// Registry
// =============================================================================

/// One registered stub range.
#[derive(Debug, Clone)]
pub struct StubDesc {
    pub name: String,
    pub begin: CodeAddr,
    pub end: CodeAddr,
}

impl StubDesc {
    #[inline]
    pub fn contains(&self, addr: CodeAddr) -> bool {
        addr >= self.begin && addr < self.end
    }
}

/// Process registry of generated stub ranges.
#[derive(Debug, Default)]
pub struct StubRoutines {
    descs: RwLock<Vec<StubDesc>>,
}

impl StubRoutines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a generated stub's address range.
    pub fn register(&self, name: &str, begin: CodeAddr, end: CodeAddr) {
        debug_assert!(begin <= end);
        debug!(target: "stubs", "Registered stub '{}' [{:#x}, {:#x})", name, begin, end);
        self.descs.write().push(StubDesc {
            name: name.to_string(),
            begin,
            end,
        });
    }

    /// Whether `addr` lies inside any generated stub.
    pub fn contains(&self, addr: CodeAddr) -> bool {
        self.descs.read().iter().any(|d| d.contains(addr))
    }

    /// Descriptor of the stub containing `addr`.
    pub fn desc_for(&self, addr: CodeAddr) -> Option<StubDesc> {
        self.descs.read().iter().find(|d| d.contains(addr)).cloned()
    }
}

// =============================================================================
// Generator
// =============================================================================

/// Owns the code buffer a batch of stubs is generated into. The emission
/// cursor doubles as the current pc.
#[derive(Debug)]
pub struct StubCodeGenerator {
    buffer: CodeBuffer,
}

impl StubCodeGenerator {
    pub fn new(name: &str, capacity: usize) -> Self {
        StubCodeGenerator {
            buffer: CodeBuffer::with_capacity(name, capacity),
        }
    }

    /// Current emission pc.
    #[inline]
    pub fn pc(&self) -> CodeAddr {
        self.buffer.section(SectionKind::Insts).end()
    }

    #[inline]
    pub fn section(&self) -> &CodeSection {
        self.buffer.section(SectionKind::Insts)
    }

    #[inline]
    pub fn section_mut(&mut self) -> &mut CodeSection {
        self.buffer.section_mut(SectionKind::Insts)
    }

    #[inline]
    pub fn buffer(&self) -> &CodeBuffer {
        &self.buffer
    }

    /// Emit raw bytes at the current pc.
    pub fn emit(&mut self, bytes: &[u8]) {
        self.section_mut().emit(bytes);
    }
}
