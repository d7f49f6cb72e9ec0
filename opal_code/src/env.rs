//! Per-compilation environment and the artifacts that flow through it.
//!
//! A [`CompileEnv`] carries the state one compilation task accumulates
//! (oop recorder, debug info, dependencies) and receives the finished
//! method through [`CompileEnv::register_method`], whether the code came
//! from the optimizing compiler or was revived from an archive.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::CodeBuffer;
use crate::debug_info::DebugInformationRecorder;
use crate::meta::MethodHandle;
use crate::oop_map::OopMapSet;
use crate::oop_recorder::OopRecorder;
use crate::runtime::OpalRuntime;

/// Entry bci of a normal (non-OSR) compilation request.
pub const INVOCATION_ENTRY_BCI: i32 = -1;

/// Which compiler produced or is requesting code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerKind {
    /// Tier-1 template compiler.
    Baseline,
    /// The optimizing compiler.
    Opto,
}

impl CompilerKind {
    #[inline]
    pub fn is_opto(self) -> bool {
        matches!(self, CompilerKind::Opto)
    }
}

// =============================================================================
// Method-shaped side tables
// =============================================================================

/// Well-known offsets into a compiled method's instruction section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeOffsets {
    pub entry: i32,
    pub verified_entry: i32,
    pub exceptions: i32,
    pub deopt: i32,
    pub deopt_mh: i32,
    pub unwind_handler: i32,
}

impl CodeOffsets {
    /// Number of recorded offsets.
    pub const COUNT: usize = 6;

    pub fn new() -> Self {
        CodeOffsets {
            entry: 0,
            verified_entry: 0,
            exceptions: -1,
            deopt: -1,
            deopt_mh: -1,
            unwind_handler: -1,
        }
    }

    pub fn to_words(&self) -> [i32; Self::COUNT] {
        [
            self.entry,
            self.verified_entry,
            self.exceptions,
            self.deopt,
            self.deopt_mh,
            self.unwind_handler,
        ]
    }

    pub fn from_words(w: [i32; Self::COUNT]) -> Self {
        CodeOffsets {
            entry: w[0],
            verified_entry: w[1],
            exceptions: w[2],
            deopt: w[3],
            deopt_mh: w[4],
            unwind_handler: w[5],
        }
    }
}

impl Default for CodeOffsets {
    fn default() -> Self {
        Self::new()
    }
}

/// Pre-encoded dependency claims of a compilation.
#[derive(Debug, Default, Clone)]
pub struct Dependencies {
    content: Vec<u8>,
}

impl Dependencies {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn size_in_bytes(&self) -> usize {
        self.content.len()
    }

    #[inline]
    pub fn content_bytes(&self) -> &[u8] {
        &self.content
    }

    pub fn set_content(&mut self, bytes: &[u8]) {
        self.content.clear();
        self.content.extend_from_slice(bytes);
    }
}

/// One exception-handler dispatch record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerEntry {
    /// Offset of the throwing pc.
    pub pco: u32,
    /// Offset of the handler.
    pub handler_pco: u32,
    /// Inline depth the handler applies at.
    pub scope_depth: u32,
}

/// Exception-handler dispatch table.
#[derive(Debug, Default, Clone)]
pub struct ExceptionHandlerTable {
    entries: Vec<HandlerEntry>,
}

impl ExceptionHandlerTable {
    /// Size of one encoded entry.
    pub const ENTRY_BYTES: usize = 12;

    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn size_in_bytes(&self) -> usize {
        self.entries.len() * Self::ENTRY_BYTES
    }

    #[inline]
    pub fn entries(&self) -> &[HandlerEntry] {
        &self.entries
    }

    pub fn add(&mut self, entry: HandlerEntry) {
        self.entries.push(entry);
    }
}

/// Implicit-null-check table: pairs of (faulting pc offset, continuation
/// pc offset).
#[derive(Debug, Default, Clone)]
pub struct ImplicitExceptionTable {
    entries: Vec<(u32, u32)>,
}

impl ImplicitExceptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(&mut self, exec_off: u32, cont_off: u32) {
        self.entries.push((exec_off, cont_off));
    }

    #[inline]
    pub fn entries(&self) -> &[(u32, u32)] {
        &self.entries
    }
}

// =============================================================================
// Compile environment
// =============================================================================

/// A method accepted into the runtime, either freshly compiled or revived.
#[derive(Debug)]
pub struct RegisteredMethod {
    pub target: MethodHandle,
    pub entry_bci: i32,
    pub offsets: CodeOffsets,
    pub orig_pc_offset: i32,
    pub code: CodeBuffer,
    pub frame_size: i32,
    pub oop_maps: OopMapSet,
    pub handler_table: ExceptionHandlerTable,
    pub nul_chk_table: ImplicitExceptionTable,
    pub compiler: CompilerKind,
    pub has_unsafe_access: bool,
    pub has_wide_vectors: bool,
    pub has_monitors: bool,
    /// Index of the archive entry this method was revived from, if any.
    pub archive_entry: Option<u32>,
}

/// State of one compilation task.
pub struct CompileEnv {
    runtime: Arc<OpalRuntime>,
    compile_id: i32,
    oop_recorder: Mutex<Option<Arc<OopRecorder>>>,
    debug_info: Mutex<Option<DebugInformationRecorder>>,
    dependencies: Mutex<Option<Dependencies>>,
    registered: Mutex<Option<RegisteredMethod>>,
}

impl CompileEnv {
    pub fn new(runtime: Arc<OpalRuntime>, compile_id: i32) -> Self {
        CompileEnv {
            runtime,
            compile_id,
            oop_recorder: Mutex::new(None),
            debug_info: Mutex::new(None),
            dependencies: Mutex::new(None),
            registered: Mutex::new(None),
        }
    }

    #[inline]
    pub fn runtime(&self) -> &Arc<OpalRuntime> {
        &self.runtime
    }

    #[inline]
    pub fn compile_id(&self) -> i32 {
        self.compile_id
    }

    pub fn set_oop_recorder(&self, recorder: Arc<OopRecorder>) {
        *self.oop_recorder.lock() = Some(recorder);
    }

    pub fn oop_recorder(&self) -> Option<Arc<OopRecorder>> {
        self.oop_recorder.lock().clone()
    }

    pub fn set_debug_info(&self, recorder: DebugInformationRecorder) {
        *self.debug_info.lock() = Some(recorder);
    }

    pub fn take_debug_info(&self) -> Option<DebugInformationRecorder> {
        self.debug_info.lock().take()
    }

    pub fn set_dependencies(&self, deps: Dependencies) {
        *self.dependencies.lock() = Some(deps);
    }

    pub fn take_dependencies(&self) -> Option<Dependencies> {
        self.dependencies.lock().take()
    }

    /// Accept a finished method into the runtime.
    #[allow(clippy::too_many_arguments)]
    pub fn register_method(
        &self,
        target: &MethodHandle,
        entry_bci: i32,
        offsets: CodeOffsets,
        orig_pc_offset: i32,
        code: CodeBuffer,
        frame_size: i32,
        oop_maps: OopMapSet,
        handler_table: ExceptionHandlerTable,
        nul_chk_table: ImplicitExceptionTable,
        compiler: CompilerKind,
        has_unsafe_access: bool,
        has_wide_vectors: bool,
        has_monitors: bool,
        archive_entry: Option<u32>,
    ) {
        *self.registered.lock() = Some(RegisteredMethod {
            target: target.clone(),
            entry_bci,
            offsets,
            orig_pc_offset,
            code,
            frame_size,
            oop_maps,
            handler_table,
            nul_chk_table,
            compiler,
            has_unsafe_access,
            has_wide_vectors,
            has_monitors,
            archive_entry,
        });
    }

    /// The method registered through this environment, if any.
    pub fn take_registered(&self) -> Option<RegisteredMethod> {
        self.registered.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_offsets_word_round_trip() {
        let mut offs = CodeOffsets::new();
        offs.entry = 0;
        offs.verified_entry = 16;
        offs.exceptions = 128;
        assert_eq!(CodeOffsets::from_words(offs.to_words()), offs);
    }

    #[test]
    fn handler_table_sizing() {
        let mut t = ExceptionHandlerTable::new();
        t.add(HandlerEntry {
            pco: 10,
            handler_pco: 90,
            scope_depth: 0,
        });
        t.add(HandlerEntry {
            pco: 30,
            handler_pco: 90,
            scope_depth: 1,
        });
        assert_eq!(t.size_in_bytes(), 2 * ExceptionHandlerTable::ENTRY_BYTES);
    }
}
