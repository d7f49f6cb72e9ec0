//! Artifact store and load operations.
//!
//! Three artifact shapes, in increasing order of ceremony:
//!
//! - **Stub**: a name and raw code bytes.
//! - **Exception blob**: pc offset, name, code sections, relocations.
//! - **nmethod**: name, flags, frame data, recorder tables, debug info,
//!   dependencies, oop maps, handler tables, code sections, relocations.
//!
//! Every store appends one aligned region and records a catalog entry; a
//! store that fails partway rewinds to the region start and records
//! nothing. Every load verifies the stored name before touching caller
//! state, and maps failures onto the archive's two failure bits.

use log::{info, warn};

use opal_code::debug_info::{DebugInformationRecorder, PcDesc, PC_DESC_BYTES};
use opal_code::env::{
    CompileEnv, CompilerKind, CodeOffsets, Dependencies, ExceptionHandlerTable, HandlerEntry,
    ImplicitExceptionTable, INVOCATION_ENTRY_BCI,
};
use opal_code::meta::MethodHandle;
use opal_code::oop_map::{OopMap, OopMapSet};
use opal_code::oop_recorder::OopRecorder;
use opal_code::stubs::StubCodeGenerator;
use opal_code::{CodeAddr, CodeBuffer};

use std::sync::Arc;

use crate::archive::{CodeArchive, EntryHandle};
use crate::error::{ArchiveError, ArchiveResult, FailureKind};
use crate::header::{Entry, EntryKind, EXCEPTION_BLOB_ID};
use crate::io::Reader;
use crate::meta;
use crate::relocs;
use crate::sections;

/// 31-based string hash keying nmethod entries by qualified name.
pub fn java_hash(bytes: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &b in bytes {
        h = h.wrapping_mul(31).wrapping_add(b as u32);
    }
    h
}

/// Everything `store_nmethod` persists about one compiled method.
pub struct NMethodRecord<'a> {
    pub method: &'a MethodHandle,
    pub compile_id: i32,
    pub entry_bci: i32,
    pub offsets: &'a CodeOffsets,
    pub orig_pc_offset: i32,
    pub recorder: &'a DebugInformationRecorder,
    pub dependencies: &'a Dependencies,
    pub buffer: &'a CodeBuffer,
    pub oop_recorder: &'a OopRecorder,
    pub frame_size: i32,
    pub oop_maps: &'a OopMapSet,
    pub handler_table: &'a ExceptionHandlerTable,
    pub nul_chk_table: &'a ImplicitExceptionTable,
    pub compiler: CompilerKind,
    pub has_unsafe_access: bool,
    pub has_wide_vectors: bool,
    pub has_monitors: bool,
}

impl CodeArchive {
    // =========================================================================
    // Stubs
    // =========================================================================

    /// Archive the stub `[start, cgen.pc())` under `id`.
    pub fn store_stub(
        &self,
        cgen: &StubCodeGenerator,
        id: u32,
        name: &str,
        start: CodeAddr,
    ) -> bool {
        if !self.for_write() {
            return false;
        }
        self.clear_lookup_failed();
        match self.store_stub_impl(cgen, id, name, start) {
            Ok(()) => {
                info!(target: "sca", "Wrote stub '{}' id:{} to shared code archive '{}'", name, id, self.path().display());
                true
            }
            Err(e) => {
                self.note_error("stub store", e);
                false
            }
        }
    }

    fn store_stub_impl(
        &self,
        cgen: &StubCodeGenerator,
        id: u32,
        name: &str,
        start: CodeAddr,
    ) -> ArchiveResult<()> {
        let store = self.store_state().expect("write-mode archive");
        let mut st = store.lock();
        let rollback = st.buf.position();
        let result = (|| -> ArchiveResult<Entry> {
            st.buf.align_write()?;
            let entry_position = st.buf.position();

            let name_size = st.buf.write_name(name)?;
            st.buf.align_write()?;

            let code_offset = st.buf.position() - entry_position;
            let section = cgen.section();
            let begin = (start - section.start()) as usize;
            let code = &section.bytes()[begin..];
            st.buf.write_bytes(code)?;

            let size = st.buf.position() - entry_position;
            Ok(Entry::new(
                entry_position as u32,
                size as u32,
                0,
                name_size as u32,
                code_offset as u32,
                code.len() as u32,
                0,
                0,
                EntryKind::Stub,
                id,
                st.entries.len() as u32,
                0,
            ))
        })();
        match result {
            Ok(entry) => {
                st.entries.push(entry);
                Ok(())
            }
            Err(e) => {
                st.buf.truncate_to(rollback);
                Err(e)
            }
        }
    }

    /// Revive the stub archived under `id` into `cgen` at `start`. The
    /// generator's section end advances past the copied bytes.
    pub fn load_stub(
        &self,
        cgen: &mut StubCodeGenerator,
        id: u32,
        name: &str,
        start: CodeAddr,
    ) -> bool {
        let _mark = match self.begin_read() {
            Some(m) => m,
            None => return false,
        };
        self.clear_lookup_failed();
        match self.load_stub_impl(cgen, id, name, start) {
            Ok(found) => found,
            Err(e) => {
                self.note_error("stub load", e);
                false
            }
        }
    }

    fn load_stub_impl(
        &self,
        cgen: &mut StubCodeGenerator,
        id: u32,
        name: &str,
        start: CodeAddr,
    ) -> ArchiveResult<bool> {
        let state = self.load_state().expect("read-mode archive");
        let entry = match self.find_entry(EntryKind::Stub, id, 0) {
            Some(e) => e,
            None => return Ok(false),
        };
        let entry_position = entry.offset as usize;

        let mut r = state
            .buf
            .reader_at(entry_position + entry.name_offset as usize)?;
        let saved_name = r.read_name(entry.name_size as usize)?;
        if saved_name != name.as_bytes() {
            warn!(
                target: "sca",
                "Saved stub's name '{}' is different from '{}' for id:{}",
                String::from_utf8_lossy(saved_name),
                name,
                id
            );
            return Err(ArchiveError::Failed(FailureKind::NameMismatch {
                expected: name.to_string(),
                found: String::from_utf8_lossy(saved_name).into_owned(),
            }));
        }

        let mut r = state
            .buf
            .reader_at(entry_position + entry.code_offset as usize)?;
        let code = r.read_bytes(entry.code_size as usize)?;
        let section = cgen.section_mut();
        let begin = (start - section.start()) as usize;
        section.write_bytes_at(begin, code);
        section.set_end(start + code.len() as CodeAddr);

        info!(target: "sca", "Read stub '{}' id:{} from shared code archive '{}'", name, id, self.path().display());
        Ok(true)
    }

    // =========================================================================
    // Exception blob
    // =========================================================================

    /// Archive the exception blob with its handler pc offset.
    pub fn store_exception_blob(&self, buffer: &CodeBuffer, pc_offset: i32) -> bool {
        if !self.for_write() {
            return false;
        }
        self.clear_lookup_failed();
        match self.store_blob_impl(buffer, pc_offset) {
            Ok(()) => {
                info!(target: "sca", "Wrote blob '{}' to shared code archive '{}'", buffer.name(), self.path().display());
                true
            }
            Err(e) => {
                self.note_error("blob store", e);
                false
            }
        }
    }

    fn store_blob_impl(&self, buffer: &CodeBuffer, pc_offset: i32) -> ArchiveResult<()> {
        let store = self.store_state().expect("write-mode archive");
        let mut st = store.lock();
        let rollback = st.buf.position();
        let result = (|| -> ArchiveResult<Entry> {
            st.buf.align_write()?;
            let entry_position = st.buf.position();

            st.buf.write_i32(pc_offset)?;

            let name_offset = st.buf.position() - entry_position;
            let name_size = st.buf.write_name(buffer.name())?;
            st.buf.align_write()?;

            let code_offset = st.buf.position() - entry_position;
            let code_size = sections::write_code(&mut st.buf, buffer, entry_position)?;

            let reloc_offset = st.buf.position() - entry_position;
            let reloc_size =
                relocs::write_relocations(&mut st.buf, self.table(), self.runtime(), buffer)?;

            let size = st.buf.position() - entry_position;
            Ok(Entry::new(
                entry_position as u32,
                size as u32,
                name_offset as u32,
                name_size as u32,
                code_offset as u32,
                code_size,
                reloc_offset as u32,
                reloc_size,
                EntryKind::Blob,
                EXCEPTION_BLOB_ID,
                st.entries.len() as u32,
                0,
            ))
        })();
        match result {
            Ok(entry) => {
                st.entries.push(entry);
                Ok(())
            }
            Err(e) => {
                st.buf.truncate_to(rollback);
                Err(e)
            }
        }
    }

    /// Revive the exception blob into `buffer`, writing the archived pc
    /// offset through `pc_offset`.
    pub fn load_exception_blob(&self, buffer: &mut CodeBuffer, pc_offset: &mut i32) -> bool {
        let _mark = match self.begin_read() {
            Some(m) => m,
            None => return false,
        };
        self.clear_lookup_failed();
        match self.load_blob_impl(buffer, pc_offset) {
            Ok(found) => found,
            Err(e) => {
                self.note_error("blob load", e);
                false
            }
        }
    }

    fn load_blob_impl(&self, buffer: &mut CodeBuffer, pc_offset: &mut i32) -> ArchiveResult<bool> {
        let state = self.load_state().expect("read-mode archive");
        let entry = match self.find_entry(EntryKind::Blob, EXCEPTION_BLOB_ID, 0) {
            Some(e) => e,
            None => return Ok(false),
        };
        let entry_position = entry.offset as usize;

        let mut r = state.buf.reader_at(entry_position)?;
        let saved_pc_offset = r.read_i32()?;

        let mut r = state
            .buf
            .reader_at(entry_position + entry.name_offset as usize)?;
        let saved_name = r.read_name(entry.name_size as usize)?;
        if saved_name != buffer.name().as_bytes() {
            warn!(
                target: "sca",
                "Saved blob's name '{}' is different from '{}'",
                String::from_utf8_lossy(saved_name),
                buffer.name()
            );
            return Err(ArchiveError::Failed(FailureKind::NameMismatch {
                expected: buffer.name().to_string(),
                found: String::from_utf8_lossy(saved_name).into_owned(),
            }));
        }

        let mut orig = CodeBuffer::descriptor(buffer.name());
        let mut r = state
            .buf
            .reader_at(entry_position + entry.code_offset as usize)?;
        sections::read_code(&mut r, &state.buf, buffer, &mut orig, entry_position)?;

        let scratch_recorder = OopRecorder::new();
        let mut r = state
            .buf
            .reader_at(entry_position + entry.reloc_offset as usize)?;
        relocs::read_relocations(
            &mut r,
            self.table(),
            self.runtime(),
            buffer,
            &orig,
            &scratch_recorder,
            None,
        )?;

        *pc_offset = saved_pc_offset;
        info!(target: "sca", "Read blob '{}' from shared code archive '{}'", buffer.name(), self.path().display());
        Ok(true)
    }

    // =========================================================================
    // nmethods
    // =========================================================================

    /// Archive a compiled method. Gated to non-OSR code from the
    /// optimizing compiler; anything else reports failure and compiles
    /// normally. Returns a handle for later invalidation.
    pub fn store_nmethod(&self, record: &NMethodRecord<'_>) -> Option<EntryHandle> {
        if record.entry_bci != INVOCATION_ENTRY_BCI {
            return None; // no OSR entries
        }
        if !record.compiler.is_opto() {
            return None;
        }
        if !self.for_write() {
            return None;
        }
        if !self.table().opto_complete() {
            warn!(target: "sca", "Address table missing the optimizing-compiler phase; not storing");
            return None;
        }
        self.clear_lookup_failed();
        let name = record.method.name_and_sig();
        match self.store_nmethod_impl(record, &name) {
            Ok(handle) => {
                info!(target: "sca", "Wrote nmethod '{}' to shared code archive '{}'", name, self.path().display());
                Some(handle)
            }
            Err(e) => {
                self.note_error("nmethod store", e);
                None
            }
        }
    }

    fn store_nmethod_impl(
        &self,
        record: &NMethodRecord<'_>,
        name: &str,
    ) -> ArchiveResult<EntryHandle> {
        let store = self.store_state().expect("write-mode archive");
        let mut st = store.lock();
        let rollback = st.buf.position();
        let result = (|| -> ArchiveResult<Entry> {
            st.buf.align_write()?;
            let entry_position = st.buf.position();

            let name_size = st.buf.write_name(name)?;
            st.buf.align_write()?;

            let code_offset = st.buf.position() - entry_position;

            let flags = ((record.has_unsafe_access as i32) << 16)
                | ((record.has_wide_vectors as i32) << 8)
                | (record.has_monitors as i32);
            st.buf.write_i32(flags)?;
            st.buf.write_i32(record.orig_pc_offset)?;
            st.buf.write_i32(record.frame_size)?;
            for w in record.offsets.to_words() {
                st.buf.write_i32(w)?;
            }

            meta::write_oops(&mut st.buf, record.oop_recorder)?;
            meta::write_metadata(&mut st.buf, record.oop_recorder)?;

            // Debug info: stream then pc descriptors.
            st.buf.write_i32(record.recorder.data_size() as i32)?;
            st.buf.write_i32(record.recorder.pcs_length() as i32)?;
            st.buf.write_bytes(record.recorder.stream())?;
            for pc in record.recorder.pcs() {
                st.buf.write_bytes(&pc.encode())?;
            }

            st.buf.align_write()?;
            st.buf
                .write_i32(record.dependencies.size_in_bytes() as i32)?;
            st.buf.write_bytes(record.dependencies.content_bytes())?;

            write_oop_maps(&mut st.buf, record.oop_maps)?;

            st.buf.write_i32(record.handler_table.len() as i32)?;
            for h in record.handler_table.entries() {
                st.buf.write_u32(h.pco)?;
                st.buf.write_u32(h.handler_pco)?;
                st.buf.write_u32(h.scope_depth)?;
            }

            st.buf.write_i32(record.nul_chk_table.len() as i32)?;
            for &(exec_off, cont_off) in record.nul_chk_table.entries() {
                st.buf.write_u32(exec_off)?;
                st.buf.write_u32(cont_off)?;
            }

            st.buf.align_write()?;
            let code_size = sections::write_code(&mut st.buf, record.buffer, entry_position)?;

            let reloc_offset = st.buf.position() - entry_position;
            let reloc_size = relocs::write_relocations(
                &mut st.buf,
                self.table(),
                self.runtime(),
                record.buffer,
            )?;

            let size = st.buf.position() - entry_position;
            Ok(Entry::new(
                entry_position as u32,
                size as u32,
                0,
                name_size as u32,
                code_offset as u32,
                code_size,
                reloc_offset as u32,
                reloc_size,
                EntryKind::Code,
                java_hash(name.as_bytes()),
                st.entries.len() as u32,
                record.method.decompile_count(),
            ))
        })();
        match result {
            Ok(entry) => {
                let handle = EntryHandle(entry.idx);
                st.entries.push(entry);
                Ok(handle)
            }
            Err(e) => {
                st.buf.truncate_to(rollback);
                Err(e)
            }
        }
    }

    /// Revive a compiled method for `target` and hand it to
    /// `env.register_method`. In verify mode the decode runs fully but the
    /// caller is told to compile fresh.
    pub fn load_nmethod(
        &self,
        env: &CompileEnv,
        target: &MethodHandle,
        entry_bci: i32,
        compiler: CompilerKind,
    ) -> bool {
        if entry_bci != INVOCATION_ENTRY_BCI {
            return false; // no OSR entries
        }
        if !compiler.is_opto() {
            return false;
        }
        let _mark = match self.begin_read() {
            Some(m) => m,
            None => return false,
        };
        if !self.table().opto_complete() {
            warn!(target: "sca", "Address table missing the optimizing-compiler phase; not loading");
            return false;
        }
        self.clear_lookup_failed();
        match self.load_nmethod_impl(env, target, entry_bci, compiler) {
            Ok(found) => found,
            Err(e) => {
                self.note_error("nmethod load", e);
                false
            }
        }
    }

    fn load_nmethod_impl(
        &self,
        env: &CompileEnv,
        target: &MethodHandle,
        entry_bci: i32,
        compiler: CompilerKind,
    ) -> ArchiveResult<bool> {
        let state = self.load_state().expect("read-mode archive");
        let name = target.name_and_sig();
        let id = java_hash(name.as_bytes());
        let decompile = target.decompile_count();
        let entry = match self.find_entry(EntryKind::Code, id, decompile) {
            Some(e) => e,
            None => return Ok(false),
        };
        let entry_position = entry.offset as usize;

        let mut r = state
            .buf
            .reader_at(entry_position + entry.name_offset as usize)?;
        let saved_name = r.read_name(entry.name_size as usize)?;
        if saved_name != name.as_bytes() {
            warn!(
                target: "sca",
                "Saved nmethod's name '{}' is different from '{}'",
                String::from_utf8_lossy(saved_name),
                name
            );
            return Err(ArchiveError::Failed(FailureKind::NameMismatch {
                expected: name,
                found: String::from_utf8_lossy(saved_name).into_owned(),
            }));
        }

        let mut r = state
            .buf
            .reader_at(entry_position + entry.code_offset as usize)?;
        let flags = r.read_i32()?;
        let has_monitors = (flags & 0xFF) != 0;
        let has_wide_vectors = ((flags >> 8) & 0xFF) != 0;
        let has_unsafe_access = ((flags >> 16) & 0xFF) != 0;
        let orig_pc_offset = r.read_i32()?;
        let frame_size = r.read_i32()?;
        let mut offset_words = [0i32; CodeOffsets::COUNT];
        for w in offset_words.iter_mut() {
            *w = r.read_i32()?;
        }
        let offsets = CodeOffsets::from_words(offset_words);

        let oop_recorder = Arc::new(OopRecorder::new());
        env.set_oop_recorder(oop_recorder.clone());
        meta::read_oops(&mut r, self.runtime(), &oop_recorder, target)?;
        meta::read_metadata(&mut r, self.runtime(), &oop_recorder, target)?;

        let data_size = r.read_i32()? as usize;
        let pcs_length = r.read_i32()? as usize;
        let stream = r.read_bytes(data_size)?.to_vec();
        let mut pcs = Vec::with_capacity(pcs_length);
        for _ in 0..pcs_length {
            pcs.push(PcDesc::decode(r.read_bytes(PC_DESC_BYTES)?));
        }
        env.set_debug_info(DebugInformationRecorder::from_parts(
            oop_recorder.clone(),
            stream,
            pcs,
        ));

        r.align()?;
        let dependencies_size = r.read_i32()? as usize;
        let mut dependencies = Dependencies::new();
        if dependencies_size > 0 {
            dependencies.set_content(r.read_bytes(dependencies_size)?);
        }
        env.set_dependencies(dependencies);

        let oop_maps = read_oop_maps(&mut r)?;

        let exc_table_length = r.read_i32()? as usize;
        let mut handler_table = ExceptionHandlerTable::new();
        for _ in 0..exc_table_length {
            handler_table.add(HandlerEntry {
                pco: r.read_u32()?,
                handler_pco: r.read_u32()?,
                scope_depth: r.read_u32()?,
            });
        }

        let nul_chk_length = r.read_i32()? as usize;
        let mut nul_chk_table = ImplicitExceptionTable::new();
        for _ in 0..nul_chk_length {
            let exec_off = r.read_u32()?;
            let cont_off = r.read_u32()?;
            nul_chk_table.append(exec_off, cont_off);
        }

        r.align()?;
        let mut buffer = CodeBuffer::with_capacity(&name, entry.code_size as usize);
        let mut orig = CodeBuffer::descriptor(&name);
        sections::read_code(&mut r, &state.buf, &mut buffer, &mut orig, entry_position)?;

        let mut r = state
            .buf
            .reader_at(entry_position + entry.reloc_offset as usize)?;
        relocs::read_relocations(
            &mut r,
            self.table(),
            self.runtime(),
            &mut buffer,
            &orig,
            &oop_recorder,
            Some(target),
        )?;

        buffer.finalize_oop_references(&oop_recorder);

        info!(target: "sca", "Read nmethod '{}' from shared code archive '{}'", name, self.path().display());
        if self.verify() {
            info!(target: "sca", "Verified nmethod '{}'; compiling fresh", name);
            return Ok(false);
        }

        env.register_method(
            target,
            entry_bci,
            offsets,
            orig_pc_offset,
            buffer,
            frame_size,
            oop_maps,
            handler_table,
            nul_chk_table,
            compiler,
            has_unsafe_access,
            has_wide_vectors,
            has_monitors,
            Some(entry.idx),
        );
        Ok(true)
    }
}

// =============================================================================
// Oop-map wire form
// =============================================================================

fn write_oop_maps(
    buf: &mut crate::io::StoreBuffer,
    oop_maps: &OopMapSet,
) -> ArchiveResult<()> {
    buf.write_i32(oop_maps.len() as i32)?;
    for map in oop_maps.maps() {
        buf.write_i32(map.pc_offset())?;
        buf.write_u32(map.count())?;
        buf.write_i32(map.data_size() as i32)?;
        buf.write_bytes(map.data())?;
    }
    Ok(())
}

fn read_oop_maps(r: &mut Reader<'_>) -> ArchiveResult<OopMapSet> {
    let count = r.read_i32()? as usize;
    let mut set = OopMapSet::new();
    for _ in 0..count {
        let pc_offset = r.read_i32()?;
        let slots = r.read_u32()?;
        let data_size = r.read_i32()? as usize;
        let data = r.read_bytes(data_size)?;
        set.add(OopMap::from_parts(pc_offset, slots, data));
    }
    Ok(set)
}
