//! Compiled-method round trips: recorder tables, debug info, oop maps,
//! handler tables, code sections, and the full relocation fix-up set.

use std::path::PathBuf;
use std::sync::Arc;

use opal_archive::archive::{CodeArchive, EntryHandle};
use opal_archive::header::EntryKind;
use opal_archive::store::{java_hash, NMethodRecord};
use opal_code::code_cache::CodeBlob;
use opal_code::debug_info::{DebugInformationRecorder, PcDesc};
use opal_code::env::{
    CompileEnv, CompilerKind, CodeOffsets, Dependencies, ExceptionHandlerTable, HandlerEntry,
    ImplicitExceptionTable, INVOCATION_ENTRY_BCI,
};
use opal_code::linker::StaticLinker;
use opal_code::meta::{LoaderId, MetadataRef, MethodHandle};
use opal_code::oop_map::{OopMap, OopMapSet};
use opal_code::oop_recorder::OopRecorder;
use opal_code::reloc::{self, RelocType};
use opal_code::{CodeBuffer, OpalRuntime, SectionKind, NO_ADDRESS};

const ANCHOR: u64 = 0x4000_0000;
const ARRAYCOPY_STUB: u64 = 0x2000;
const DEOPT_BLOB: u64 = 0x3000;
const UNCOMMON_TRAP_BLOB: u64 = 0x3080;
const SLOW_PATH_EXTR: u64 = 0x5000;
const FMT_AREA: u64 = ANCHOR + 0x5000;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn archive_path(tag: &str) -> PathBuf {
    let path =
        std::env::temp_dir().join(format!("opal_sca_nm_{}_{}.bin", tag, std::process::id()));
    let _ = std::fs::remove_file(&path);
    path
}

/// A runtime with the full complement of relocation targets plus the
/// `demo/Calc.sum(II)I` method under compilation.
fn test_runtime() -> (Arc<OpalRuntime>, MethodHandle) {
    let linker = StaticLinker::new();
    linker.register("fmt_area", FMT_AREA, 0x100);
    let rt = OpalRuntime::new(Box::new(linker), ANCHOR);
    rt.stub_routines()
        .register("arraycopy", ARRAYCOPY_STUB, 0x100);
    rt.code_cache()
        .register_blob(CodeBlob::new("shared_blobs", DEOPT_BLOB, 0x100, DEOPT_BLOB));
    let k = rt.define_class("demo/Calc", LoaderId::System, None);
    let m = rt.define_method(&k, "sum", "(II)I");
    (rt, m)
}

fn init_table(archive: &CodeArchive) {
    archive
        .table()
        .init_base(&[SLOW_PATH_EXTR], &[ARRAYCOPY_STUB], &[DEOPT_BLOB]);
    archive.table().init_opto(&[UNCOMMON_TRAP_BLOB]);
}

/// Eight relocation sites, one per interesting shape, each an 8-byte
/// absolute operand.
fn build_code(rt: &OpalRuntime, recorder: &OopRecorder) -> CodeBuffer {
    let mirror = {
        let k = rt
            .dictionary()
            .find_instance_or_array_klass(&rt.symbols().intern(b"demo/Calc"), LoaderId::Null, None)
            .unwrap();
        rt.java_mirror(&k)
    };
    let mirror_index = recorder.find_index(&mirror);
    assert_eq!(mirror_index, 1);

    let pi = rt.intern_string("pi");

    let mut cb = CodeBuffer::with_capacity("sum", 256);
    cb.initialize_section_size(SectionKind::Consts, 16);
    cb.section_mut(SectionKind::Consts).emit(&[0x55; 16]);
    let consts_start = cb.section(SectionKind::Consts).start();

    let method_handle = {
        let k = rt
            .dictionary()
            .find_instance_or_array_klass(&rt.symbols().intern(b"demo/Calc"), LoaderId::Null, None)
            .unwrap();
        let m = k
            .find_method(&rt.symbols().intern(b"sum"), &rt.symbols().intern(b"(II)I"))
            .unwrap();
        MetadataRef::Method(m).handle()
    };

    let insts = cb.section_mut(SectionKind::Insts);
    // 0: call into a registered stub
    insts.emit_addr(ARRAYCOPY_STUB);
    insts.add_reloc(0, RelocType::RuntimeCall, &[]);
    // 8: call that needs no fix-up
    insts.emit_addr(NO_ADDRESS);
    insts.add_reloc(8, RelocType::RuntimeCall, &[]);
    // 16: external word resolved by anchor distance
    insts.emit_addr(FMT_AREA + 0x10);
    insts.add_reloc(16, RelocType::ExternalWord, &[]);
    // 24: word into the constant pool
    insts.emit_addr(consts_start + 4);
    insts.add_reloc(24, RelocType::InternalWord, &[]);
    // 32: immediate oop (interned string)
    insts.emit_addr(pi.handle());
    insts.add_reloc(32, RelocType::Oop, &[0]);
    // 40: indexed oop (class mirror through the recorder)
    insts.emit_addr(mirror.handle());
    insts.add_reloc(40, RelocType::Oop, &[mirror_index as u16]);
    // 48: immediate metadata (the method itself)
    insts.emit_addr(method_handle);
    insts.add_reloc(48, RelocType::Metadata, &[0]);
    // 56: external word with the target packed inline
    insts.emit_addr(0);
    insts.add_reloc(56, RelocType::ExternalWord, &reloc::pack_addr(SLOW_PATH_EXTR));
    cb
}

fn build_debug_info(recorder: &Arc<OopRecorder>) -> DebugInformationRecorder {
    let mut di = DebugInformationRecorder::new(recorder.clone());
    di.append_stream(&[9, 8, 7, 6, 5]);
    di.add_pc_desc(PcDesc {
        pc_offset: 0,
        scope_decode_offset: 0,
        obj_decode_offset: -1,
        flags: 0,
    });
    di.add_pc_desc(PcDesc {
        pc_offset: 16,
        scope_decode_offset: 3,
        obj_decode_offset: -1,
        flags: 1,
    });
    di
}

fn build_oop_maps() -> OopMapSet {
    let mut maps = OopMapSet::new();
    let mut m = OopMap::new(0x10);
    m.set_oop(2);
    m.set_oop(5);
    maps.add(m);
    maps
}

/// Store `demo/Calc.sum` and return the entry handle.
fn store_sum(archive: &CodeArchive, rt: &Arc<OpalRuntime>, method: &MethodHandle) -> EntryHandle {
    let oop_recorder = Arc::new(OopRecorder::new());
    let buffer = build_code(rt, &oop_recorder);
    let recorder = build_debug_info(&oop_recorder);
    let mut dependencies = Dependencies::new();
    dependencies.set_content(&[0xD0, 0xD1, 0xD2]);
    let oop_maps = build_oop_maps();
    let mut handler_table = ExceptionHandlerTable::new();
    handler_table.add(HandlerEntry {
        pco: 20,
        handler_pco: 60,
        scope_depth: 0,
    });
    let mut nul_chk_table = ImplicitExceptionTable::new();
    nul_chk_table.append(12, 40);

    let mut offsets = CodeOffsets::new();
    offsets.entry = 0;
    offsets.verified_entry = 8;
    offsets.exceptions = 48;

    let record = NMethodRecord {
        method,
        compile_id: 17,
        entry_bci: INVOCATION_ENTRY_BCI,
        offsets: &offsets,
        orig_pc_offset: 24,
        recorder: &recorder,
        dependencies: &dependencies,
        buffer: &buffer,
        oop_recorder: &oop_recorder,
        frame_size: 64,
        oop_maps: &oop_maps,
        handler_table: &handler_table,
        nul_chk_table: &nul_chk_table,
        compiler: CompilerKind::Opto,
        has_unsafe_access: false,
        has_wide_vectors: true,
        has_monitors: false,
    };
    archive.store_nmethod(&record).expect("nmethod stored")
}

#[test]
fn nmethod_round_trip_with_relocations() {
    init_logging();
    let path = archive_path("round_trip");

    let (rt, method) = test_runtime();
    let archive = CodeArchive::open_for_write(&path, rt.clone(), 1 << 20).unwrap();
    init_table(&archive);
    store_sum(&archive, &rt, &method);
    archive.close();

    // A different process: same runtime layout, fresh objects.
    let (rt2, method2) = test_runtime();
    let archive = CodeArchive::open_for_read(&path, rt2.clone(), false).unwrap();
    init_table(&archive);

    let env = CompileEnv::new(rt2.clone(), 99);
    assert!(archive.load_nmethod(&env, &method2, INVOCATION_ENTRY_BCI, CompilerKind::Opto));

    let registered = env.take_registered().expect("method registered");
    assert_eq!(registered.frame_size, 64);
    assert_eq!(registered.orig_pc_offset, 24);
    assert!(registered.has_wide_vectors);
    assert!(!registered.has_unsafe_access);
    assert!(!registered.has_monitors);
    assert_eq!(registered.offsets.verified_entry, 8);
    assert_eq!(registered.offsets.exceptions, 48);
    assert_eq!(registered.archive_entry, Some(0));

    let insts = registered.code.section(SectionKind::Insts);
    let consts = registered.code.section(SectionKind::Consts);

    // Call and word targets resolved to this process's layout.
    assert_eq!(insts.read_addr_at(0), ARRAYCOPY_STUB);
    assert_eq!(insts.read_addr_at(8), NO_ADDRESS);
    assert_eq!(insts.read_addr_at(16), FMT_AREA + 0x10);
    assert_eq!(insts.read_addr_at(24), consts.start() + 4);
    assert_eq!(consts.bytes(), &[0x55; 16]);

    // Object references resolved to this process's objects.
    assert_eq!(insts.read_addr_at(32), rt2.intern_string("pi").handle());
    let k2 = rt2
        .dictionary()
        .find_instance_or_array_klass(&rt2.symbols().intern(b"demo/Calc"), LoaderId::Null, None)
        .unwrap();
    assert_eq!(insts.read_addr_at(40), rt2.java_mirror(&k2).handle());
    assert_eq!(
        insts.read_addr_at(48),
        MetadataRef::Method(method2.clone()).handle()
    );

    // The packed external word re-packed in place.
    let units = insts.locs().to_vec();
    let mut iter = reloc::RelocIterator::new(&units);
    let mut packed_target = None;
    while iter.next() {
        if iter.reloc_type() == RelocType::ExternalWord && iter.has_data() {
            packed_target = Some(reloc::unpack_addr(iter.data()));
        }
    }
    assert_eq!(packed_target, Some(SLOW_PATH_EXTR));

    // Side tables revived byte for byte.
    let di = env.take_debug_info().expect("debug info");
    assert_eq!(di.stream(), &[9, 8, 7, 6, 5]);
    assert_eq!(di.pcs_length(), 2);
    assert_eq!(di.pcs()[1].pc_offset, 16);
    let deps = env.take_dependencies().expect("dependencies");
    assert_eq!(deps.content_bytes(), &[0xD0, 0xD1, 0xD2]);
    assert_eq!(registered.oop_maps.len(), 1);
    assert_eq!(registered.oop_maps.at(0).slots(), vec![2, 5]);
    assert_eq!(registered.handler_table.len(), 1);
    assert_eq!(registered.handler_table.entries()[0].handler_pco, 60);
    assert_eq!(registered.nul_chk_table.entries(), &[(12, 40)]);

    archive.close();
}

#[test]
fn osr_and_baseline_requests_are_refused() {
    init_logging();
    let path = archive_path("gating");
    let (rt, method) = test_runtime();
    let archive = CodeArchive::open_for_write(&path, rt.clone(), 1 << 20).unwrap();
    init_table(&archive);
    store_sum(&archive, &rt, &method);
    archive.close();

    let (rt2, method2) = test_runtime();
    let archive = CodeArchive::open_for_read(&path, rt2.clone(), false).unwrap();
    init_table(&archive);
    let env = CompileEnv::new(rt2, 1);
    assert!(!archive.load_nmethod(&env, &method2, 7, CompilerKind::Opto));
    assert!(!archive.load_nmethod(&env, &method2, INVOCATION_ENTRY_BCI, CompilerKind::Baseline));
    assert!(!archive.failed());
}

#[test]
fn invalidation_is_sticky() {
    init_logging();
    let path = archive_path("invalidate");
    let (rt, method) = test_runtime();
    let archive = CodeArchive::open_for_write(&path, rt.clone(), 1 << 20).unwrap();
    init_table(&archive);
    store_sum(&archive, &rt, &method);
    archive.close();

    let (rt2, method2) = test_runtime();
    let archive = CodeArchive::open_for_read(&path, rt2, false).unwrap();
    init_table(&archive);

    let hash = java_hash(method2.name_and_sig().as_bytes());
    let entry = archive.find_entry(EntryKind::Code, hash, 0).expect("entry");
    let handle = EntryHandle(entry.idx);
    archive.invalidate(handle);
    assert!(archive.find_entry(EntryKind::Code, hash, 0).is_none());

    // And the load path agrees.
    let env = CompileEnv::new(archive.runtime().clone(), 1);
    assert!(!archive.load_nmethod(&env, &method2, INVOCATION_ENTRY_BCI, CompilerKind::Opto));
    assert!(!archive.failed());
}

#[test]
fn decompile_count_keys_the_lookup() {
    init_logging();
    let path = archive_path("decompile");
    let (rt, method) = test_runtime();
    let archive = CodeArchive::open_for_write(&path, rt.clone(), 1 << 20).unwrap();
    init_table(&archive);

    let first = store_sum(&archive, &rt, &method);
    method.inc_decompile_count();
    let second = store_sum(&archive, &rt, &method);
    assert_ne!(first, second);
    archive.close();

    let (rt2, method2) = test_runtime();
    let archive = CodeArchive::open_for_read(&path, rt2, false).unwrap();
    let hash = java_hash(method2.name_and_sig().as_bytes());
    let e0 = archive.find_entry(EntryKind::Code, hash, 0).expect("decompile 0");
    let e1 = archive.find_entry(EntryKind::Code, hash, 1).expect("decompile 1");
    assert_eq!(e0.idx, 0);
    assert_eq!(e1.idx, 1);
    assert_eq!(e0.decompile, 0);
    assert_eq!(e1.decompile, 1);
}

#[test]
fn restore_of_same_key_wins() {
    init_logging();
    let path = archive_path("idempotent");
    let (rt, method) = test_runtime();
    let archive = CodeArchive::open_for_write(&path, rt.clone(), 1 << 20).unwrap();
    init_table(&archive);
    store_sum(&archive, &rt, &method);
    store_sum(&archive, &rt, &method);
    archive.close();

    let (rt2, method2) = test_runtime();
    let archive = CodeArchive::open_for_read(&path, rt2, false).unwrap();
    let hash = java_hash(method2.name_and_sig().as_bytes());
    let found = archive.find_entry(EntryKind::Code, hash, 0).expect("entry");
    assert_eq!(found.idx, 1, "lookup prefers the most recent store");
}

#[test]
fn external_word_repack_overflow_skips_the_artifact() {
    init_logging();
    let path = archive_path("repack");
    let (rt, method) = test_runtime();
    let archive = CodeArchive::open_for_write(&path, rt.clone(), 1 << 20).unwrap();
    init_table(&archive);
    store_sum(&archive, &rt, &method);
    archive.close();

    // The loading process maps the external function somewhere a single
    // u16 word cannot express.
    let (rt2, method2) = test_runtime();
    let archive = CodeArchive::open_for_read(&path, rt2.clone(), false).unwrap();
    archive
        .table()
        .init_base(&[0x7_0000_0000], &[ARRAYCOPY_STUB], &[DEOPT_BLOB]);
    archive.table().init_opto(&[UNCOMMON_TRAP_BLOB]);

    let env = CompileEnv::new(rt2, 1);
    assert!(!archive.load_nmethod(&env, &method2, INVOCATION_ENTRY_BCI, CompilerKind::Opto));
    assert!(!archive.failed(), "payload overflow only skips the artifact");
    assert!(archive.lookup_failed());
    assert!(env.take_registered().is_none());
}

#[test]
fn unresolvable_class_skips_but_archive_survives() {
    init_logging();
    let path = archive_path("lookup_failed");

    // Store a method whose recorder references a class that only the
    // storing process ever loaded.
    let (rt, method) = test_runtime();
    rt.define_class("demo/Missing", LoaderId::System, None);
    let archive = CodeArchive::open_for_write(&path, rt.clone(), 1 << 20).unwrap();
    init_table(&archive);

    let oop_recorder = Arc::new(OopRecorder::new());
    let missing = rt
        .dictionary()
        .find_instance_or_array_klass(&rt.symbols().intern(b"demo/Missing"), LoaderId::Null, None)
        .unwrap();
    oop_recorder.find_index(&rt.java_mirror(&missing));

    let buffer = CodeBuffer::with_capacity("sum", 64);
    let recorder = build_debug_info(&oop_recorder);
    let offsets = CodeOffsets::new();
    let record = NMethodRecord {
        method: &method,
        compile_id: 5,
        entry_bci: INVOCATION_ENTRY_BCI,
        offsets: &offsets,
        orig_pc_offset: 0,
        recorder: &recorder,
        dependencies: &Dependencies::new(),
        buffer: &buffer,
        oop_recorder: &oop_recorder,
        frame_size: 16,
        oop_maps: &OopMapSet::new(),
        handler_table: &ExceptionHandlerTable::new(),
        nul_chk_table: &ImplicitExceptionTable::new(),
        compiler: CompilerKind::Opto,
        has_unsafe_access: false,
        has_wide_vectors: false,
        has_monitors: false,
    };
    assert!(archive.store_nmethod(&record).is_some());
    archive.close();

    // The loading process never saw demo/Missing; its symbol does not
    // even probe, so the oop decode bails out for this artifact only.
    let (rt2, method2) = test_runtime();
    let archive = CodeArchive::open_for_read(&path, rt2.clone(), false).unwrap();
    init_table(&archive);

    let env = CompileEnv::new(rt2, 1);
    assert!(!archive.load_nmethod(&env, &method2, INVOCATION_ENTRY_BCI, CompilerKind::Opto));
    assert!(!archive.failed(), "symbolic misses never poison the archive");
    assert!(archive.lookup_failed());
    assert!(env.take_registered().is_none());
    archive.close();
}

#[test]
fn skipped_store_rolls_back_and_archive_continues() {
    init_logging();
    let path = archive_path("rollback");
    let (rt, method) = test_runtime();
    let archive = CodeArchive::open_for_write(&path, rt.clone(), 1 << 20).unwrap();
    init_table(&archive);

    // A recorder holding an object the archive cannot express.
    let k = rt
        .dictionary()
        .find_instance_or_array_klass(&rt.symbols().intern(b"demo/Calc"), LoaderId::Null, None)
        .unwrap();
    let other = rt.define_method(&k, "mix", "()V");
    let bad_recorder = Arc::new(OopRecorder::new());
    let opaque = opal_code::meta::JitObject::Obj(Arc::new(opal_code::meta::HeapObject::Opaque(
        "file handle".into(),
    )));
    bad_recorder.find_index(&opaque);

    let buffer = CodeBuffer::with_capacity("mix", 64);
    let recorder = build_debug_info(&bad_recorder);
    let offsets = CodeOffsets::new();
    let record = NMethodRecord {
        method: &other,
        compile_id: 2,
        entry_bci: INVOCATION_ENTRY_BCI,
        offsets: &offsets,
        orig_pc_offset: 0,
        recorder: &recorder,
        dependencies: &Dependencies::new(),
        buffer: &buffer,
        oop_recorder: &bad_recorder,
        frame_size: 16,
        oop_maps: &OopMapSet::new(),
        handler_table: &ExceptionHandlerTable::new(),
        nul_chk_table: &ImplicitExceptionTable::new(),
        compiler: CompilerKind::Opto,
        has_unsafe_access: false,
        has_wide_vectors: false,
        has_monitors: false,
    };
    assert!(archive.store_nmethod(&record).is_none());
    assert!(archive.lookup_failed());
    assert!(!archive.failed(), "unsupported objects only skip the artifact");

    // The archive keeps working and records nothing for the failed store.
    let good_recorder = Arc::new(OopRecorder::new());
    let good_debug = build_debug_info(&good_recorder);
    let good = NMethodRecord {
        method: &method,
        recorder: &good_debug,
        oop_recorder: &good_recorder,
        ..record
    };
    assert!(archive.store_nmethod(&good).is_some());
    archive.close();

    let (rt2, method2) = test_runtime();
    let archive = CodeArchive::open_for_read(&path, rt2, false).unwrap();
    assert_eq!(archive.entries_count(), 1, "the skipped store left no entry");
    let hash = java_hash(method2.name_and_sig().as_bytes());
    assert!(archive.find_entry(EntryKind::Code, hash, 0).is_some());
}

#[test]
fn verify_mode_decodes_but_reports_miss() {
    init_logging();
    let path = archive_path("verify");
    let (rt, method) = test_runtime();
    let archive = CodeArchive::open_for_write(&path, rt.clone(), 1 << 20).unwrap();
    init_table(&archive);
    store_sum(&archive, &rt, &method);
    archive.close();

    let (rt2, method2) = test_runtime();
    let archive = CodeArchive::open_for_read(&path, rt2.clone(), true).unwrap();
    init_table(&archive);

    let env = CompileEnv::new(rt2, 1);
    assert!(!archive.load_nmethod(&env, &method2, INVOCATION_ENTRY_BCI, CompilerKind::Opto));
    assert!(!archive.failed());
    assert!(!archive.lookup_failed());
    assert!(
        env.take_registered().is_none(),
        "verify mode never registers the decoded method"
    );
}
