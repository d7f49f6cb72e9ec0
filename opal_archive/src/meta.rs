//! Symbolic metadata and object-reference codec.
//!
//! Classes, methods, and object constants embedded by the compiler cannot
//! be persisted as addresses; they are written as loader-resolvable names
//! and re-resolved at load time through the symbol table and system
//! dictionary. Every object reference is preceded by a kind tag.

use std::sync::Arc;

use log::{info, warn};

use opal_code::meta::{
    BasicType, HeapObject, JitObject, Klass, MetadataRef, Method, MethodHandle,
};
use opal_code::oop_recorder::OopRecorder;
use opal_code::OpalRuntime;

use crate::error::{ArchiveError, ArchiveResult, FailureKind, SkipReason};
use crate::io::{Reader, StoreBuffer};

/// Object-reference kind tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum DataKind {
    /// Sentinel non-oop word.
    NoData = -1,
    Null = 0,
    Klass = 1,
    Method = 2,
    String = 3,
    Primitive = 4,
    SysLoader = 5,
    PlaLoader = 6,
    /// Reserved for primitive arrays; not yet archivable.
    Array = 7,
}

// =============================================================================
// Names
// =============================================================================

/// Append a class name block: `u32` length, bytes, NUL.
fn write_klass_name(buf: &mut StoreBuffer, klass: &Klass) -> ArchiveResult<()> {
    let name = klass.name().as_bytes();
    buf.write_u32(name.len() as u32)?;
    buf.write_bytes(name)?;
    buf.write_u8(0)?;
    Ok(())
}

/// Resolve a class by name with the compiling method's loader, retrying
/// with the null loader before giving up on this artifact.
pub fn read_klass(
    r: &mut Reader<'_>,
    runtime: &OpalRuntime,
    comp_method: &MethodHandle,
) -> ArchiveResult<Arc<Klass>> {
    let len = r.read_u32()? as usize;
    let bytes = r.read_name(len + 1)?;
    let sym = match runtime.symbols().probe(bytes) {
        Some(s) => s,
        None => {
            info!(target: "sca", "Probe failed for class {}", String::from_utf8_lossy(bytes));
            return Err(ArchiveError::Skip(SkipReason::SymbolProbeFailed(
                String::from_utf8_lossy(bytes).into_owned(),
            )));
        }
    };
    let holder = comp_method.holder();
    let found = runtime
        .dictionary()
        .find_instance_or_array_klass(&sym, holder.loader(), holder.protection_domain())
        .or_else(|| {
            runtime
                .dictionary()
                .find_instance_or_array_klass(&sym, opal_code::meta::LoaderId::Null, None)
        });
    match found {
        Some(k) => {
            info!(target: "sca", "{} {} (lookup)", holder.external_name(), k.external_name());
            Ok(k)
        }
        None => {
            info!(target: "sca", "Lookup failed for class {}", sym.as_str_lossy());
            Err(ArchiveError::Skip(SkipReason::KlassLookupFailed(
                sym.as_str_lossy().into_owned(),
            )))
        }
    }
}

/// Append a method reference: holder, name, and signature lengths, then
/// one combined buffer `holder name signature` with a trailing NUL.
fn write_method_ref(buf: &mut StoreBuffer, method: &Method) -> ArchiveResult<()> {
    let holder = method.holder().name().as_bytes();
    let name = method.name().as_bytes();
    let signat = method.signature().as_bytes();
    buf.write_i32(holder.len() as i32)?;
    buf.write_i32(name.len() as i32)?;
    buf.write_i32(signat.len() as i32)?;
    buf.write_bytes(holder)?;
    buf.write_u8(b' ')?;
    buf.write_bytes(name)?;
    buf.write_u8(b' ')?;
    buf.write_bytes(signat)?;
    buf.write_u8(0)?;
    Ok(())
}

/// Inverse of [`write_method_ref`].
pub fn read_method(
    r: &mut Reader<'_>,
    runtime: &OpalRuntime,
    comp_method: &MethodHandle,
) -> ArchiveResult<Arc<Method>> {
    let holder_len = r.read_i32()? as usize;
    let name_len = r.read_i32()? as usize;
    let signat_len = r.read_i32()? as usize;
    let total = holder_len + 1 + name_len + 1 + signat_len + 1;
    let bytes = r.read_bytes(total)?;
    let holder_bytes = &bytes[..holder_len];
    let name_bytes = &bytes[holder_len + 1..holder_len + 1 + name_len];
    let signat_bytes = &bytes[holder_len + 1 + name_len + 1..total - 1];

    let klass_sym = runtime.symbols().probe(holder_bytes).ok_or_else(|| {
        info!(target: "sca", "Probe failed for class {}", String::from_utf8_lossy(holder_bytes));
        ArchiveError::Skip(SkipReason::SymbolProbeFailed(
            String::from_utf8_lossy(holder_bytes).into_owned(),
        ))
    })?;
    let name_sym = runtime.symbols().probe(name_bytes).ok_or_else(|| {
        info!(target: "sca", "Probe failed for method name {}", String::from_utf8_lossy(name_bytes));
        ArchiveError::Skip(SkipReason::SymbolProbeFailed(
            String::from_utf8_lossy(name_bytes).into_owned(),
        ))
    })?;
    let signat_sym = runtime.symbols().probe(signat_bytes).ok_or_else(|| {
        info!(target: "sca", "Probe failed for method signature {}", String::from_utf8_lossy(signat_bytes));
        ArchiveError::Skip(SkipReason::SymbolProbeFailed(
            String::from_utf8_lossy(signat_bytes).into_owned(),
        ))
    })?;

    let holder = comp_method.holder();
    let klass = runtime
        .dictionary()
        .find_instance_or_array_klass(&klass_sym, holder.loader(), holder.protection_domain())
        .or_else(|| {
            runtime
                .dictionary()
                .find_instance_or_array_klass(&klass_sym, opal_code::meta::LoaderId::Null, None)
        })
        .ok_or_else(|| {
            info!(target: "sca", "Lookup failed for class {}", klass_sym.as_str_lossy());
            ArchiveError::Skip(SkipReason::KlassLookupFailed(
                klass_sym.as_str_lossy().into_owned(),
            ))
        })?;

    match klass.find_method(&name_sym, &signat_sym) {
        Some(m) => {
            info!(target: "sca", "Method lookup: {}", m.name_and_sig());
            Ok(m)
        }
        None => {
            info!(
                target: "sca",
                "Lookup failed for method {}{}",
                name_sym.as_str_lossy(),
                signat_sym.as_str_lossy()
            );
            Err(ArchiveError::Skip(SkipReason::MethodLookupFailed(format!(
                "{}.{}{}",
                klass_sym.as_str_lossy(),
                name_sym.as_str_lossy(),
                signat_sym.as_str_lossy()
            ))))
        }
    }
}

// =============================================================================
// Object references
// =============================================================================

/// Append one tagged object reference.
pub fn write_oop(buf: &mut StoreBuffer, obj: &JitObject) -> ArchiveResult<()> {
    match obj {
        JitObject::Null => buf.write_i32(DataKind::Null as i32),
        JitObject::NonOop => buf.write_i32(DataKind::NoData as i32),
        JitObject::Obj(o) => match o.as_ref() {
            HeapObject::Mirror(k) => {
                buf.write_i32(DataKind::Klass as i32)?;
                write_klass_name(buf, k)
            }
            HeapObject::PrimitiveMirror(bt) => {
                buf.write_i32(DataKind::Primitive as i32)?;
                buf.write_i32(bt.tag() as i32)
            }
            HeapObject::InternedString(s) => {
                buf.write_i32(DataKind::String as i32)?;
                buf.write_u32(s.len() as u32)?;
                buf.write_bytes(s.as_bytes())
            }
            HeapObject::SystemLoader => buf.write_i32(DataKind::SysLoader as i32),
            HeapObject::PlatformLoader => buf.write_i32(DataKind::PlaLoader as i32),
            HeapObject::Opaque(desc) => {
                warn!(target: "sca", "Cannot archive object reference: {}", desc);
                Err(ArchiveError::Skip(SkipReason::UnsupportedObjectKind(
                    "opaque object",
                )))
            }
        },
    }
}

/// Decode one tagged object reference.
pub fn read_oop(
    r: &mut Reader<'_>,
    runtime: &OpalRuntime,
    comp_method: &MethodHandle,
) -> ArchiveResult<JitObject> {
    let tag = r.read_i32()?;
    match tag {
        t if t == DataKind::Null as i32 => Ok(JitObject::Null),
        t if t == DataKind::NoData as i32 => Ok(JitObject::NonOop),
        t if t == DataKind::Klass as i32 => {
            let k = read_klass(r, runtime, comp_method)?;
            Ok(runtime.java_mirror(&k))
        }
        t if t == DataKind::String as i32 => {
            let len = r.read_u32()? as usize;
            let bytes = r.read_bytes(len)?;
            let s = std::str::from_utf8(bytes).map_err(|_| {
                ArchiveError::Failed(FailureKind::MalformedEntry("string is not utf-8"))
            })?;
            Ok(runtime.intern_string(s))
        }
        t if t == DataKind::Primitive as i32 => {
            let bt_tag = r.read_i32()?;
            let bt = BasicType::from_tag(bt_tag as u8).ok_or(ArchiveError::Failed(
                FailureKind::MalformedEntry("bad primitive type tag"),
            ))?;
            Ok(runtime.primitive_mirror(bt))
        }
        t if t == DataKind::SysLoader as i32 => Ok(runtime.system_loader_obj()),
        t if t == DataKind::PlaLoader as i32 => Ok(runtime.platform_loader_obj()),
        t if t == DataKind::Array as i32 => Err(ArchiveError::Skip(
            SkipReason::UnsupportedObjectKind("primitive array"),
        )),
        _ => Err(ArchiveError::Failed(FailureKind::MalformedEntry(
            "unknown object kind tag",
        ))),
    }
}

// =============================================================================
// Metadata references
// =============================================================================

/// Append one tagged metadata reference.
pub fn write_metadata_ref(buf: &mut StoreBuffer, m: &MetadataRef) -> ArchiveResult<()> {
    match m {
        MetadataRef::None => buf.write_i32(DataKind::NoData as i32),
        MetadataRef::Klass(k) => {
            buf.write_i32(DataKind::Klass as i32)?;
            write_klass_name(buf, k)
        }
        MetadataRef::Method(method) => {
            buf.write_i32(DataKind::Method as i32)?;
            write_method_ref(buf, method)
        }
    }
}

/// Decode one tagged metadata reference.
pub fn read_metadata_ref(
    r: &mut Reader<'_>,
    runtime: &OpalRuntime,
    comp_method: &MethodHandle,
) -> ArchiveResult<MetadataRef> {
    let tag = r.read_i32()?;
    match tag {
        t if t == DataKind::NoData as i32 => Ok(MetadataRef::None),
        t if t == DataKind::Klass as i32 => Ok(MetadataRef::Klass(read_klass(
            r,
            runtime,
            comp_method,
        )?)),
        t if t == DataKind::Method as i32 => Ok(MetadataRef::Method(read_method(
            r,
            runtime,
            comp_method,
        )?)),
        _ => Err(ArchiveError::Failed(FailureKind::MalformedEntry(
            "unknown metadata kind tag",
        ))),
    }
}

// =============================================================================
// Recorder lists
// =============================================================================

/// Append every recorder oop slot, tagged.
pub fn write_oops(buf: &mut StoreBuffer, recorder: &OopRecorder) -> ArchiveResult<()> {
    let count = recorder.oop_count();
    buf.write_i32(count)?;
    for i in 0..count {
        write_oop(buf, &recorder.oop_at(i))?;
    }
    Ok(())
}

/// Rebuild the recorder's oop slots in stored order.
pub fn read_oops(
    r: &mut Reader<'_>,
    runtime: &OpalRuntime,
    recorder: &OopRecorder,
    comp_method: &MethodHandle,
) -> ArchiveResult<()> {
    let count = r.read_i32()?;
    for i in 0..count {
        let obj = read_oop(r, runtime, comp_method)?;
        let index = recorder.find_index(&obj);
        debug_assert!(index <= i, "oop slots must decode densely");
    }
    Ok(())
}

/// Append every recorder metadata slot, tagged. Unresolvable slots keep
/// their position as `NoData`.
pub fn write_metadata(buf: &mut StoreBuffer, recorder: &OopRecorder) -> ArchiveResult<()> {
    let count = recorder.metadata_count();
    buf.write_i32(count)?;
    for i in 0..count {
        let m = recorder.metadata_at(i);
        write_metadata_ref(buf, &m)?;
        match &m {
            MetadataRef::None => {}
            MetadataRef::Klass(k) => {
                info!(target: "sca", "Write metadata [{}]: {}", i, k.external_name())
            }
            MetadataRef::Method(md) => {
                info!(target: "sca", "Write metadata [{}]: {}", i, md.name_and_sig())
            }
        }
    }
    Ok(())
}

/// Rebuild the recorder's metadata slots in stored order.
pub fn read_metadata(
    r: &mut Reader<'_>,
    runtime: &OpalRuntime,
    recorder: &OopRecorder,
    comp_method: &MethodHandle,
) -> ArchiveResult<()> {
    let count = r.read_i32()?;
    for _ in 0..count {
        match read_metadata_ref(r, runtime, comp_method)? {
            MetadataRef::None => {}
            m => {
                recorder.find_metadata_index(&m);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::LoadBuffer;
    use opal_code::linker::StaticLinker;
    use opal_code::meta::LoaderId;

    fn runtime() -> Arc<OpalRuntime> {
        OpalRuntime::new(Box::new(StaticLinker::new()), 0x10_0000)
    }

    fn comp_method(rt: &OpalRuntime) -> MethodHandle {
        let k = rt.define_class("demo/Main", LoaderId::System, None);
        rt.define_method(&k, "main", "()V")
    }

    fn round_trip(rt: &OpalRuntime, obj: &JitObject) -> JitObject {
        let mut buf = StoreBuffer::with_reservation(1024);
        write_oop(&mut buf, obj).unwrap();
        let load = LoadBuffer::from_bytes(buf.as_slice());
        let mut r = load.reader_at(0).unwrap();
        read_oop(&mut r, rt, &comp_method(rt)).unwrap()
    }

    #[test]
    fn oop_kinds_round_trip() {
        let rt = runtime();
        let k = rt.define_class("demo/Shape", LoaderId::System, None);

        let mirror = rt.java_mirror(&k);
        assert_eq!(round_trip(&rt, &mirror).handle(), mirror.handle());

        let s = rt.intern_string("hello");
        assert_eq!(round_trip(&rt, &s).handle(), s.handle());

        let prim = rt.primitive_mirror(BasicType::Long);
        assert_eq!(round_trip(&rt, &prim).handle(), prim.handle());

        assert_eq!(round_trip(&rt, &JitObject::Null).handle(), 0);
        assert!(matches!(round_trip(&rt, &JitObject::NonOop), JitObject::NonOop));

        let sys = rt.system_loader_obj();
        assert_eq!(round_trip(&rt, &sys).handle(), sys.handle());
    }

    #[test]
    fn opaque_objects_are_skipped() {
        let mut buf = StoreBuffer::with_reservation(64);
        let obj = JitObject::Obj(Arc::new(HeapObject::Opaque("socket".into())));
        let err = write_oop(&mut buf, &obj).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn unresolvable_class_is_artifact_local() {
        let rt = runtime();
        let k = rt.define_class("demo/Gone", LoaderId::System, None);
        let mirror = rt.java_mirror(&k);

        let mut buf = StoreBuffer::with_reservation(128);
        write_oop(&mut buf, &mirror).unwrap();

        // A fresh runtime has no such class; the symbol probe fails.
        let other = runtime();
        let load = LoadBuffer::from_bytes(buf.as_slice());
        let mut r = load.reader_at(0).unwrap();
        let err = read_oop(&mut r, &other, &comp_method(&other)).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn metadata_list_round_trip() {
        let rt = runtime();
        let k = rt.define_class("demo/Widget", LoaderId::System, None);
        let m = rt.define_method(&k, "render", "(I)V");

        let recorder = OopRecorder::new();
        recorder.find_metadata_index(&MetadataRef::Klass(k.clone()));
        recorder.find_metadata_index(&MetadataRef::Method(m.clone()));

        let mut buf = StoreBuffer::with_reservation(1024);
        write_metadata(&mut buf, &recorder).unwrap();

        let decoded = OopRecorder::new();
        let load = LoadBuffer::from_bytes(buf.as_slice());
        let mut r = load.reader_at(0).unwrap();
        read_metadata(&mut r, &rt, &decoded, &comp_method(&rt)).unwrap();

        assert_eq!(decoded.metadata_count(), 3);
        assert!(matches!(decoded.metadata_at(1), MetadataRef::Klass(dk) if Arc::ptr_eq(&dk, &k)));
        assert!(matches!(decoded.metadata_at(2), MetadataRef::Method(dm) if Arc::ptr_eq(&dm, &m)));
    }
}
