//! Process-wide runtime context.
//!
//! One [`OpalRuntime`] bundles the registries compiled code resolves
//! against: symbols, the class dictionary, interned strings, stub ranges,
//! code blobs, and the dynamic-symbol resolver. It also owns the compile
//! lock that serializes method installation.

use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::buffer::CodeAddr;
use crate::code_cache::CodeCache;
use crate::linker::RuntimeLinker;
use crate::meta::{
    BasicType, HeapObject, JitObject, Klass, MetadataRef, Method, SymbolTable, SystemDictionary,
};
use crate::stubs::StubRoutines;

/// JIT behavior toggles the archive machinery constrains.
#[derive(Debug, Clone, Copy)]
pub struct JitFlags {
    /// Fold loads from `@Stable`-style constant fields at compile time.
    pub fold_stable_constants: bool,
    /// Emit far-capable addressing for out-of-code-cache targets.
    pub far_code_addressing: bool,
    /// Generate compiler stubs lazily on first use.
    pub defer_stub_generation: bool,
}

impl Default for JitFlags {
    fn default() -> Self {
        JitFlags {
            fold_stable_constants: true,
            far_code_addressing: false,
            defer_stub_generation: true,
        }
    }
}

/// The runtime context archive operations execute against.
pub struct OpalRuntime {
    symbols: SymbolTable,
    dictionary: SystemDictionary,
    stub_routines: StubRoutines,
    code_cache: CodeCache,
    linker: Box<dyn RuntimeLinker>,
    anchor: CodeAddr,
    compile_lock: Mutex<()>,
    flags: Mutex<JitFlags>,

    string_table: RwLock<FxHashMap<String, Arc<HeapObject>>>,
    oop_handles: RwLock<FxHashMap<u64, JitObject>>,
    metadata_handles: RwLock<FxHashMap<u64, MetadataRef>>,

    primitive_mirrors: [Arc<HeapObject>; BasicType::COUNT],
    system_loader: Arc<HeapObject>,
    platform_loader: Arc<HeapObject>,
}

impl OpalRuntime {
    /// Build a runtime around a symbol resolver and process anchor. The
    /// anchor is the base every distance-encoded address is measured from.
    pub fn new(linker: Box<dyn RuntimeLinker>, anchor: CodeAddr) -> Arc<OpalRuntime> {
        let primitive_mirrors =
            BasicType::ALL.map(|bt| Arc::new(HeapObject::PrimitiveMirror(bt)));
        let runtime = Arc::new(OpalRuntime {
            symbols: SymbolTable::new(),
            dictionary: SystemDictionary::new(),
            stub_routines: StubRoutines::new(),
            code_cache: CodeCache::new(),
            linker,
            anchor,
            compile_lock: Mutex::new(()),
            flags: Mutex::new(JitFlags::default()),
            string_table: RwLock::new(FxHashMap::default()),
            oop_handles: RwLock::new(FxHashMap::default()),
            metadata_handles: RwLock::new(FxHashMap::default()),
            primitive_mirrors,
            system_loader: Arc::new(HeapObject::SystemLoader),
            platform_loader: Arc::new(HeapObject::PlatformLoader),
        });
        for obj in runtime
            .primitive_mirrors
            .iter()
            .chain([&runtime.system_loader, &runtime.platform_loader])
        {
            runtime.register_oop_handle(JitObject::Obj(obj.clone()));
        }
        runtime
    }

    #[inline]
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    #[inline]
    pub fn dictionary(&self) -> &SystemDictionary {
        &self.dictionary
    }

    #[inline]
    pub fn stub_routines(&self) -> &StubRoutines {
        &self.stub_routines
    }

    #[inline]
    pub fn code_cache(&self) -> &CodeCache {
        &self.code_cache
    }

    #[inline]
    pub fn linker(&self) -> &dyn RuntimeLinker {
        self.linker.as_ref()
    }

    /// Base address distance-encoded targets are measured from.
    #[inline]
    pub fn anchor(&self) -> CodeAddr {
        self.anchor
    }

    /// The lock serializing method stores and archive finalization.
    #[inline]
    pub fn compile_lock(&self) -> &Mutex<()> {
        &self.compile_lock
    }

    pub fn flags(&self) -> JitFlags {
        *self.flags.lock()
    }

    pub fn set_flags(&self, flags: JitFlags) {
        *self.flags.lock() = flags;
    }

    /// Constrain JIT behavior to what archived code can express: no baked
    /// constant-field values, far addressing everywhere, all stubs present
    /// at startup.
    pub fn force_archive_flag_defaults(&self) {
        let mut flags = self.flags.lock();
        flags.fold_stable_constants = false;
        flags.far_code_addressing = true;
        flags.defer_stub_generation = false;
        debug!(target: "jit", "Forced archive-compatible flag defaults");
    }

    // -------------------------------------------------------------------------
    // Objects
    // -------------------------------------------------------------------------

    /// Intern a string literal, returning its object reference.
    pub fn intern_string(&self, s: &str) -> JitObject {
        if let Some(obj) = self.string_table.read().get(s) {
            return JitObject::Obj(obj.clone());
        }
        let mut table = self.string_table.write();
        let obj = table
            .entry(s.to_string())
            .or_insert_with(|| Arc::new(HeapObject::InternedString(s.to_string())))
            .clone();
        drop(table);
        let jit = JitObject::Obj(obj);
        self.register_oop_handle(jit.clone());
        jit
    }

    /// Mirror object of a loaded class.
    pub fn java_mirror(&self, klass: &Arc<Klass>) -> JitObject {
        let obj = {
            let mut slot = klass.mirror_slot().lock();
            match &*slot {
                Some(m) => m.clone(),
                None => {
                    let m = Arc::new(HeapObject::Mirror(klass.clone()));
                    *slot = Some(m.clone());
                    m
                }
            }
        };
        let jit = JitObject::Obj(obj);
        self.register_oop_handle(jit.clone());
        jit
    }

    /// Mirror of a primitive type.
    pub fn primitive_mirror(&self, bt: BasicType) -> JitObject {
        JitObject::Obj(self.primitive_mirrors[bt.tag() as usize].clone())
    }

    pub fn system_loader_obj(&self) -> JitObject {
        JitObject::Obj(self.system_loader.clone())
    }

    pub fn platform_loader_obj(&self) -> JitObject {
        JitObject::Obj(self.platform_loader.clone())
    }

    // -------------------------------------------------------------------------
    // Handles
    // -------------------------------------------------------------------------

    /// Make an object reference resolvable from its raw handle value, as
    /// embedded at immediate relocation sites.
    pub fn register_oop_handle(&self, obj: JitObject) {
        if obj.is_real() {
            self.oop_handles.write().insert(obj.handle(), obj);
        }
    }

    /// Make a metadata reference resolvable from its raw handle value.
    pub fn register_metadata_handle(&self, m: MetadataRef) {
        if m.is_real() {
            self.metadata_handles.write().insert(m.handle(), m);
        }
    }

    /// Resolve a raw oop handle embedded in code.
    pub fn resolve_oop_handle(&self, handle: u64) -> Option<JitObject> {
        match handle {
            0 => Some(JitObject::Null),
            h if h == crate::meta::NON_OOP_WORD => Some(JitObject::NonOop),
            h => self.oop_handles.read().get(&h).cloned(),
        }
    }

    /// Resolve a raw metadata handle embedded in code.
    pub fn resolve_metadata_handle(&self, handle: u64) -> Option<MetadataRef> {
        if handle == 0 {
            return Some(MetadataRef::None);
        }
        self.metadata_handles.read().get(&handle).cloned()
    }

    // -------------------------------------------------------------------------
    // Class and method definition
    // -------------------------------------------------------------------------

    /// Define a class and register its metadata handle.
    pub fn define_class(
        &self,
        name: &str,
        loader: crate::meta::LoaderId,
        domain: crate::meta::ProtectionDomain,
    ) -> Arc<Klass> {
        let sym = self.symbols.intern(name.as_bytes());
        let k = self.dictionary.define_class(sym, loader, domain);
        self.register_metadata_handle(MetadataRef::Klass(k.clone()));
        k
    }

    /// Define a method and register its metadata handle.
    pub fn define_method(&self, holder: &Arc<Klass>, name: &str, signature: &str) -> Arc<Method> {
        let name = self.symbols.intern(name.as_bytes());
        let sig = self.symbols.intern(signature.as_bytes());
        let m = self.dictionary.define_method(holder, name, sig);
        self.register_metadata_handle(MetadataRef::Method(m.clone()));
        m
    }
}
