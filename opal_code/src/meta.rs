//! The runtime metadata and object model the compiler works against.
//!
//! Compiled code embeds references to classes, methods, mirrors, and
//! interned strings. Persisting code means persisting those references
//! symbolically, so the model here is built around names that survive a
//! process restart: interned [`Symbol`]s, a [`SystemDictionary`] keyed by
//! (name, loader), and per-class method lookup.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

// =============================================================================
// Symbols
// =============================================================================

/// An interned byte string. Symbols with equal bytes are pointer-equal.
#[derive(Clone)]
pub struct Symbol(Arc<Box<[u8]>>);

impl Symbol {
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn utf8_length(&self) -> usize {
        self.0.len()
    }

    /// Lossy UTF-8 view for diagnostics.
    pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Symbol {}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.as_str_lossy())
    }
}

/// Process-wide symbol interning table.
#[derive(Debug, Default)]
pub struct SymbolTable {
    inner: RwLock<FxHashMap<Box<[u8]>, Symbol>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `bytes`, creating the symbol if absent.
    pub fn intern(&self, bytes: &[u8]) -> Symbol {
        if let Some(sym) = self.inner.read().get(bytes) {
            return sym.clone();
        }
        let mut map = self.inner.write();
        map.entry(bytes.to_vec().into_boxed_slice())
            .or_insert_with(|| Symbol(Arc::new(bytes.to_vec().into_boxed_slice())))
            .clone()
    }

    /// Look up an existing symbol without creating it.
    pub fn probe(&self, bytes: &[u8]) -> Option<Symbol> {
        self.inner.read().get(bytes).cloned()
    }
}

// =============================================================================
// Loaders and protection domains
// =============================================================================

/// Identity of a class loader. `Null` is the bootstrap loader and matches
/// classes defined by any loader during dictionary lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoaderId {
    Null,
    System,
    Platform,
    Custom(u32),
}

/// Opaque protection-domain token; `None` is the null domain.
pub type ProtectionDomain = Option<u32>;

// =============================================================================
// Basic types
// =============================================================================

/// Primitive value types with mirror objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BasicType {
    Boolean = 0,
    Byte = 1,
    Char = 2,
    Short = 3,
    Int = 4,
    Long = 5,
    Float = 6,
    Double = 7,
    Void = 8,
}

impl BasicType {
    pub const COUNT: usize = 9;

    pub const ALL: [BasicType; Self::COUNT] = [
        BasicType::Boolean,
        BasicType::Byte,
        BasicType::Char,
        BasicType::Short,
        BasicType::Int,
        BasicType::Long,
        BasicType::Float,
        BasicType::Double,
        BasicType::Void,
    ];

    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<BasicType> {
        Self::ALL.get(tag as usize).copied()
    }
}

// =============================================================================
// Klass and Method
// =============================================================================

/// A loaded class: name, defining loader, methods, and a lazily created
/// mirror object.
pub struct Klass {
    name: Symbol,
    loader: LoaderId,
    protection_domain: ProtectionDomain,
    methods: RwLock<Vec<Arc<Method>>>,
    mirror: parking_lot::Mutex<Option<Arc<HeapObject>>>,
}

impl Klass {
    fn new(name: Symbol, loader: LoaderId, protection_domain: ProtectionDomain) -> Self {
        Klass {
            name,
            loader,
            protection_domain,
            methods: RwLock::new(Vec::new()),
            mirror: parking_lot::Mutex::new(None),
        }
    }

    #[inline]
    pub fn name(&self) -> &Symbol {
        &self.name
    }

    #[inline]
    pub fn loader(&self) -> LoaderId {
        self.loader
    }

    #[inline]
    pub fn protection_domain(&self) -> ProtectionDomain {
        self.protection_domain
    }

    /// Find a declared method by name and signature symbols.
    pub fn find_method(&self, name: &Symbol, signature: &Symbol) -> Option<Arc<Method>> {
        self.methods
            .read()
            .iter()
            .find(|m| m.name() == name && m.signature() == signature)
            .cloned()
    }

    pub fn external_name(&self) -> String {
        self.name.as_str_lossy().into_owned()
    }

    /// Cache slot for this class's mirror object.
    pub(crate) fn mirror_slot(&self) -> &parking_lot::Mutex<Option<Arc<HeapObject>>> {
        &self.mirror
    }
}

impl fmt::Debug for Klass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Klass({})", self.name.as_str_lossy())
    }
}

/// A method: holder class, name, signature, and its deopt history.
pub struct Method {
    holder: Arc<Klass>,
    name: Symbol,
    signature: Symbol,
    decompile_count: AtomicU32,
}

impl Method {
    #[inline]
    pub fn holder(&self) -> &Arc<Klass> {
        &self.holder
    }

    #[inline]
    pub fn name(&self) -> &Symbol {
        &self.name
    }

    #[inline]
    pub fn signature(&self) -> &Symbol {
        &self.signature
    }

    /// Fully qualified `holder.name(args)ret` string used for archive
    /// entry naming and hashing.
    pub fn name_and_sig(&self) -> String {
        format!(
            "{}.{}{}",
            self.holder.name().as_str_lossy(),
            self.name.as_str_lossy(),
            self.signature.as_str_lossy()
        )
    }

    /// Times this method's compiled code has been thrown away.
    #[inline]
    pub fn decompile_count(&self) -> u32 {
        self.decompile_count.load(Ordering::Relaxed)
    }

    /// Record one more deoptimization.
    #[inline]
    pub fn inc_decompile_count(&self) -> u32 {
        self.decompile_count.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Method({})", self.name_and_sig())
    }
}

/// Shared handle to a method under compilation.
pub type MethodHandle = Arc<Method>;

// =============================================================================
// System dictionary
// =============================================================================

/// Name + loader keyed class registry.
#[derive(Default)]
pub struct SystemDictionary {
    inner: RwLock<Vec<Arc<Klass>>>,
}

impl SystemDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a class under `loader`. Returns the existing class when the
    /// (name, loader) pair is already present.
    pub fn define_class(
        &self,
        name: Symbol,
        loader: LoaderId,
        protection_domain: ProtectionDomain,
    ) -> Arc<Klass> {
        let mut classes = self.inner.write();
        if let Some(k) = classes
            .iter()
            .find(|k| k.name() == &name && k.loader() == loader)
        {
            return k.clone();
        }
        let k = Arc::new(Klass::new(name, loader, protection_domain));
        classes.push(k.clone());
        k
    }

    /// Attach a method to a class defined here.
    pub fn define_method(
        &self,
        holder: &Arc<Klass>,
        name: Symbol,
        signature: Symbol,
    ) -> Arc<Method> {
        let m = Arc::new(Method {
            holder: holder.clone(),
            name,
            signature,
            decompile_count: AtomicU32::new(0),
        });
        holder.methods.write().push(m.clone());
        m
    }

    /// Resolve a class by name, visible to `loader` under `domain`.
    ///
    /// The null loader sees every class; a concrete loader sees its own
    /// classes and the bootstrap ones.
    pub fn find_instance_or_array_klass(
        &self,
        name: &Symbol,
        loader: LoaderId,
        _domain: ProtectionDomain,
    ) -> Option<Arc<Klass>> {
        let classes = self.inner.read();
        classes
            .iter()
            .find(|k| {
                k.name() == name
                    && (loader == LoaderId::Null
                        || k.loader() == loader
                        || k.loader() == LoaderId::Null)
            })
            .cloned()
    }
}

// =============================================================================
// Heap objects
// =============================================================================

/// Handle value of a reference that is not an object at all; compiled code
/// uses it where a slot must hold a non-null non-oop word.
pub const NON_OOP_WORD: u64 = u64::MAX - 1;

/// The object shapes compiled code can embed references to.
#[derive(Debug)]
pub enum HeapObject {
    /// `java.lang.Class`-style mirror of a loaded class.
    Mirror(Arc<Klass>),
    /// Mirror of a primitive type.
    PrimitiveMirror(BasicType),
    /// An interned string literal.
    InternedString(String),
    /// The system class loader object.
    SystemLoader,
    /// The platform class loader object.
    PlatformLoader,
    /// Anything else the compiler may have captured. Never archivable.
    Opaque(String),
}

/// A compile-time object reference.
#[derive(Debug, Clone)]
pub enum JitObject {
    Null,
    /// The non-oop sentinel word.
    NonOop,
    Obj(Arc<HeapObject>),
}

impl JitObject {
    /// Raw handle value as embedded at code sites.
    #[inline]
    pub fn handle(&self) -> u64 {
        match self {
            JitObject::Null => 0,
            JitObject::NonOop => NON_OOP_WORD,
            JitObject::Obj(o) => Arc::as_ptr(o) as u64,
        }
    }

    /// Whether this is a real heap object (not null, not the sentinel).
    #[inline]
    pub fn is_real(&self) -> bool {
        matches!(self, JitObject::Obj(_))
    }

    #[inline]
    pub fn as_obj(&self) -> Option<&Arc<HeapObject>> {
        match self {
            JitObject::Obj(o) => Some(o),
            _ => None,
        }
    }
}

/// Compile-time metadata reference.
#[derive(Debug, Clone)]
pub enum MetadataRef {
    /// Recorder slot reserved but holding nothing resolvable.
    None,
    Klass(Arc<Klass>),
    Method(Arc<Method>),
}

impl MetadataRef {
    /// Raw handle value as embedded at code sites.
    #[inline]
    pub fn handle(&self) -> u64 {
        match self {
            MetadataRef::None => 0,
            MetadataRef::Klass(k) => Arc::as_ptr(k) as u64,
            MetadataRef::Method(m) => Arc::as_ptr(m) as u64,
        }
    }

    #[inline]
    pub fn is_real(&self) -> bool {
        !matches!(self, MetadataRef::None)
    }
}

// =============================================================================
// Tests
// =============================================================================
