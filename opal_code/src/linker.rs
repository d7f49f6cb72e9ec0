//! Process anchor and dynamic-symbol resolution.
//!
//! An address that belongs to no registered runtime routine, stub, or blob
//! may still be meaningful across processes if it resolves to a named
//! dynamic-library symbol: such addresses are encoded as a distance from a
//! process-wide anchor. The resolver behind that test is pluggable; the
//! default uses the platform dynamic loader.

use crate::buffer::CodeAddr;

/// Result of resolving an address against loaded images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    /// Name of the nearest preceding symbol.
    pub name: String,
    /// Byte offset of the address from that symbol's start.
    pub offset: usize,
}

/// Maps process addresses back to dynamic symbols.
pub trait RuntimeLinker: Send + Sync {
    fn address_to_symbol(&self, addr: CodeAddr) -> Option<SymbolInfo>;
}

// =============================================================================
// Platform resolver
// =============================================================================

/// Resolver backed by the platform dynamic loader.
#[derive(Debug, Default)]
pub struct ProcessLinker;

#[cfg(unix)]
impl RuntimeLinker for ProcessLinker {
    fn address_to_symbol(&self, addr: CodeAddr) -> Option<SymbolInfo> {
        use std::ffi::CStr;

        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
        // SAFETY: dladdr only inspects the address and fills `info`; a
        // failed lookup returns 0 and leaves the fields null.
        let rc = unsafe { libc::dladdr(addr as *const libc::c_void, &mut info) };
        if rc == 0 || info.dli_sname.is_null() {
            return None;
        }
        // SAFETY: dli_sname is a NUL-terminated string owned by the loader.
        let name = unsafe { CStr::from_ptr(info.dli_sname) }
            .to_string_lossy()
            .into_owned();
        let offset = addr.saturating_sub(info.dli_saddr as CodeAddr) as usize;
        Some(SymbolInfo { name, offset })
    }
}

#[cfg(not(unix))]
impl RuntimeLinker for ProcessLinker {
    fn address_to_symbol(&self, _addr: CodeAddr) -> Option<SymbolInfo> {
        None
    }
}

// =============================================================================
// Registry resolver
// =============================================================================

/// Resolver over explicitly registered symbol ranges. Hermetic runs and
/// tests use this in place of the dynamic loader.
#[derive(Debug, Default)]
pub struct StaticLinker {
    ranges: parking_lot::RwLock<Vec<(CodeAddr, usize, String)>>,
}

impl StaticLinker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, base: CodeAddr, len: usize) {
        self.ranges.write().push((base, len, name.to_string()));
    }
}

impl RuntimeLinker for StaticLinker {
    fn address_to_symbol(&self, addr: CodeAddr) -> Option<SymbolInfo> {
        self.ranges
            .read()
            .iter()
            .find(|(base, len, _)| addr >= *base && addr < base + *len as CodeAddr)
            .map(|(base, _, name)| SymbolInfo {
                name: name.clone(),
                offset: (addr - base) as usize,
            })
    }
}
