//! Code-blob registry.
//!
//! Every piece of shared glue code (deopt blob, resolution trampolines,
//! exception blob) occupies an address range in the code cache. The
//! registry resolves arbitrary addresses back to the blob containing them,
//! which relocation encoding uses to classify call targets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::buffer::CodeAddr;

/// A registered piece of non-method code.
#[derive(Debug)]
pub struct CodeBlob {
    name: String,
    base: CodeAddr,
    size: usize,
    entry_point: CodeAddr,
}

impl CodeBlob {
    pub fn new(name: &str, base: CodeAddr, size: usize, entry_point: CodeAddr) -> Self {
        debug_assert!(entry_point >= base && entry_point < base + size as CodeAddr);
        CodeBlob {
            name: name.to_string(),
            base,
            size,
            entry_point,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn entry_point(&self) -> CodeAddr {
        self.entry_point
    }

    #[inline]
    pub fn contains(&self, addr: CodeAddr) -> bool {
        addr >= self.base && addr < self.base + self.size as CodeAddr
    }
}

/// Registry of live code blobs, searchable by address.
#[derive(Debug, Default)]
pub struct CodeCache {
    blobs: RwLock<Vec<Arc<CodeBlob>>>,
    lookups: AtomicU64,
    hits: AtomicU64,
}

impl CodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a blob. Returns it for chaining into registries.
    pub fn register_blob(&self, blob: CodeBlob) -> Arc<CodeBlob> {
        let blob = Arc::new(blob);
        self.blobs.write().push(blob.clone());
        blob
    }

    /// Find the blob whose range contains `addr`.
    pub fn find_blob(&self, addr: CodeAddr) -> Option<Arc<CodeBlob>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let found = self
            .blobs
            .read()
            .iter()
            .find(|b| b.contains(addr))
            .cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_blob_by_address() {
        let cache = CodeCache::new();
        cache.register_blob(CodeBlob::new("deopt_blob", 0x8000, 0x100, 0x8010));

        let hit = cache.find_blob(0x8050).expect("inside range");
        assert_eq!(hit.name(), "deopt_blob");
        assert_eq!(hit.entry_point(), 0x8010);

        assert!(cache.find_blob(0x7FFF).is_none());
        assert!(cache.find_blob(0x8100).is_none());
    }
}
