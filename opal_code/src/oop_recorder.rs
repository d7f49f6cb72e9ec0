//! Compile-time object and metadata handle tables.
//!
//! The recorder assigns small dense indices to every object and metadata
//! reference a compilation embeds. Index 0 is reserved: a relocation whose
//! index is 0 carries its value immediately at the code site instead.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::meta::{JitObject, MetadataRef};

/// Handle-to-index table shared by a compilation's code buffer, debug
/// recorder, and archive codecs.
#[derive(Debug, Default)]
pub struct OopRecorder {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    oops: Vec<JitObject>,
    metadata: Vec<MetadataRef>,
    oop_index: FxHashMap<u64, i32>,
    metadata_index: FxHashMap<u64, i32>,
    /// Immediate references revived from an archive; kept so their handles
    /// stay valid for the lifetime of the compilation.
    immediates: Vec<JitObject>,
}

impl OopRecorder {
    pub fn new() -> Self {
        let recorder = OopRecorder::default();
        {
            let mut inner = recorder.inner.lock();
            // Slot 0 backs the immediate marker and never resolves.
            inner.oops.push(JitObject::Null);
            inner.metadata.push(MetadataRef::None);
        }
        recorder
    }

    /// Index of `obj`, interning it on first sight. Null maps to the
    /// reserved slot 0; real indices are stable and start at 1.
    pub fn find_index(&self, obj: &JitObject) -> i32 {
        if matches!(obj, JitObject::Null) {
            return 0;
        }
        let mut inner = self.inner.lock();
        let key = obj.handle();
        if let Some(&i) = inner.oop_index.get(&key) {
            return i;
        }
        let i = inner.oops.len() as i32;
        inner.oops.push(obj.clone());
        inner.oop_index.insert(key, i);
        i
    }

    /// Index of metadata `m`, interning it on first sight. Empty references
    /// map to the reserved slot 0.
    pub fn find_metadata_index(&self, m: &MetadataRef) -> i32 {
        if !m.is_real() {
            return 0;
        }
        let mut inner = self.inner.lock();
        let key = m.handle();
        if let Some(&i) = inner.metadata_index.get(&key) {
            return i;
        }
        let i = inner.metadata.len() as i32;
        inner.metadata.push(m.clone());
        inner.metadata_index.insert(key, i);
        i
    }

    /// Number of oop slots, counting the reserved slot 0.
    #[inline]
    pub fn oop_count(&self) -> i32 {
        self.inner.lock().oops.len() as i32
    }

    /// Number of metadata slots, counting the reserved slot 0.
    #[inline]
    pub fn metadata_count(&self) -> i32 {
        self.inner.lock().metadata.len() as i32
    }

    /// Object at `index`. Panics on an out-of-range index.
    pub fn oop_at(&self, index: i32) -> JitObject {
        self.inner.lock().oops[index as usize].clone()
    }

    /// Metadata at `index`. Panics on an out-of-range index.
    pub fn metadata_at(&self, index: i32) -> MetadataRef {
        self.inner.lock().metadata[index as usize].clone()
    }

    /// Whether slot `index` holds a real object.
    pub fn is_real_oop(&self, index: i32) -> bool {
        self.inner.lock().oops[index as usize].is_real()
    }

    /// Whether metadata slot `index` holds a real reference.
    pub fn is_real_metadata(&self, index: i32) -> bool {
        self.inner.lock().metadata[index as usize].is_real()
    }

    /// Pin an immediate reference so its handle outlives decoding.
    pub fn keep_immediate(&self, obj: JitObject) {
        self.inner.lock().immediates.push(obj);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::HeapObject;
    use std::sync::Arc;

    #[test]
    fn indices_start_at_one_and_dedupe() {
        let rec = OopRecorder::new();
        let a = JitObject::Obj(Arc::new(HeapObject::InternedString("a".into())));
        let b = JitObject::Obj(Arc::new(HeapObject::InternedString("b".into())));

        let ia = rec.find_index(&a);
        let ib = rec.find_index(&b);
        assert_eq!(ia, 1);
        assert_eq!(ib, 2);
        assert_eq!(rec.find_index(&a), 1);
        assert_eq!(rec.oop_count(), 3);
        assert!(rec.is_real_oop(1));
        assert!(!rec.is_real_oop(0));
    }

    #[test]
    fn null_and_empty_map_to_slot_zero() {
        let rec = OopRecorder::new();
        assert_eq!(rec.find_index(&JitObject::Null), 0);
        assert_eq!(rec.find_metadata_index(&MetadataRef::None), 0);
        assert_eq!(rec.metadata_count(), 1);
        assert!(!rec.is_real_metadata(0));
    }
}
