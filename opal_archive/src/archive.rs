//! The archive object: open, catalog, invalidation, and close.
//!
//! An archive is read-only or write-only for its whole lifetime. Load mode
//! resolves the entry catalog and string pool out of the preloaded image at
//! open; store mode stages everything in memory and writes the file once at
//! close. Two failure bits separate a poisoned archive (`failed`) from a
//! single abandoned artifact (`lookup_failed`).

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use parking_lot::{Condvar, Mutex};

use opal_code::{CodeAddr, OpalRuntime, RUNTIME_VERSION};

use crate::error::{ArchiveError, ArchiveResult, FailureKind};
use crate::header::{Entry, EntryKind, Header, ENTRY_BYTES, HEADER_BYTES};
use crate::io::{LoadBuffer, StoreBuffer};
use crate::strings;
use crate::table::AddressTable;

/// How long close waits for in-flight readers before giving up on them.
const CLOSE_GRACE: Duration = Duration::from_secs(5);
const CLOSE_POLL: Duration = Duration::from_millis(10);

/// Stable reference to a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHandle(pub u32);

pub(crate) struct LoadState {
    pub(crate) buf: LoadBuffer,
    pub(crate) header: Header,
    pub(crate) entries: Vec<Entry>,
}

pub(crate) struct StoreState {
    pub(crate) buf: StoreBuffer,
    pub(crate) file: Option<File>,
    pub(crate) entries: Vec<Entry>,
}

/// One open shared-code archive.
pub struct CodeArchive {
    path: PathBuf,
    for_read: bool,
    verify: bool,
    runtime: Arc<OpalRuntime>,
    table: AddressTable,

    failed: AtomicBool,
    lookup_failed: AtomicBool,
    closing: AtomicBool,
    closed: AtomicBool,
    readers: Mutex<usize>,
    readers_cv: Condvar,

    load: Option<LoadState>,
    store: Option<Mutex<StoreState>>,
}

impl CodeArchive {
    // -------------------------------------------------------------------------
    // Opening
    // -------------------------------------------------------------------------

    /// Open an existing archive for reading. The whole file is resident
    /// after this returns; the catalog and string pool are decoded eagerly.
    pub fn open_for_read(
        path: &Path,
        runtime: Arc<OpalRuntime>,
        verify: bool,
    ) -> ArchiveResult<CodeArchive> {
        info!(target: "sca", "Trying to load shared code archive '{}'", path.display());
        let meta = fs::metadata(path)?;
        if !meta.is_file() {
            return Err(ArchiveError::Failed(FailureKind::MalformedEntry(
                "archive path is not a regular file",
            )));
        }
        let buf = LoadBuffer::open(path)?;
        if buf.len() < HEADER_BYTES {
            return Err(ArchiveError::Failed(FailureKind::MalformedEntry(
                "file shorter than the header",
            )));
        }
        let mut r = buf.reader_at(0)?;
        let header = Header::decode(&mut r)?;
        if header.version != RUNTIME_VERSION {
            warn!(
                target: "sca",
                "Shared code archive '{}' has version {:#x}, runtime is {:#x}",
                path.display(),
                header.version,
                RUNTIME_VERSION
            );
            return Err(ArchiveError::Failed(FailureKind::VersionMismatch {
                found: header.version,
                expected: RUNTIME_VERSION,
            }));
        }
        if header.total_size as usize > buf.len() {
            return Err(ArchiveError::Failed(FailureKind::MalformedEntry(
                "recorded size exceeds the file",
            )));
        }

        let mut entries = Vec::with_capacity(header.entries_count as usize);
        if header.entries_count > 0 {
            let mut er = buf.reader_at(header.entries_offset as usize)?;
            for i in 0..header.entries_count {
                let entry = Entry::decode(&mut er)?;
                if entry.idx != i {
                    return Err(ArchiveError::Failed(FailureKind::MalformedEntry(
                        "entry index out of sequence",
                    )));
                }
                entry.check_bounds(header.total_size)?;
                entries.push(entry);
            }
            info!(
                target: "sca",
                "Read entry catalog with {} elements at offset {}",
                header.entries_count,
                header.entries_offset
            );
        }

        let table = AddressTable::new(runtime.clone());
        if header.strings_count > 0 {
            let addrs = strings::decode_pool(&buf, header.strings_offset, header.strings_count)?;
            table.set_loaded_strings(addrs);
        }

        info!(target: "sca", "Opened for read shared code archive '{}'", path.display());
        Ok(CodeArchive {
            path: path.to_path_buf(),
            for_read: true,
            verify,
            runtime,
            table,
            failed: AtomicBool::new(false),
            lookup_failed: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            readers: Mutex::new(0),
            readers_cv: Condvar::new(),
            load: Some(LoadState {
                buf,
                header,
                entries,
            }),
            store: None,
        })
    }

    /// Create a fresh archive for writing. The previous file at `path` is
    /// removed so processes holding it open keep their view.
    pub fn open_for_write(
        path: &Path,
        runtime: Arc<OpalRuntime>,
        reserved_store_size: usize,
    ) -> ArchiveResult<CodeArchive> {
        let _ = fs::remove_file(path);
        let file = File::create(path)?;
        let mut buf = StoreBuffer::with_reservation(reserved_store_size);
        Header::initial(RUNTIME_VERSION).encode(&mut buf)?;
        let table = AddressTable::new(runtime.clone());
        info!(target: "sca", "Opened for write shared code archive '{}'", path.display());
        Ok(CodeArchive {
            path: path.to_path_buf(),
            for_read: false,
            verify: false,
            runtime,
            table,
            failed: AtomicBool::new(false),
            lookup_failed: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            readers: Mutex::new(0),
            readers_cv: Condvar::new(),
            load: None,
            store: Some(Mutex::new(StoreState {
                buf,
                file: Some(file),
                entries: Vec::new(),
            })),
        })
    }

    // -------------------------------------------------------------------------
    // State bits
    // -------------------------------------------------------------------------

    /// Usable for loads right now.
    #[inline]
    pub fn for_read(&self) -> bool {
        self.for_read && !self.failed() && !self.closed.load(Ordering::Acquire)
    }

    /// Usable for stores right now.
    #[inline]
    pub fn for_write(&self) -> bool {
        !self.for_read && !self.failed() && !self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn lookup_failed(&self) -> bool {
        self.lookup_failed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_lookup_failed(&self) {
        self.lookup_failed.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn clear_lookup_failed(&self) {
        self.lookup_failed.store(false, Ordering::Release);
    }

    #[inline]
    pub fn verify(&self) -> bool {
        self.verify
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn runtime(&self) -> &Arc<OpalRuntime> {
        &self.runtime
    }

    /// The process-global address table backing this archive.
    #[inline]
    pub fn table(&self) -> &AddressTable {
        &self.table
    }

    /// Register an interned C string for relocation targets.
    pub fn add_c_string(&self, addr: CodeAddr, bytes: &[u8]) {
        self.table.add_string(addr, bytes);
    }

    pub(crate) fn load_state(&self) -> Option<&LoadState> {
        self.load.as_ref()
    }

    pub(crate) fn store_state(&self) -> Option<&Mutex<StoreState>> {
        self.store.as_ref()
    }

    /// Map an operation error onto the archive bits and report failure.
    pub(crate) fn note_error(&self, what: &str, err: ArchiveError) {
        match err {
            ArchiveError::Skip(reason) => {
                self.set_lookup_failed();
                info!(target: "sca", "Skipped {} in shared code archive '{}': {}", what, self.path.display(), reason);
            }
            ArchiveError::Failed(kind) => {
                self.set_failed();
                warn!(target: "sca", "Failed {} in shared code archive '{}': {}", what, self.path.display(), kind);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Reader gate
    // -------------------------------------------------------------------------

    /// Enter a read operation. Refused once close has begun.
    pub(crate) fn begin_read(&self) -> Option<ReadingMark<'_>> {
        if self.closing.load(Ordering::Acquire) || !self.for_read() {
            return None;
        }
        let mut n = self.readers.lock();
        *n += 1;
        Some(ReadingMark { archive: self })
    }

    // -------------------------------------------------------------------------
    // Catalog
    // -------------------------------------------------------------------------

    /// Find the newest live entry of `kind` with `id`. Code entries are
    /// additionally keyed by decompile count and skip invalidated records.
    pub fn find_entry(&self, kind: EntryKind, id: u32, decompile: u32) -> Option<&Entry> {
        let state = self.load.as_ref()?;
        state.entries.iter().rev().find(|e| {
            e.kind == kind
                && e.id == id
                && (kind != EntryKind::Code || (!e.not_entrant() && e.decompile == decompile))
        })
    }

    /// Entry by catalog index, on the load side.
    pub fn entry_at(&self, idx: u32) -> Option<&Entry> {
        self.load.as_ref()?.entries.get(idx as usize)
    }

    /// Decoded header of a load-mode archive.
    pub fn header(&self) -> Option<&Header> {
        self.load.as_ref().map(|l| &l.header)
    }

    /// Number of catalog entries visible to this archive.
    pub fn entries_count(&self) -> usize {
        if let Some(load) = &self.load {
            load.entries.len()
        } else if let Some(store) = &self.store {
            store.lock().entries.len()
        } else {
            0
        }
    }

    /// Mark an entry dead. Idempotent and monotone: once invalidated the
    /// entry is never returned by [`CodeArchive::find_entry`] again.
    pub fn invalidate(&self, handle: EntryHandle) {
        if let Some(load) = &self.load {
            if let Some(e) = load.entries.get(handle.0 as usize) {
                e.set_not_entrant();
                info!(target: "sca", "Invalidated archive entry {} (kind {:?})", handle.0, e.kind);
            }
            return;
        }
        if let Some(store) = &self.store {
            let st = store.lock();
            if let Some(e) = st.entries.get(handle.0 as usize) {
                e.set_not_entrant();
                info!(target: "sca", "Invalidated archive entry {} (kind {:?})", handle.0, e.kind);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Finalize (when writing) and close. Waits a bounded grace period for
    /// readers in flight, then excludes stores via the compile lock.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closing.store(true, Ordering::Release);

        let started = Instant::now();
        {
            let mut n = self.readers.lock();
            while *n > 0 {
                self.readers_cv.wait_for(&mut n, CLOSE_POLL);
                if started.elapsed() >= CLOSE_GRACE {
                    warn!(
                        target: "sca",
                        "Closing shared code archive '{}' with {} readers still in flight",
                        self.path.display(),
                        *n
                    );
                    break;
                }
            }
        }

        let _compile_guard = self.runtime.compile_lock().lock();
        if !self.for_read && !self.failed() {
            if let Err(e) = self.finish_write() {
                warn!(
                    target: "sca",
                    "Failed to finalize shared code archive '{}': {}",
                    self.path.display(),
                    e
                );
                self.set_failed();
            }
        }
        if let Some(store) = &self.store {
            let mut st = store.lock();
            st.file = None; // drop the descriptor
        }
        info!(target: "sca", "Closed shared code archive '{}'", self.path.display());
    }

    /// Append the string pool and entry catalog, rewrite the header, and
    /// flush the staging buffer to the file in one write.
    fn finish_write(&self) -> ArchiveResult<()> {
        let store = self
            .store
            .as_ref()
            .expect("finalizing a read-mode archive");
        let mut guard = store.lock();
        let st = &mut *guard;

        st.buf.align_write()?;
        let mut strings_offset = 0u32;
        if self.table.string_count() > 0 {
            strings_offset = st.buf.position() as u32;
        }
        let strings_count = self.table.encode_strings(&mut st.buf)?;

        let mut entries_offset = 0u32;
        let count = st.entries.len() as u32;
        if count > 0 {
            st.buf.align_write()?;
            entries_offset = st.buf.position() as u32;
            for e in &st.entries {
                e.encode(&mut st.buf)?;
            }
            debug_assert_eq!(
                st.buf.position() as u32,
                entries_offset + count * ENTRY_BYTES as u32
            );
            info!(target: "sca", "Wrote {} catalog entries to shared code archive '{}'", count, self.path.display());
        }

        let header = Header {
            version: RUNTIME_VERSION,
            entries_count: count,
            total_size: st.buf.position() as u32,
            entries_offset,
            strings_count,
            strings_offset,
        };
        header.patch(&mut st.buf);

        let file = st.file.as_mut().expect("archive file already closed");
        file.write_all(st.buf.as_slice())?;
        file.sync_all()?;
        info!(
            target: "sca",
            "Wrote header to shared code archive '{}' ({} bytes, {} entries)",
            self.path.display(),
            header.total_size,
            count
        );
        Ok(())
    }
}

/// Scoped read registration; close waits for these to drain.
pub(crate) struct ReadingMark<'a> {
    archive: &'a CodeArchive,
}

impl Drop for ReadingMark<'_> {
    fn drop(&mut self) {
        let mut n = self.archive.readers.lock();
        *n -= 1;
        if *n == 0 {
            self.archive.readers_cv.notify_all();
        }
    }
}
