//! Persistent shared compiled-code archive for the Opal VM.
//!
//! Across process launches the runtime may either store or load artifacts
//! produced by the optimizing JIT (runtime stubs, the exception blob, and
//! compiled methods) so a later launch skips re-compiling them. The crate
//! is organized around three subsystems:
//!
//! - the archive file format and in-memory catalog ([`io`], [`header`],
//!   [`strings`], [`archive`])
//! - the relocation relocatability layer ([`sections`], [`relocs`])
//! - the symbolic address table ([`table`])
//!
//! The archive is process-wide: [`initialize`] opens at most one archive,
//! in exactly one direction, and every public operation consults that
//! singleton and short-circuits when it is absent. All operations report
//! success as a boolean; a failed operation never leaves a partially
//! written entry behind.
#![deny(unsafe_op_in_unsafe_fn)]

pub mod archive;
pub mod config;
pub mod error;
pub mod header;
pub mod io;
pub mod meta;
pub mod relocs;
pub mod sections;
pub mod store;
pub mod strings;
pub mod table;

use std::sync::Arc;

use log::{info, warn};
use parking_lot::RwLock;

use opal_code::env::{CompileEnv, CompilerKind};
use opal_code::meta::MethodHandle;
use opal_code::stubs::StubCodeGenerator;
use opal_code::{CodeAddr, CodeBuffer, OpalRuntime};

pub use archive::{CodeArchive, EntryHandle};
pub use config::{ArchiveConfig, ArchiveMode};
pub use error::{ArchiveError, ArchiveResult, FailureKind, SkipReason};
pub use header::{Entry, EntryKind, EXCEPTION_BLOB_ID};
pub use store::NMethodRecord;

static ARCHIVE: RwLock<Option<Arc<CodeArchive>>> = RwLock::new(None);

/// The open archive, if any.
pub fn archive() -> Option<Arc<CodeArchive>> {
    ARCHIVE.read().clone()
}

/// Whether an archive is open.
pub fn is_on() -> bool {
    ARCHIVE.read().is_some()
}

/// Open the process archive according to `config`.
///
/// A no-op (returning false) when no path or mode is configured, and when
/// an archive is already open. Only the final component of the configured
/// path is used; the file lives in the working directory. On success the
/// runtime's JIT flags are forced to archive-compatible defaults.
pub fn initialize(config: &ArchiveConfig, runtime: Arc<OpalRuntime>) -> bool {
    let (path, mode) = match (&config.archive_path, config.mode) {
        (Some(p), Some(m)) => (p, m),
        _ => return false,
    };
    let mut slot = ARCHIVE.write();
    if slot.is_some() {
        warn!(target: "sca", "Shared code archive already initialized");
        return false;
    }
    // Strip every directory component, as the stored name convention is
    // basename-only.
    let file_name = match path.file_name() {
        Some(n) => std::path::Path::new(n),
        None => return false,
    };

    let opened = match mode {
        ArchiveMode::Load => {
            CodeArchive::open_for_read(file_name, runtime.clone(), config.verify)
        }
        ArchiveMode::Store => {
            CodeArchive::open_for_write(file_name, runtime.clone(), config.reserved_store_size)
        }
    };
    match opened {
        Ok(archive) => {
            runtime.force_archive_flag_defaults();
            *slot = Some(Arc::new(archive));
            true
        }
        Err(e) => {
            info!(target: "sca", "Shared code archive unavailable: {}", e);
            false
        }
    }
}

/// Finalize (when storing) and close the process archive. After close a
/// new archive may be initialized.
pub fn close() {
    let taken = ARCHIVE.write().take();
    if let Some(archive) = taken {
        archive.close();
    }
}

/// Register the compiler-independent address-table targets.
pub fn init_table(extrs: &[CodeAddr], stubs: &[CodeAddr], blobs: &[CodeAddr]) {
    if let Some(archive) = archive() {
        archive.table().init_base(extrs, stubs, blobs);
    }
}

/// Register the optimizing compiler's address-table blobs.
pub fn init_opto_table(blobs: &[CodeAddr]) {
    if let Some(archive) = archive() {
        archive.table().init_opto(blobs);
    }
}

/// Register an interned C string as a relocation target.
pub fn add_c_string(addr: CodeAddr, bytes: &[u8]) {
    if let Some(archive) = archive() {
        archive.add_c_string(addr, bytes);
    }
}

/// Whether the compiler may fold loads from constant-annotated fields.
/// Folding bakes loader-specific values into code, so it is only allowed
/// while no archive is being written.
pub fn allow_const_field() -> bool {
    match archive() {
        None => true,
        Some(a) => a.failed() || a.for_read(),
    }
}

// =============================================================================
// Singleton operation veneer
// =============================================================================

/// Store a stub through the process archive.
pub fn store_stub(cgen: &StubCodeGenerator, id: u32, name: &str, start: CodeAddr) -> bool {
    match archive() {
        Some(a) => a.store_stub(cgen, id, name, start),
        None => false,
    }
}

/// Load a stub through the process archive.
pub fn load_stub(cgen: &mut StubCodeGenerator, id: u32, name: &str, start: CodeAddr) -> bool {
    match archive() {
        Some(a) => a.load_stub(cgen, id, name, start),
        None => false,
    }
}

/// Store the exception blob through the process archive.
pub fn store_exception_blob(buffer: &CodeBuffer, pc_offset: i32) -> bool {
    match archive() {
        Some(a) => a.store_exception_blob(buffer, pc_offset),
        None => false,
    }
}

/// Load the exception blob through the process archive.
pub fn load_exception_blob(buffer: &mut CodeBuffer, pc_offset: &mut i32) -> bool {
    match archive() {
        Some(a) => a.load_exception_blob(buffer, pc_offset),
        None => false,
    }
}

/// Store a compiled method through the process archive.
pub fn store_nmethod(record: &NMethodRecord<'_>) -> Option<EntryHandle> {
    archive().and_then(|a| a.store_nmethod(record))
}

/// Load a compiled method through the process archive.
pub fn load_nmethod(
    env: &CompileEnv,
    target: &MethodHandle,
    entry_bci: i32,
    compiler: CompilerKind,
) -> bool {
    match archive() {
        Some(a) => a.load_nmethod(env, target, entry_bci, compiler),
        None => false,
    }
}

/// Invalidate an archive entry after its code deoptimizes.
pub fn invalidate(handle: EntryHandle) {
    if let Some(a) = archive() {
        a.invalidate(handle);
    }
}
