//! Compiled-code infrastructure for the Opal VM.
//!
//! This crate hosts the pieces of the runtime that compiled code is made
//! of and resolved against:
//! - [`buffer`]: code buffers with instruction/stub/constant sections
//! - [`reloc`]: raw relocation records and the typed relocation iterator
//! - [`oop_recorder`]: compile-time object and metadata handle tables
//! - [`debug_info`] / [`oop_map`]: scope and frame metadata recorders
//! - [`stubs`] / [`code_cache`]: generated-stub and code-blob registries
//! - [`meta`]: the symbol/class/method/loader object model
//! - [`env`]: the per-compilation environment and registration sink
//! - [`linker`]: process anchor and dynamic-symbol resolution
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod code_cache;
pub mod debug_info;
pub mod env;
pub mod linker;
pub mod meta;
pub mod oop_map;
pub mod oop_recorder;
pub mod reloc;
pub mod stubs;

mod runtime;

pub use buffer::{CodeAddr, CodeBuffer, CodeSection, SectionKind, NO_ADDRESS, SECT_COUNT};
pub use runtime::{JitFlags, OpalRuntime};

/// Runtime release encoded as `major << 16 | minor << 8 | patch`.
///
/// Archives record this word and refuse to load under a different release.
pub const RUNTIME_VERSION: u32 = (0 << 16) | (4 << 8) | 0;
