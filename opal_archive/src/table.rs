//! Symbolic address table.
//!
//! Every externally addressable target a relocation can point at gets a
//! small stable id, so machine code stored by one process can be revived
//! at different addresses by another. The id space is a `u32`:
//!
//! ```text
//! 0xFFFF_FFFF                     no-fixup sentinel (target was -1)
//! [0, E)                          external runtime function index
//! [E, E+S)                        shared stub index
//! [E+S, E+S+B)                    shared call-blob index
//! [ALL_MAX, ALL_MAX + strings)    interned C-string pool index
//! (ALL_MAX + MAX_STRINGS, ..)     distance from the process anchor
//! ```
//!
//! where E, S, B are the lengths of the three address ranges, together
//! capped at `ALL_MAX`. The distance form covers addresses that belong to
//! no registered target but resolve to a named dynamic symbol at a
//! non-zero offset; the receiving process reconstructs `anchor + id`.
//!
//! The table fills in two phases at startup: the base phase with
//! compiler-independent targets, and an optimizing-compiler phase with its
//! runtime blobs. Encoding refuses to run before the base phase is done;
//! misses after that are programmer errors and abort loudly.

use std::sync::Arc;

use log::{info, warn};
use parking_lot::RwLock;

use opal_code::{CodeAddr, OpalRuntime, NO_ADDRESS};

use crate::error::ArchiveResult;
use crate::io::StoreBuffer;
use crate::strings::StringPool;

/// Base of the string-id range; also the cap on registered addresses.
pub const ALL_MAX: u32 = 1024;

/// Maximum strings the pool accepts.
pub const MAX_STRINGS: u32 = 256;

/// Id of a target that needs no fix-up.
pub const NO_FIXUP_ID: u32 = u32::MAX;

/// First id interpreted as a distance from the process anchor.
pub const DISTANCE_BASE: u32 = ALL_MAX + MAX_STRINGS;

#[derive(Debug, Default)]
struct TableState {
    extrs: Vec<CodeAddr>,
    stubs: Vec<CodeAddr>,
    blobs: Vec<CodeAddr>,
    strings: StringPool,
    loaded_strings: Vec<CodeAddr>,
    base_complete: bool,
    opto_complete: bool,
}

impl TableState {
    #[inline]
    fn registered(&self) -> u32 {
        (self.extrs.len() + self.stubs.len() + self.blobs.len()) as u32
    }
}

/// Process-global id/address directory for archived relocations.
pub struct AddressTable {
    runtime: Arc<OpalRuntime>,
    state: RwLock<TableState>,
}

impl AddressTable {
    pub fn new(runtime: Arc<OpalRuntime>) -> AddressTable {
        AddressTable {
            runtime,
            state: RwLock::new(TableState::default()),
        }
    }

    /// Register the compiler-independent targets and mark the base phase
    /// complete.
    pub fn init_base(&self, extrs: &[CodeAddr], stubs: &[CodeAddr], blobs: &[CodeAddr]) {
        let mut state = self.state.write();
        assert!(!state.base_complete, "address table base phase ran twice");
        state.extrs.extend_from_slice(extrs);
        state.stubs.extend_from_slice(stubs);
        state.blobs.extend_from_slice(blobs);
        assert!(
            state.registered() < ALL_MAX,
            "address table exceeds id space"
        );
        state.base_complete = true;
        info!(
            target: "sca",
            "Address table initialized: {} externals, {} stubs, {} blobs",
            state.extrs.len(),
            state.stubs.len(),
            state.blobs.len()
        );
    }

    /// Register the optimizing compiler's blobs and mark its phase done.
    pub fn init_opto(&self, blobs: &[CodeAddr]) {
        let mut state = self.state.write();
        assert!(state.base_complete, "base phase must run first");
        state.blobs.extend_from_slice(blobs);
        assert!(
            state.registered() < ALL_MAX,
            "address table exceeds id space"
        );
        state.opto_complete = true;
        info!(target: "sca", "Address table optimizing-compiler phase added {} blobs", blobs.len());
    }

    #[inline]
    pub fn base_complete(&self) -> bool {
        self.state.read().base_complete
    }

    #[inline]
    pub fn opto_complete(&self) -> bool {
        self.state.read().opto_complete
    }

    // -------------------------------------------------------------------------
    // Strings
    // -------------------------------------------------------------------------

    /// Register an interned C string by address identity. Dropped silently
    /// while the table is incomplete, and with a warning once the pool cap
    /// is hit.
    pub fn add_string(&self, addr: CodeAddr, bytes: &[u8]) {
        let mut state = self.state.write();
        if !state.base_complete {
            return;
        }
        if state.strings.find(addr).is_none() && state.strings.len() as u32 >= MAX_STRINGS {
            warn!(target: "sca", "String pool full; dropping string at {:#x}", addr);
            return;
        }
        state.strings.add(addr, bytes);
    }

    /// Number of pooled strings on the store side.
    pub fn string_count(&self) -> u32 {
        self.state.read().strings.len() as u32
    }

    /// Append the pool in wire form at finalization.
    pub fn encode_strings(&self, buf: &mut StoreBuffer) -> ArchiveResult<u32> {
        self.state.read().strings.encode(buf)
    }

    /// Install the loaded pool's in-image string addresses.
    pub fn set_loaded_strings(&self, addrs: Vec<CodeAddr>) {
        self.state.write().loaded_strings = addrs;
    }

    // -------------------------------------------------------------------------
    // Encoding
    // -------------------------------------------------------------------------

    /// Id of `addr` for the store side.
    ///
    /// Panics when the table is incomplete or the address belongs to a
    /// known target category but is not registered; those are runtime
    /// configuration bugs that must not produce a silently wrong archive.
    pub fn id_for_address(&self, addr: CodeAddr) -> u32 {
        if addr == NO_ADDRESS {
            return NO_FIXUP_ID;
        }
        let state = self.state.read();
        assert!(state.base_complete, "address table is not complete");

        if let Some(i) = state.strings.find(addr) {
            return ALL_MAX + i;
        }

        let runtime = &self.runtime;
        if runtime.stub_routines().contains(addr) {
            if let Some(i) = search_address(addr, &state.stubs) {
                return state.extrs.len() as u32 + i;
            }
            let name = runtime
                .stub_routines()
                .desc_for(addr)
                .map(|d| d.name)
                .unwrap_or_else(|| "<unknown>".to_string());
            panic!(
                "address {:#x} for stub '{}' is missing in the address table",
                addr, name
            );
        }

        if let Some(blob) = runtime.code_cache().find_blob(addr) {
            if let Some(i) = search_address(addr, &state.blobs) {
                return (state.extrs.len() + state.stubs.len()) as u32 + i;
            }
            panic!(
                "address {:#x} for blob '{}' is missing in the address table",
                addr,
                blob.name()
            );
        }

        if let Some(i) = search_address(addr, &state.extrs) {
            return i;
        }

        // Last resort: a named dynamic symbol at a non-zero offset is
        // typically a string constant; encode its anchor distance.
        match runtime.linker().address_to_symbol(addr) {
            Some(sym) if sym.offset > 0 => {
                info!(
                    target: "sca",
                    "Address {:#x} in '{}' not in address table; encoding anchor distance",
                    addr, sym.name
                );
                let dist = addr.checked_sub(runtime.anchor()).unwrap_or_else(|| {
                    panic!("address {:#x} precedes the process anchor", addr)
                });
                assert!(
                    dist > DISTANCE_BASE as u64 && dist < NO_FIXUP_ID as u64,
                    "anchor distance {:#x} collides with the id ranges",
                    dist
                );
                dist as u32
            }
            Some(sym) => panic!(
                "address {:#x} for runtime target '{}+{}' is missing in the address table",
                addr, sym.name, sym.offset
            ),
            None => panic!(
                "address {:#x} for <unknown> is missing in the address table",
                addr
            ),
        }
    }

    /// Address of `id` for the load side. The inverse of
    /// [`AddressTable::id_for_address`]; invalid ids abort.
    pub fn address_for_id(&self, id: u32) -> CodeAddr {
        let state = self.state.read();
        assert!(state.base_complete, "address table is not complete");
        let registered = state.registered();
        assert!(
            id != NO_FIXUP_ID && id != registered,
            "incorrect id {} for the address table",
            id
        );

        if id < registered {
            let mut i = id as usize;
            if i < state.extrs.len() {
                return state.extrs[i];
            }
            i -= state.extrs.len();
            if i < state.stubs.len() {
                return state.stubs[i];
            }
            i -= state.stubs.len();
            return state.blobs[i];
        }

        if id >= ALL_MAX && id < ALL_MAX + MAX_STRINGS {
            let i = (id - ALL_MAX) as usize;
            if state.loaded_strings.is_empty() {
                // A store-mode process decoding its own ids sees the pool.
                return match state.strings.addr_at(i) {
                    Some(a) => a,
                    None => panic!("string id {} outside the pool", id),
                };
            }
            return match state.loaded_strings.get(i) {
                Some(&a) => a,
                None => panic!("string id {} outside the pool", id),
            };
        }

        if id >= DISTANCE_BASE {
            return self.runtime.anchor() + id as CodeAddr;
        }

        panic!("incorrect id {} for the address table", id);
    }
}

/// Linear scan; the table holds a few hundred entries at most and stays
/// cache resident.
fn search_address(addr: CodeAddr, table: &[CodeAddr]) -> Option<u32> {
    table.iter().position(|&a| a == addr).map(|i| i as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_code::code_cache::CodeBlob;
    use opal_code::linker::StaticLinker;

    const ANCHOR: CodeAddr = 0x10_0000;

    fn runtime_with_linker() -> Arc<OpalRuntime> {
        let linker = StaticLinker::new();
        linker.register("message_table", ANCHOR + 0x9000, 0x100);
        OpalRuntime::new(Box::new(linker), ANCHOR)
    }

    fn populated_table(runtime: &Arc<OpalRuntime>) -> AddressTable {
        runtime.stub_routines().register("checkcast", 0x2000, 0x2040);
        runtime
            .code_cache()
            .register_blob(CodeBlob::new("deopt_blob", 0x3000, 0x80, 0x3000));
        let table = AddressTable::new(runtime.clone());
        table.init_base(&[0x5000, 0x5008], &[0x2000], &[0x3000]);
        table.init_opto(&[0x3040]);
        // Pretend the opto blob occupies a registered range too.
        runtime
            .code_cache()
            .register_blob(CodeBlob::new("rethrow", 0x3040, 0x20, 0x3040));
        table
    }

    #[test]
    fn ranges_round_trip() {
        let rt = runtime_with_linker();
        let table = populated_table(&rt);

        for addr in [0x5000u64, 0x5008, 0x2000, 0x3000, 0x3040] {
            let id = table.id_for_address(addr);
            assert!(id < ALL_MAX);
            assert_eq!(table.address_for_id(id), addr, "id {}", id);
        }
    }

    #[test]
    fn sentinel_needs_no_table() {
        let rt = runtime_with_linker();
        let table = AddressTable::new(rt);
        assert_eq!(table.id_for_address(NO_ADDRESS), NO_FIXUP_ID);
    }

    #[test]
    fn strings_use_the_high_range() {
        let rt = runtime_with_linker();
        let table = populated_table(&rt);
        table.add_string(0x7000, b"fmt");
        let id = table.id_for_address(0x7000);
        assert_eq!(id, ALL_MAX);
        assert_eq!(table.address_for_id(id), 0x7000);
    }

    #[test]
    fn strings_dropped_before_completion() {
        let rt = runtime_with_linker();
        let table = AddressTable::new(rt);
        table.add_string(0x7000, b"early");
        assert_eq!(table.string_count(), 0);
    }

    #[test]
    fn distance_fallback_for_named_symbols() {
        let rt = runtime_with_linker();
        let table = populated_table(&rt);
        // +0x10 into message_table: resolvable, non-zero offset.
        let addr = ANCHOR + 0x9010;
        let id = table.id_for_address(addr);
        assert!(id >= DISTANCE_BASE);
        assert_eq!(table.address_for_id(id), addr);
    }

    #[test]
    #[should_panic(expected = "missing in the address table")]
    fn unknown_address_aborts() {
        let rt = runtime_with_linker();
        let table = populated_table(&rt);
        table.id_for_address(0xDEAD_0000);
    }

    #[test]
    #[should_panic(expected = "is not complete")]
    fn encode_requires_base_phase() {
        let rt = runtime_with_linker();
        let table = AddressTable::new(rt);
        table.id_for_address(0x5000);
    }

    #[test]
    #[should_panic(expected = "incorrect id")]
    fn boundary_id_is_invalid() {
        let rt = runtime_with_linker();
        let table = populated_table(&rt);
        // id == registered count is the reserved invalid boundary.
        table.address_for_id(5);
    }
}
