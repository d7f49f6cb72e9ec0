//! Relocation codec and cross-process fix-up.
//!
//! Per section the archive stores:
//!
//! ```text
//! i32 reloc_count                  raw unit count; 0 ends the section
//! i32 locs_point_off
//! u16[reloc_count]                 the raw relocation stream, verbatim
//! u32[reloc_count]                 auxiliary payload, one per unit slot
//! ```
//!
//! followed by the tagged immediates of any immediate oop/metadata
//! relocations, in iteration order. Re-reading the exact units the store
//! wrote lets the loader re-create a live relocation iterator over the new
//! section cheaply; the auxiliary payload carries only what the raw bytes
//! cannot: the cross-process identity of every call and word target.
//!
//! The payload meaning per type, and the load action, are dispatched in
//! [`read_relocations`]; unhandled types abort, as they mean the archive
//! machinery is out of sync with the relocation set the compiler emits.

use log::warn;
use smallvec::SmallVec;

use opal_code::oop_recorder::OopRecorder;
use opal_code::reloc::{self, RelocIterator, RelocType};
use opal_code::meta::MethodHandle;
use opal_code::{CodeBuffer, OpalRuntime, SectionKind};

use crate::error::{ArchiveError, ArchiveResult, SkipReason};
use crate::io::{Reader, StoreBuffer};
use crate::meta;
use crate::table::{AddressTable, NO_FIXUP_ID};

/// What an immediate relocation defers to the stream suffix.
enum Immediate {
    Oop(opal_code::meta::JitObject),
    Metadata(opal_code::meta::MetadataRef),
}

/// Append `buffer`'s per-section relocations. Returns the largest raw
/// stream size in bytes across sections, recorded in the entry so the
/// loader can size its buffers.
pub fn write_relocations(
    buf: &mut StoreBuffer,
    table: &AddressTable,
    runtime: &OpalRuntime,
    buffer: &CodeBuffer,
) -> ArchiveResult<u32> {
    let mut max_units = 0usize;
    for kind in SectionKind::ALL {
        max_units = max_units.max(buffer.section(kind).locs_count());
    }

    for kind in SectionKind::ALL {
        let cs = buffer.section(kind);
        let count = cs.locs_count();
        buf.write_i32(count as i32)?;
        if count == 0 {
            continue;
        }
        buf.write_i32(cs.locs_point_off() as i32)?;
        for &unit in cs.locs() {
            buf.write_u16(unit)?;
        }

        let mut aux: SmallVec<[u32; 16]> = SmallVec::from_elem(0, count);
        let mut immediates: Vec<Immediate> = Vec::new();
        let mut iter = RelocIterator::new(cs.locs());
        let mut j = 0usize;
        while iter.next() {
            match iter.reloc_type() {
                RelocType::None
                | RelocType::Poll
                | RelocType::PollReturn
                | RelocType::PostCallNop
                | RelocType::StaticStub
                | RelocType::InternalWord
                | RelocType::SectionWord => {}
                RelocType::Oop => {
                    let index = iter.data().first().copied().unwrap_or(0);
                    if index == 0 {
                        let handle = cs.read_addr_at(iter.offset());
                        let obj = runtime.resolve_oop_handle(handle).ok_or(
                            ArchiveError::Skip(SkipReason::UnknownHandle(handle)),
                        )?;
                        immediates.push(Immediate::Oop(obj));
                        aux[j] = j as u32;
                    }
                }
                RelocType::Metadata => {
                    let index = iter.data().first().copied().unwrap_or(0);
                    if index == 0 {
                        let handle = cs.read_addr_at(iter.offset());
                        let m = runtime.resolve_metadata_handle(handle).ok_or(
                            ArchiveError::Skip(SkipReason::UnknownHandle(handle)),
                        )?;
                        immediates.push(Immediate::Metadata(m));
                        aux[j] = j as u32;
                    }
                }
                RelocType::VirtualCall
                | RelocType::OptVirtualCall
                | RelocType::StaticCall
                | RelocType::RuntimeCall => {
                    let dest = reloc::call_destination(cs, iter.offset());
                    aux[j] = table.id_for_address(dest);
                }
                RelocType::ExternalWord => {
                    let target = reloc::external_target(cs, iter.offset(), iter.data());
                    aux[j] = table.id_for_address(target);
                }
                RelocType::RuntimeCallWithCp => {
                    panic!("runtime_call_w_cp relocation unimplemented");
                }
                RelocType::DataPrefix => unreachable!("prefix units are consumed by the iterator"),
            }
            j += 1;
        }
        debug_assert!(j <= count);

        for &a in aux.iter() {
            buf.write_u32(a)?;
        }
        for imm in &immediates {
            match imm {
                Immediate::Oop(obj) => meta::write_oop(buf, obj)?,
                Immediate::Metadata(m) => meta::write_metadata_ref(buf, m)?,
            }
        }
    }
    Ok((max_units * 2) as u32)
}

/// Decode and apply per-section relocations into `buffer`.
///
/// `orig` is the descriptor replica of the storing process's buffer; word
/// targets that pointed into it are rebased onto `buffer`'s sections.
/// `comp_method` provides the loader for symbolic immediates; artifacts
/// without one (blobs) cannot carry object or metadata immediates.
#[allow(clippy::too_many_arguments)]
pub fn read_relocations(
    r: &mut Reader<'_>,
    table: &AddressTable,
    runtime: &OpalRuntime,
    buffer: &mut CodeBuffer,
    orig: &CodeBuffer,
    recorder: &OopRecorder,
    comp_method: Option<&MethodHandle>,
) -> ArchiveResult<()> {
    for kind in SectionKind::ALL {
        let count = r.read_i32()? as usize;
        if count == 0 {
            continue;
        }
        let locs_point_off = r.read_i32()? as usize;
        let units = r.read_u16_array(count)?;
        let mut aux = Vec::with_capacity(count);
        for _ in 0..count {
            aux.push(r.read_u32()?);
        }
        buffer
            .section_mut(kind)
            .set_locs(units.clone(), locs_point_off);

        let mut iter = RelocIterator::new(&units);
        let mut j = 0usize;
        while iter.next() {
            let off = iter.offset();
            match iter.reloc_type() {
                RelocType::None
                | RelocType::Poll
                | RelocType::PollReturn
                | RelocType::PostCallNop => {}
                RelocType::Oop => {
                    let index = iter.data().first().copied().unwrap_or(0);
                    if index == 0 {
                        debug_assert_eq!(aux[j], j as u32);
                        let cm = comp_method.ok_or(ArchiveError::Skip(
                            SkipReason::UnsupportedObjectKind("object outside a method"),
                        ))?;
                        let obj = meta::read_oop(r, runtime, cm)?;
                        buffer.section_mut(kind).write_addr_at(off, obj.handle());
                        recorder.keep_immediate(obj);
                    }
                    // Indexed references resolve through the recorder when
                    // the buffer finalizes its oop references.
                }
                RelocType::Metadata => {
                    let index = iter.data().first().copied().unwrap_or(0);
                    if index == 0 {
                        debug_assert_eq!(aux[j], j as u32);
                        let cm = comp_method.ok_or(ArchiveError::Skip(
                            SkipReason::UnsupportedObjectKind("metadata outside a method"),
                        ))?;
                        let m = meta::read_metadata_ref(r, runtime, cm)?;
                        buffer.section_mut(kind).write_addr_at(off, m.handle());
                    }
                }
                RelocType::VirtualCall
                | RelocType::OptVirtualCall
                | RelocType::StaticCall
                | RelocType::RuntimeCall => {
                    if aux[j] != NO_FIXUP_ID {
                        let dest = table.address_for_id(aux[j]);
                        let cs = buffer.section_mut(kind);
                        reloc::set_call_destination(cs, off, dest);
                    }
                }
                RelocType::StaticStub | RelocType::InternalWord | RelocType::SectionWord => {
                    reloc::fix_word_after_move(orig, buffer, kind, off);
                }
                RelocType::ExternalWord => {
                    reloc::fix_word_after_move(orig, buffer, kind, off);
                    if aux[j] != NO_FIXUP_ID {
                        let target = table.address_for_id(aux[j]);
                        if iter.has_data() {
                            let packed = reloc::pack_addr(target);
                            let range = iter.data_unit_range();
                            if packed.len() > range.len() {
                                warn!(
                                    target: "sca",
                                    "External word target {:#x} does not fit its {}-word record",
                                    target,
                                    range.len()
                                );
                                return Err(ArchiveError::Skip(
                                    SkipReason::RelocPayloadOverflow {
                                        needed: packed.len(),
                                        have: range.len(),
                                    },
                                ));
                            }
                            let locs = buffer.section_mut(kind).locs_mut();
                            for (i, slot) in locs[range].iter_mut().enumerate() {
                                *slot = packed.get(i).copied().unwrap_or(0);
                            }
                        } else {
                            buffer.section_mut(kind).write_addr_at(off, target);
                        }
                    }
                }
                RelocType::RuntimeCallWithCp => {
                    panic!("runtime_call_w_cp relocation unimplemented");
                }
                RelocType::DataPrefix => unreachable!("prefix units are consumed by the iterator"),
            }
            j += 1;
        }
        debug_assert!(j <= count);
    }
    Ok(())
}
