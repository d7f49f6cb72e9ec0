//! Scope and program-counter debug metadata for compiled methods.
//!
//! The recorder owns a flat byte stream of encoded scope descriptors plus
//! an array of [`PcDesc`] records mapping instruction offsets into that
//! stream. Both are opaque to everything but the deoptimizer; what matters
//! here is that they serialize and revive byte-for-byte.

use std::sync::Arc;

use crate::oop_recorder::OopRecorder;

/// Size of one encoded [`PcDesc`] record.
pub const PC_DESC_BYTES: usize = 16;

/// Maps one instruction offset to its scope information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcDesc {
    pub pc_offset: i32,
    pub scope_decode_offset: i32,
    pub obj_decode_offset: i32,
    pub flags: u32,
}

impl PcDesc {
    pub fn encode(&self) -> [u8; PC_DESC_BYTES] {
        let mut out = [0u8; PC_DESC_BYTES];
        out[0..4].copy_from_slice(&self.pc_offset.to_le_bytes());
        out[4..8].copy_from_slice(&self.scope_decode_offset.to_le_bytes());
        out[8..12].copy_from_slice(&self.obj_decode_offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> PcDesc {
        PcDesc {
            pc_offset: i32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            scope_decode_offset: i32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            obj_decode_offset: i32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            flags: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
        }
    }
}

/// Records scope streams and pc descriptors during compilation, and is
/// reconstructed verbatim when compiled code is revived.
#[derive(Debug)]
pub struct DebugInformationRecorder {
    oop_recorder: Arc<OopRecorder>,
    stream: Vec<u8>,
    pcs: Vec<PcDesc>,
}

impl DebugInformationRecorder {
    pub fn new(oop_recorder: Arc<OopRecorder>) -> Self {
        DebugInformationRecorder {
            oop_recorder,
            stream: Vec::new(),
            pcs: Vec::new(),
        }
    }

    #[inline]
    pub fn oop_recorder(&self) -> &Arc<OopRecorder> {
        &self.oop_recorder
    }

    /// Bytes of encoded scope data.
    #[inline]
    pub fn data_size(&self) -> usize {
        self.stream.len()
    }

    #[inline]
    pub fn pcs_length(&self) -> usize {
        self.pcs.len()
    }

    #[inline]
    pub fn stream(&self) -> &[u8] {
        &self.stream
    }

    #[inline]
    pub fn pcs(&self) -> &[PcDesc] {
        &self.pcs
    }

    /// Append encoded scope bytes.
    pub fn append_stream(&mut self, bytes: &[u8]) {
        self.stream.extend_from_slice(bytes);
    }

    /// Record a pc descriptor.
    pub fn add_pc_desc(&mut self, desc: PcDesc) {
        self.pcs.push(desc);
    }

    /// Rebuild a recorder from persisted state.
    pub fn from_parts(oop_recorder: Arc<OopRecorder>, stream: Vec<u8>, pcs: Vec<PcDesc>) -> Self {
        DebugInformationRecorder {
            oop_recorder,
            stream,
            pcs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pc_desc_codec_round_trip() {
        let d = PcDesc {
            pc_offset: 0x40,
            scope_decode_offset: -1,
            obj_decode_offset: 12,
            flags: 0b101,
        };
        assert_eq!(PcDesc::decode(&d.encode()), d);
    }

    #[test]
    fn recorder_accumulates() {
        let mut rec = DebugInformationRecorder::new(Arc::new(OopRecorder::new()));
        rec.append_stream(&[1, 2, 3]);
        rec.add_pc_desc(PcDesc {
            pc_offset: 0,
            scope_decode_offset: 0,
            obj_decode_offset: 0,
            flags: 0,
        });
        assert_eq!(rec.data_size(), 3);
        assert_eq!(rec.pcs_length(), 1);
    }
}
