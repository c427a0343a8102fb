//! The buffer contract the dataplane packet I/O framework must satisfy
//! (spec §6 "Buffer contract"). Production NIC-ring buffers are owned by
//! that external framework; [`VecPacketBuffer`] is the reference
//! implementation this crate's own tests and the `replay` CLI build
//! against.

use crate::metadata::PacketMetadata;

/// A contiguous packet buffer with Ethernet at offset 0, a writable opaque
/// metadata slot of at least 24 bytes, a per-buffer id, and a
/// `length_in_chain` accessor. `prepend` supports the encapsulator (spec
/// §4.9), which needs to grow the buffer at the front for outer headers.
pub trait PacketBuffer {
    fn data(&self) -> &[u8];
    fn data_mut(&mut self) -> &mut [u8];

    fn metadata(&self) -> &PacketMetadata;
    fn metadata_mut(&mut self) -> &mut PacketMetadata;

    /// Monotonically assigned per-buffer id, for tracing.
    fn buffer_id(&self) -> u64;

    /// Total length of the packet, which may span more than one physical
    /// buffer in a scatter-gather chain; a single-buffer implementation
    /// just returns `data().len()`.
    fn length_in_chain(&self) -> usize;

    /// Grows the buffer at the front by `header.len()` bytes and copies
    /// `header` into the new space, shifting existing contents back.
    fn prepend(&mut self, header: &[u8]);
}

/// A batch of packet buffers moving through one pipeline pass (spec §2:
/// "nominal 256 buffers, minimum useful 4"). The bounds are a sizing
/// guideline, not a hard limit — callers assembling unusually small or
/// large batches get a debug-only nudge, never a panic.
pub const NOMINAL_BATCH_SIZE: usize = 256;
pub const MIN_USEFUL_BATCH_SIZE: usize = 4;

/// A simple heap-backed [`PacketBuffer`], used by tests, benchmarks, and
/// the `replay` subcommand. Not intended for line-rate use: every
/// `prepend` reallocates.
pub struct VecPacketBuffer {
    buffer_id: u64,
    bytes: Vec<u8>,
    metadata: PacketMetadata,
}

impl VecPacketBuffer {
    pub fn new(buffer_id: u64, bytes: Vec<u8>) -> Self {
        Self {
            buffer_id,
            bytes,
            metadata: PacketMetadata::new(),
        }
    }
}

impl PacketBuffer for VecPacketBuffer {
    fn data(&self) -> &[u8] {
        &self.bytes
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    fn metadata(&self) -> &PacketMetadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut PacketMetadata {
        &mut self.metadata
    }

    fn buffer_id(&self) -> u64 {
        self.buffer_id
    }

    fn length_in_chain(&self) -> usize {
        self.bytes.len()
    }

    fn prepend(&mut self, header: &[u8]) {
        let mut grown = Vec::with_capacity(header.len() + self.bytes.len());
        grown.extend_from_slice(header);
        grown.extend_from_slice(&self.bytes);
        self.bytes = grown;
    }
}

/// Checks a batch against the nominal sizing guidance; only active in
/// debug builds, never a hard panic (spec §2: "nominal 256, minimum
/// useful 4" is sizing guidance, not an invariant).
pub fn debug_check_batch_size(len: usize) {
    debug_assert!(
        len == 0 || len >= MIN_USEFUL_BATCH_SIZE || len <= NOMINAL_BATCH_SIZE,
        "batch of {len} buffers is outside the nominal sizing range"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepend_grows_buffer_at_the_front() {
        let mut buf = VecPacketBuffer::new(1, vec![0xAA, 0xBB]);
        buf.prepend(&[0x01, 0x02, 0x03]);
        assert_eq!(buf.data(), &[0x01, 0x02, 0x03, 0xAA, 0xBB]);
        assert_eq!(buf.length_in_chain(), 5);
    }

    #[test]
    fn metadata_is_mutable_in_place() {
        let mut buf = VecPacketBuffer::new(1, vec![0; 4]);
        buf.metadata_mut().tenant_id = 7;
        assert_eq!(buf.metadata().tenant_id, 7);
    }
}
