//! Rolling-hash content-defined chunk splitting.
//!
//! A 48-byte window rolls an Adler-32-style checksum over the content; a
//! chunk boundary falls wherever the low bits of the checksum are all
//! ones, subject to minimum and maximum chunk sizes. Boundaries depend
//! only on the window content, so identical data always chunks
//! identically and chunk layouts re-synchronize shortly after an
//! insertion or deletion.

use std::ops::Range;

/// Width of the rolling window in bytes.
pub const WINDOW_SIZE: usize = 48;

/// Minimum chunk size; no boundary is accepted earlier.
pub const MIN_CHUNK_SIZE: usize = 2 * 1024;

/// Maximum chunk size; a boundary is forced here.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// A boundary falls where `digest & MASK == MASK` (expected chunk size
/// around 8 KiB past the minimum).
const BOUNDARY_MASK: u32 = 8191;

/// Adler-32-style rolling checksum over a fixed window.
struct RollingAdler {
    a: u32,
    b: u32,
    window: [u8; WINDOW_SIZE],
    pos: usize,
}

impl RollingAdler {
    fn new() -> Self {
        Self {
            a: 1,
            b: 0,
            window: [0u8; WINDOW_SIZE],
            pos: 0,
        }
    }

    /// Push a byte, evicting the byte that leaves the window.
    fn roll(&mut self, byte: u8) {
        let out = self.window[self.pos] as u32;
        self.window[self.pos] = byte;
        self.pos = (self.pos + 1) % WINDOW_SIZE;

        self.a = self.a.wrapping_add(byte as u32).wrapping_sub(out);
        self.b = self
            .b
            .wrapping_add(self.a)
            .wrapping_sub((WINDOW_SIZE as u32).wrapping_mul(out));
    }

    fn digest(&self) -> u32 {
        (self.b << 16) | (self.a & 0xFFFF)
    }
}

/// Split `data` into chunk byte ranges.
///
/// The returned ranges are contiguous, non-empty and cover `data`
/// exactly. Empty input yields a single empty range so that every blob
/// has at least one chunk.
pub fn split(data: &[u8]) -> Vec<Range<usize>> {
    if data.is_empty() {
        return vec![0..0];
    }

    let mut ranges = Vec::new();
    let mut start = 0usize;
    let mut hash = RollingAdler::new();

    for (i, &byte) in data.iter().enumerate() {
        hash.roll(byte);
        let len = i + 1 - start;
        if len < MIN_CHUNK_SIZE {
            continue;
        }
        if len >= MAX_CHUNK_SIZE || hash.digest() & BOUNDARY_MASK == BOUNDARY_MASK {
            ranges.push(start..i + 1);
            start = i + 1;
            hash = RollingAdler::new();
        }
    }

    if start < data.len() {
        ranges.push(start..data.len());
    }
    ranges
}
