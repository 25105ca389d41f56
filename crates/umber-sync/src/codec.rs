//! Chunk body encoding and decoding.
//!
//! The sender emits the bodies of the chunks requested by the wishlist,
//! each framed as `{length: uvarint}{bytes}`. With a non-trivial
//! permutation, chunks are bucketed by the permutation applied to the
//! first byte of their key, then ordered by natural index within a
//! bucket. The trivial permutation marks legacy mode: bodies travel in
//! natural order. No terminator frame exists; the receiver knows the
//! count from its own wishlist.
//!
//! The sink is flushed after every frame so that a compressing or
//! pipelining sink shows the receiver steady progress.

use std::io::{Read, Write};

use umber_cafs::File;
use umber_types::Fingerprint;

use crate::wishlist::Wishlist;
use crate::{varint, Result, SyncError, SyncInfo};

/// Progress observer: `(bytes_total, bytes_transmitted)`.
pub type ProgressFn<'a> = &'a mut dyn FnMut(u64, u64);

/// Stream the requested chunk bodies of `file` into `sink`.
///
/// `bytes_total` reported to `progress` is the sum of the requested
/// chunk lengths, computed before transmission starts.
pub fn write_chunk_data<W: Write>(
    file: &File,
    wishlist: &Wishlist,
    info: &SyncInfo,
    sink: &mut W,
    progress: ProgressFn<'_>,
) -> Result<()> {
    let mut requested: Vec<umber_cafs::Chunk> = file
        .chunks()
        .filter(|c| wishlist.wants(c.index))
        .collect();
    let bytes_total: u64 = requested.iter().map(|c| c.data.len() as u64).sum();
    if !info.has_trivial_permutation() {
        requested.sort_by_key(|c| (info.bucket_of(&c.key), c.index));
    }

    tracing::debug!(
        requested = requested.len(),
        of = file.num_chunks(),
        bytes_total,
        "sending chunk data"
    );

    let mut transmitted = 0u64;
    for chunk in requested {
        varint::write(sink, chunk.data.len() as u64)?;
        sink.write_all(&chunk.data)?;
        sink.flush()?;
        transmitted += chunk.data.len() as u64;
        progress(bytes_total, transmitted);
    }
    Ok(())
}

/// Reassemble the frame stream produced by [`write_chunk_data`].
///
/// Returns `(natural_index, body)` pairs in emission order. Every body
/// is verified against the key announced in the header.
pub fn read_chunk_data<R: Read>(
    info: &SyncInfo,
    wishlist: &Wishlist,
    r: &mut R,
) -> Result<Vec<(usize, Vec<u8>)>> {
    let mut order: Vec<usize> = (0..info.num_chunks())
        .filter(|&i| wishlist.wants(i))
        .collect();
    if !info.has_trivial_permutation() {
        order.sort_by_key(|&i| (info.bucket_of(&info.chunks[i].key), i));
    }

    let mut received = Vec::with_capacity(order.len());
    for index in order {
        let len = varint::read(r)?.ok_or_else(|| {
            SyncError::InvalidEncoding(format!("stream ended before chunk {index}"))
        })?;
        let expected = &info.chunks[index];
        if len != expected.size {
            return Err(SyncError::InvalidEncoding(format!(
                "chunk {index}: frame length {len}, header says {}",
                expected.size
            )));
        }
        let mut body = vec![0u8; len as usize];
        r.read_exact(&mut body)?;
        if digest(&body) != expected.key {
            return Err(SyncError::ChunkMismatch { index });
        }
        received.push((index, body));
    }
    Ok(received)
}

fn digest(data: &[u8]) -> Fingerprint {
    use sha2::Digest;
    let mut hasher = sha2::Sha256::new();
    hasher.update(data);
    Fingerprint::from_bytes(hasher.finalize().into())
}
