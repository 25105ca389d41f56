//! The in-memory store, owning file handles and temp sinks.
//!
//! Handles carry ownership: every [`File`] — created, fetched or
//! duplicated — counts against the store's live-handle tally until it is
//! dropped. [`Store::live_handles`] lets callers verify that an
//! operation released everything it acquired.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use umber_types::Fingerprint;

use crate::{chunker, CafsError, Result};

/// A content-addressed blob store. Clones share the same storage.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<StoreInner>>,
}

struct StoreInner {
    files: HashMap<Fingerprint, FileRecord>,
    chunks: HashMap<Fingerprint, Arc<Vec<u8>>>,
    live_handles: usize,
}

struct FileRecord {
    chunk_keys: Vec<Fingerprint>,
    size: u64,
}

/// One chunk of a stored file.
#[derive(Clone)]
pub struct Chunk {
    /// Zero-based position within the file.
    pub index: usize,
    /// SHA-256 of the chunk bytes.
    pub key: Fingerprint,
    /// The chunk bytes.
    pub data: Arc<Vec<u8>>,
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                files: HashMap::new(),
                chunks: HashMap::new(),
                live_handles: 0,
            })),
        }
    }

    /// Open a temp sink. `info` describes the pending content for logs.
    pub fn create(&self, info: &str) -> Temp {
        Temp {
            store: self.clone(),
            info: info.to_string(),
            buf: Vec::new(),
            state: TempState::Open,
        }
    }

    /// Fetch an owning handle to a stored blob.
    pub fn get(&self, key: &Fingerprint) -> Result<File> {
        let mut inner = self.lock();
        let record = inner
            .files
            .get(key)
            .ok_or_else(|| CafsError::FileNotFound(key.to_hex()))?;
        let size = record.size;
        let num_chunks = record.chunk_keys.len();
        inner.live_handles += 1;
        Ok(File {
            store: self.clone(),
            key: *key,
            size,
            num_chunks,
        })
    }

    /// Whether a blob with the given key is stored.
    pub fn contains(&self, key: &Fingerprint) -> bool {
        self.lock().files.contains_key(key)
    }

    /// Number of outstanding [`File`] handles.
    pub fn live_handles(&self) -> usize {
        self.lock().live_handles
    }

    /// Convenience: store a byte blob and return a handle to it.
    pub fn add_blob(&self, info: &str, data: &[u8]) -> Result<File> {
        let mut temp = self.create(info);
        temp.write_all(data)
            .map_err(|e| CafsError::TempNotOpen(e.to_string()))?;
        temp.close()?;
        temp.file()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        // The store never panics while holding its lock.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

/// An owning handle to a stored blob.
pub struct File {
    store: Store,
    key: Fingerprint,
    size: u64,
    num_chunks: usize,
}

impl File {
    /// Content key of the blob.
    pub fn key(&self) -> Fingerprint {
        self.key
    }

    /// Total size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the blob consists of more than one chunk.
    pub fn is_chunked(&self) -> bool {
        self.num_chunks > 1
    }

    /// Number of chunks.
    pub fn num_chunks(&self) -> usize {
        self.num_chunks
    }

    /// Open a reader over the whole content.
    pub fn open(&self) -> FileReader {
        FileReader {
            iter: self.chunks(),
            current: None,
            offset: 0,
        }
    }

    /// Lazy, restartable iterator over `(index, key, bytes)` chunks.
    pub fn chunks(&self) -> ChunkIter {
        let keys = {
            let inner = self.store.lock();
            inner
                .files
                .get(&self.key)
                .map(|r| r.chunk_keys.clone())
                .unwrap_or_default()
        };
        ChunkIter {
            store: self.store.clone(),
            keys,
            next: 0,
        }
    }

    /// Create an independent owning handle to the same blob.
    pub fn duplicate(&self) -> File {
        self.store.lock().live_handles += 1;
        File {
            store: self.store.clone(),
            key: self.key,
            size: self.size,
            num_chunks: self.num_chunks,
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        let mut inner = self.store.lock();
        inner.live_handles = inner.live_handles.saturating_sub(1);
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("key", &self.key)
            .field("size", &self.size)
            .field("num_chunks", &self.num_chunks)
            .finish()
    }
}

/// Iterator over the chunks of a file.
pub struct ChunkIter {
    store: Store,
    keys: Vec<Fingerprint>,
    next: usize,
}

impl Iterator for ChunkIter {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let key = *self.keys.get(self.next)?;
        let data = {
            let inner = self.store.lock();
            inner.chunks.get(&key).cloned()
        };
        let data = match data {
            Some(d) => d,
            None => {
                tracing::error!(chunk = %key, "chunk missing from store");
                return None;
            }
        };
        let chunk = Chunk {
            index: self.next,
            key,
            data,
        };
        self.next += 1;
        Some(chunk)
    }
}

/// Reader over the concatenated chunks of a file.
pub struct FileReader {
    iter: ChunkIter,
    current: Option<Arc<Vec<u8>>>,
    offset: usize,
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(data) = &self.current {
                if self.offset < data.len() {
                    let n = (data.len() - self.offset).min(buf.len());
                    buf[..n].copy_from_slice(&data[self.offset..self.offset + n]);
                    self.offset += n;
                    return Ok(n);
                }
            }
            match self.iter.next() {
                Some(chunk) => {
                    self.current = Some(chunk.data);
                    self.offset = 0;
                }
                None => return Ok(0),
            }
        }
    }
}

/// SHA-256 content key of a byte string.
fn content_key(data: &[u8]) -> Fingerprint {
    use sha2::Digest;
    let mut hasher = sha2::Sha256::new();
    hasher.update(data);
    Fingerprint::from_bytes(hasher.finalize().into())
}

enum TempState {
    Open,
    Closed(Fingerprint),
    Disposed,
}

/// A write sink that becomes a stored blob on [`Temp::close`].
///
/// Dropping an unclosed temp disposes its pending content.
pub struct Temp {
    store: Store,
    info: String,
    buf: Vec<u8>,
    state: TempState,
}

impl Temp {
    /// Finalize the content: chunk it, store it, compute the key.
    pub fn close(&mut self) -> Result<()> {
        if !matches!(self.state, TempState::Open) {
            return Err(CafsError::TempNotOpen(self.info.clone()));
        }

        let ranges = chunker::split(&self.buf);
        let key = content_key(&self.buf);

        let mut chunk_keys = Vec::with_capacity(ranges.len());
        let mut inner = self.store.lock();
        for range in ranges {
            let chunk_data = self.buf[range].to_vec();
            let chunk_key = content_key(&chunk_data);
            inner
                .chunks
                .entry(chunk_key)
                .or_insert_with(|| Arc::new(chunk_data));
            chunk_keys.push(chunk_key);
        }
        let num_chunks = chunk_keys.len();
        inner.files.insert(
            key,
            FileRecord {
                chunk_keys,
                size: self.buf.len() as u64,
            },
        );
        drop(inner);

        tracing::debug!(
            info = %self.info,
            key = %key,
            size = self.buf.len(),
            num_chunks,
            "temp closed into store"
        );
        self.buf = Vec::new();
        self.state = TempState::Closed(key);
        Ok(())
    }

    /// Handle to the stored blob. Only valid after [`Temp::close`].
    pub fn file(&self) -> Result<File> {
        match &self.state {
            TempState::Closed(key) => self.store.get(key),
            _ => Err(CafsError::TempNotClosed(self.info.clone())),
        }
    }

    /// Discard the temp. Equivalent to dropping it.
    pub fn dispose(mut self) {
        self.state = TempState::Disposed;
    }
}

impl Write for Temp {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !matches!(self.state, TempState::Open) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("temp is not open: {}", self.info),
            ));
        }
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Temp {
    fn drop(&mut self) {
        if matches!(self.state, TempState::Open) {
            tracing::debug!(info = %self.info, "temp disposed without close");
        }
    }
}
