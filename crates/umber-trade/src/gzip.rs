//! Optional gzip framing for request bodies.
//!
//! Sellers advertising `GZIPCompression` receive the whole multipart
//! body gzip-wrapped. For the chunk-data push the stream must surface
//! progress without waiting for the encoder's buffer to fill, so `flush`
//! performs a gzip sync-flush, making everything written so far visible
//! to the receiver.

use std::io::{self, Write};

use flate2::write::GzEncoder;
use flate2::Compression;

/// A sink that is either gzip-encoding or pass-through.
pub enum Compressor<W: Write> {
    /// Gzip-encoded output.
    Gzip(GzEncoder<W>),
    /// Unmodified output.
    Plain(W),
}

impl<W: Write> Compressor<W> {
    /// Wrap `inner`, gzip-encoding iff `compressed`.
    pub fn new(inner: W, compressed: bool) -> Self {
        if compressed {
            Compressor::Gzip(GzEncoder::new(inner, Compression::default()))
        } else {
            Compressor::Plain(inner)
        }
    }

    /// Finalize the gzip stream (if any) and hand back the inner writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            Compressor::Gzip(encoder) => encoder.finish(),
            Compressor::Plain(inner) => Ok(inner),
        }
    }
}

impl<W: Write> Write for Compressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Compressor::Gzip(encoder) => encoder.write(buf),
            Compressor::Plain(inner) => inner.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Compressor::Gzip(encoder) => encoder.flush(),
            Compressor::Plain(inner) => inner.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn test_plain_passthrough() {
        let mut compressor = Compressor::new(Vec::new(), false);
        compressor.write_all(b"as-is").expect("write");
        let inner = compressor.finish().expect("finish");
        assert_eq!(inner, b"as-is");
    }

    #[test]
    fn test_gzip_roundtrip() {
        let mut compressor = Compressor::new(Vec::new(), true);
        compressor.write_all(b"compress me").expect("write");
        let encoded = compressor.finish().expect("finish");
        assert_ne!(encoded, b"compress me");

        let mut decoded = Vec::new();
        GzDecoder::new(encoded.as_slice())
            .read_to_end(&mut decoded)
            .expect("decode");
        assert_eq!(decoded, b"compress me");
    }

    #[test]
    fn test_flush_makes_data_visible() {
        let mut compressor = Compressor::new(Vec::new(), true);
        compressor.write_all(b"first frame").expect("write");
        compressor.flush().expect("flush");

        // After a sync flush the encoded bytes so far must already
        // decode to the full input, without finishing the stream.
        let encoded_so_far = match &compressor {
            Compressor::Gzip(encoder) => encoder.get_ref().clone(),
            Compressor::Plain(_) => unreachable!("gzip mode"),
        };
        assert!(!encoded_so_far.is_empty());

        let mut decoded = Vec::new();
        let mut decoder = GzDecoder::new(encoded_so_far.as_slice());
        decoder.read_to_end(&mut decoded).ok();
        assert_eq!(decoded, b"first frame");
    }
}
