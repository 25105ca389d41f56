//! In-memory byte pipe bridging a synchronous producer to a streaming
//! HTTP request body.
//!
//! A producer task (running under `spawn_blocking`) writes a multipart
//! body into the [`PipeWriter`]; the HTTP client pulls the bytes out of
//! the [`PipeBody`] stream while concurrently reading the response. The
//! producer propagates failures to the consumer by closing the pipe with
//! an error, which aborts the request.
//!
//! `PipeWriter` buffers writes and must only be used from a blocking
//! context: it parks the thread when the consumer lags.

use std::io::{self, Write};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::mpsc;

/// Bytes buffered in the writer before a send.
const WRITE_BUF_SIZE: usize = 64 * 1024;

/// In-flight buffers between producer and consumer.
const CHANNEL_CAPACITY: usize = 8;

/// Create a connected writer/body pair.
pub fn pipe() -> (PipeWriter, PipeBody) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        PipeWriter {
            tx,
            buf: Vec::with_capacity(WRITE_BUF_SIZE),
        },
        PipeBody { rx },
    )
}

/// Write end of the pipe.
pub struct PipeWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    buf: Vec<u8>,
}

impl PipeWriter {
    /// A handle that can fail the pipe after the writer has been moved
    /// into a wrapping encoder.
    pub fn error_handle(&self) -> PipeErrorHandle {
        PipeErrorHandle {
            tx: self.tx.clone(),
        }
    }

    /// Flush remaining bytes and close the pipe cleanly.
    pub fn finish(mut self) -> io::Result<()> {
        self.send_buf()
    }

    /// Close the pipe with an error; the consumer's next read fails.
    /// Buffered but unsent bytes are discarded.
    pub fn close_with_error(mut self, error: io::Error) {
        self.buf.clear();
        let _ = self.tx.blocking_send(Err(error));
    }

    fn send_buf(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let data = Bytes::from(std::mem::take(&mut self.buf));
        self.tx
            .blocking_send(Ok(data))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe consumer is gone"))
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        if self.buf.len() >= WRITE_BUF_SIZE {
            self.send_buf()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buf()
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        // Deliver whatever is buffered; dropping the sender then closes
        // the stream cleanly.
        let _ = self.send_buf();
    }
}

/// Handle for failing the pipe independently of the writer.
pub struct PipeErrorHandle {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl PipeErrorHandle {
    /// Close the pipe with an error; the consumer's next read fails.
    pub fn close_with_error(self, error: io::Error) {
        let _ = self.tx.blocking_send(Err(error));
    }
}

/// Read end of the pipe: a byte stream suitable as a request body.
pub struct PipeBody {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl futures_core::Stream for PipeBody {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl From<PipeBody> for reqwest::Body {
    fn from(body: PipeBody) -> Self {
        reqwest::Body::wrap_stream(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut body: PipeBody) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(item) = body.rx.recv().await {
            out.extend_from_slice(&item?);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_write_then_finish() {
        let (writer, body) = pipe();
        let producer = tokio::task::spawn_blocking(move || {
            let mut writer = writer;
            writer.write_all(b"hello ").expect("write");
            writer.write_all(b"world").expect("write");
            writer.finish().expect("finish");
        });

        let data = collect(body).await.expect("collect");
        producer.await.expect("producer");
        assert_eq!(data, b"hello world");
    }

    #[tokio::test]
    async fn test_large_transfer_crosses_buffer_boundary() {
        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 255) as u8).collect();
        let expected = payload.clone();

        let (writer, body) = pipe();
        let producer = tokio::task::spawn_blocking(move || {
            let mut writer = writer;
            writer.write_all(&payload).expect("write");
            writer.finish().expect("finish");
        });

        let data = collect(body).await.expect("collect");
        producer.await.expect("producer");
        assert_eq!(data, expected);
    }

    #[tokio::test]
    async fn test_close_with_error_reaches_consumer() {
        let (writer, body) = pipe();
        let producer = tokio::task::spawn_blocking(move || {
            let mut writer = writer;
            writer.write_all(b"partial").expect("write");
            writer.flush().expect("flush");
            writer.close_with_error(io::Error::new(io::ErrorKind::Other, "source died"));
        });

        let result = collect(body).await;
        producer.await.expect("producer");
        let err = result.expect_err("must fail");
        assert!(err.to_string().contains("source died"));
    }

    #[tokio::test]
    async fn test_error_handle_fails_pipe() {
        let (writer, body) = pipe();
        let handle = writer.error_handle();
        let producer = tokio::task::spawn_blocking(move || {
            // Writer moved into some encoder that failed mid-way; only
            // the handle is left to report it.
            drop(writer);
            handle.close_with_error(io::Error::new(io::ErrorKind::Other, "encoder failed"));
        });

        let result = collect(body).await;
        producer.await.expect("producer");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_drop_closes_cleanly() {
        let (writer, body) = pipe();
        let producer = tokio::task::spawn_blocking(move || {
            let mut writer = writer;
            writer.write_all(b"tail").expect("write");
            // Dropped without finish: buffered bytes still arrive.
        });

        let data = collect(body).await.expect("collect");
        producer.await.expect("producer");
        assert_eq!(data, b"tail");
    }
}
