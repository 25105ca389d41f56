//! Hand-rolled `multipart/form-data` writer.
//!
//! The engine gzip-wraps whole multipart bodies and streams them through
//! a pipe, so it needs to own the raw byte stream; this writer produces
//! RFC 2046 multipart framing over any `io::Write` sink.

use std::io::{self, Write};

use rand::RngCore;

enum State {
    /// Before the first part or right after a boundary header block.
    Idle,
    /// Body bytes of a part are being written.
    InPart,
}

/// Streams a `multipart/form-data` body into an inner writer.
pub struct MultipartWriter<W: Write> {
    inner: W,
    boundary: String,
    state: State,
}

impl<W: Write> MultipartWriter<W> {
    /// Wrap a sink with a fresh random boundary.
    pub fn new(inner: W) -> Self {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        Self {
            inner,
            boundary: hex::encode(raw),
            state: State::Idle,
        }
    }

    /// The `Content-Type` header value announcing the boundary.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Start a file part; subsequent `write` calls produce its body.
    pub fn begin_file_part(&mut self, name: &str, filename: &str) -> io::Result<()> {
        self.open_part()?;
        write!(
            self.inner,
            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )?;
        self.state = State::InPart;
        Ok(())
    }

    /// Emit a complete text field part.
    pub fn write_field(&mut self, name: &str, value: &str) -> io::Result<()> {
        self.open_part()?;
        write!(
            self.inner,
            "Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}"
        )?;
        self.state = State::InPart;
        Ok(())
    }

    /// Write the closing boundary and hand back the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        if matches!(self.state, State::InPart) {
            self.inner.write_all(b"\r\n")?;
        }
        write!(self.inner, "--{}--\r\n", self.boundary)?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn open_part(&mut self) -> io::Result<()> {
        if matches!(self.state, State::InPart) {
            self.inner.write_all(b"\r\n")?;
        }
        write!(self.inner, "--{}\r\n", self.boundary)?;
        Ok(())
    }
}

impl<W: Write> Write for MultipartWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.state {
            State::InPart => self.inner.write(buf),
            State::Idle => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no multipart part is open",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
