//! AES-256-OFB result decryption.
//!
//! The seller encrypts the result with a one-time 256-bit key and a zero
//! initialization vector; the buyer decrypts with the same parameters
//! once the coordinator releases the key. The zero IV is part of the
//! wire contract: the key is never reused, and both sides must derive
//! the identical keystream. OFB keystream application is its own
//! inverse, so encrypt and decrypt are the same operation.

use std::io::{Read, Write};

use aes::Aes256;
use ofb::cipher::{KeyIvInit, StreamCipher};
use ofb::Ofb;
use umber_types::Fingerprint;

use crate::{CryptoError, Result};

type Aes256Ofb = Ofb<Aes256>;

const ZERO_IV: [u8; 16] = [0u8; 16];
const STREAM_BUF_SIZE: usize = 64 * 1024;

/// Apply the AES-256-OFB keystream for `key` to `data` in place.
pub fn apply_in_place(key: &Fingerprint, data: &mut [u8]) {
    let mut cipher = Aes256Ofb::new(key.as_bytes().into(), (&ZERO_IV).into());
    cipher.apply_keystream(data);
}

/// Stream `reader` through the AES-256-OFB keystream for `key` into
/// `writer`, returning the number of bytes processed.
pub fn apply_stream<R: Read, W: Write>(
    key: &Fingerprint,
    reader: &mut R,
    writer: &mut W,
) -> Result<u64> {
    let mut cipher = Aes256Ofb::new(key.as_bytes().into(), (&ZERO_IV).into());
    let mut buf = vec![0u8; STREAM_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| CryptoError::Io(e.to_string()))?;
        if n == 0 {
            return Ok(total);
        }
        cipher.apply_keystream(&mut buf[..n]);
        writer
            .write_all(&buf[..n])
            .map_err(|e| CryptoError::Io(e.to_string()))?;
        total += n as u64;
    }
}
