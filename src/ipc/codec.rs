//! Newline-delimited JSON framing for the command protocol.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};

/// Default frame limit; COLLECT replies carry whole output files.
pub const DEFAULT_MAX_LENGTH: usize = 256 * 1024 * 1024;

/// Newline-delimited JSON codec.
///
/// Decodes `T`; encodes anything serializable, so one codec can read
/// requests and write responses on the same connection.
#[derive(Debug)]
pub struct NdJsonCodec<T> {
    _phantom: PhantomData<T>,
    max_length: usize,
    /// Bytes already scanned for a newline in the current frame
    scanned: usize,
}

impl<T> NdJsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            _phantom: PhantomData,
            max_length,
            scanned: 0,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl<T> Default for NdJsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for NdJsonCodec<T> {
    fn clone(&self) -> Self {
        Self::with_max_length(self.max_length)
    }
}

fn too_large(len: usize, max: usize) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("Message too large: {} > {}", len, max),
    )
}

impl<T: DeserializeOwned> Decoder for NdJsonCodec<T> {
    type Item = T;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline_pos = src[self.scanned..].iter().position(|&b| b == b'\n');

            let Some(offset) = newline_pos else {
                if src.len() > self.max_length {
                    return Err(too_large(src.len(), self.max_length));
                }
                self.scanned = src.len();
                return Ok(None);
            };

            let pos = self.scanned + offset;
            self.scanned = 0;
            if pos > self.max_length {
                return Err(too_large(pos, self.max_length));
            }

            let line = src.split_to(pos);
            src.advance(1);

            // Blank keep-alive lines carry no frame.
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }

            return serde_json::from_slice(&line)
                .map(Some)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, format!("JSON error: {}", e)));
        }
    }
}

impl<T, U: Serialize> Encoder<U> for NdJsonCodec<T> {
    type Error = std::io::Error;

    fn encode(&mut self, item: U, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        // serde_json compact output never contains a raw newline
        let json = serde_json::to_vec(&item)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, format!("JSON error: {}", e)))?;

        if json.len() > self.max_length {
            return Err(too_large(json.len(), self.max_length));
        }

        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
