//! Optional compression stage of the mapper pipeline.
//!
//! At write time the mapper applies `compress` after transcoding and before
//! encryption; at read time `decompress` runs in the inverse position.
//! Compression of arbitrary bytes cannot fail; decompression of corrupt
//! input can, and surfaces as a decoding failure at the mapper boundary.

use std::io::{self, Write as _};

use flate2::{
    Compression,
    write::{ZlibDecoder, ZlibEncoder},
};

/// A byte-to-byte compression capability with an inverse.
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Vec<u8>;

    /// Invert [`compress`](Self::compress).
    ///
    /// # Errors
    ///
    /// Returns an [`io::Error`] when `data` is not a valid compressed
    /// stream.
    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>>;
}

/// zlib (RFC 1950) compression.
#[derive(Clone, Copy, Debug)]
pub struct Zlib {
    level: Compression,
}

impl Zlib {
    /// zlib at the default compression level.
    #[must_use]
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
        }
    }

    /// zlib at an explicit level (0-9).
    #[must_use]
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level),
        }
    }
}

impl Default for Zlib {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for Zlib {
    fn compress(&self, data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), self.level);
        encoder
            .write_all(data)
            .and_then(|()| encoder.finish())
            .expect("writing to an in-memory zlib encoder cannot fail")
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut decoder = ZlibDecoder::new(Vec::new());
        decoder.write_all(data)?;
        decoder.finish()
    }
}
