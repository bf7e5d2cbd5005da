//! Stream-level chunk compression.
//!
//! One raw DEFLATE stream spans a whole transfer attempt. Every chunk ends on
//! a sync flush so the receiver can decode it as soon as it arrives, while the
//! dictionary carries over between chunks.

use std::io::{self, Write};

use flate2::write::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;

pub struct StreamCompressor {
    encoder: DeflateEncoder<Vec<u8>>,
}

impl Default for StreamCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamCompressor {
    pub fn new() -> Self {
        Self {
            encoder: DeflateEncoder::new(Vec::new(), Compression::default()),
        }
    }

    /// Compress one chunk. `is_final` terminates the stream.
    pub fn compress_chunk(&mut self, data: &[u8], is_final: bool) -> io::Result<Vec<u8>> {
        self.encoder.write_all(data)?;
        if is_final {
            self.encoder.try_finish()?;
        } else {
            self.encoder.flush()?;
        }
        Ok(std::mem::take(self.encoder.get_mut()))
    }
}

pub struct StreamDecompressor {
    decoder: DeflateDecoder<Vec<u8>>,
}

impl Default for StreamDecompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecompressor {
    pub fn new() -> Self {
        Self {
            decoder: DeflateDecoder::new(Vec::new()),
        }
    }

    /// Decompress one chunk produced by [`StreamCompressor::compress_chunk`].
    pub fn decompress_chunk(&mut self, data: &[u8], is_final: bool) -> io::Result<Vec<u8>> {
        self.decoder.write_all(data)?;
        if is_final {
            self.decoder.try_finish()?;
        } else {
            self.decoder.flush()?;
        }
        Ok(std::mem::take(self.decoder.get_mut()))
    }
}
