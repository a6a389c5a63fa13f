use exaconn_core::error::{ExaError, Result};
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use std::io::Write;

fn compression_error(err: std::io::Error) -> ExaError {
    ExaError::Compression(err.to_string())
}

/// Incremental gzip decoder. Chunks go in, whatever inflated so far comes out.
pub struct Inflater {
    decoder: GzDecoder<Vec<u8>>,
}

impl Inflater {
    pub fn new() -> Self {
        Self {
            decoder: GzDecoder::new(Vec::new()),
        }
    }

    pub fn feed(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        self.decoder.write_all(input).map_err(compression_error)?;
        Ok(std::mem::take(self.decoder.get_mut()))
    }

    /// Flush the bytes still buffered after the last chunk.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        self.decoder.try_finish().map_err(compression_error)?;
        Ok(std::mem::take(self.decoder.get_mut()))
    }
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Deflater {
    encoder: GzEncoder<Vec<u8>>,
}

impl Deflater {
    pub fn new() -> Self {
        Self {
            encoder: GzEncoder::new(Vec::new(), Compression::fast()),
        }
    }

    pub fn feed(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        self.encoder.write_all(input).map_err(compression_error)?;
        Ok(std::mem::take(self.encoder.get_mut()))
    }

    pub fn finish(self) -> Result<Vec<u8>> {
        self.encoder.finish().map_err(compression_error)
    }
}

impl Default for Deflater {
    fn default() -> Self {
        Self::new()
    }
}
