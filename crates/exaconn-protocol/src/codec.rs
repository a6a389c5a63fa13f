use crate::messages::Response;
use exaconn_core::error::{ExaError, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_json::Value;
use std::io::{Read, Write};

/// One message on the control connection. Uncompressed envelopes travel as
/// text frames, compressed ones as binary frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// JSON envelope codec with optional zlib compression.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireCodec {
    compression: bool,
}

impl WireCodec {
    pub fn new(compression: bool) -> Self {
        Self { compression }
    }

    pub fn is_compressed(&self) -> bool {
        self.compression
    }

    pub fn encode(&self, payload: &Value) -> Result<Frame> {
        let text = serde_json::to_string(payload)?;
        if !self.compression {
            return Ok(Frame::Text(text));
        }
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
        encoder
            .write_all(text.as_bytes())
            .map_err(|e| ExaError::Compression(e.to_string()))?;
        let bytes = encoder
            .finish()
            .map_err(|e| ExaError::Compression(e.to_string()))?;
        Ok(Frame::Binary(bytes))
    }

    pub fn decode(&self, frame: Frame) -> Result<Response> {
        let response = match frame {
            Frame::Text(text) => serde_json::from_str(&text)?,
            Frame::Binary(bytes) if self.compression => {
                let mut text = Vec::new();
                ZlibDecoder::new(bytes.as_slice())
                    .read_to_end(&mut text)
                    .map_err(|e| ExaError::Compression(e.to_string()))?;
                serde_json::from_slice(&text)?
            }
            Frame::Binary(bytes) => serde_json::from_slice(&bytes)?,
        };
        Ok(response)
    }
}
