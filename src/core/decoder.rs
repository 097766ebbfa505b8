//! Response body decoding for the `Content-Encoding` schemes backends use.

use std::io::Read;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("unsupported content encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("corrupt {encoding} payload: {source}")]
    CorruptPayload {
        encoding: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// A `Content-Encoding` label the proxy knows how to undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
    Zstd,
    Snappy,
}

impl ContentEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
            Self::Brotli => "br",
            Self::Zstd => "zstd",
            Self::Snappy => "snappy",
        }
    }
}

impl FromStr for ContentEncoding {
    type Err = DecodeError;

    fn from_str(label: &str) -> Result<Self, Self::Err> {
        match label.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Ok(Self::Identity),
            "gzip" | "x-gzip" => Ok(Self::Gzip),
            "deflate" => Ok(Self::Deflate),
            "br" => Ok(Self::Brotli),
            "zstd" => Ok(Self::Zstd),
            "snappy" => Ok(Self::Snappy),
            _ => Err(DecodeError::UnsupportedEncoding(label.to_string())),
        }
    }
}

/// Decode `bytes` according to the `Content-Encoding` label.
///
/// An empty label is treated as identity.
pub fn decode(bytes: &[u8], encoding: &str) -> Result<Vec<u8>, DecodeError> {
    let encoding = ContentEncoding::from_str(encoding)?;
    let mut out = Vec::with_capacity(bytes.len() * 2);

    let result = match encoding {
        ContentEncoding::Identity => return Ok(bytes.to_vec()),
        ContentEncoding::Gzip => flate2::read::MultiGzDecoder::new(bytes).read_to_end(&mut out),
        ContentEncoding::Deflate => flate2::read::ZlibDecoder::new(bytes).read_to_end(&mut out),
        ContentEncoding::Brotli => brotli::Decompressor::new(bytes, 4096).read_to_end(&mut out),
        ContentEncoding::Zstd => zstd::stream::read::Decoder::new(bytes)
            .and_then(|mut decoder| decoder.read_to_end(&mut out)),
        ContentEncoding::Snappy => snap::read::FrameDecoder::new(bytes).read_to_end(&mut out),
    };

    result.map(|_| out).map_err(|source| DecodeError::CorruptPayload {
        encoding: encoding.as_str(),
        source,
    })
}
