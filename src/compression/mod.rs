// src/compression/mod.rs

//! Decompression of package indices
//!
//! Repositories publish their `Packages` index plain, gzip-compressed
//! (`Packages.gz`) or xz-compressed (`Packages.xz`).

use crate::error::{Error, Result};
use std::io::Read;

/// Supported compression formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    /// No compression (raw data)
    None,
    /// Gzip compression (.gz)
    Gzip,
    /// XZ/LZMA compression (.xz)
    Xz,
}

impl CompressionFormat {
    /// Detect compression format from a file name or URL
    pub fn from_extension(path: &str) -> Self {
        if path.ends_with(".gz") {
            Self::Gzip
        } else if path.ends_with(".xz") {
            Self::Xz
        } else {
            Self::None
        }
    }

    /// Detect compression format from magic bytes
    ///
    /// Magic bytes:
    /// - Gzip: `1f 8b`
    /// - XZ: `fd 37 7a 58 5a 00` (FD + "7zXZ" + NUL)
    pub fn from_magic_bytes(data: &[u8]) -> Self {
        if data.starts_with(&[0x1f, 0x8b]) {
            Self::Gzip
        } else if data.starts_with(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]) {
            Self::Xz
        } else {
            Self::None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Xz => "xz",
        }
    }
}

impl std::fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Decompress a byte slice using the specified format
pub fn decompress(data: &[u8], format: CompressionFormat) -> Result<Vec<u8>> {
    let mut decoder: Box<dyn Read + '_> = match format {
        CompressionFormat::None => return Ok(data.to_vec()),
        CompressionFormat::Gzip => Box::new(flate2::read::GzDecoder::new(data)),
        CompressionFormat::Xz => Box::new(xz2::read::XzDecoder::new(data)),
    };
    let mut output = Vec::new();
    decoder.read_to_end(&mut output).map_err(|e| {
        Error::ParseError(format!("Failed to decompress {} data: {}", format, e))
    })?;
    Ok(output)
}

/// Decompress an index named `name`
///
/// The extension decides; content that is compressed despite a plain name
/// is still detected from its magic bytes.
pub fn decompress_index(name: &str, data: &[u8]) -> Result<Vec<u8>> {
    let format = match CompressionFormat::from_extension(name) {
        CompressionFormat::None => CompressionFormat::from_magic_bytes(data),
        format => format,
    };
    decompress(data, format)
}
