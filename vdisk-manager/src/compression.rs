// SPDX-License-Identifier: GPL-3.0-only

//! Gzip helpers for content transfer payloads

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{Result, VdiskError};

pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decode a gzip stream held in memory.
///
/// An empty, truncated or non-gzip payload is a `DecompressionError`.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Err(VdiskError::DecompressionError(
            "payload is empty".to_string(),
        ));
    }

    let mut decoder = GzDecoder::new(data);
    let mut output = Vec::new();
    decoder
        .read_to_end(&mut output)
        .map_err(|error| VdiskError::DecompressionError(error.to_string()))?;
    Ok(output)
}
