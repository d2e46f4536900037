//! Wire-protocol compression (`OP_COMPRESSED`) support.

#[cfg(feature = "zlib-compression")]
use std::io::Write;

use crate::error::{Error, ErrorKind, Result};

pub(crate) const NOOP_COMPRESSOR_ID: u8 = 0;
pub(crate) const SNAPPY_COMPRESSOR_ID: u8 = 1;
pub(crate) const ZLIB_COMPRESSOR_ID: u8 = 2;
pub(crate) const ZSTD_COMPRESSOR_ID: u8 = 3;

/// The compressors that may be negotiated during the handshake and applied to outgoing messages.
///
/// Each variant is only available when the corresponding cargo feature is enabled.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Compressor {
    /// Zstd compression.
    #[cfg(feature = "zstd-compression")]
    Zstd {
        /// The compression level; `None` indicates the zstd default.
        level: Option<i32>,
    },

    /// Zlib compression.
    #[cfg(feature = "zlib-compression")]
    Zlib {
        /// The compression level, from 0 (no compression) to 9 (maximum compression).
        level: Option<i32>,
    },

    /// Snappy compression.
    #[cfg(feature = "snappy-compression")]
    Snappy,
}

impl Compressor {
    /// Parse a compressor name from the `compressors` URI option.
    ///
    /// Names of algorithms whose feature is not enabled produce an error rather than being
    /// silently dropped, so that a misconfigured client fails loudly.
    pub(crate) fn parse_str(s: &str) -> Result<Self> {
        match s {
            #[cfg(feature = "zstd-compression")]
            "zstd" => Ok(Compressor::Zstd { level: None }),
            #[cfg(not(feature = "zstd-compression"))]
            "zstd" => Err(Error::invalid_argument(
                "zstd compression was requested, but the zstd-compression feature is disabled",
            )),
            #[cfg(feature = "zlib-compression")]
            "zlib" => Ok(Compressor::Zlib { level: None }),
            #[cfg(not(feature = "zlib-compression"))]
            "zlib" => Err(Error::invalid_argument(
                "zlib compression was requested, but the zlib-compression feature is disabled",
            )),
            #[cfg(feature = "snappy-compression")]
            "snappy" => Ok(Compressor::Snappy),
            #[cfg(not(feature = "snappy-compression"))]
            "snappy" => Err(Error::invalid_argument(
                "snappy compression was requested, but the snappy-compression feature is disabled",
            )),
            other => Err(Error::invalid_argument(format!(
                "unsupported compressor: {}",
                other
            ))),
        }
    }

    /// The name of the compressor as reported to the server during the handshake.
    pub(crate) fn name(&self) -> &'static str {
        match *self {
            #[cfg(feature = "zstd-compression")]
            Compressor::Zstd { .. } => "zstd",
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { .. } => "zlib",
            #[cfg(feature = "snappy-compression")]
            Compressor::Snappy => "snappy",
        }
    }

    /// The wire-level compressor id.
    pub(crate) fn id(&self) -> u8 {
        match *self {
            #[cfg(feature = "zstd-compression")]
            Compressor::Zstd { .. } => ZSTD_COMPRESSOR_ID,
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { .. } => ZLIB_COMPRESSOR_ID,
            #[cfg(feature = "snappy-compression")]
            Compressor::Snappy => SNAPPY_COMPRESSOR_ID,
        }
    }

    pub(crate) fn set_zlib_level(&mut self, zlib_level: i32) {
        #[cfg(feature = "zlib-compression")]
        if let Compressor::Zlib { ref mut level } = *self {
            *level = Some(zlib_level);
        }
        #[cfg(not(feature = "zlib-compression"))]
        let _ = zlib_level;
    }

    /// Compress the provided bytes.
    pub(crate) fn compress(&self, _bytes: &[u8]) -> Result<Vec<u8>> {
        match *self {
            #[cfg(feature = "zstd-compression")]
            Compressor::Zstd { level } => {
                zstd::encode_all(_bytes, level.unwrap_or(zstd::DEFAULT_COMPRESSION_LEVEL))
                    .map_err(|e| ErrorKind::Internal {
                        message: format!("an error occurred while compressing: {}", e),
                    }
                    .into())
            }
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { level } => {
                // A level of -1 selects zlib's own default.
                let level = match level {
                    Some(level) if level >= 0 => flate2::Compression::new(level as u32),
                    _ => flate2::Compression::default(),
                };
                let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), level);
                encoder
                    .write_all(_bytes)
                    .and_then(|_| encoder.finish())
                    .map_err(|e| {
                        ErrorKind::Internal {
                            message: format!("an error occurred while compressing: {}", e),
                        }
                        .into()
                    })
            }
            #[cfg(feature = "snappy-compression")]
            Compressor::Snappy => snap::raw::Encoder::new()
                .compress_vec(_bytes)
                .map_err(|e| {
                    ErrorKind::Internal {
                        message: format!("an error occurred while compressing: {}", e),
                    }
                    .into()
                }),
        }
    }
}

/// Decompress a message body given the compressor id from its header.
pub(crate) fn decompress(compressor_id: u8, _bytes: &[u8]) -> Result<Vec<u8>> {
    match compressor_id {
        NOOP_COMPRESSOR_ID => Ok(_bytes.to_vec()),
        #[cfg(feature = "zstd-compression")]
        ZSTD_COMPRESSOR_ID => zstd::decode_all(_bytes).map_err(|e| {
            ErrorKind::Internal {
                message: format!("an error occurred while decompressing: {}", e),
            }
            .into()
        }),
        #[cfg(feature = "zlib-compression")]
        ZLIB_COMPRESSOR_ID => {
            use std::io::Read;
            let mut decoder = flate2::read::ZlibDecoder::new(_bytes);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).map_err(|e| ErrorKind::Internal {
                message: format!("an error occurred while decompressing: {}", e),
            })?;
            Ok(out)
        }
        #[cfg(feature = "snappy-compression")]
        SNAPPY_COMPRESSOR_ID => snap::raw::Decoder::new().decompress_vec(_bytes).map_err(|e| {
            ErrorKind::Internal {
                message: format!("an error occurred while decompressing: {}", e),
            }
            .into()
        }),
        other => Err(ErrorKind::InvalidResponse {
            message: format!("server replied with an unsupported compressor id: {}", other),
        }
        .into()),
    }
}

#[cfg(all(test, feature = "zlib-compression"))]
mod test {
    use super::{decompress, Compressor, ZLIB_COMPRESSOR_ID};

    #[test]
    fn zlib_round_trip() {
        let compressor = Compressor::Zlib { level: Some(4) };
        let payload = b"a payload that is long enough to actually shrink under zlib zlib zlib";
        let compressed = compressor.compress(payload).unwrap();
        assert_eq!(
            decompress(ZLIB_COMPRESSOR_ID, &compressed).unwrap(),
            payload.to_vec()
        );
    }
}
