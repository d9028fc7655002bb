#[cfg(any(
    feature = "zstd-compression",
    feature = "zlib-compression",
    feature = "snappy-compression"
))]
#[cfg(test)]
mod test;

#[cfg(feature = "zlib-compression")]
use flate2::write::{ZlibDecoder, ZlibEncoder};
#[cfg(any(feature = "zstd-compression", feature = "zlib-compression"))]
use std::io::Write;

use crate::error::{Error, ErrorKind, Result};

/// The compressor ids assigned by the wire protocol.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum CompressorId {
    Noop = 0,
    Snappy = 1,
    Zlib = 2,
    Zstd = 3,
}

impl CompressorId {
    pub(crate) fn from_u8(id: u8) -> Result<Self> {
        match id {
            0 => Ok(CompressorId::Noop),
            1 => Ok(CompressorId::Snappy),
            2 => Ok(CompressorId::Zlib),
            3 => Ok(CompressorId::Zstd),
            other => Err(ErrorKind::InvalidResponse {
                message: format!("Invalid compressor id: {}", other),
            }
            .into()),
        }
    }
}

/// Enum representing supported compressor algorithms.
/// Used for compressing and decompressing messages sent to and read from the server.
/// For compressors that take a `level`, use `None` to indicate the default level.
/// Higher `level` indicates more compression (and slower).
/// Requires `zstd-compression` feature flag to use `Zstd` compressor,
/// `zlib-compression` feature flag to use `Zlib` compressor, and
/// `snappy-compression` feature flag to use `Snappy` Compressor.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Compressor {
    /// Zstd compressor. See [`Zstd`](http://facebook.github.io/zstd/zstd_manual.html) for more
    /// information.
    #[cfg(feature = "zstd-compression")]
    Zstd {
        /// Zstd compression level
        level: Option<i32>,
    },
    /// Zlib compressor. See [`Zlib`](https://zlib.net/) for more information.
    #[cfg(feature = "zlib-compression")]
    Zlib {
        /// Zlib compression level
        level: Option<i32>,
    },
    /// Snappy compressor. See [`Snappy`](http://google.github.io/snappy/) for more information.
    #[cfg(feature = "snappy-compression")]
    Snappy,
}

impl Compressor {
    /// Parse the compressor name as it appears in a connection string or in the server's
    /// `compression` hello response field.
    pub(crate) fn parse_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            #[cfg(feature = "zlib-compression")]
            "zlib" => Ok(Compressor::Zlib { level: None }),
            #[cfg(feature = "zstd-compression")]
            "zstd" => Ok(Compressor::Zstd { level: None }),
            #[cfg(feature = "snappy-compression")]
            "snappy" => Ok(Compressor::Snappy),
            other => Err(Error::from(ErrorKind::InvalidArgument {
                message: format!("Invalid compressor: {} was supplied but is invalid", other),
            })),
        }
    }

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

    pub(crate) fn id(&self) -> CompressorId {
        match *self {
            #[cfg(feature = "zstd-compression")]
            Compressor::Zstd { .. } => CompressorId::Zstd,
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { .. } => CompressorId::Zlib,
            #[cfg(feature = "snappy-compression")]
            Compressor::Snappy => CompressorId::Snappy,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        #[allow(unreachable_patterns)]
        match *self {
            #[cfg(feature = "zstd-compression")]
            Compressor::Zstd { level: Some(level) }
                if !zstd::compression_level_range().contains(&level) =>
            {
                Err(Error::from(ErrorKind::InvalidArgument {
                    message: format!("invalid zstd level: {}", level),
                }))
            }
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { level: Some(level) } if !(-1..10).contains(&level) => {
                Err(Error::from(ErrorKind::InvalidArgument {
                    message: format!("invalid zlib level: {}", level),
                }))
            }
            _ => Ok(()),
        }
    }

    /// Compress `bytes` with this compressor's algorithm and level.
    pub(crate) fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        match *self {
            #[cfg(feature = "zstd-compression")]
            Compressor::Zstd { level } => {
                let mut encoder =
                    zstd::Encoder::new(vec![], level.unwrap_or(zstd::DEFAULT_COMPRESSION_LEVEL))
                        .map_err(compression_failed)?;
                encoder.write_all(bytes).map_err(compression_failed)?;
                encoder.finish().map_err(compression_failed)
            }
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { level } => {
                let level = match level {
                    Some(level) => flate2::Compression::new(level.try_into().map_err(|_| {
                        Error::from(ErrorKind::InvalidArgument {
                            message: format!("an invalid zlib compression level was given: {:?}", level),
                        })
                    })?),
                    None => flate2::Compression::default(),
                };
                let mut encoder = ZlibEncoder::new(vec![], level);
                encoder.write_all(bytes).map_err(compression_failed)?;
                encoder.finish().map_err(compression_failed)
            }
            #[cfg(feature = "snappy-compression")]
            Compressor::Snappy => {
                // The server doesn't use the snappy frame format, so we need to use
                // snap::raw::Encoder rather than snap::write::FrameEncoder. Likewise for decoding.
                let mut compressor = snap::raw::Encoder::new();
                compressor.compress_vec(bytes).map_err(compression_failed)
            }
        }
    }
}

#[cfg(any(
    feature = "zstd-compression",
    feature = "zlib-compression",
    feature = "snappy-compression"
))]
fn compression_failed(e: impl std::fmt::Display) -> Error {
    ErrorKind::Internal {
        message: format!("an error occurred while compressing a message: {}", e),
    }
    .into()
}

/// Decompresses inbound OP_COMPRESSED payloads. Unlike `Compressor`, this is not gated on the
/// client's configured compressor list: the server may reply with any compressor it advertised,
/// so every algorithm compiled into the build can decode.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Decoder {
    #[cfg(feature = "zstd-compression")]
    Zstd,
    #[cfg(feature = "zlib-compression")]
    Zlib,
    #[cfg(feature = "snappy-compression")]
    Snappy,
    Noop,
}

impl Decoder {
    pub(crate) fn from_u8(id: u8) -> Result<Self> {
        match CompressorId::from_u8(id)? {
            CompressorId::Noop => Ok(Decoder::Noop),
            #[cfg(feature = "snappy-compression")]
            CompressorId::Snappy => Ok(Decoder::Snappy),
            #[cfg(feature = "zlib-compression")]
            CompressorId::Zlib => Ok(Decoder::Zlib),
            #[cfg(feature = "zstd-compression")]
            CompressorId::Zstd => Ok(Decoder::Zstd),
            #[allow(unreachable_patterns)]
            other => Err(ErrorKind::InvalidResponse {
                message: format!(
                    "the server replied with the {:?} compressor, but support for it is not \
                     enabled in this build",
                    other
                ),
            }
            .into()),
        }
    }

    pub(crate) fn decode(self, source: &[u8]) -> Result<Vec<u8>> {
        match self {
            #[cfg(feature = "zstd-compression")]
            Decoder::Zstd => {
                let mut ret = Vec::new();
                zstd::stream::copy_decode(source, &mut ret).map_err(decompression_failed)?;
                Ok(ret)
            }
            #[cfg(feature = "zlib-compression")]
            Decoder::Zlib => {
                let mut decoder = ZlibDecoder::new(vec![]);
                decoder.write_all(source)?;
                decoder.finish().map_err(decompression_failed)
            }
            #[cfg(feature = "snappy-compression")]
            Decoder::Snappy => {
                let mut decompressor = snap::raw::Decoder::new();
                decompressor
                    .decompress_vec(source)
                    .map_err(decompression_failed)
            }
            Decoder::Noop => Ok(source.to_vec()),
        }
    }
}

#[cfg(any(
    feature = "zstd-compression",
    feature = "zlib-compression",
    feature = "snappy-compression"
))]
fn decompression_failed(e: impl std::fmt::Display) -> Error {
    ErrorKind::InvalidResponse {
        message: format!("an error occurred while decompressing a message: {}", e),
    }
    .into()
}
