//! Compression codecs for stored images.
//!
//! Images are published compressed and read back decompressed. Writers pick
//! the codec from repository configuration; readers detect it from the
//! stream's leading magic bytes, so a repository may hold a mix.
//!
//! | Codec | Suffix | Magic | Max level |
//! |-------|--------|-------|-----------|
//! | xz    | `xz`   | `FD 37 7A 58 5A 00` | 9 |
//! | gzip  | `gz`   | `1F 8B` | 9 |
//! | zstd  | `zst`  | `28 B5 2F FD` | 19 |

use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::str::FromStr;
use std::sync::Arc;

use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use xz2::write::XzEncoder;

use crate::error::{NimError, Result};
use crate::models::ImageData;

const XZ_MAGIC: &[u8] = &[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];
const GZ_MAGIC: &[u8] = &[0x1F, 0x8B];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xB5, 0x2F, 0xFD];
const MAGIC_LEN: usize = 6;

/// Supported compression codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    Xz,
    #[serde(alias = "gzip")]
    Gz,
    #[serde(alias = "zst")]
    Zstd,
}

impl CompressionType {
    /// File name suffix, without the leading dot.
    pub fn suffix(&self) -> &'static str {
        match self {
            CompressionType::Xz => "xz",
            CompressionType::Gz => "gz",
            CompressionType::Zstd => "zst",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            CompressionType::Xz => "application/x-xz",
            CompressionType::Gz => "application/gzip",
            CompressionType::Zstd => "application/zstd",
        }
    }

    fn max_level(&self) -> u32 {
        match self {
            CompressionType::Xz | CompressionType::Gz => 9,
            CompressionType::Zstd => 19,
        }
    }

    /// Map a ratio in `[0, 1]` onto this codec's level range, minimum 1.
    pub fn level_for(&self, ratio: f32) -> u32 {
        let ratio = if ratio.is_nan() { 1.0 } else { ratio.clamp(0.0, 1.0) };
        let level = (ratio * self.max_level() as f32).round() as u32;
        level.max(1)
    }

    /// Identify a codec from a stream's leading bytes.
    pub fn detect(magic: &[u8]) -> Option<Self> {
        if magic.starts_with(XZ_MAGIC) {
            Some(CompressionType::Xz)
        } else if magic.starts_with(GZ_MAGIC) {
            Some(CompressionType::Gz)
        } else if magic.starts_with(ZSTD_MAGIC) {
            Some(CompressionType::Zstd)
        } else {
            None
        }
    }

    /// Codec implied by a file name's final extension.
    pub fn from_filename(name: &str) -> Option<Self> {
        let (_, ext) = name.rsplit_once('.')?;
        ext.parse().ok()
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

impl FromStr for CompressionType {
    type Err = NimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "xz" => Ok(CompressionType::Xz),
            "gz" | "gzip" => Ok(CompressionType::Gz),
            "zst" | "zstd" => Ok(CompressionType::Zstd),
            other => Err(NimError::InvalidArgument(format!(
                "unsupported compression type '{}'",
                other
            ))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Encoding
// ═══════════════════════════════════════════════════════════════════════

/// A compressing writer for one of the supported codecs.
pub enum Encoder<W: Write> {
    Xz(XzEncoder<W>),
    Gz(GzEncoder<W>),
    Zstd(zstd::Encoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    pub fn new(kind: CompressionType, ratio: f32, inner: W) -> Result<Self> {
        let level = kind.level_for(ratio);
        Ok(match kind {
            CompressionType::Xz => Encoder::Xz(XzEncoder::new(inner, level)),
            CompressionType::Gz => {
                Encoder::Gz(GzEncoder::new(inner, flate2::Compression::new(level)))
            }
            CompressionType::Zstd => Encoder::Zstd(
                zstd::Encoder::new(inner, level as i32)
                    .map_err(|e| NimError::Compression(e.to_string()))?,
            ),
        })
    }

    /// Write the codec trailer and return the inner writer.
    pub fn finish(self) -> Result<W> {
        let inner = match self {
            Encoder::Xz(e) => e.finish(),
            Encoder::Gz(e) => e.finish(),
            Encoder::Zstd(e) => e.finish(),
        };
        inner.map_err(|e| NimError::Compression(e.to_string()))
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Xz(e) => e.write(buf),
            Encoder::Gz(e) => e.write(buf),
            Encoder::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Xz(e) => e.flush(),
            Encoder::Gz(e) => e.flush(),
            Encoder::Zstd(e) => e.flush(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Decoding
// ═══════════════════════════════════════════════════════════════════════

/// Wrap `inner` in a decoder chosen by sniffing its magic bytes.
///
/// Fails with [`NimError::Compression`] when the stream is empty or its
/// format is not recognized.
pub fn decompressing_reader<R>(mut inner: R) -> Result<Box<dyn Read + Send>>
where
    R: Read + Send + 'static,
{
    let mut magic = Vec::with_capacity(MAGIC_LEN);
    let mut buf = [0u8; MAGIC_LEN];
    while magic.len() < MAGIC_LEN {
        let n = inner.read(&mut buf[..MAGIC_LEN - magic.len()])?;
        if n == 0 {
            break;
        }
        magic.extend_from_slice(&buf[..n]);
    }

    let kind = CompressionType::detect(&magic).ok_or_else(|| {
        NimError::Compression(format!(
            "unsupported compression format (leading bytes {})",
            hex::encode(&magic)
        ))
    })?;

    let stream = Cursor::new(magic).chain(inner);
    let reader: Box<dyn Read + Send> = match kind {
        CompressionType::Xz => Box::new(xz2::read::XzDecoder::new_multi_decoder(stream)),
        CompressionType::Gz => Box::new(flate2::read::MultiGzDecoder::new(stream)),
        CompressionType::Zstd => Box::new(
            zstd::stream::read::Decoder::new(stream)
                .map_err(|e| NimError::Compression(e.to_string()))?,
        ),
    };
    Ok(reader)
}

/// [`ImageData`] view that decompresses another source on open.
pub struct DecompressingData {
    inner: Arc<dyn ImageData>,
}

impl DecompressingData {
    pub fn new(inner: Arc<dyn ImageData>) -> Self {
        Self { inner }
    }
}

impl ImageData for DecompressingData {
    fn open(&self) -> Result<Box<dyn Read + Send>> {
        decompressing_reader(self.inner.open()?)
    }

    fn describe(&self) -> String {
        format!("decompressing {}", self.inner.describe())
    }
}
