//! Image repositories.
//!
//! A repository durably stores compressed images next to a JSON metadata
//! sidecar ([`ImageInfo`]). Reading is the [`ImageRepository`] capability;
//! publishing and deleting is the [`UpdatableImageRepository`] extension.
//! Both backends share [`CompressionSettings::compress`], which streams an
//! uncompressed image through the digest and compression chain:
//!
//! ```text
//! input ─▶ Progress ─▶ Digest(uncompressed) ─▶ Encoder ─▶ Digest(compressed) ─▶ output
//! ```
//!
//! | Backend | Data | Metadata | Save steps |
//! |---------|------|----------|------------|
//! | [`FsImageRepository`] | `<root>/<id>.img.<suffix>` | `<root>/<id>.json` | 1 |
//! | [`S3ImageRepository`] | `<prefix>node-image-data/<id>.img.<suffix>` | `<prefix>node-image-meta/<id>.json` | 3 |

mod fs;
mod s3;

use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::compression::{CompressionType, DecompressingData, Encoder};
use crate::error::{NimError, Result};
use crate::models::{Image, ImageInfo};
use crate::streams::{DigestWriter, ProgressWriter};
use crate::tracker::TaskStepTracker;

pub use fs::FsImageRepository;
pub use s3::{S3ImageRepository, S3RepositorySettings};

/// Read capability shared by all repositories.
pub trait ImageRepository: Send + Sync {
    /// Metadata for every stored image, in no particular order.
    fn find_all(&self) -> Result<Vec<ImageInfo>>;

    /// The stored image with its bytes exactly as stored (compressed).
    fn find_one_compressed(&self, id: &str) -> Result<Option<Image>>;

    /// The stored image with a stream that decompresses on read.
    fn find_one(&self, id: &str) -> Result<Option<Image>> {
        Ok(self.find_one_compressed(id)?.map(decompressed_view))
    }

    /// A time-limited direct download link, when the backend supports one.
    fn download_url(&self, info: &ImageInfo) -> Result<Option<String>>;
}

/// Write capability.
pub trait UpdatableImageRepository: ImageRepository {
    /// Compress, digest, and durably store `image`, whose stream yields the
    /// uncompressed content. Returns the stored image (decompressing view).
    ///
    /// Consumes [`save_task_step_count`](Self::save_task_step_count) steps of
    /// `tracker`.
    fn save(&self, image: &Image, tracker: Arc<TaskStepTracker>) -> Result<Image>;

    /// Remove an image's data and metadata. Absent objects are not an error.
    fn delete(&self, id: &str) -> Result<()>;

    /// Tracker steps consumed by one `save`.
    fn save_task_step_count(&self) -> usize;
}

/// Wrap a compressed image in a decompressing view, dropping the codec
/// suffix from its filename.
pub fn decompressed_view(image: Image) -> Image {
    let filename = match image.filename().rsplit_once('.') {
        Some((stem, _)) if CompressionType::from_filename(image.filename()).is_some() => {
            stem.to_string()
        }
        _ => image.filename().to_string(),
    };
    let data = Arc::new(DecompressingData::new(image.data().clone()));
    Image::new(image.into_info(), filename, data)
}

// ═══════════════════════════════════════════════════════════════════════
// Shared compression settings
// ═══════════════════════════════════════════════════════════════════════

/// Codec and strength used when publishing.
#[derive(Debug, Clone, Copy)]
pub struct CompressionSettings {
    pub kind: CompressionType,
    /// 0 = fastest .. 1 = strongest.
    pub ratio: f32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            kind: CompressionType::Xz,
            ratio: 1.0,
        }
    }
}

impl CompressionSettings {
    /// File name of the data artifact for `id`.
    pub fn data_filename(&self, id: &str) -> String {
        format!("{}.img.{}", id, self.kind.suffix())
    }

    /// Compress `input` into `output`, digesting both sides.
    ///
    /// Progress is reported against `expected_length` uncompressed bytes.
    /// Returns the flushed `output` and an [`ImageInfo`] with both digests
    /// and lengths filled in.
    pub fn compress<W: Write>(
        &self,
        id: &str,
        input: &mut dyn Read,
        expected_length: u64,
        tracker: Arc<TaskStepTracker>,
        output: W,
    ) -> Result<(W, ImageInfo)> {
        let encoder = Encoder::new(self.kind, self.ratio, DigestWriter::new(output))?;
        let mut chain = ProgressWriter::new(expected_length, tracker, DigestWriter::new(encoder));
        io::copy(input, &mut chain)?;

        let (encoder, uncompressed) = chain.into_inner().finish();
        let (mut output, compressed) = encoder.finish()?.finish();
        output.flush()?;

        let info = ImageInfo {
            id: id.to_string(),
            compressed_sha256: Some(compressed.sha256),
            compressed_length: compressed.length,
            uncompressed_sha256: Some(uncompressed.sha256),
            uncompressed_length: uncompressed.length,
        };
        Ok((output, info))
    }
}

/// Whether `name` is a data artifact of `id`: `<id>.img.<suffix>` or
/// `<id>.<suffix>` with a known codec suffix. Names of images whose id
/// merely starts with `<id>.` do not match.
pub fn is_data_filename(id: &str, name: &str) -> bool {
    let Some(rest) = name.strip_prefix(id).and_then(|r| r.strip_prefix('.')) else {
        return false;
    };
    let suffix = rest.strip_prefix("img.").unwrap_or(rest);
    !suffix.contains('.') && suffix.parse::<CompressionType>().is_ok()
}

/// Reject ids that cannot be used as a single path or key segment.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty()
        || id == "."
        || id == ".."
        || id.starts_with('.')
        || id.contains(['/', '\\'])
        || id.chars().any(char::is_control)
    {
        return Err(NimError::InvalidArgument(format!("invalid image id '{}'", id)));
    }
    Ok(())
}
