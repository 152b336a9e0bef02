//! Core data models used throughout the image maker.
//!
//! [`ImageInfo`] is both the in-memory identity/integrity record and the
//! on-disk JSON sidecar format. [`Image`] pairs an info record with a
//! lazily opened byte stream.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{NimError, Result};

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// Identity and integrity metadata for a stored image.
///
/// Serialized as the metadata sidecar:
///
/// ```json
/// {"id":"foobar","sha256":"…","contentLength":123,
///  "uncompressedSha256":"…","uncompressedContentLength":456}
/// ```
///
/// Unknown fields are ignored on read; absent or zero fields are omitted
/// on write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    /// Hex SHA-256 of the stored (compressed) bytes.
    #[serde(rename = "sha256", default, skip_serializing_if = "Option::is_none")]
    pub compressed_sha256: Option<String>,
    #[serde(rename = "contentLength", default, skip_serializing_if = "is_zero")]
    pub compressed_length: u64,
    /// Hex SHA-256 of the decompressed content.
    #[serde(
        rename = "uncompressedSha256",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub uncompressed_sha256: Option<String>,
    #[serde(
        rename = "uncompressedContentLength",
        default,
        skip_serializing_if = "is_zero"
    )]
    pub uncompressed_length: u64,
}

impl ImageInfo {
    /// An info record with only an id, as used for a not-yet-published image.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Parse a metadata sidecar.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Case-insensitive ordering by image id.
pub fn compare_by_id(a: &ImageInfo, b: &ImageInfo) -> Ordering {
    a.id.to_lowercase()
        .cmp(&b.id.to_lowercase())
        .then_with(|| a.id.cmp(&b.id))
}

/// A source of image bytes that can be opened on demand.
///
/// Some sources (upload parts, one-shot network bodies) may only support a
/// single `open` per transfer.
pub trait ImageData: Send + Sync {
    fn open(&self) -> Result<Box<dyn Read + Send>>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

/// Image bytes stored in a local file.
#[derive(Debug, Clone)]
pub struct FileData {
    path: PathBuf,
}

impl FileData {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ImageData for FileData {
    fn open(&self) -> Result<Box<dyn Read + Send>> {
        let file = File::open(&self.path).map_err(|e| {
            NimError::storage(format!("Error opening {}", self.path.display()), e)
        })?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }
}

/// Image bytes held in memory.
#[derive(Debug, Clone)]
pub struct BytesData(pub Arc<Vec<u8>>);

impl ImageData for BytesData {
    fn open(&self) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(std::io::Cursor::new(self.0.as_ref().clone())))
    }

    fn describe(&self) -> String {
        format!("memory ({} bytes)", self.0.len())
    }
}

/// An [`ImageInfo`] plus a read handle on its bytes.
///
/// The repository owns the durable bytes; an `Image` is only a handle.
#[derive(Clone)]
pub struct Image {
    info: ImageInfo,
    filename: String,
    data: Arc<dyn ImageData>,
}

impl Image {
    pub fn new(info: ImageInfo, filename: impl Into<String>, data: Arc<dyn ImageData>) -> Self {
        Self {
            info,
            filename: filename.into(),
            data,
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn info(&self) -> &ImageInfo {
        &self.info
    }

    pub fn into_info(self) -> ImageInfo {
        self.info
    }

    /// File name; carries the compression suffix when the bytes are compressed.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn data(&self) -> &Arc<dyn ImageData> {
        &self.data
    }

    /// Open the image's byte stream.
    pub fn open(&self) -> Result<Box<dyn Read + Send>> {
        self.data.open()
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("info", &self.info)
            .field("filename", &self.filename)
            .field("data", &self.data.describe())
            .finish()
    }
}

/// Content of a customization resource.
#[derive(Debug, Clone)]
pub enum ResourceContent {
    Bytes(Vec<u8>),
    /// A caller-owned file, e.g. an upload part that may vanish once the
    /// caller's request completes.
    File(PathBuf),
}

/// A named file to stage alongside the base image.
#[derive(Debug, Clone)]
pub struct ImageResource {
    pub filename: String,
    pub content: ResourceContent,
}

impl ImageResource {
    pub fn from_bytes(filename: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            content: ResourceContent::Bytes(data.into()),
        }
    }

    pub fn from_file(filename: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            content: ResourceContent::File(path.into()),
        }
    }

    /// Copy this resource's bytes to `dest`.
    pub fn transfer_to(&self, dest: &Path) -> Result<()> {
        match &self.content {
            ResourceContent::Bytes(data) => std::fs::write(dest, data),
            ResourceContent::File(path) => std::fs::copy(path, dest).map(|_| ()),
        }
        .map_err(|e| {
            NimError::storage(
                format!("Error transferring resource {} to {}", self.filename, dest.display()),
                e,
            )
        })
    }
}

/// Options for a customization task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageOptions {
    /// Passed to the customization tool's process environment.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Consumer-defined parameters, e.g. `format` to override the image format.
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
    /// Enable extra customization tool diagnostics.
    #[serde(default)]
    pub verbose: bool,
}

impl ImageOptions {
    pub fn parameter_value(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }
}
