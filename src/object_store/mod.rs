//! Minimal object-storage abstraction used by the S3 image repository.
//!
//! [`ObjectStore`] covers exactly the operations the repository needs:
//! paginated listing, streamed get/put, batch delete, and presigned
//! download URLs. [`S3Client`] talks to S3 (or an S3-compatible service)
//! over HTTPS with SigV4 signing; [`InMemoryObjectStore`] backs tests.

mod memory;
mod s3;

use std::io::Read;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Result;

pub use memory::InMemoryObjectStore;
pub use s3::{AwsCredentials, S3Client, S3Settings};

/// Summary of one listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct ObjectListing {
    pub objects: Vec<ObjectSummary>,
    pub is_truncated: bool,
    /// Token to pass to the next `list_objects` call when truncated.
    pub next_token: Option<String>,
}

/// Blocking object-storage operations.
pub trait ObjectStore: Send + Sync {
    /// Bucket or container name, for logs and URLs.
    fn bucket(&self) -> &str;

    /// List up to `max_keys` objects under `prefix`, continuing from `token`.
    fn list_objects(
        &self,
        prefix: &str,
        token: Option<&str>,
        max_keys: usize,
    ) -> Result<ObjectListing>;

    /// Open an object's content, or `None` if it does not exist.
    fn get_object(&self, key: &str) -> Result<Option<Box<dyn Read + Send>>>;

    /// Upload `content_length` bytes from `body` to `key`.
    fn put_object(
        &self,
        key: &str,
        body: Box<dyn Read + Send>,
        content_length: u64,
        content_type: &str,
    ) -> Result<()>;

    /// Delete `keys` in one request. Missing keys are not an error.
    fn delete_objects(&self, keys: &[String]) -> Result<()>;

    /// A time-limited URL granting unauthenticated GET access to `key`.
    fn presigned_get_url(&self, key: &str, expires_in: Duration) -> Result<String>;
}

/// Follow continuation tokens until the listing under `prefix` is exhausted.
pub fn list_all(
    store: &dyn ObjectStore,
    prefix: &str,
    max_keys: usize,
) -> Result<Vec<ObjectSummary>> {
    let mut objects = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = store.list_objects(prefix, token.as_deref(), max_keys)?;
        objects.extend(page.objects);
        match page.next_token {
            Some(next) if page.is_truncated => token = Some(next),
            _ => break,
        }
    }
    Ok(objects)
}
