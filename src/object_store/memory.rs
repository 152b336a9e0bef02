//! In-memory [`ObjectStore`] for tests.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::ops::Bound;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;

use super::{ObjectListing, ObjectStore, ObjectSummary};
use crate::error::{NimError, Result};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    content_type: String,
}

/// Object store backed by a sorted in-memory map.
///
/// Listing returns keys in lexicographic order; the continuation token is
/// the last key of the previous page.
#[derive(Debug)]
pub struct InMemoryObjectStore {
    bucket: String,
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl InMemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    /// All stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    pub fn object_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().get(key).map(|o| o.data.clone())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.read().get(key).map(|o| o.content_type.clone())
    }

    /// Store bytes directly, bypassing `put_object`.
    pub fn insert(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.objects.write().insert(
            key.into(),
            StoredObject {
                data: data.into(),
                content_type: "application/octet-stream".to_string(),
            },
        );
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn list_objects(
        &self,
        prefix: &str,
        token: Option<&str>,
        max_keys: usize,
    ) -> Result<ObjectListing> {
        let objects = self.objects.read();
        let start = match token {
            Some(t) => Bound::Excluded(t.to_string()),
            None => Bound::Included(prefix.to_string()),
        };
        let mut matching = objects
            .range((start, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix));

        let page: Vec<ObjectSummary> = matching
            .by_ref()
            .take(max_keys.max(1))
            .map(|(k, o)| ObjectSummary {
                key: k.clone(),
                size: o.data.len() as u64,
                last_modified: Some(Utc::now()),
            })
            .collect();
        let is_truncated = matching.next().is_some();
        let next_token = if is_truncated {
            page.last().map(|o| o.key.clone())
        } else {
            None
        };
        Ok(ObjectListing {
            objects: page,
            is_truncated,
            next_token,
        })
    }

    fn get_object(&self, key: &str) -> Result<Option<Box<dyn Read + Send>>> {
        Ok(self
            .objects
            .read()
            .get(key)
            .map(|o| Box::new(Cursor::new(o.data.clone())) as Box<dyn Read + Send>))
    }

    fn put_object(
        &self,
        key: &str,
        mut body: Box<dyn Read + Send>,
        content_length: u64,
        content_type: &str,
    ) -> Result<()> {
        let mut data = Vec::with_capacity(content_length as usize);
        body.read_to_end(&mut data)?;
        if data.len() as u64 != content_length {
            return Err(NimError::Storage(format!(
                "Upload of {} sent {} bytes, expected {}",
                key,
                data.len(),
                content_length
            )));
        }
        self.objects.write().insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    fn delete_objects(&self, keys: &[String]) -> Result<()> {
        let mut objects = self.objects.write();
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }

    fn presigned_get_url(&self, key: &str, expires_in: Duration) -> Result<String> {
        Ok(format!(
            "memory://{}/{}?expires={}",
            self.bucket,
            key,
            expires_in.as_secs()
        ))
    }
}
