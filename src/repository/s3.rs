//! Object-storage image repository.
//!
//! Metadata objects are stored under `<prefix>node-image-meta/` and data
//! objects under `<prefix>node-image-data/`. Saving stages the compressed
//! bytes in a local temporary file so the final length and digest are known
//! before upload, then uploads data and metadata as separate steps.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::{
    is_data_filename, validate_id, CompressionSettings, ImageRepository,
    UpdatableImageRepository,
};
use crate::cache::StreamCache;
use crate::error::{NimError, Result};
use crate::models::{Image, ImageData, ImageInfo};
use crate::object_store::{list_all, ObjectStore};
use crate::streams::ProgressReader;
use crate::tracker::TaskStepTracker;

const META_DIR: &str = "node-image-meta/";
const DATA_DIR: &str = "node-image-data/";

/// Settings for an [`S3ImageRepository`].
#[derive(Debug, Clone)]
pub struct S3RepositorySettings {
    /// Tenant/environment prefix prepended to every key, e.g. `"prod/"`.
    pub object_key_prefix: String,
    /// Where compressed output is staged before upload.
    pub work_dir: PathBuf,
    /// Page size for listings.
    pub max_keys: usize,
    pub download_expiration: Duration,
    pub compression: CompressionSettings,
}

impl Default for S3RepositorySettings {
    fn default() -> Self {
        Self {
            object_key_prefix: String::new(),
            work_dir: std::env::temp_dir(),
            max_keys: 500,
            download_expiration: Duration::from_secs(3600),
            compression: CompressionSettings::default(),
        }
    }
}

/// Repository backed by an [`ObjectStore`].
pub struct S3ImageRepository {
    store: Arc<dyn ObjectStore>,
    settings: S3RepositorySettings,
    cache: Option<Arc<StreamCache>>,
}

impl S3ImageRepository {
    pub fn new(store: Arc<dyn ObjectStore>, settings: S3RepositorySettings) -> Result<Self> {
        std::fs::create_dir_all(&settings.work_dir).map_err(|e| {
            NimError::storage(
                format!("Failed to create work directory {}", settings.work_dir.display()),
                e,
            )
        })?;
        Ok(Self {
            store,
            settings,
            cache: None,
        })
    }

    /// Serve data reads through `cache`.
    pub fn with_cache(mut self, cache: Arc<StreamCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    fn meta_prefix(&self) -> String {
        format!("{}{}", self.settings.object_key_prefix, META_DIR)
    }

    fn data_prefix(&self) -> String {
        format!("{}{}", self.settings.object_key_prefix, DATA_DIR)
    }

    fn meta_key(&self, id: &str) -> String {
        format!("{}{}.json", self.meta_prefix(), id)
    }

    fn data_key(&self, id: &str) -> String {
        format!(
            "{}{}",
            self.data_prefix(),
            self.settings.compression.data_filename(id)
        )
    }

    /// Existing data object keys for `id`, preferring `<id>.img.*`.
    fn data_keys(&self, id: &str) -> Result<Vec<String>> {
        let prefix = format!("{}{}.", self.data_prefix(), id);
        let mut keys: Vec<String> = list_all(self.store.as_ref(), &prefix, self.settings.max_keys)?
            .into_iter()
            .map(|o| o.key)
            .filter(|k| is_data_filename(id, filename_of(k)))
            .collect();
        keys.sort_by_key(|k| !k[prefix.len()..].starts_with("img."));
        Ok(keys)
    }

    fn evict(&self, keys: &[String]) -> Result<()> {
        if let Some(cache) = &self.cache {
            for key in keys {
                if cache.remove(key)? {
                    tracing::debug!(key = %key, "Evicted cached image data");
                }
            }
        }
        Ok(())
    }

    fn read_info(&self, key: &str) -> Result<Option<ImageInfo>> {
        let Some(mut reader) = self.store.get_object(key)? else {
            return Ok(None);
        };
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok(Some(ImageInfo::from_json(&data)?))
    }
}

fn filename_of(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Bytes of one stored object, optionally via the stream cache.
struct ObjectData {
    store: Arc<dyn ObjectStore>,
    key: String,
    cache: Option<Arc<StreamCache>>,
}

impl ObjectData {
    fn fetch(store: &dyn ObjectStore, key: &str) -> Result<Box<dyn Read + Send>> {
        store
            .get_object(key)?
            .ok_or_else(|| NimError::NotFound(format!("s3://{}/{}", store.bucket(), key)))
    }
}

impl ImageData for ObjectData {
    fn open(&self) -> Result<Box<dyn Read + Send>> {
        match &self.cache {
            Some(cache) => cache.get(&self.key, || Self::fetch(self.store.as_ref(), &self.key)),
            None => Self::fetch(self.store.as_ref(), &self.key),
        }
    }

    fn describe(&self) -> String {
        format!("s3://{}/{}", self.store.bucket(), self.key)
    }
}

impl ImageRepository for S3ImageRepository {
    fn find_all(&self) -> Result<Vec<ImageInfo>> {
        let mut infos = Vec::new();
        for object in list_all(
            self.store.as_ref(),
            &self.meta_prefix(),
            self.settings.max_keys,
        )? {
            if !object.key.ends_with(".json") {
                continue;
            }
            match self.read_info(&object.key) {
                Ok(Some(info)) => infos.push(info),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(key = %object.key, error = %e, "Skipping unreadable image metadata");
                }
            }
        }
        Ok(infos)
    }

    fn find_one_compressed(&self, id: &str) -> Result<Option<Image>> {
        if validate_id(id).is_err() {
            return Ok(None);
        }
        let Some(info) = self.read_info(&self.meta_key(id))? else {
            return Ok(None);
        };
        let Some(key) = self.data_keys(id)?.into_iter().next() else {
            tracing::warn!(id, "Image metadata has no data object");
            return Ok(None);
        };
        let data = ObjectData {
            store: self.store.clone(),
            key: key.clone(),
            cache: self.cache.clone(),
        };
        Ok(Some(Image::new(info, filename_of(&key), Arc::new(data))))
    }

    fn download_url(&self, info: &ImageInfo) -> Result<Option<String>> {
        if validate_id(&info.id).is_err() {
            return Ok(None);
        }
        match self.data_keys(&info.id)?.into_iter().next() {
            Some(key) => Ok(Some(
                self.store
                    .presigned_get_url(&key, self.settings.download_expiration)?,
            )),
            None => Ok(None),
        }
    }
}

impl UpdatableImageRepository for S3ImageRepository {
    fn save(&self, image: &Image, tracker: Arc<TaskStepTracker>) -> Result<Image> {
        let id = image.id();
        validate_id(id)?;
        let compression = &self.settings.compression;
        let data_key = self.data_key(id);

        // Removed on drop in every outcome.
        let temp = tempfile::Builder::new()
            .prefix("node-image-")
            .suffix(&format!(".img.{}", compression.kind.suffix()))
            .tempfile_in(&self.settings.work_dir)?;

        tracing::info!(id, temp = %temp.path().display(), compression = %compression.kind, "Compressing image");
        let mut input = image.open()?;
        let (writer, info) = compression.compress(
            id,
            &mut input,
            image.info().uncompressed_length,
            tracker.clone(),
            BufWriter::new(temp.reopen()?),
        )?;
        drop(writer.into_inner().map_err(|e| {
            NimError::storage(format!("Error flushing {}", temp.path().display()), e)
        })?);
        tracker.complete_step();

        tracker.set_message("Uploading customized image");
        tracing::info!(id, key = %data_key, bytes = info.compressed_length, "Uploading image data");
        let body = ProgressReader::new(
            info.compressed_length,
            tracker.clone(),
            BufReader::new(File::open(temp.path())?),
        );
        self.store.put_object(
            &data_key,
            Box::new(body),
            info.compressed_length,
            compression.kind.content_type(),
        )?;
        self.evict(std::slice::from_ref(&data_key))?;
        tracker.complete_step();

        let meta = info.to_json()?;
        let meta_len = meta.len() as u64;
        self.store.put_object(
            &self.meta_key(id),
            Box::new(std::io::Cursor::new(meta)),
            meta_len,
            "application/json",
        )?;
        tracker.complete_step();
        drop(temp);

        let stale: Vec<String> = self
            .data_keys(id)?
            .into_iter()
            .filter(|k| *k != data_key)
            .collect();
        if !stale.is_empty() {
            self.store.delete_objects(&stale)?;
            self.evict(&stale)?;
        }

        self.find_one(id)?
            .ok_or_else(|| NimError::Storage(format!("Saved image {} not found", id)))
    }

    fn delete(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        let mut keys = self.data_keys(id)?;
        let data_key = self.data_key(id);
        if !keys.contains(&data_key) {
            keys.push(data_key);
        }
        keys.push(self.meta_key(id));
        self.store.delete_objects(&keys)?;
        self.evict(&keys)?;
        tracing::info!(id, bucket = self.store.bucket(), "Deleted image");
        Ok(())
    }

    fn save_task_step_count(&self) -> usize {
        3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::InMemoryObjectStore;
    use tempfile::TempDir;

    fn repo(tmp: &TempDir, store: Arc<InMemoryObjectStore>) -> S3ImageRepository {
        S3ImageRepository::new(
            store,
            S3RepositorySettings {
                object_key_prefix: "test/".to_string(),
                work_dir: tmp.path().join("work"),
                max_keys: 2,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_keys_use_prefix_and_suffix() {
        let tmp = TempDir::new().unwrap();
        let r = repo(&tmp, Arc::new(InMemoryObjectStore::new("b")));
        assert_eq!(r.meta_key("foo"), "test/node-image-meta/foo.json");
        assert_eq!(r.data_key("foo"), "test/node-image-data/foo.img.xz");
    }

    #[test]
    fn test_find_one_missing_data_object() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryObjectStore::new("b"));
        store.insert("test/node-image-meta/orphan.json", br#"{"id":"orphan"}"#.to_vec());
        let r = repo(&tmp, store);
        assert!(r.find_one("orphan").unwrap().is_none());
        assert_eq!(r.find_all().unwrap().len(), 1);
    }

    #[test]
    fn test_delete_absent_is_ok() {
        let tmp = TempDir::new().unwrap();
        let r = repo(&tmp, Arc::new(InMemoryObjectStore::new("b")));
        r.delete("never-existed").unwrap();
    }
}
