use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use node_image_maker::cache::StreamCache;
use node_image_maker::models::{BytesData, Image, ImageInfo};
use node_image_maker::object_store::{InMemoryObjectStore, ObjectListing, ObjectStore};
use node_image_maker::repository::{
    CompressionSettings, ImageRepository, S3ImageRepository, S3RepositorySettings,
    UpdatableImageRepository,
};
use node_image_maker::streams::sha256_hex;
use node_image_maker::tracker::TaskStepTracker;
use node_image_maker::Result;
use tempfile::TempDir;

/// Counts `get_object` calls on the wrapped store.
struct CountingStore {
    inner: InMemoryObjectStore,
    gets: AtomicUsize,
}

impl ObjectStore for CountingStore {
    fn bucket(&self) -> &str {
        self.inner.bucket()
    }

    fn list_objects(&self, prefix: &str, token: Option<&str>, max_keys: usize) -> Result<ObjectListing> {
        self.inner.list_objects(prefix, token, max_keys)
    }

    fn get_object(&self, key: &str) -> Result<Option<Box<dyn Read + Send>>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get_object(key)
    }

    fn put_object(
        &self,
        key: &str,
        body: Box<dyn Read + Send>,
        content_length: u64,
        content_type: &str,
    ) -> Result<()> {
        self.inner.put_object(key, body, content_length, content_type)
    }

    fn delete_objects(&self, keys: &[String]) -> Result<()> {
        self.inner.delete_objects(keys)
    }

    fn presigned_get_url(&self, key: &str, expires_in: Duration) -> Result<String> {
        self.inner.presigned_get_url(key, expires_in)
    }
}

fn settings(tmp: &TempDir) -> S3RepositorySettings {
    S3RepositorySettings {
        object_key_prefix: "tenant/".to_string(),
        work_dir: tmp.path().join("work"),
        max_keys: 2,
        download_expiration: Duration::from_secs(600),
        compression: CompressionSettings::default(),
    }
}

fn image(id: &str, content: &[u8]) -> Image {
    let info = ImageInfo {
        uncompressed_length: content.len() as u64,
        ..ImageInfo::new(id)
    };
    Image::new(info, format!("{}.img", id), Arc::new(BytesData(Arc::new(content.to_vec()))))
}

fn read_all(image: &Image) -> Vec<u8> {
    let mut out = Vec::new();
    image.open().unwrap().read_to_end(&mut out).unwrap();
    out
}

#[test]
fn test_save_uses_three_steps_and_both_keys() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemoryObjectStore::new("images"));
    let repo = S3ImageRepository::new(store.clone(), settings(&tmp)).unwrap();
    assert_eq!(repo.save_task_step_count(), 3);

    let content = b"customized node image".repeat(100);
    let tracker = Arc::new(TaskStepTracker::new(3).unwrap());
    let saved = repo.save(&image("abc", &content), tracker.clone()).unwrap();

    assert_eq!(tracker.current_step(), 4);
    assert_eq!(tracker.overall_percent_complete(), 1.0);
    assert_eq!(
        store.keys(),
        vec![
            "tenant/node-image-data/abc.img.xz".to_string(),
            "tenant/node-image-meta/abc.json".to_string(),
        ]
    );
    assert_eq!(
        store.content_type("tenant/node-image-data/abc.img.xz").as_deref(),
        Some("application/x-xz")
    );

    let stored = store.object_bytes("tenant/node-image-data/abc.img.xz").unwrap();
    let meta = ImageInfo::from_json(&store.object_bytes("tenant/node-image-meta/abc.json").unwrap())
        .unwrap();
    assert_eq!(meta.compressed_sha256, Some(sha256_hex(&stored)));
    assert_eq!(meta.compressed_length, stored.len() as u64);
    assert_eq!(meta.uncompressed_sha256, Some(sha256_hex(&content)));
    assert_eq!(saved.info(), &meta);
    assert_eq!(read_all(&saved), content);

    let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join("work")).unwrap().collect();
    assert!(leftovers.is_empty(), "work dir not cleaned: {:?}", leftovers);
}

#[test]
fn test_find_all_paginates() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemoryObjectStore::new("images"));
    for i in 0..5 {
        store.insert(
            format!("tenant/node-image-meta/img-{}.json", i),
            format!(r#"{{"id":"img-{}"}}"#, i),
        );
    }
    store.insert("other/node-image-meta/foreign.json", r#"{"id":"foreign"}"#);
    let repo = S3ImageRepository::new(store, settings(&tmp)).unwrap();

    let mut ids: Vec<String> = repo.find_all().unwrap().into_iter().map(|i| i.id).collect();
    ids.sort();
    assert_eq!(ids, vec!["img-0", "img-1", "img-2", "img-3", "img-4"]);
}

#[test]
fn test_download_url_and_delete() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemoryObjectStore::new("images"));
    let repo = S3ImageRepository::new(store.clone(), settings(&tmp)).unwrap();
    let saved = repo
        .save(&image("dl", b"bytes"), Arc::new(TaskStepTracker::new(3).unwrap()))
        .unwrap();

    assert_eq!(
        repo.download_url(saved.info()).unwrap().as_deref(),
        Some("memory://images/tenant/node-image-data/dl.img.xz?expires=600")
    );

    repo.delete("dl").unwrap();
    assert!(store.keys().is_empty());
    assert!(repo.find_one("dl").unwrap().is_none());
    assert!(repo.download_url(saved.info()).unwrap().is_none());
    repo.delete("dl").unwrap();
}

#[test]
fn test_cached_reads_fetch_once() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(CountingStore {
        inner: InMemoryObjectStore::new("images"),
        gets: AtomicUsize::new(0),
    });
    let cache = Arc::new(StreamCache::new(&tmp.path().join("cache")).unwrap());
    let repo = S3ImageRepository::new(store.clone(), settings(&tmp))
        .unwrap()
        .with_cache(cache.clone());
    let content = b"base image".repeat(500);
    repo.save(&image("base", &content), Arc::new(TaskStepTracker::new(3).unwrap()))
        .unwrap();

    let data_key = "tenant/node-image-data/base.img.xz";
    let image = repo.find_one("base").unwrap().unwrap();
    let before = store.gets.load(Ordering::SeqCst);
    assert_eq!(read_all(&image), content);
    assert_eq!(store.gets.load(Ordering::SeqCst), before + 1);
    assert!(cache.contains(data_key));

    assert_eq!(read_all(&image), content);
    assert_eq!(store.gets.load(Ordering::SeqCst), before + 1);

    repo.delete("base").unwrap();
    assert!(!cache.contains(data_key));
}

#[test]
fn test_ids_sharing_a_prefix_are_independent() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemoryObjectStore::new("images"));
    let repo = S3ImageRepository::new(store.clone(), settings(&tmp)).unwrap();
    repo.save(&image("foo.bar", b"dotted image"), Arc::new(TaskStepTracker::new(3).unwrap()))
        .unwrap();
    repo.save(&image("foo", b"plain image"), Arc::new(TaskStepTracker::new(3).unwrap()))
        .unwrap();

    assert_eq!(read_all(&repo.find_one("foo.bar").unwrap().unwrap()), b"dotted image");
    assert_eq!(read_all(&repo.find_one("foo").unwrap().unwrap()), b"plain image");

    repo.delete("foo").unwrap();
    assert!(repo.find_one("foo").unwrap().is_none());
    assert_eq!(
        store.keys(),
        vec![
            "tenant/node-image-data/foo.bar.img.xz".to_string(),
            "tenant/node-image-meta/foo.bar.json".to_string(),
        ]
    );
    assert_eq!(read_all(&repo.find_one("foo.bar").unwrap().unwrap()), b"dotted image");
}

#[test]
fn test_resave_refreshes_cached_data() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemoryObjectStore::new("images"));
    let cache = Arc::new(StreamCache::new(&tmp.path().join("cache")).unwrap());
    let repo = S3ImageRepository::new(store, settings(&tmp))
        .unwrap()
        .with_cache(cache.clone());

    repo.save(&image("x", b"version one"), Arc::new(TaskStepTracker::new(3).unwrap()))
        .unwrap();
    assert_eq!(read_all(&repo.find_one("x").unwrap().unwrap()), b"version one");
    assert!(cache.contains("tenant/node-image-data/x.img.xz"));

    repo.save(&image("x", b"version two"), Arc::new(TaskStepTracker::new(3).unwrap()))
        .unwrap();
    let found = repo.find_one("x").unwrap().unwrap();
    let content = read_all(&found);
    assert_eq!(content, b"version two");
    assert_eq!(found.info().uncompressed_sha256, Some(sha256_hex(&content)));

    let raw = read_all(&repo.find_one_compressed("x").unwrap().unwrap());
    assert_eq!(found.info().compressed_sha256, Some(sha256_hex(&raw)));
}
