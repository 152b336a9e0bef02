//! Filesystem image repository.
//!
//! Images live flat in one directory: a `<id>.json` sidecar plus a sibling
//! data file `<id>.img.<suffix>` (a bare `<id>.<suffix>` is also read).
//! Writes go to a hidden temporary file first and are renamed into place.

use std::fs;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use super::{
    is_data_filename, validate_id, CompressionSettings, ImageRepository,
    UpdatableImageRepository,
};
use crate::error::{NimError, Result};
use crate::models::{FileData, Image, ImageInfo};
use crate::tracker::TaskStepTracker;

/// Repository rooted at a local directory.
pub struct FsImageRepository {
    root: PathBuf,
    compression: CompressionSettings,
}

impl FsImageRepository {
    /// Open (creating if needed) a repository at `root`.
    pub fn new(root: &Path, compression: CompressionSettings) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| {
            NimError::storage(
                format!("Failed to create repository directory {}", root.display()),
                e,
            )
        })?;
        Ok(Self {
            root: root.to_path_buf(),
            compression,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }

    /// Visible regular files directly under the root.
    fn files(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| {
                NimError::storage(format!("Error listing {}", self.root.display()), e)
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            files.push((name, entry.into_path()));
        }
        Ok(files)
    }

    /// Data files belonging to `id`, preferring `<id>.img.*`.
    fn data_files(&self, id: &str) -> Result<Vec<(String, PathBuf)>> {
        let mut found: Vec<_> = self
            .files()?
            .into_iter()
            .filter(|(name, _)| is_data_filename(id, name))
            .collect();
        found.sort_by_key(|(name, _)| !name[id.len() + 1..].starts_with("img."));
        Ok(found)
    }

    fn read_info(&self, path: &Path) -> Result<ImageInfo> {
        let data = fs::read(path)
            .map_err(|e| NimError::storage(format!("Error reading {}", path.display()), e))?;
        ImageInfo::from_json(&data)
    }

    /// Write `data` to `dest` via a temp file in the root.
    fn write_atomic(&self, dest: &Path, data: &[u8]) -> Result<()> {
        let mut temp = tempfile::Builder::new()
            .prefix(".meta-")
            .tempfile_in(&self.root)?;
        io::Write::write_all(&mut temp, data)?;
        temp.persist(dest)
            .map_err(|e| NimError::storage(format!("Error writing {}", dest.display()), e))?;
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(NimError::storage(
            format!("Error deleting {}", path.display()),
            e,
        )),
    }
}

impl ImageRepository for FsImageRepository {
    fn find_all(&self) -> Result<Vec<ImageInfo>> {
        let mut infos = Vec::new();
        for (name, path) in self.files()? {
            if !name.ends_with(".json") {
                continue;
            }
            match self.read_info(&path) {
                Ok(info) => infos.push(info),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable image metadata");
                }
            }
        }
        Ok(infos)
    }

    fn find_one_compressed(&self, id: &str) -> Result<Option<Image>> {
        if validate_id(id).is_err() {
            return Ok(None);
        }
        let meta_path = self.meta_path(id);
        if !meta_path.is_file() {
            return Ok(None);
        }
        let info = self.read_info(&meta_path)?;
        let Some((filename, path)) = self.data_files(id)?.into_iter().next() else {
            tracing::warn!(id, "Image metadata has no data file");
            return Ok(None);
        };
        Ok(Some(Image::new(info, filename, Arc::new(FileData::new(path)))))
    }

    fn download_url(&self, _info: &ImageInfo) -> Result<Option<String>> {
        Ok(None)
    }
}

impl UpdatableImageRepository for FsImageRepository {
    fn save(&self, image: &Image, tracker: Arc<TaskStepTracker>) -> Result<Image> {
        let id = image.id();
        validate_id(id)?;
        let filename = self.compression.data_filename(id);
        let dest = self.root.join(&filename);

        tracing::info!(id, dest = %dest.display(), compression = %self.compression.kind, "Compressing image");
        let temp = tempfile::Builder::new()
            .prefix(&format!(".{}-", id))
            .tempfile_in(&self.root)?;
        let mut input = image.open()?;
        let (writer, info) = self.compression.compress(
            id,
            &mut input,
            image.info().uncompressed_length,
            tracker.clone(),
            BufWriter::new(temp),
        )?;
        let temp = writer
            .into_inner()
            .map_err(|e| NimError::storage(format!("Error flushing {}", dest.display()), e))?;
        temp.persist(&dest)
            .map_err(|e| NimError::storage(format!("Error writing {}", dest.display()), e))?;

        for (name, path) in self.data_files(id)? {
            if name != filename {
                remove_if_exists(&path)?;
            }
        }
        self.write_atomic(&self.meta_path(id), &info.to_json()?)?;
        tracker.complete_step();

        self.find_one(id)?
            .ok_or_else(|| NimError::Storage(format!("Saved image {} not found", id)))
    }

    fn delete(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        for (_, path) in self.data_files(id)? {
            remove_if_exists(&path)?;
        }
        remove_if_exists(&self.meta_path(id))?;
        tracing::info!(id, "Deleted image");
        Ok(())
    }

    fn save_task_step_count(&self) -> usize {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BytesData;
    use crate::streams::sha256_hex;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn test_save_writes_data_and_sidecar() {
        let tmp = TempDir::new().unwrap();
        let repo = FsImageRepository::new(tmp.path(), CompressionSettings::default()).unwrap();
        let data = b"disk image bytes".repeat(64);
        let mut info = ImageInfo::new("custom-1");
        info.uncompressed_length = data.len() as u64;
        let image = Image::new(info, "custom-1.img", Arc::new(BytesData(Arc::new(data.clone()))));
        let tracker = Arc::new(TaskStepTracker::new(1).unwrap());

        let saved = repo.save(&image, tracker.clone()).unwrap();
        assert_eq!(tracker.overall_percent_complete(), 1.0);
        assert_eq!(saved.filename(), "custom-1.img");
        assert_eq!(saved.info().uncompressed_sha256, Some(sha256_hex(&data)));
        assert!(tmp.path().join("custom-1.img.xz").is_file());
        assert!(tmp.path().join("custom-1.json").is_file());

        let mut out = Vec::new();
        saved.open().unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_data_files_ignore_other_ids() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("foo.json"), br#"{"id":"foo"}"#).unwrap();
        fs::write(tmp.path().join("foo.img.xz"), b"x").unwrap();
        fs::write(tmp.path().join("foo.bar.json"), br#"{"id":"foo.bar"}"#).unwrap();
        fs::write(tmp.path().join("foo.bar.img.xz"), b"x").unwrap();
        fs::write(tmp.path().join(".foo.img.xz-partial"), b"x").unwrap();
        let repo = FsImageRepository::new(tmp.path(), CompressionSettings::default()).unwrap();
        let names: Vec<_> = repo
            .data_files("foo")
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["foo.img.xz"]);
    }

    #[test]
    fn test_unreadable_sidecar_skipped() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("bad.json"), b"not json").unwrap();
        fs::write(tmp.path().join("good.json"), br#"{"id":"good"}"#).unwrap();
        let repo = FsImageRepository::new(tmp.path(), CompressionSettings::default()).unwrap();
        let ids: Vec<_> = repo.find_all().unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["good"]);
    }
}
