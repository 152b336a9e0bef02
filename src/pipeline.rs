//! The per-task customization job.
//!
//! [`CustomizationJob::stage`] runs on the submitting caller's thread and
//! copies every resource into a private staging directory. [`CustomizationJob::run`]
//! then executes on a worker:
//!
//! 1. decompress the base image into the staging directory, verifying its
//!    declared uncompressed digest
//! 2. run the customization tool
//! 3. compress and publish through the destination repository
//!    ([`UpdatableImageRepository::save_task_step_count`] steps)
//!
//! Whatever the outcome, the staging directory is removed and the tracker
//! completed. On failure any partially published output is deleted.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tempfile::TempDir;
use uuid::Uuid;

use crate::customizer::{CustomizeRequest, ImageCustomizer};
use crate::error::{NimError, Result};
use crate::models::{Image, ImageData, ImageInfo, ImageOptions, ImageResource};
use crate::receipt::TaskState;
use crate::repository::{validate_id, UpdatableImageRepository};
use crate::streams::{CancelFlag, CancellableReader, DigestReader, ProgressWriter};
use crate::tracker::TaskStepTracker;

/// Tracker steps for a task publishing to `dest`.
pub fn task_step_count(dest: &dyn UpdatableImageRepository) -> usize {
    2 + dest.save_task_step_count()
}

/// A staged task waiting for a worker.
pub struct CustomizationJob {
    task_id: String,
    source: Image,
    output_id: String,
    options: ImageOptions,
    staging: TempDir,
    image_path: PathBuf,
    resources: Vec<PathBuf>,
}

impl CustomizationJob {
    /// Create the staging directory under `staging_root` and copy `resources`
    /// into it. Resources with an empty filename are skipped.
    pub fn stage(
        task_id: impl Into<String>,
        staging_root: &Path,
        source: Image,
        resources: &[ImageResource],
        options: ImageOptions,
    ) -> Result<Self> {
        validate_id(source.id())?;
        let image_name = format!("{}.img", source.id());

        std::fs::create_dir_all(staging_root).map_err(|e| {
            NimError::storage(
                format!("Failed to create staging directory {}", staging_root.display()),
                e,
            )
        })?;
        let staging = tempfile::Builder::new()
            .prefix("node-image-")
            .tempdir_in(staging_root)?;

        let mut staged = Vec::with_capacity(resources.len());
        for resource in resources {
            if resource.filename.is_empty() {
                continue;
            }
            check_resource_name(&resource.filename, &image_name)?;
            let dest = staging.path().join(&resource.filename);
            tracing::info!(resource = %resource.filename, dest = %dest.display(), "Transferring resource");
            resource.transfer_to(&dest)?;
            staged.push(dest);
        }

        Ok(Self {
            task_id: task_id.into(),
            image_path: staging.path().join(image_name),
            source,
            output_id: Uuid::new_v4().to_string(),
            options,
            staging,
            resources: staged,
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Id the customized image is published under.
    pub fn output_id(&self) -> &str {
        &self.output_id
    }

    pub fn staging_dir(&self) -> &Path {
        self.staging.path()
    }

    pub fn staged_resources(&self) -> &[PathBuf] {
        &self.resources
    }

    /// Execute the task to a terminal state. Never panics on task errors;
    /// failures are returned as [`TaskState::Failed`].
    pub fn run(
        self,
        dest: &dyn UpdatableImageRepository,
        customizer: &dyn ImageCustomizer,
        tracker: Arc<TaskStepTracker>,
        cancel: &CancelFlag,
    ) -> TaskState {
        let started = Instant::now();
        tracker.start();

        let result = self
            .execute(dest, customizer, &tracker, cancel)
            .and_then(|done| {
                if cancel.is_cancelled() {
                    Err(NimError::Cancelled)
                } else {
                    Ok(done)
                }
            });
        let state = match result {
            Ok((image, output)) => {
                tracker.set_message("Done");
                TaskState::Succeeded { image, output }
            }
            Err(e) => {
                if let Err(cleanup) = dest.delete(&self.output_id) {
                    tracing::warn!(
                        image = %self.output_id,
                        error = %cleanup,
                        cause = %e,
                        "Error cleaning up image after failure"
                    );
                }
                if cancel.is_cancelled() || matches!(e, NimError::Cancelled) {
                    tracker.set_message("Cancelled");
                    TaskState::Cancelled
                } else {
                    let message = format!("{}: {}", e.kind(), e);
                    tracing::error!(task_id = %self.task_id, error = %message, "Task failed");
                    tracker.set_message(message.clone());
                    TaskState::Failed(message)
                }
            }
        };

        let staging_path = self.staging.path().to_path_buf();
        tracing::info!(dir = %staging_path.display(), "Deleting staging dir");
        if let Err(e) = self.staging.close() {
            tracing::warn!(dir = %staging_path.display(), error = %e, "Error deleting staging dir");
        }
        tracker.complete();

        let outcome = match state {
            TaskState::Succeeded { .. } => "successfully",
            _ => "with error",
        };
        tracing::info!(
            task_id = %self.task_id,
            elapsed = ?started.elapsed(),
            "Task completed {}",
            outcome
        );
        state
    }

    fn execute(
        &self,
        dest: &dyn UpdatableImageRepository,
        customizer: &dyn ImageCustomizer,
        tracker: &Arc<TaskStepTracker>,
        cancel: &CancelFlag,
    ) -> Result<(ImageInfo, String)> {
        self.decompress_source(tracker, cancel)?;
        tracker.complete_step();

        tracker.set_message("Customizing image");
        let output = customizer.customize(&CustomizeRequest {
            staging_dir: self.staging.path(),
            image_file: &self.image_path,
            resources: &self.resources,
            options: &self.options,
            cancel,
        })?;
        tracker.complete_step();
        if cancel.is_cancelled() {
            return Err(NimError::Cancelled);
        }

        tracker.set_message("Compressing customized image");
        let length = std::fs::metadata(&self.image_path)?.len();
        tracing::info!(
            task_id = %self.task_id,
            image = %self.output_id,
            bytes = length,
            "Compressing customized image"
        );
        let info = ImageInfo {
            uncompressed_length: length,
            ..ImageInfo::new(self.output_id.clone())
        };
        let staged = StagedImageData {
            path: self.image_path.clone(),
            cancel: cancel.clone(),
        };
        let image = Image::new(info, format!("{}.img", self.output_id), Arc::new(staged));
        let saved = dest.save(&image, tracker.clone())?;
        Ok((saved.into_info(), output))
    }

    /// Decompress the base image to `image_path`, checking its digest.
    fn decompress_source(&self, tracker: &Arc<TaskStepTracker>, cancel: &CancelFlag) -> Result<()> {
        tracker.set_message("Uncompressing source image");
        let info = self.source.info();
        tracing::info!(
            task_id = %self.task_id,
            source = %self.source.data().describe(),
            dest = %self.image_path.display(),
            "Decompressing source image"
        );

        let mut reader = DigestReader::new(CancellableReader::new(cancel.clone(), self.source.open()?));
        let file = File::create(&self.image_path).map_err(|e| {
            NimError::storage(format!("Error creating {}", self.image_path.display()), e)
        })?;
        let mut writer = ProgressWriter::new(info.uncompressed_length, tracker.clone(), BufWriter::new(file));
        io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
        drop(writer);

        let (_, digest) = reader.finish();
        match &info.uncompressed_sha256 {
            Some(expected) if digest.matches(expected) => {
                tracing::debug!(id = %info.id, sha256 = %digest.sha256, bytes = digest.length, "Verified source image");
                Ok(())
            }
            expected => Err(NimError::Integrity {
                id: info.id.clone(),
                expected: expected.clone().unwrap_or_else(|| "(none)".to_string()),
                actual: digest.sha256,
            }),
        }
    }
}

fn check_resource_name(name: &str, image_name: &str) -> Result<()> {
    if name == "." || name == ".." || name.contains(['/', '\\']) || name == image_name {
        return Err(NimError::InvalidArgument(format!(
            "invalid resource name '{}'",
            name
        )));
    }
    Ok(())
}

/// The customized image in the staging directory; reads stop on cancel.
struct StagedImageData {
    path: PathBuf,
    cancel: CancelFlag,
}

impl ImageData for StagedImageData {
    fn open(&self) -> Result<Box<dyn Read + Send>> {
        let file = File::open(&self.path)?;
        Ok(Box::new(CancellableReader::new(
            self.cancel.clone(),
            BufReader::new(file),
        )))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
