//! The image customization service.
//!
//! [`ImageService`] stages each request on the caller's thread, registers a
//! [`Receipt`], and runs the [`CustomizationJob`] on a blocking worker thread
//! once one of `workers` permits is free. Receipts are looked up by a task
//! id derived from the receipt id and the caller's session key, and are
//! dropped by [`ImageService::clean_expired_receipts`] once older than the
//! configured max age.
//!
//! Repository, authorizer, and customizer calls block. Call the service from
//! a blocking context (a plain thread or `spawn_blocking`) inside a Tokio
//! runtime.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::{Authorizer, SessionCache};
use crate::customizer::ImageCustomizer;
use crate::error::{NimError, Result};
use crate::models::{Image, ImageOptions, ImageResource};
use crate::pipeline::{task_step_count, CustomizationJob};
use crate::receipt::{Receipt, ReceiptStatus, TaskState};
use crate::repository::{ImageRepository, UpdatableImageRepository};
use crate::streams::sha256_hex;
use crate::tracker::TaskStepTracker;

/// Tunables for [`ImageService`].
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Parent of the per-task staging directories.
    pub staging_dir: PathBuf,
    /// Concurrent customization tasks.
    pub workers: usize,
    /// Receipt lifetime; also the session TTL.
    pub receipt_max_age: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            staging_dir: std::env::temp_dir(),
            workers: 1,
            receipt_max_age: Duration::from_secs(12 * 60 * 60),
        }
    }
}

/// Derive the registry id for a receipt id and session key.
pub fn task_id(receipt_id: &str, key: &str) -> String {
    sha256_hex(format!("{}{}", receipt_id, key).as_bytes())
}

pub struct ImageService {
    source: Arc<dyn ImageRepository>,
    dest: Arc<dyn UpdatableImageRepository>,
    customizer: Arc<dyn ImageCustomizer>,
    authorizer: Option<Arc<dyn Authorizer>>,
    sessions: SessionCache,
    receipts: RwLock<HashMap<String, Arc<Receipt>>>,
    workers: Arc<Semaphore>,
    runtime: Handle,
    settings: ServiceSettings,
}

impl ImageService {
    /// Must be called within a Tokio runtime; tasks are spawned onto it.
    pub fn new(
        settings: ServiceSettings,
        source: Arc<dyn ImageRepository>,
        dest: Arc<dyn UpdatableImageRepository>,
        customizer: Arc<dyn ImageCustomizer>,
    ) -> Result<Self> {
        if settings.workers == 0 {
            return Err(NimError::InvalidArgument(
                "workers must be at least 1".to_string(),
            ));
        }
        let runtime = Handle::try_current().map_err(|e| {
            NimError::InvalidArgument(format!("ImageService requires a Tokio runtime: {}", e))
        })?;
        Ok(Self {
            source,
            dest,
            customizer,
            authorizer: None,
            sessions: SessionCache::new(settings.receipt_max_age),
            receipts: RwLock::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(settings.workers)),
            runtime,
            settings,
        })
    }

    /// Require session keys issued by [`authorize`](Self::authorize).
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn source(&self) -> &Arc<dyn ImageRepository> {
        &self.source
    }

    pub fn dest(&self) -> &Arc<dyn UpdatableImageRepository> {
        &self.dest
    }

    // ============ Authorization ============

    /// Exchange a signed authorization for a new session key.
    ///
    /// Without an authorizer the key is returned unrecorded.
    pub fn authorize(&self, authorization: &str, date: DateTime<Utc>) -> Result<String> {
        let key = sha256_hex(Uuid::new_v4().to_string().as_bytes());
        let Some(authorizer) = &self.authorizer else {
            return Ok(key);
        };
        let identity = authorizer.authorize(authorization, date)?;
        let expires = self.sessions.insert(&key);
        tracing::info!(identity = ?identity, %expires, "Issued session key");
        Ok(key)
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }

    fn check_key(&self, key: &str) -> Result<()> {
        let authorized = match &self.authorizer {
            Some(_) => self.sessions.is_valid(key),
            None => !key.is_empty(),
        };
        if authorized {
            Ok(())
        } else {
            Err(NimError::Authorization("Key is not authorized".to_string()))
        }
    }

    // ============ Tasks ============

    /// Stage a customization of `base_image_id` and queue it.
    ///
    /// Resources are copied before this returns. An unknown base image is
    /// [`NimError::NotFound`].
    pub fn create_image(
        &self,
        key: &str,
        base_image_id: &str,
        resources: &[ImageResource],
        options: ImageOptions,
    ) -> Result<Arc<Receipt>> {
        self.check_key(key)?;
        let source = self
            .source
            .find_one(base_image_id)?
            .ok_or_else(|| NimError::NotFound(format!("image {}", base_image_id)))?;

        let receipt_id = Uuid::new_v4().to_string();
        let task_id = task_id(&receipt_id, key);
        let job = CustomizationJob::stage(
            task_id.clone(),
            &self.settings.staging_dir,
            source,
            resources,
            options,
        )?;
        let tracker = Arc::new(TaskStepTracker::new(task_step_count(self.dest.as_ref()))?);
        let receipt = Arc::new(Receipt::new(receipt_id, task_id.clone(), base_image_id, tracker));
        tracing::info!(
            %task_id,
            base = base_image_id,
            output = job.output_id(),
            staging = %job.staging_dir().display(),
            "Queued image customization"
        );

        self.receipts.write().insert(task_id, receipt.clone());

        let handle = self.runtime.spawn(run_task(
            self.workers.clone(),
            receipt.clone(),
            job,
            self.dest.clone(),
            self.customizer.clone(),
        ));
        receipt.set_abort_handle(handle.abort_handle());
        Ok(receipt)
    }

    /// Look up a receipt. Unknown ids are `Ok(None)`.
    pub fn get_receipt(&self, key: &str, receipt_id: &str) -> Result<Option<Arc<Receipt>>> {
        if self.authorizer.is_some() {
            self.check_key(key)?;
        }
        Ok(self.receipts.read().get(&task_id(receipt_id, key)).cloned())
    }

    /// The published image as stored (compressed), once succeeded.
    pub fn result_image(&self, receipt: &Receipt) -> Result<Option<Image>> {
        match receipt.image_info() {
            Some(info) => self.dest.find_one_compressed(&info.id),
            None => Ok(None),
        }
    }

    /// Direct download link for a succeeded task, when the repository has one.
    pub fn download_url(&self, receipt: &Receipt) -> Result<Option<String>> {
        if !receipt.is_done() || receipt.is_cancelled() || receipt.percent_complete() < 1.0 {
            return Ok(None);
        }
        match receipt.image_info() {
            Some(info) => self.dest.download_url(&info),
            None => Ok(None),
        }
    }

    /// [`Receipt::status`] with the download link filled in.
    pub fn receipt_status(&self, receipt: &Receipt) -> Result<ReceiptStatus> {
        let mut status = receipt.status();
        status.download_url = self.download_url(receipt)?;
        Ok(status)
    }

    /// Snapshot of every registered receipt, oldest first.
    pub fn receipt_statuses(&self) -> Vec<ReceiptStatus> {
        let mut statuses: Vec<ReceiptStatus> =
            self.receipts.read().values().map(|r| r.status()).collect();
        statuses.sort_by_key(|s| s.created_at);
        statuses
    }

    // ============ Expiry ============

    /// Drop receipts older than the max age, cancelling unfinished tasks and
    /// deleting published results. Also purges expired sessions. Returns the
    /// number of receipts removed.
    pub fn clean_expired_receipts(&self) -> usize {
        let max_age = chrono::Duration::from_std(self.settings.receipt_max_age)
            .unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let expired: Vec<Arc<Receipt>> = {
            let mut receipts = self.receipts.write();
            let ids: Vec<String> = receipts
                .iter()
                .filter(|(_, r)| {
                    r.created_at()
                        .checked_add_signed(max_age)
                        .map(|expires| expires <= now)
                        .unwrap_or(false)
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| receipts.remove(id)).collect()
        };

        for receipt in &expired {
            if !receipt.is_done() {
                receipt.cancel();
            }
            if let Some(info) = receipt.image_info() {
                if let Err(e) = self.dest.delete(&info.id) {
                    tracing::warn!(image = %info.id, error = %e, "Error deleting expired task image");
                }
            }
            tracing::info!(
                task_id = receipt.task_id(),
                created = %receipt.created_at(),
                "Removed expired receipt"
            );
        }

        let sessions = self.sessions.purge_expired();
        if sessions > 0 {
            tracing::info!(count = sessions, "Purged expired sessions");
        }
        expired.len()
    }

    /// Run [`clean_expired_receipts`](Self::clean_expired_receipts) every
    /// `interval` until the service is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let service: Weak<Self> = Arc::downgrade(self);
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let service = service.clone();
                let swept = tokio::task::spawn_blocking(move || {
                    service.upgrade().map(|s| s.clean_expired_receipts())
                })
                .await;
                match swept {
                    Ok(Some(removed)) => {
                        tracing::debug!(removed, "Receipt sweep finished");
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "Receipt sweep panicked");
                    }
                }
            }
        })
    }
}

async fn run_task(
    workers: Arc<Semaphore>,
    receipt: Arc<Receipt>,
    job: CustomizationJob,
    dest: Arc<dyn UpdatableImageRepository>,
    customizer: Arc<dyn ImageCustomizer>,
) {
    let Ok(_permit) = workers.acquire_owned().await else {
        return;
    };
    if !receipt.mark_running() {
        return;
    }
    let tracker = receipt.tracker().clone();
    let cancel = receipt.cancel_flag().clone();
    let repo = dest.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        job.run(repo.as_ref(), customizer.as_ref(), tracker, &cancel)
    })
    .await;
    let state = outcome.unwrap_or_else(|e| {
        tracing::error!(task_id = receipt.task_id(), error = %e, "Task worker panicked");
        receipt.tracker().complete();
        TaskState::Failed(format!("StorageError: task worker failed: {}", e))
    });
    if let Some(orphan) = receipt.finish(state) {
        let id = orphan.id.clone();
        let deleted = tokio::task::spawn_blocking(move || dest.delete(&orphan.id))
            .await
            .map_err(|e| NimError::Storage(format!("cleanup worker failed: {}", e)))
            .and_then(|r| r);
        if let Err(e) = deleted {
            tracing::warn!(task_id = receipt.task_id(), image = %id, error = %e, "Error deleting image of cancelled task");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::customizer::CustomizeRequest;
    use crate::repository::{CompressionSettings, FsImageRepository};
    use tempfile::TempDir;

    struct NoopCustomizer;

    impl ImageCustomizer for NoopCustomizer {
        fn customize(&self, _request: &CustomizeRequest<'_>) -> Result<String> {
            Ok(String::new())
        }
    }

    struct RejectingAuthorizer;

    impl Authorizer for RejectingAuthorizer {
        fn authorize(&self, _authorization: &str, _date: DateTime<Utc>) -> Result<crate::auth::Identity> {
            Err(NimError::Authorization("Authentication failure".to_string()))
        }
    }

    fn service(tmp: &TempDir) -> ImageService {
        let repo = Arc::new(
            FsImageRepository::new(&tmp.path().join("images"), CompressionSettings::default())
                .unwrap(),
        );
        ImageService::new(
            ServiceSettings {
                staging_dir: tmp.path().join("staging"),
                ..Default::default()
            },
            repo.clone(),
            repo,
            Arc::new(NoopCustomizer),
        )
        .unwrap()
    }

    #[test]
    fn test_task_id_depends_on_key() {
        assert_eq!(task_id("r", "k"), sha256_hex(b"rk"));
        assert_ne!(task_id("r", "k1"), task_id("r", "k2"));
    }

    #[test]
    fn test_new_requires_runtime() {
        let tmp = TempDir::new().unwrap();
        let repo = Arc::new(
            FsImageRepository::new(tmp.path(), CompressionSettings::default()).unwrap(),
        );
        let err = ImageService::new(ServiceSettings::default(), repo.clone(), repo, Arc::new(NoopCustomizer))
            .err()
            .unwrap();
        assert!(matches!(err, NimError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_authorize_without_authorizer_is_unrecorded() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        let key = svc.authorize("anything", Utc::now()).unwrap();
        assert_eq!(key.len(), 64);
        assert_eq!(svc.active_session_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_authorization_records_nothing() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp).with_authorizer(Arc::new(RejectingAuthorizer));
        let err = svc.authorize("SNWS2 bad", Utc::now()).unwrap_err();
        assert!(matches!(err, NimError::Authorization(_)));
        assert_eq!(svc.active_session_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_base_image_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        let err = svc
            .create_image("key", "missing", &[], ImageOptions::default())
            .unwrap_err();
        assert!(matches!(err, NimError::NotFound(_)));
        assert!(svc.receipt_statuses().is_empty());
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        let err = svc
            .create_image("", "base", &[], ImageOptions::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "Key is not authorized");
    }

    #[tokio::test]
    async fn test_unknown_receipt_is_none() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        assert!(svc.get_receipt("key", "nope").unwrap().is_none());
    }
}
