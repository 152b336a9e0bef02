use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use node_image_maker::auth::{Authorizer, Identity};
use node_image_maker::customizer::{CustomizeRequest, ImageCustomizer};
use node_image_maker::models::{BytesData, Image, ImageInfo, ImageOptions, ImageResource};
use node_image_maker::receipt::{Receipt, TaskState};
use node_image_maker::repository::{
    CompressionSettings, FsImageRepository, ImageRepository, UpdatableImageRepository,
};
use node_image_maker::service::{ImageService, ServiceSettings};
use node_image_maker::streams::sha256_hex;
use node_image_maker::tracker::TaskStepTracker;
use node_image_maker::{NimError, Result};
use tempfile::TempDir;

const BASE: &[u8] = b"solarnode base image contents";

/// Appends the `NODE_NAME` environment value to the image.
struct StampCustomizer;

impl ImageCustomizer for StampCustomizer {
    fn customize(&self, request: &CustomizeRequest<'_>) -> Result<String> {
        let name = request
            .options
            .environment
            .get("NODE_NAME")
            .cloned()
            .unwrap_or_default();
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(request.image_file)?;
        file.write_all(format!("\nhostname={}", name).as_bytes())?;
        Ok(format!("stamped {}", name))
    }
}

/// Blocks until cancelled.
struct StallingCustomizer;

impl ImageCustomizer for StallingCustomizer {
    fn customize(&self, request: &CustomizeRequest<'_>) -> Result<String> {
        let deadline = Instant::now() + Duration::from_secs(20);
        while Instant::now() < deadline {
            if request.cancel.is_cancelled() {
                return Err(NimError::Cancelled);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok("never cancelled".to_string())
    }
}

struct AcceptingAuthorizer;

impl Authorizer for AcceptingAuthorizer {
    fn authorize(&self, _authorization: &str, _date: DateTime<Utc>) -> Result<Identity> {
        let mut identity = Identity::new();
        identity.insert("userId".to_string(), 7.into());
        Ok(identity)
    }
}

struct Harness {
    tmp: TempDir,
    source: Arc<FsImageRepository>,
    dest: Arc<FsImageRepository>,
}

impl Harness {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let source = Arc::new(
            FsImageRepository::new(&tmp.path().join("source"), CompressionSettings::default())
                .unwrap(),
        );
        let dest = Arc::new(
            FsImageRepository::new(&tmp.path().join("dest"), CompressionSettings::default())
                .unwrap(),
        );
        let info = ImageInfo {
            uncompressed_length: BASE.len() as u64,
            ..ImageInfo::new("base")
        };
        source
            .save(
                &Image::new(info, "base.img", Arc::new(BytesData(Arc::new(BASE.to_vec())))),
                Arc::new(TaskStepTracker::new(1).unwrap()),
            )
            .unwrap();
        Self { tmp, source, dest }
    }

    fn settings(&self, workers: usize, max_age: Duration) -> ServiceSettings {
        ServiceSettings {
            staging_dir: self.tmp.path().join("staging"),
            workers,
            receipt_max_age: max_age,
        }
    }

    fn service_with(&self, customizer: Arc<dyn ImageCustomizer>, settings: ServiceSettings) -> ImageService {
        ImageService::new(settings, self.source.clone(), self.dest.clone(), customizer).unwrap()
    }

    fn service(&self) -> ImageService {
        self.service_with(Arc::new(StampCustomizer), self.settings(1, Duration::from_secs(3600)))
    }

    fn staging_entries(&self) -> usize {
        std::fs::read_dir(self.tmp.path().join("staging"))
            .map(|d| d.count())
            .unwrap_or(0)
    }
}

fn script() -> Vec<ImageResource> {
    vec![ImageResource::from_bytes("setup.fish", "write /etc/hostname solar\n")]
}

fn options(node: &str) -> ImageOptions {
    let mut options = ImageOptions::default();
    options
        .environment
        .insert("NODE_NAME".to_string(), node.to_string());
    options
}

async fn wait(receipt: &Receipt) -> TaskState {
    tokio::time::timeout(Duration::from_secs(30), receipt.wait())
        .await
        .expect("task did not finish in time")
}

#[tokio::test]
async fn test_create_image_publishes_result() {
    let h = Harness::new();
    let svc = h.service();

    let receipt = svc
        .create_image("key-1", "base", &script(), options("solar-1"))
        .unwrap();
    assert_eq!(receipt.base_image_id(), "base");

    let state = wait(&receipt).await;
    let TaskState::Succeeded { image, output } = state else {
        panic!("unexpected state {:?}", state);
    };
    assert_eq!(output, "stamped solar-1");
    assert_eq!(receipt.percent_complete(), 1.0);
    assert_eq!(receipt.message().as_deref(), Some("Done"));
    assert!(receipt.started_at().is_some());
    assert!(receipt.completed_at().is_some());

    let expected = [BASE, b"\nhostname=solar-1"].concat();
    assert_eq!(image.uncompressed_sha256, Some(sha256_hex(&expected)));

    let mut out = Vec::new();
    h.dest
        .find_one(&image.id)
        .unwrap()
        .unwrap()
        .open()
        .unwrap()
        .read_to_end(&mut out)
        .unwrap();
    assert_eq!(out, expected);

    let result = svc.result_image(&receipt).unwrap().unwrap();
    assert_eq!(result.filename(), format!("{}.img.xz", image.id));
    assert!(svc.download_url(&receipt).unwrap().is_none());

    let status = svc.receipt_status(&receipt).unwrap();
    assert!(status.done);
    assert!(!status.cancelled);
    assert_eq!(status.state, "succeeded");

    assert_eq!(h.staging_entries(), 0);
}

#[tokio::test]
async fn test_receipt_lookup_requires_matching_key() {
    let h = Harness::new();
    let svc = h.service();
    let receipt = svc
        .create_image("key-1", "base", &script(), options("a"))
        .unwrap();

    let found = svc.get_receipt("key-1", receipt.id()).unwrap().unwrap();
    assert!(Arc::ptr_eq(&found, &receipt));
    assert!(svc.get_receipt("key-2", receipt.id()).unwrap().is_none());
    assert!(svc.get_receipt("key-1", "unknown").unwrap().is_none());
    wait(&receipt).await;
}

#[tokio::test]
async fn test_integrity_failure_leaves_no_output() {
    let h = Harness::new();
    let meta_path = h.tmp.path().join("source").join("base.json");
    let mut info = ImageInfo::from_json(&std::fs::read(&meta_path).unwrap()).unwrap();
    info.uncompressed_sha256 = Some(sha256_hex(b"something else"));
    std::fs::write(&meta_path, info.to_json().unwrap()).unwrap();

    let svc = h.service();
    let receipt = svc
        .create_image("key", "base", &script(), options("x"))
        .unwrap();
    let state = wait(&receipt).await;
    let TaskState::Failed(message) = state else {
        panic!("unexpected state {:?}", state);
    };
    assert!(message.starts_with("IntegrityError: "), "{}", message);
    assert!(receipt.is_done());
    assert!(svc.result_image(&receipt).unwrap().is_none());
    assert!(h.dest.find_all().unwrap().is_empty());
    assert_eq!(h.staging_entries(), 0);
}

#[tokio::test]
async fn test_authorizer_gates_create_and_lookup() {
    let h = Harness::new();
    let svc = h.service().with_authorizer(Arc::new(AcceptingAuthorizer));

    let err = svc
        .create_image("unissued", "base", &script(), options("x"))
        .unwrap_err();
    assert!(matches!(err, NimError::Authorization(_)));
    assert!(matches!(
        svc.get_receipt("unissued", "any"),
        Err(NimError::Authorization(_))
    ));

    let key = svc.authorize("SNWS2 Credential=abc,SignedHeaders=x-sn-date,Signature=00", Utc::now()).unwrap();
    assert_eq!(svc.active_session_count(), 1);
    let receipt = svc
        .create_image(&key, "base", &script(), options("x"))
        .unwrap();
    assert!(svc.get_receipt(&key, receipt.id()).unwrap().is_some());
    assert!(matches!(wait(&receipt).await, TaskState::Succeeded { .. }));
}

#[tokio::test]
async fn test_clean_expired_removes_and_deletes_output() {
    let h = Harness::new();
    let svc = h.service_with(Arc::new(StampCustomizer), h.settings(1, Duration::ZERO));
    let receipt = svc
        .create_image("key", "base", &script(), options("x"))
        .unwrap();
    let TaskState::Succeeded { image, .. } = wait(&receipt).await else {
        panic!("task failed");
    };
    assert!(h.dest.find_one(&image.id).unwrap().is_some());

    assert_eq!(svc.clean_expired_receipts(), 1);
    assert!(svc.get_receipt("key", receipt.id()).unwrap().is_none());
    assert!(h.dest.find_one(&image.id).unwrap().is_none());
    assert!(svc.receipt_statuses().is_empty());
}

#[tokio::test]
async fn test_clean_expired_cancels_unfinished_tasks() {
    let h = Harness::new();
    let svc = h.service_with(Arc::new(StallingCustomizer), h.settings(1, Duration::ZERO));
    let running = svc
        .create_image("key", "base", &script(), options("a"))
        .unwrap();
    let queued = svc
        .create_image("key", "base", &script(), options("b"))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while !running.is_started() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(running.is_started());
    assert_eq!(queued.state(), TaskState::Pending);

    assert_eq!(svc.clean_expired_receipts(), 2);
    assert_eq!(wait(&queued).await, TaskState::Cancelled);
    assert_eq!(wait(&running).await, TaskState::Cancelled);
    assert!(!queued.is_started());
    assert!(h.dest.find_all().unwrap().is_empty());
}

#[tokio::test]
async fn test_sweeper_runs_periodically() {
    let h = Harness::new();
    let svc = Arc::new(h.service_with(Arc::new(StampCustomizer), h.settings(2, Duration::ZERO)));
    let sweeper = svc.spawn_sweeper(Duration::from_millis(50));

    let receipt = svc
        .create_image("key", "base", &script(), options("x"))
        .unwrap();
    wait(&receipt).await;

    let deadline = Instant::now() + Duration::from_secs(10);
    while !svc.receipt_statuses().is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(svc.receipt_statuses().is_empty());
    assert!(h.dest.find_all().unwrap().is_empty());
    sweeper.abort();
}

#[tokio::test]
async fn test_unknown_base_image_is_rejected_synchronously() {
    let h = Harness::new();
    let svc = h.service();
    let err = svc
        .create_image("key", "no-such-image", &script(), options("x"))
        .unwrap_err();
    assert!(matches!(err, NimError::NotFound(_)));
    assert_eq!(h.staging_entries(), 0);
}

#[cfg(unix)]
mod guestfish {
    use super::*;
    use node_image_maker::customizer::GuestfishCustomizer;
    use std::os::unix::fs::PermissionsExt;

    #[tokio::test]
    async fn test_tool_failure_reported_as_external_tool_error() {
        let h = Harness::new();
        let tool = h.tmp.path().join("fake-guestfish");
        std::fs::write(
            &tool,
            "#!/bin/sh\necho 'libguestfs: error: no operating system was found' >&2\nexit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let svc = h.service_with(
            Arc::new(GuestfishCustomizer::new(&tool)),
            h.settings(1, Duration::from_secs(3600)),
        );
        let receipt = svc
            .create_image("key", "base", &script(), ImageOptions::default())
            .unwrap();
        let state = wait(&receipt).await;
        let TaskState::Failed(message) = state else {
            panic!("unexpected state {:?}", state);
        };
        assert!(message.starts_with("ExternalToolError: "), "{}", message);
        assert!(message.contains("no operating system was found"));
        assert!(h.dest.find_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_script_fails_task() {
        let h = Harness::new();
        let svc = h.service_with(
            Arc::new(GuestfishCustomizer::new("/bin/true")),
            h.settings(1, Duration::from_secs(3600)),
        );
        let resources = vec![ImageResource::from_bytes("evil.fish", "ls /\n!ls /\n")];
        let receipt = svc
            .create_image("key", "base", &resources, ImageOptions::default())
            .unwrap();
        let TaskState::Failed(message) = wait(&receipt).await else {
            panic!("expected failure");
        };
        assert_eq!(
            message,
            "ExternalToolError: evil.fish line 2: Local commands are not supported: !ls /"
        );
    }
}
