//! TOML configuration for the `nim` binary.
//!
//! ```toml
//! [service]
//! staging_dir = "/var/tmp/nim"
//! workers = 2
//!
//! [customizer]
//! bin = "guestfish"
//!
//! [repo.source]
//! kind = "filesystem"
//! path = "/srv/images/base"
//!
//! [repo.dest]
//! kind = "s3"
//! bucket = "node-images"
//! object_key_prefix = "prod/"
//! cache_dir = "/var/cache/nim"
//!
//! [auth]
//! base_url = "https://data.solarnetwork.net"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::HttpAuthorizer;
use crate::cache::StreamCache;
use crate::compression::CompressionType;
use crate::customizer::GuestfishCustomizer;
use crate::object_store::{AwsCredentials, S3Client, S3Settings};
use crate::repository::{
    CompressionSettings, FsImageRepository, S3ImageRepository, S3RepositorySettings,
    UpdatableImageRepository,
};
use crate::service::{ImageService, ServiceSettings};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub customizer: CustomizerConfig,
    pub repo: RepoConfig,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_receipt_max_age_secs")]
    pub receipt_max_age_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            workers: default_workers(),
            receipt_max_age_secs: default_receipt_max_age_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_staging_dir() -> PathBuf {
    std::env::temp_dir()
}
fn default_workers() -> usize {
    1
}
fn default_receipt_max_age_secs() -> u64 {
    43_200
}
fn default_sweep_interval_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct CustomizerConfig {
    #[serde(default = "default_customizer_bin")]
    pub bin: PathBuf,
}

impl Default for CustomizerConfig {
    fn default() -> Self {
        Self {
            bin: default_customizer_bin(),
        }
    }
}

fn default_customizer_bin() -> PathBuf {
    PathBuf::from("guestfish")
}

#[derive(Debug, Deserialize, Clone)]
pub struct RepoConfig {
    pub source: RepositoryConfig,
    pub dest: RepositoryConfig,
}

/// One image repository, tagged by `kind`.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RepositoryConfig {
    Filesystem(FilesystemRepoConfig),
    S3(S3RepoConfig),
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemRepoConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub compression_type: CompressionType,
    #[serde(default = "default_compression_ratio")]
    pub compression_ratio: f32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3RepoConfig {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub object_key_prefix: String,
    /// Custom endpoint (MinIO, LocalStack); uses path-style addressing.
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default = "default_staging_dir")]
    pub work_dir: PathBuf,
    /// Enables the stream cache for data reads.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,
    #[serde(default = "default_download_expiration_secs")]
    pub download_expiration_secs: u64,
    #[serde(default)]
    pub compression_type: CompressionType,
    #[serde(default = "default_compression_ratio")]
    pub compression_ratio: f32,
}

fn default_region() -> String {
    "us-west-2".to_string()
}
fn default_max_keys() -> usize {
    500
}
fn default_download_expiration_secs() -> u64 {
    3600
}
fn default_compression_ratio() -> f32 {
    1.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    #[serde(default = "default_auth_base_url")]
    pub base_url: String,
    #[serde(default = "default_validate_path")]
    pub validate_path: String,
}

fn default_auth_base_url() -> String {
    "https://data.solarnetwork.net".to_string()
}
fn default_validate_path() -> String {
    "/solaruser/api/v1/sec/whoami".to_string()
}

impl RepositoryConfig {
    fn compression(&self) -> CompressionSettings {
        let (kind, ratio) = match self {
            RepositoryConfig::Filesystem(c) => (c.compression_type, c.compression_ratio),
            RepositoryConfig::S3(c) => (c.compression_type, c.compression_ratio),
        };
        CompressionSettings { kind, ratio }
    }

    fn validate(&self, name: &str) -> Result<()> {
        let ratio = self.compression().ratio;
        if !(0.0..=1.0).contains(&ratio) {
            anyhow::bail!("repo.{}.compression_ratio must be in [0.0, 1.0]", name);
        }
        if let RepositoryConfig::S3(c) = self {
            if c.bucket.trim().is_empty() {
                anyhow::bail!("repo.{}.bucket must not be empty", name);
            }
            if c.max_keys == 0 {
                anyhow::bail!("repo.{}.max_keys must be > 0", name);
            }
            if c.access_key.is_some() != c.secret_key.is_some() {
                anyhow::bail!(
                    "repo.{}: access_key and secret_key must be given together",
                    name
                );
            }
        }
        Ok(())
    }

    /// Construct the configured repository.
    pub fn build(&self) -> Result<Arc<dyn UpdatableImageRepository>> {
        let compression = self.compression();
        match self {
            RepositoryConfig::Filesystem(c) => {
                let repo = FsImageRepository::new(&c.path, compression).with_context(|| {
                    format!("Failed to open image directory {}", c.path.display())
                })?;
                Ok(Arc::new(repo))
            }
            RepositoryConfig::S3(c) => {
                let credentials = match (&c.access_key, &c.secret_key) {
                    (Some(access_key), Some(secret_key)) => AwsCredentials {
                        access_key_id: access_key.clone(),
                        secret_access_key: secret_key.clone(),
                        session_token: None,
                    },
                    _ => AwsCredentials::from_env()
                        .context("S3 repository requires access_key/secret_key or AWS_* env vars")?,
                };
                let client = S3Client::new(S3Settings {
                    bucket: c.bucket.clone(),
                    region: c.region.clone(),
                    endpoint_url: c.endpoint_url.clone(),
                    credentials,
                })?;
                let mut repo = S3ImageRepository::new(
                    Arc::new(client),
                    S3RepositorySettings {
                        object_key_prefix: c.object_key_prefix.clone(),
                        work_dir: c.work_dir.clone(),
                        max_keys: c.max_keys,
                        download_expiration: Duration::from_secs(c.download_expiration_secs),
                        compression,
                    },
                )?;
                if let Some(cache_dir) = &c.cache_dir {
                    let cache = StreamCache::new(cache_dir).with_context(|| {
                        format!("Failed to open cache directory {}", cache_dir.display())
                    })?;
                    repo = repo.with_cache(Arc::new(cache));
                }
                Ok(Arc::new(repo))
            }
        }
    }
}

impl Config {
    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            staging_dir: self.service.staging_dir.clone(),
            workers: self.service.workers,
            receipt_max_age: Duration::from_secs(self.service.receipt_max_age_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.service.sweep_interval_secs)
    }

    /// Construct the service. Must run inside a Tokio runtime.
    pub fn build_service(&self) -> Result<ImageService> {
        let source = self.repo.source.build().context("Failed to build source repository")?;
        let dest = self.repo.dest.build().context("Failed to build destination repository")?;
        let customizer = Arc::new(GuestfishCustomizer::new(&self.customizer.bin));
        let mut service = ImageService::new(self.service_settings(), source, dest, customizer)?;
        if let Some(auth) = &self.auth {
            let authorizer = HttpAuthorizer::new(&auth.base_url, &auth.validate_path)?;
            service = service.with_authorizer(Arc::new(authorizer));
        }
        Ok(service)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.service.workers == 0 {
        anyhow::bail!("service.workers must be >= 1");
    }
    if config.service.sweep_interval_secs == 0 {
        anyhow::bail!("service.sweep_interval_secs must be > 0");
    }

    config.repo.source.validate("source")?;
    config.repo.dest.validate("dest")?;

    if let Some(auth) = &config.auth {
        if !auth.validate_path.starts_with('/') {
            anyhow::bail!("auth.validate_path must start with '/'");
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(tmp: &TempDir, content: &str) -> PathBuf {
        let path = tmp.path().join("nim.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(
            &tmp,
            r#"
[repo.source]
kind = "filesystem"
path = "/srv/base"

[repo.dest]
kind = "s3"
bucket = "node-images"
"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.service.workers, 1);
        assert_eq!(config.service.receipt_max_age_secs, 43_200);
        assert_eq!(config.customizer.bin, PathBuf::from("guestfish"));
        assert!(config.auth.is_none());
        match &config.repo.dest {
            RepositoryConfig::S3(s3) => {
                assert_eq!(s3.region, "us-west-2");
                assert_eq!(s3.max_keys, 500);
                assert_eq!(s3.download_expiration_secs, 3600);
                assert_eq!(s3.compression_type, CompressionType::Xz);
                assert_eq!(s3.compression_ratio, 1.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_auth_section_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(
            &tmp,
            r#"
[auth]

[repo.source]
kind = "filesystem"
path = "/a"

[repo.dest]
kind = "filesystem"
path = "/b"
compression_type = "zstd"
"#,
        );
        let config = load_config(&path).unwrap();
        let auth = config.auth.unwrap();
        assert_eq!(auth.base_url, "https://data.solarnetwork.net");
        assert_eq!(auth.validate_path, "/solaruser/api/v1/sec/whoami");
        assert_eq!(config.repo.dest.compression().kind, CompressionType::Zstd);
    }

    #[test]
    fn test_ratio_out_of_range_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(
            &tmp,
            r#"
[repo.source]
kind = "filesystem"
path = "/a"

[repo.dest]
kind = "filesystem"
path = "/b"
compression_ratio = 1.5
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("compression_ratio"));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(
            &tmp,
            r#"
[service]
workers = 0

[repo.source]
kind = "filesystem"
path = "/a"

[repo.dest]
kind = "filesystem"
path = "/b"
"#,
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(
            &tmp,
            r#"
[repo.source]
kind = "ftp"
path = "/a"

[repo.dest]
kind = "filesystem"
path = "/b"
"#,
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_build_filesystem_repository() {
        let tmp = TempDir::new().unwrap();
        let config = RepositoryConfig::Filesystem(FilesystemRepoConfig {
            path: tmp.path().join("images"),
            compression_type: CompressionType::Gz,
            compression_ratio: 0.5,
        });
        let repo = config.build().unwrap();
        assert!(repo.find_all().unwrap().is_empty());
        assert_eq!(repo.save_task_step_count(), 1);
    }

    #[test]
    fn test_example_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/nim.example.toml");
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.service.workers, 2);
        assert!(cfg.auth.is_none());
        match &cfg.repo.dest {
            RepositoryConfig::S3(s3) => {
                assert_eq!(s3.bucket, "node-images");
                assert_eq!(s3.object_key_prefix, "custom/");
                assert!(s3.cache_dir.is_some());
            }
            other => panic!("unexpected dest repository: {:?}", other),
        }
    }
}
