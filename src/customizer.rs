//! External customization tool invocation.
//!
//! The default [`GuestfishCustomizer`] runs
//!
//! ```text
//! guestfish [-v -x] --rw [--format=<fmt>] -a <image> -i  < <script>.fish
//! ```
//!
//! in the task's staging directory, with `options.environment` added to the
//! process environment. The first staged resource ending in `.fish` is the
//! script; it is checked by a [`ScriptValidator`] before launch.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::{NimError, Result};
use crate::models::ImageOptions;
use crate::sanitizer::{GuestfishScriptSanitizer, ScriptValidator};
use crate::streams::CancelFlag;

/// File extension identifying the script resource.
pub const SCRIPT_EXTENSION: &str = ".fish";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Everything the tool needs for one run.
#[derive(Debug)]
pub struct CustomizeRequest<'a> {
    /// Working directory holding the image and resources.
    pub staging_dir: &'a Path,
    /// Decompressed image file inside `staging_dir`.
    pub image_file: &'a Path,
    /// Staged resource files.
    pub resources: &'a [PathBuf],
    pub options: &'a ImageOptions,
    pub cancel: &'a CancelFlag,
}

/// Mutates a staged disk image in place.
pub trait ImageCustomizer: Send + Sync {
    /// Run the customization and return its captured output.
    fn customize(&self, request: &CustomizeRequest<'_>) -> Result<String>;
}

/// Runs `guestfish` as a subprocess.
pub struct GuestfishCustomizer {
    bin: PathBuf,
    validator: Arc<dyn ScriptValidator>,
}

impl GuestfishCustomizer {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            validator: Arc::new(GuestfishScriptSanitizer),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn ScriptValidator>) -> Self {
        self.validator = validator;
        self
    }

    fn args(image_name: &str, options: &ImageOptions) -> Vec<String> {
        let mut args = Vec::with_capacity(8);
        if options.verbose {
            args.push("-v".to_string());
            args.push("-x".to_string());
        }
        args.push("--rw".to_string());
        if let Some(format) = options
            .parameter_value("format")
            .and_then(|v| v.as_str())
            .filter(|f| !f.is_empty())
        {
            args.push(format!("--format={}", format));
        }
        args.push("-a".to_string());
        args.push(image_name.to_string());
        args.push("-i".to_string());
        args
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

impl ImageCustomizer for GuestfishCustomizer {
    fn customize(&self, request: &CustomizeRequest<'_>) -> Result<String> {
        let script = request
            .resources
            .iter()
            .find(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().ends_with(SCRIPT_EXTENSION))
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                NimError::InvalidArgument(format!("No {} resource provided", SCRIPT_EXTENSION))
            })?;
        self.validator.validate(script)?;

        let image_name = request
            .image_file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| NimError::InvalidArgument("image file has no name".into()))?;
        let args = Self::args(&image_name, request.options);
        tracing::info!(
            command = %format!("{} {}", self.bin.display(), args.join(" ")),
            script = %script.display(),
            "Executing customization command"
        );

        let stdin = File::open(script)?;
        let mut child = Command::new(&self.bin)
            .args(&args)
            .current_dir(request.staging_dir)
            .envs(&request.options.environment)
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| NimError::ToolFailed {
                code: None,
                output: format!("unable to launch {}: {}", self.bin.display(), e),
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if request.cancel.is_cancelled() {
                tracing::warn!(pid = child.id(), "Killing cancelled customization command");
                let _ = child.kill();
                let _ = child.wait();
                return Err(NimError::Cancelled);
            }
            thread::sleep(POLL_INTERVAL);
        };

        let mut output = stdout.join().unwrap_or_default();
        let err_text = stderr.join().unwrap_or_default();
        if !err_text.trim().is_empty() {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&err_text);
        }
        let output = output.trim_end().to_string();

        if !status.success() {
            tracing::error!(code = ?status.code(), %output, "Customization command failed");
            return Err(NimError::ToolFailed {
                code: status.code(),
                output,
            });
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_args_default() {
        let args = GuestfishCustomizer::args("base.img", &ImageOptions::default());
        assert_eq!(args, vec!["--rw", "-a", "base.img", "-i"]);
    }

    #[test]
    fn test_args_verbose_and_format() {
        let mut options = ImageOptions {
            verbose: true,
            ..Default::default()
        };
        options
            .parameters
            .insert("format".to_string(), json!("raw"));
        let args = GuestfishCustomizer::args("base.img", &options);
        assert_eq!(
            args,
            vec!["-v", "-x", "--rw", "--format=raw", "-a", "base.img", "-i"]
        );
    }

    #[test]
    fn test_non_string_format_ignored() {
        let mut options = ImageOptions::default();
        options.parameters.insert("format".to_string(), json!(3));
        let args = GuestfishCustomizer::args("x.img", &options);
        assert!(!args.iter().any(|a| a.starts_with("--format")));
    }

    #[test]
    fn test_missing_script_resource() {
        let tmp = tempfile::TempDir::new().unwrap();
        let image = tmp.path().join("base.img");
        let cancel = CancelFlag::new();
        let request = CustomizeRequest {
            staging_dir: tmp.path(),
            image_file: &image,
            resources: &[tmp.path().join("readme.txt")],
            options: &ImageOptions::default(),
            cancel: &cancel,
        };
        let err = GuestfishCustomizer::new("guestfish")
            .customize(&request)
            .unwrap_err();
        assert!(matches!(err, NimError::InvalidArgument(_)));
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        /// A stand-in tool: echoes its args, copies stdin, exits with $FAKE_EXIT.
        fn fake_tool(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-guestfish");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn staged(tmp: &TempDir, script: &str) -> (PathBuf, PathBuf, Vec<PathBuf>) {
            let staging = tmp.path().join("staging");
            std::fs::create_dir_all(&staging).unwrap();
            let image = staging.join("base.img");
            std::fs::write(&image, b"raw").unwrap();
            let fish = staging.join("setup.fish");
            std::fs::write(&fish, script).unwrap();
            (staging, image, vec![fish])
        }

        #[test]
        fn test_runs_tool_with_script_on_stdin() {
            let tmp = TempDir::new().unwrap();
            let tool = fake_tool(tmp.path(), "echo \"args: $*\"\necho \"env: $NODE_NAME\"\ncat");
            let (staging, image, resources) = staged(&tmp, "write /etc/hostname node\n");
            let mut options = ImageOptions::default();
            options
                .environment
                .insert("NODE_NAME".to_string(), "solar-1".to_string());
            let cancel = CancelFlag::new();
            let output = GuestfishCustomizer::new(&tool)
                .customize(&CustomizeRequest {
                    staging_dir: &staging,
                    image_file: &image,
                    resources: &resources,
                    options: &options,
                    cancel: &cancel,
                })
                .unwrap();
            assert_eq!(
                output,
                "args: --rw -a base.img -i\nenv: solar-1\nwrite /etc/hostname node"
            );
        }

        #[test]
        fn test_non_zero_exit_carries_output() {
            let tmp = TempDir::new().unwrap();
            let tool = fake_tool(tmp.path(), "echo 'libguestfs: error: no OS found' >&2\nexit 3");
            let (staging, image, resources) = staged(&tmp, "ls /\n");
            let cancel = CancelFlag::new();
            let err = GuestfishCustomizer::new(&tool)
                .customize(&CustomizeRequest {
                    staging_dir: &staging,
                    image_file: &image,
                    resources: &resources,
                    options: &ImageOptions::default(),
                    cancel: &cancel,
                })
                .unwrap_err();
            match err {
                NimError::ToolFailed { code, output } => {
                    assert_eq!(code, Some(3));
                    assert_eq!(output, "libguestfs: error: no OS found");
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        #[test]
        fn test_rejected_script_never_runs_tool() {
            let tmp = TempDir::new().unwrap();
            let marker = tmp.path().join("ran");
            let tool = fake_tool(tmp.path(), &format!("touch {}", marker.display()));
            let (staging, image, resources) = staged(&tmp, "ls /\n!rm -rf /\n");
            let cancel = CancelFlag::new();
            let err = GuestfishCustomizer::new(&tool)
                .customize(&CustomizeRequest {
                    staging_dir: &staging,
                    image_file: &image,
                    resources: &resources,
                    options: &ImageOptions::default(),
                    cancel: &cancel,
                })
                .unwrap_err();
            assert!(matches!(err, NimError::Script { line: Some(2), .. }));
            assert!(!marker.exists());
        }

        #[test]
        fn test_cancel_kills_tool() {
            let tmp = TempDir::new().unwrap();
            let tool = fake_tool(tmp.path(), "sleep 30");
            let (staging, image, resources) = staged(&tmp, "ls /\n");
            let cancel = CancelFlag::new();
            let canceller = {
                let cancel = cancel.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(200));
                    cancel.cancel();
                })
            };
            let started = std::time::Instant::now();
            let err = GuestfishCustomizer::new(&tool)
                .customize(&CustomizeRequest {
                    staging_dir: &staging,
                    image_file: &image,
                    resources: &resources,
                    options: &ImageOptions::default(),
                    cancel: &cancel,
                })
                .unwrap_err();
            canceller.join().unwrap();
            assert!(matches!(err, NimError::Cancelled));
            assert!(started.elapsed() < Duration::from_secs(10));
        }
    }
}
