//! Task progress reporting for the CLI.
//!
//! While `nim create` polls a receipt, each snapshot is handed to a
//! [`TaskProgressReporter`]. Output goes to stderr so stdout stays clean for
//! the final status JSON.
//!
//! Human mode prints one line per change:
//! ```text
//! [ 33.3%] running  Customizing image
//! ```
//! JSON mode prints one object per snapshot:
//! ```json
//! {"event":"progress","id":"…","state":"running","percent":0.333,"message":"Customizing image"}
//! ```

use std::io::Write;

use parking_lot::Mutex;

use crate::receipt::ReceiptStatus;

/// Receives receipt snapshots while a task runs.
pub trait TaskProgressReporter: Send + Sync {
    fn report(&self, status: &ReceiptStatus);
}

/// Human-readable lines on stderr, printed only when the line changes.
#[derive(Default)]
pub struct StderrProgress {
    last: Mutex<Option<String>>,
}

impl StderrProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

fn human_line(status: &ReceiptStatus) -> String {
    format!(
        "[{:>5.1}%] {:<9}{}",
        status.percent_complete * 100.0,
        status.state,
        status.message.as_deref().unwrap_or("")
    )
    .trim_end()
    .to_string()
}

impl TaskProgressReporter for StderrProgress {
    fn report(&self, status: &ReceiptStatus) {
        let line = human_line(status);
        let mut last = self.last.lock();
        if last.as_deref() == Some(line.as_str()) {
            return;
        }
        let _ = writeln!(std::io::stderr().lock(), "{}", line);
        *last = Some(line);
    }
}

/// Newline-delimited JSON on stderr.
pub struct JsonProgress;

impl TaskProgressReporter for JsonProgress {
    fn report(&self, status: &ReceiptStatus) {
        let obj = serde_json::json!({
            "event": if status.done { "done" } else { "progress" },
            "id": status.id,
            "state": status.state,
            "percent": status.percent_complete,
            "message": status.message,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl TaskProgressReporter for NoProgress {
    fn report(&self, _status: &ReceiptStatus) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Parse a `--progress` value; `None` picks the TTY default.
    pub fn from_flag(flag: Option<&str>) -> Result<Self, String> {
        match flag {
            None => Ok(Self::default_for_tty()),
            Some("human") => Ok(ProgressMode::Human),
            Some("json") => Ok(ProgressMode::Json),
            Some("off") => Ok(ProgressMode::Off),
            Some(other) => Err(format!(
                "invalid progress mode '{}': expected human, json, or off",
                other
            )),
        }
    }

    pub fn reporter(&self) -> Box<dyn TaskProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress::new()),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receipt::Receipt;
    use crate::tracker::TaskStepTracker;
    use std::sync::Arc;

    #[test]
    fn test_human_line() {
        let tracker = Arc::new(TaskStepTracker::new(3).unwrap());
        let receipt = Receipt::new("r1", "t1", "base", tracker.clone());
        tracker.complete_step();
        tracker.set_message("Customizing image");
        assert_eq!(
            human_line(&receipt.status()),
            "[ 33.3%] pending  Customizing image"
        );
    }

    #[test]
    fn test_from_flag() {
        assert_eq!(ProgressMode::from_flag(Some("json")).unwrap(), ProgressMode::Json);
        assert_eq!(ProgressMode::from_flag(Some("off")).unwrap(), ProgressMode::Off);
        assert!(ProgressMode::from_flag(Some("loud")).is_err());
    }
}
