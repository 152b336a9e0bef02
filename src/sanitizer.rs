//! Validation of customization scripts before they run.
//!
//! The customization tool executes its script inside an appliance, but a
//! few guestfish commands reach back out to the host. Scripts containing
//! them are rejected line by line, in this order:
//!
//! | Pattern | Rejected |
//! |---------|----------|
//! | `^\s*<?!` | local command (`!cmd`, `<!cmd`) |
//! | `\|` | pipe to a local command |
//! | `^\s*lcd` | local directory change |

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{NimError, Result};

static LOCAL_CMD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*<?!").expect("valid local command pattern"));
static LOCAL_PIPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\|").expect("valid pipe pattern"));
static LCD_CMD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*lcd").expect("valid lcd pattern"));

/// Checks a script file before it is handed to the customization tool.
pub trait ScriptValidator: Send + Sync {
    /// Returns [`NimError::Script`] naming the file and offending line.
    fn validate(&self, script: &Path) -> Result<()>;
}

/// Rejects guestfish host-escape commands.
#[derive(Debug, Default, Clone, Copy)]
pub struct GuestfishScriptSanitizer;

impl GuestfishScriptSanitizer {
    fn check_line(line: &str) -> Option<&'static str> {
        if LOCAL_CMD.is_match(line) {
            Some("Local commands are not supported")
        } else if LOCAL_PIPE.is_match(line) {
            Some("Local pipe commands are not supported")
        } else if LCD_CMD.is_match(line) {
            Some("The lcd command is not supported")
        } else {
            None
        }
    }
}

impl ScriptValidator for GuestfishScriptSanitizer {
    fn validate(&self, script: &Path) -> Result<()> {
        let name = script
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| script.display().to_string());
        let script_error = |line: Option<usize>, message: String| NimError::Script {
            script: name.clone(),
            line,
            message,
        };

        let file = File::open(script)
            .map_err(|e| script_error(None, format!("Error processing script: {}", e)))?;
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line =
                line.map_err(|e| script_error(None, format!("Error processing script: {}", e)))?;
            if let Some(reason) = Self::check_line(&line) {
                return Err(script_error(Some(idx + 1), format!("{}: {}", reason, line)));
            }
        }
        Ok(())
    }
}
