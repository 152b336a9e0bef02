//! Step-based progress tracking for customization tasks.
//!
//! A task declares up front how many discrete steps it will run. The
//! pipeline worker advances through them with [`TaskStepTracker::complete_step`]
//! and reports fine-grained progress inside a step with
//! [`TaskStepTracker::set_step_percent_complete`]; pollers read a single
//! normalized fraction from [`TaskStepTracker::overall_percent_complete`].
//!
//! ```text
//! overall = (current_step - 1) / step_count + step_percent / step_count
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{NimError, Result};

#[derive(Debug, Default)]
struct TrackerState {
    current_step: usize,
    step_percent_complete: f64,
    message: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

/// Progress state machine shared between one writer (the pipeline worker)
/// and any number of readers (receipt pollers).
#[derive(Debug)]
pub struct TaskStepTracker {
    step_count: usize,
    state: Mutex<TrackerState>,
}

impl TaskStepTracker {
    /// Create a tracker for a task with `step_count` steps.
    pub fn new(step_count: usize) -> Result<Self> {
        if step_count < 1 {
            return Err(NimError::InvalidArgument(
                "Step count must be > 0".to_string(),
            ));
        }
        Ok(Self {
            step_count,
            state: Mutex::new(TrackerState::default()),
        })
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    /// The 1-based step currently in progress (0 before any progress).
    pub fn current_step(&self) -> usize {
        self.state.lock().current_step
    }

    /// Complete the current step and begin the next one at 0%.
    ///
    /// Saturates at `step_count + 1`, where the overall fraction is 1.
    pub fn complete_step(&self) {
        let mut state = self.state.lock();
        if state.current_step < 1 {
            state.current_step = 1;
        }
        if state.current_step <= self.step_count {
            state.current_step += 1;
        }
        state.step_percent_complete = 0.0;
    }

    /// Set the fraction complete of the current step, clamped to `[0, 1]`.
    pub fn set_step_percent_complete(&self, percent: f64) {
        let mut state = self.state.lock();
        if state.current_step < 1 {
            state.current_step = 1;
        }
        state.step_percent_complete = if percent.is_nan() {
            0.0
        } else {
            percent.clamp(0.0, 1.0)
        };
    }

    /// Overall fraction complete across all steps, in `[0, 1]`.
    pub fn overall_percent_complete(&self) -> f64 {
        let state = self.state.lock();
        if state.current_step < 1 {
            return 0.0;
        }
        if state.current_step > self.step_count {
            return 1.0;
        }
        let n = self.step_count as f64;
        let overall = (state.current_step - 1) as f64 / n + state.step_percent_complete / n;
        overall.clamp(0.0, 1.0)
    }

    pub fn message(&self) -> Option<String> {
        self.state.lock().message.clone()
    }

    pub fn set_message(&self, message: impl Into<String>) {
        self.state.lock().message = Some(message.into());
    }

    /// Record the start time. Only the first call has an effect.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.started_at.is_none() {
            state.started_at = Some(Utc::now());
        }
    }

    /// Record the completion time. Only the first call has an effect.
    pub fn complete(&self) {
        let mut state = self.state.lock();
        if state.completed_at.is_none() {
            state.completed_at = Some(Utc::now());
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().completed_at
    }

    pub fn is_started(&self) -> bool {
        self.started_at().is_some()
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at().is_some()
    }
}
