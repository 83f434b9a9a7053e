//! Data model: users, tasks, subtasks, feedback, and the derived types that
//! flow between pipeline components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Hour-of-day bucket, `0..=23`.
pub type Hour = u8;

/// A half-open UTC interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    /// Inclusive start instant.
    pub start: DateTime<Utc>,
    /// Exclusive end instant.
    pub end: DateTime<Utc>,
}

impl Interval {
    /// Build the interval `[start, end)`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Length of the interval in whole minutes.
    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    /// Whether this interval shares any instant with `other`.
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// User-declared window of best cognitive performance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeakWindow {
    /// Roughly 06:00-12:00.
    Morning,
    /// Roughly 12:00-18:00.
    Afternoon,
    /// Roughly 18:00-23:00.
    Evening,
}

impl PeakWindow {
    /// Whether `hour` (local, 0-23) falls inside this window.
    pub fn contains(&self, hour: Hour) -> bool {
        match self {
            PeakWindow::Morning => (6..12).contains(&hour),
            PeakWindow::Afternoon => (12..18).contains(&hour),
            PeakWindow::Evening => (18..23).contains(&hour),
        }
    }
}

/// Per-user scheduling and work-session preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preferences {
    /// Local hour the work window opens, `0..=23`.
    pub work_window_start: Hour,
    /// Local hour the work window closes, `0..=23`.
    pub work_window_end: Hour,
    /// The user's declared peak-performance window.
    pub peak_window: PeakWindow,
    /// Ideal length of one focused work session, in minutes.
    pub preferred_session_minutes: u32,
    /// Hard ceiling on a single scheduled session, in minutes.
    pub max_session_minutes: u32,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            work_window_start: 9,
            work_window_end: 17,
            peak_window: PeakWindow::Morning,
            preferred_session_minutes: 25,
            max_session_minutes: 30,
        }
    }
}

/// Lifecycle state shared by tasks and subtasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not yet started.
    Pending,
    /// Actively being worked.
    InProgress,
    /// Completed.
    Done,
    /// Withdrawn; excluded from prioritization and scheduling.
    Cancelled,
}

impl TaskStatus {
    /// Whether this status can no longer change (`done` or `cancelled`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancelled)
    }
}

/// A provider-side calendar event cached under the owning subtask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarEventHandle {
    /// Provider-assigned event identifier.
    pub event_id: String,
    /// The placed window, as last written to the calendar.
    pub window: Interval,
    /// The event summary/title last written to the calendar.
    pub summary: String,
}

/// A one-level-nested unit of work, the scheduling granule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    /// Stable identifier.
    pub id: Uuid,
    /// Short, verb-led label.
    pub heading: String,
    /// Longer free-form description.
    pub details: String,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Optional completion deadline.
    pub deadline: Option<DateTime<Utc>>,
    /// Planner-estimated effort in minutes.
    pub time_estimate_minutes: Option<u32>,
    /// Optional link to a supporting resource.
    pub resource_link: Option<String>,
    /// The calendar event this subtask is currently placed as, if any.
    pub event: Option<CalendarEventHandle>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Subtask {
    /// Build a new pending subtask with a fresh id and timestamps.
    pub fn new(heading: impl Into<String>, details: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            heading: heading.into(),
            details: details.into(),
            status: TaskStatus::Pending,
            deadline: None,
            time_estimate_minutes: None,
            resource_link: None,
            event: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A subtask is schedulable onto the calendar only within this estimate.
    pub fn is_schedulable(&self) -> bool {
        self.status == TaskStatus::Pending
            && self
                .time_estimate_minutes
                .is_some_and(|m| m <= MAX_SCHEDULABLE_MINUTES)
    }
}

/// Upper bound on a schedulable subtask's time estimate, in minutes.
pub const MAX_SCHEDULABLE_MINUTES: u32 = 30;

/// A user-owned unit of work; never nested inside another task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable identifier.
    pub id: Uuid,
    /// Short, verb-led label.
    pub heading: String,
    /// Longer free-form description.
    pub details: String,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Optional completion deadline.
    pub deadline: Option<DateTime<Utc>>,
    /// Effort estimate in minutes, when the task itself (not a subtask) is
    /// directly schedulable.
    pub time_estimate_minutes: Option<u32>,
    /// Optional link to a supporting resource.
    pub resource_link: Option<String>,
    /// Ordered breakdown produced by the Planner.
    pub subtasks: Vec<Subtask>,
    /// Set when the Planner failed to produce subtasks for this task.
    pub needs_planning: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a new pending task with a fresh id and timestamps.
    pub fn new(heading: impl Into<String>, details: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            heading: heading.into(),
            details: details.into(),
            status: TaskStatus::Pending,
            deadline: None,
            time_estimate_minutes: None,
            resource_link: None,
            subtasks: Vec::new(),
            needs_planning: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Cascade `mark_done`: the task is done, and every pending/in-progress
    /// subtask is carried to done with it. Already-cancelled subtasks are
    /// left untouched and do not block completion.
    pub fn mark_done(&mut self) {
        let now = Utc::now();
        for sub in &mut self.subtasks {
            if !sub.status.is_terminal() {
                sub.status = TaskStatus::Done;
                sub.updated_at = now;
            }
        }
        self.status = TaskStatus::Done;
        self.updated_at = now;
    }
}

/// Kind of an append-only feedback record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    /// Actual vs. estimated time for a completed subtask.
    TaskCompletion,
    /// Whether a scheduled placement actually got worked.
    Scheduling,
    /// Subjective difficulty rating.
    Difficulty,
    /// Subjective energy/focus rating at the time of work.
    Energy,
}

/// A single append-only observation about how work actually went.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    /// What this record is reporting on.
    pub kind: FeedbackKind,
    /// Owning task.
    pub task_id: Uuid,
    /// Owning subtask, when the feedback is subtask-scoped.
    pub subtask_id: Option<Uuid>,
    /// Actual time spent, in minutes.
    pub actual_minutes: Option<u32>,
    /// Subjective difficulty, `1..=5`.
    pub difficulty: Option<u8>,
    /// Subjective energy level at the time, `0..=100`.
    pub energy: Option<u8>,
    /// When the observation was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Observed energy score per hour-of-day, accumulated from feedback via a
/// moving average.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnergyPattern {
    /// Smoothed energy score per hour-of-day, `0.0..=100.0`.
    pub by_hour: BTreeMap<Hour, f64>,
}

impl EnergyPattern {
    /// Fold a new observation into the hour's moving average.
    #[allow(clippy::arithmetic_side_effects)] // plain floating-point averaging, no overflow risk
    pub fn observe(&mut self, hour: Hour, energy: u8) {
        let sample = f64::from(energy);
        let entry = self.by_hour.entry(hour).or_insert(sample);
        *entry = (*entry * ENERGY_SMOOTHING) + (sample * (1.0 - ENERGY_SMOOTHING));
    }
}

/// Weight given to the prior average when folding in a new energy sample.
const ENERGY_SMOOTHING: f64 = 0.7;

/// Session bookkeeping for one user's stored document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// When this user record was first created.
    pub created_at: DateTime<Utc>,
    /// When this user record was last mutated.
    pub last_updated: DateTime<Utc>,
    /// Schema version of this user record.
    pub version: u32,
}

impl Default for SessionMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            last_updated: now,
            version: 1,
        }
    }
}

/// The eight recognized intent kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Create a new task.
    Add,
    /// Patch an existing task's fields.
    Edit,
    /// Mark a task (and its subtasks) done.
    MarkDone,
    /// Change a task's deadline.
    Reschedule,
    /// Append a subtask to an existing task.
    AddSubtask,
    /// Cancel a task.
    Delete,
    /// Ask how a task is progressing; produces no mutation.
    QueryProgress,
    /// Ask what to work on next; produces no mutation.
    QueryNext,
}

/// How a target task/subtask is identified in an incoming action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TargetRef {
    /// An exact task id.
    Id(Uuid),
    /// A task heading, matched case-insensitively.
    Heading(String),
    /// The most recently created task.
    LastTask,
}

/// A patch applied by an `edit` action. All fields optional; absent fields
/// are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    /// New heading, if changing.
    pub heading: Option<String>,
    /// New details, if changing.
    pub details: Option<String>,
    /// New deadline, if changing.
    pub deadline: Option<DateTime<Utc>>,
    /// New resource link, if changing.
    pub resource_link: Option<String>,
}

/// A new subtask payload carried by an `add_subtask` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubtask {
    /// Short, verb-led label.
    pub heading: String,
    /// Longer free-form description.
    pub details: Option<String>,
    /// Optional completion deadline.
    pub deadline: Option<DateTime<Utc>>,
}

/// A single typed operation derived from a user utterance: a tagged variant,
/// not a duck-typed dictionary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Create a new task.
    Add {
        /// Short, verb-led label.
        heading: String,
        /// Longer free-form description.
        details: Option<String>,
        /// Optional completion deadline.
        deadline: Option<DateTime<Utc>>,
        /// Free-text priority hint, currently advisory only.
        priority: Option<String>,
    },
    /// Patch an existing task.
    Edit {
        /// Which task to patch.
        target: TargetRef,
        /// The fields to change.
        patch: TaskPatch,
    },
    /// Mark a task (and its subtasks) done.
    MarkDone {
        /// Which task to mark done.
        target: TargetRef,
    },
    /// Change a task's deadline.
    Reschedule {
        /// Which task to reschedule.
        target: TargetRef,
        /// The new deadline.
        deadline: DateTime<Utc>,
    },
    /// Append a subtask to an existing task.
    AddSubtask {
        /// Which task to append to.
        target: TargetRef,
        /// The new subtask's payload.
        subtask: NewSubtask,
    },
    /// Cancel a task.
    Delete {
        /// Which task to cancel.
        target: TargetRef,
    },
    /// Ask how a task is progressing; produces no mutation.
    QueryProgress,
    /// Ask what to work on next; produces no mutation.
    QueryNext,
}

impl Action {
    /// The tag of this action, independent of its payload.
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Add { .. } => ActionKind::Add,
            Action::Edit { .. } => ActionKind::Edit,
            Action::MarkDone { .. } => ActionKind::MarkDone,
            Action::Reschedule { .. } => ActionKind::Reschedule,
            Action::AddSubtask { .. } => ActionKind::AddSubtask,
            Action::Delete { .. } => ActionKind::Delete,
            Action::QueryProgress => ActionKind::QueryProgress,
            Action::QueryNext => ActionKind::QueryNext,
        }
    }
}

/// Semantic error kind surfaced per action and at the pipeline boundary,
/// independent of which component raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenieErrorKind {
    /// Malformed or out-of-range input.
    Validation,
    /// The referenced task/subtask does not exist.
    NotFound,
    /// A concurrent mutation collided with this one.
    Conflict,
    /// A retryable external failure (network, rate limit).
    TransientExternal,
    /// A non-retryable external failure (auth, unrecoverable).
    FatalExternal,
    /// Persisted state failed validation and could not be recovered.
    Corrupt,
    /// An operation exceeded its deadline.
    Timeout,
    /// The LLM returned output that could not be parsed or validated.
    InvalidLlmOutput,
}

/// Per-action outcome returned from `handleUtterance`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    /// Whether the action applied successfully.
    pub ok: bool,
    /// The semantic error kind, present only when `ok` is false.
    pub kind: Option<GenieErrorKind>,
    /// A human-readable message, present only when `ok` is false.
    pub message: Option<String>,
    /// The affected task, when applicable.
    pub task_id: Option<Uuid>,
}

impl ActionResult {
    /// A successful outcome, optionally naming the affected task.
    pub fn ok(task_id: Option<Uuid>) -> Self {
        Self {
            ok: true,
            kind: None,
            message: None,
            task_id,
        }
    }

    /// A failed outcome carrying the semantic error kind and a message.
    pub fn failed(kind: GenieErrorKind, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            kind: Some(kind),
            message: Some(message.into()),
            task_id: None,
        }
    }
}

/// How well a recommended subtask matches the user's current cognitive state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PsychologicalFit {
    /// Inside the user's declared peak window and a deep-work task.
    Peak,
    /// Inside the peak window, or a shallow task outside it.
    Aligned,
    /// Workable but not well matched to the current hour.
    Acceptable,
    /// Poorly matched; a deep-work task outside the peak window.
    Mismatch,
}

/// The Prioritizer's single-winner output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    /// The winning task, when one fits.
    pub task_id: Option<Uuid>,
    /// The winning subtask within that task, when one fits.
    pub subtask_id: Option<Uuid>,
    /// Human-readable explanation of the choice.
    pub reasoning: String,
    /// How well the winner matches the current hour.
    pub psychological_fit: Option<PsychologicalFit>,
    /// The calendar window the Scheduler placed it into, if any.
    pub scheduled: Option<Interval>,
}

impl Recommendation {
    /// The degraded recommendation returned when no task fits the window.
    pub fn none_fitting() -> Self {
        Self {
            task_id: None,
            subtask_id: None,
            reasoning: "no fitting work in window".to_string(),
            psychological_fit: None,
            scheduled: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_done_cascades_pending_and_in_progress_but_not_cancelled() {
        let mut task = Task::new("Ship release", "");
        let mut s1 = Subtask::new("write notes", "");
        s1.status = TaskStatus::Pending;
        let mut s2 = Subtask::new("tag release", "");
        s2.status = TaskStatus::InProgress;
        let mut s3 = Subtask::new("old step", "");
        s3.status = TaskStatus::Cancelled;
        task.subtasks = vec![s1, s2, s3];

        task.mark_done();

        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.subtasks[0].status, TaskStatus::Done);
        assert_eq!(task.subtasks[1].status, TaskStatus::Done);
        assert_eq!(task.subtasks[2].status, TaskStatus::Cancelled);
    }

    #[test]
    fn schedulable_requires_pending_status_and_estimate_within_bound() {
        let mut s = Subtask::new("quick review", "");
        s.time_estimate_minutes = Some(30);
        assert!(s.is_schedulable());

        s.time_estimate_minutes = Some(31);
        assert!(!s.is_schedulable());

        s.time_estimate_minutes = Some(20);
        s.status = TaskStatus::Done;
        assert!(!s.is_schedulable());
    }

    #[test]
    fn peak_window_hour_membership() {
        assert!(PeakWindow::Morning.contains(8));
        assert!(!PeakWindow::Morning.contains(14));
        assert!(PeakWindow::Evening.contains(20));
    }

    #[test]
    fn interval_overlap_is_symmetric_and_half_open() {
        let a = Interval::new(
            "2025-01-01T09:00:00Z".parse().unwrap(),
            "2025-01-01T10:00:00Z".parse().unwrap(),
        );
        let b = Interval::new(
            "2025-01-01T10:00:00Z".parse().unwrap(),
            "2025-01-01T11:00:00Z".parse().unwrap(),
        );
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));

        let c = Interval::new(
            "2025-01-01T09:30:00Z".parse().unwrap(),
            "2025-01-01T10:30:00Z".parse().unwrap(),
        );
        assert!(a.overlaps(&c));
        assert!(c.overlaps(&a));
    }
}
