//! Prioritizer (C7): scores pending subtasks given schedule, energy, and
//! deadlines, returning one recommendation with rationale.
//!
//! No grounding counterpart exists in this codebase for this scoring logic;
//! implemented as a deterministic function, favoring determinism over a
//! guided LLM call (see DESIGN.md), in the plain-function-over-owned-data
//! style already used for this codebase's non-LLM validation helpers.

use chrono::{DateTime, Timelike, Utc};

use crate::calendar::FreeBusy;
use crate::types::{Preferences, PsychologicalFit, Recommendation, Task, TaskStatus};

const DEADLINE_PRESSURE_WINDOW_HOURS: i64 = 24;
const MAX_CANDIDATE_SUBTASKS_PER_TASK: usize = 5;

const DEEP_WORK_VERBS: &[&str] = &["design", "analyze", "implement", "study", "write"];
const SHALLOW_WORK_VERBS: &[&str] = &["set up", "review", "list", "email"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkKind {
    Deep,
    Shallow,
    Neutral,
}

fn classify(heading: &str) -> WorkKind {
    let lower = heading.to_lowercase();
    if DEEP_WORK_VERBS.iter().any(|v| lower.contains(v)) {
        WorkKind::Deep
    } else if SHALLOW_WORK_VERBS.iter().any(|v| lower.contains(v)) {
        WorkKind::Shallow
    } else {
        WorkKind::Neutral
    }
}

struct Candidate<'a> {
    task: &'a Task,
    subtask_index: usize,
    deadline_pressure: bool,
    energy_score: u8, // 0 = matches rule 3, 1 = does not
    fit: PsychologicalFit,
}

/// Score all pending subtasks and return the single winning recommendation.
pub fn prioritize(
    tasks: &[Task],
    free_busy: &FreeBusy,
    preferences: &Preferences,
    now: DateTime<Utc>,
) -> Recommendation {
    let window_end = now + chrono::Duration::hours(DEADLINE_PRESSURE_WINDOW_HOURS);
    let largest_free_block_minutes = free_busy
        .free
        .iter()
        .map(crate::types::Interval::duration_minutes)
        .max()
        .unwrap_or(0);

    let current_hour = u8::try_from(now.hour()).unwrap_or(0);
    let is_peak = preferences.peak_window.contains(current_hour);

    let mut candidates: Vec<Candidate> = Vec::new();
    for task in tasks {
        for (index, subtask) in task
            .subtasks
            .iter()
            .enumerate()
            .take(MAX_CANDIDATE_SUBTASKS_PER_TASK)
        {
            if subtask.status != TaskStatus::Pending {
                continue;
            }
            let Some(estimate) = subtask.time_estimate_minutes else {
                continue;
            };
            if i64::from(estimate) > largest_free_block_minutes {
                continue; // hard filter: rule 1
            }

            let deadline_pressure = task
                .deadline
                .is_some_and(|d| d >= now && d <= window_end);

            let kind = classify(&subtask.heading);
            let (energy_score, fit) = match (kind, is_peak) {
                (WorkKind::Deep, true) => (0, PsychologicalFit::Peak),
                (WorkKind::Shallow, false) => (0, PsychologicalFit::Aligned),
                (WorkKind::Deep, false) => (1, PsychologicalFit::Mismatch),
                (WorkKind::Shallow, true) => (1, PsychologicalFit::Acceptable),
                (WorkKind::Neutral, _) => (1, PsychologicalFit::Acceptable),
            };

            candidates.push(Candidate {
                task,
                subtask_index: index,
                deadline_pressure,
                energy_score,
                fit,
            });
        }
    }

    if candidates.is_empty() {
        return Recommendation::none_fitting();
    }

    candidates.sort_by(|a, b| {
        // Rule 2: deadline pressure, then earliest deadline first.
        b.deadline_pressure
            .cmp(&a.deadline_pressure)
            .then_with(|| {
                let a_deadline = a.task.deadline.unwrap_or(DateTime::<Utc>::MAX_UTC);
                let b_deadline = b.task.deadline.unwrap_or(DateTime::<Utc>::MAX_UTC);
                a_deadline.cmp(&b_deadline)
            })
            // Rule 3: energy match.
            .then_with(|| a.energy_score.cmp(&b.energy_score))
            // Rule 4: dependency order (lower sibling index first).
            .then_with(|| a.subtask_index.cmp(&b.subtask_index))
            // Rule 5: tie-break on task creation time.
            .then_with(|| a.task.created_at.cmp(&b.task.created_at))
    });

    let winner = &candidates[0];
    let subtask = &winner.task.subtasks[winner.subtask_index];

    let reasoning = if winner.deadline_pressure {
        "selected due to deadline pressure: parent task deadline is within 24h".to_string()
    } else if winner.energy_score == 0 {
        "selected for energy match with the current peak window".to_string()
    } else {
        format!(
            "selected by dependency order: earliest prerequisite (position {})",
            winner.subtask_index
        )
    };

    Recommendation {
        task_id: Some(winner.task.id),
        subtask_id: Some(subtask.id),
        reasoning,
        psychological_fit: Some(winner.fit),
        scheduled: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Interval, PeakWindow, Subtask};

    fn free_busy_open(now: DateTime<Utc>) -> FreeBusy {
        FreeBusy {
            free: vec![Interval::new(now, now + chrono::Duration::hours(2))],
            busy: vec![],
            connected: true,
        }
    }

    #[test]
    fn no_candidates_returns_no_fitting_work() {
        let now: DateTime<Utc> = "2025-09-15T09:00:00Z".parse().unwrap();
        let rec = prioritize(&[], &free_busy_open(now), &Preferences::default(), now);
        assert_eq!(rec.task_id, None);
        assert_eq!(rec.reasoning, "no fitting work in window");
    }

    #[test]
    fn deadline_pressure_outranks_energy_match() {
        let now: DateTime<Utc> = "2025-09-15T09:00:00Z".parse().unwrap();
        let mut urgent = Task::new("Pay rent", "");
        urgent.deadline = Some(now + chrono::Duration::hours(2));
        urgent.subtasks.push({
            let mut s = Subtask::new("set up payment", "");
            s.time_estimate_minutes = Some(15);
            s
        });

        let mut relaxed = Task::new("Learn Rust", "");
        relaxed.subtasks.push({
            let mut s = Subtask::new("design project outline", "");
            s.time_estimate_minutes = Some(20);
            s
        });

        let prefs = Preferences {
            peak_window: PeakWindow::Morning,
            ..Preferences::default()
        };
        let rec = prioritize(&[urgent.clone(), relaxed], &free_busy_open(now), &prefs, now);
        assert_eq!(rec.task_id, Some(urgent.id));
        assert!(rec.reasoning.contains("deadline"));
    }

    #[test]
    fn dependency_order_wins_single_task_single_candidate() {
        let now: DateTime<Utc> = "2025-09-15T09:00:00Z".parse().unwrap();
        let mut task = Task::new("Learn Python", "");
        task.deadline = Some(now + chrono::Duration::days(15));
        task.subtasks.push({
            let mut s = Subtask::new("review syllabus", "");
            s.time_estimate_minutes = Some(20);
            s
        });

        let prefs = Preferences {
            peak_window: PeakWindow::Morning,
            ..Preferences::default()
        };
        let rec = prioritize(&[task.clone()], &free_busy_open(now), &prefs, now);
        assert_eq!(rec.subtask_id, Some(task.subtasks[0].id));
    }

    #[test]
    fn hard_filter_excludes_subtasks_longer_than_largest_free_block() {
        let now: DateTime<Utc> = "2025-09-15T09:00:00Z".parse().unwrap();
        let mut task = Task::new("Big task", "");
        task.subtasks.push({
            let mut s = Subtask::new("write long plan", "");
            s.time_estimate_minutes = Some(30);
            s
        });
        let tiny_free = FreeBusy {
            free: vec![Interval::new(now, now + chrono::Duration::minutes(10))],
            busy: vec![],
            connected: true,
        };
        let rec = prioritize(&[task], &tiny_free, &Preferences::default(), now);
        assert_eq!(rec.task_id, None);
    }
}
