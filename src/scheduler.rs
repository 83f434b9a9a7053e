//! Scheduler (C8): places the winning recommendation's subtask into the
//! user's calendar when availability permits.
//!
//! No grounding counterpart exists in this codebase for the placement
//! search itself; authored fresh. The orphan-adoption list-then-match
//! approach reuses the `[Genie]`-marker recognition idiom that also grounds
//! the Calendar Client's event summary convention.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::calendar::{CalendarClient, EventDraft, FreeBusy};
use crate::store::Store;
use crate::types::{CalendarEventHandle, Interval, Recommendation, Task};

const PLACEMENT_WINDOW_HOURS: i64 = 2;
const TRAILING_BUFFER_MINUTES: i64 = 5;

/// Places (or clears) a calendar event for the winning recommendation.
pub struct Scheduler<'a> {
    /// Calendar provider to place/adopt/clear events against.
    pub calendar: &'a dyn CalendarClient,
    /// Store to persist the resulting event handle into.
    pub store: &'a Store,
    /// Target calendar identifier.
    pub calendar_id: String,
    /// Prefix marking events this crate owns, for orphan adoption.
    pub summary_prefix: String,
}

impl<'a> Scheduler<'a> {
    /// Attempt to place `recommendation`'s subtask into the calendar given
    /// `free_busy`. Mutates `recommendation.scheduled` on success and
    /// records the event handle in the Store.
    pub async fn schedule(
        &self,
        user_id: &str,
        task: &Task,
        recommendation: &mut Recommendation,
        free_busy: &FreeBusy,
        now: DateTime<Utc>,
    ) {
        let Some(subtask_id) = recommendation.subtask_id else {
            return;
        };
        let Some(subtask) = task.subtasks.iter().find(|s| s.id == subtask_id) else {
            return;
        };
        let Some(estimate) = subtask.time_estimate_minutes else {
            return;
        };
        if estimate > crate::types::MAX_SCHEDULABLE_MINUTES {
            return; // scheduling filter: never schedule an over-long subtask
        }

        let search_window = Interval::new(now, now + chrono::Duration::hours(PLACEMENT_WINDOW_HOURS));
        let needed_minutes = i64::from(estimate) + TRAILING_BUFFER_MINUTES;

        let Some(chosen) = earliest_fit(&free_busy.free, search_window, needed_minutes) else {
            info!(subtask = %subtask.heading, "no free interval large enough, leaving recommendation unscheduled");
            return;
        };
        let placement = Interval::new(chosen.start, chosen.start + chrono::Duration::minutes(i64::from(estimate)));

        let summary = format!("{}{}", self.summary_prefix, subtask.heading);
        let description = match &subtask.resource_link {
            Some(url) => format!("{}\n\nResource: {url}", subtask.details),
            None => subtask.details.clone(),
        };
        let draft = EventDraft {
            summary: summary.clone(),
            description,
            window: placement,
        };

        let result = match &subtask.event {
            Some(existing) if existing.window.start == placement.start && existing.window.end == placement.end => {
                // Already scheduled at this exact window; nothing to do.
                recommendation.scheduled = Some(placement);
                return;
            }
            Some(existing) => self
                .calendar
                .update_event(&self.calendar_id, &existing.event_id, &draft)
                .await
                .map(|()| existing.event_id.clone()),
            None => self.adopt_or_create(user_id, subtask_id, &draft, placement).await,
        };

        match result {
            Ok(event_id) => {
                let handle = CalendarEventHandle {
                    event_id,
                    window: placement,
                    summary,
                };
                if let Err(e) = self
                    .store
                    .update_task(user_id, task.id, move |t| {
                        if let Some(s) = t.subtasks.iter_mut().find(|s| s.id == subtask_id) {
                            s.event = Some(handle);
                        }
                    })
                    .await
                {
                    warn!(error = %e, "failed to persist scheduled event handle");
                }
                recommendation.scheduled = Some(placement);
            }
            Err(e) => {
                warn!(error = %e, "calendar write failed, recommendation remains unscheduled");
            }
        }
    }

    /// Idempotence guard: before creating a new event, check for an orphan
    /// `[Genie]`-marked event already occupying the chosen window (created
    /// on a prior invocation whose Store write then failed).
    async fn adopt_or_create(
        &self,
        _user_id: &str,
        _subtask_id: uuid::Uuid,
        draft: &EventDraft,
        placement: Interval,
    ) -> Result<String, crate::calendar::CalendarError> {
        if let Ok(existing) = self
            .calendar
            .list_events(&self.calendar_id, placement, &self.summary_prefix)
            .await
        {
            if let Some((event_id, _window)) = existing.into_iter().find(|(_, w)| w.overlaps(&placement)) {
                return Ok(event_id);
            }
        }
        self.calendar.create_event(&self.calendar_id, draft).await
    }

    /// Clear an existing event when its subtask is marked done or
    /// rescheduled out of its window.
    pub async fn clear_event(&self, handle: &CalendarEventHandle) {
        if let Err(e) = self.calendar.delete_event(&self.calendar_id, &handle.event_id).await {
            warn!(error = %e, event_id = %handle.event_id, "failed to delete calendar event");
        }
    }
}

/// Earliest free interval within `window` at least `needed_minutes` long.
fn earliest_fit(free: &[Interval], window: Interval, needed_minutes: i64) -> Option<Interval> {
    free.iter()
        .filter_map(|interval| {
            let start = interval.start.max(window.start);
            let end = interval.end.min(window.end);
            if end <= start {
                return None;
            }
            let available = (end - start).num_minutes();
            if available >= needed_minutes {
                Some(Interval::new(start, end))
            } else {
                None
            }
        })
        .min_by_key(|i| i.start)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn earliest_fit_picks_first_interval_large_enough() {
        let window = Interval::new(dt("2025-09-15T09:00:00Z"), dt("2025-09-15T11:00:00Z"));
        let free = vec![
            Interval::new(dt("2025-09-15T09:00:00Z"), dt("2025-09-15T09:10:00Z")),
            Interval::new(dt("2025-09-15T09:30:00Z"), dt("2025-09-15T10:30:00Z")),
        ];
        let fit = earliest_fit(&free, window, 25).unwrap();
        assert_eq!(fit.start, dt("2025-09-15T09:30:00Z"));
    }

    #[test]
    fn earliest_fit_returns_none_when_nothing_large_enough() {
        let window = Interval::new(dt("2025-09-15T09:00:00Z"), dt("2025-09-15T11:00:00Z"));
        let free = vec![Interval::new(
            dt("2025-09-15T09:00:00Z"),
            dt("2025-09-15T09:10:00Z"),
        )];
        assert!(earliest_fit(&free, window, 25).is_none());
    }
}
