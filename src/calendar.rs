//! Calendar Client (C4): free/busy query + event create/update/delete
//! against an external calendar.
//!
//! `free_busy` is grounded directly on this codebase's existing Google
//! Calendar freebusy query tool (range clamping, bearer-token credential
//! resolution, JSON passthrough), adapted from an ad hoc tool action into a
//! typed trait method. The event-CRUD methods have no grounding counterpart
//! here and are authored fresh against the same Calendar v3 REST surface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::instrument;

use crate::types::Interval;

/// Maximum allowed range in hours for a freebusy query.
const MAX_RANGE_HOURS: i64 = 168; // 7 days

/// Free/busy view for a requested window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeBusy {
    /// Open intervals within the requested window.
    pub free: Vec<Interval>,
    /// Busy intervals within the requested window.
    pub busy: Vec<Interval>,
    /// Whether this view reflects a live provider response rather than a
    /// degraded fallback.
    pub connected: bool,
}

/// Fields accepted when creating or patching an event.
#[derive(Debug, Clone)]
pub struct EventDraft {
    /// Event title.
    pub summary: String,
    /// Event body text.
    pub description: String,
    /// The interval to place the event in.
    pub window: Interval,
}

/// Errors surfaced by calendar write operations; read operations degrade
/// instead of erroring.
#[derive(Debug, thiserror::Error)]
pub enum CalendarError {
    /// The provider rejected the credential.
    #[error("auth failure: {0}")]
    Auth(String),
    /// The HTTP call failed or the provider returned an error status.
    #[error("request failed: {0}")]
    RequestFailed(String),
}

/// The seam a calendar provider implements.
#[async_trait]
pub trait CalendarClient: Send + Sync {
    /// Query free/busy state over `range`. Never fails: on any provider
    /// error this returns a degraded view treating the whole range as free.
    async fn free_busy(&self, range: Interval, calendar_id: &str) -> FreeBusy;
    /// Create an event from `draft`, returning the provider-assigned id.
    async fn create_event(&self, calendar_id: &str, draft: &EventDraft) -> Result<String, CalendarError>;
    /// Patch an existing event's fields.
    async fn update_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        draft: &EventDraft,
    ) -> Result<(), CalendarError>;
    /// Remove an event.
    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> Result<(), CalendarError>;
    /// List events within `range` whose summary starts with
    /// `summary_prefix`, as `(event_id, window)` pairs.
    async fn list_events(
        &self,
        calendar_id: &str,
        range: Interval,
        summary_prefix: &str,
    ) -> Result<Vec<(String, Interval)>, CalendarError>;
}

#[derive(Debug, Deserialize)]
struct FreeBusyCalendarEntry {
    #[serde(default)]
    busy: Vec<RawInterval>,
}

#[derive(Debug, Deserialize, Serialize)]
struct RawInterval {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct FreeBusyResponse {
    calendars: std::collections::HashMap<String, FreeBusyCalendarEntry>,
}

/// Google Calendar v3 HTTP client.
pub struct GoogleCalendarClient {
    client: reqwest::Client,
    oauth_token: String,
}

impl GoogleCalendarClient {
    /// Build a client authenticating with a pre-issued OAuth bearer token.
    pub fn new(oauth_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            oauth_token: oauth_token.into(),
        }
    }

    fn clamp_range(range: Interval) -> Interval {
        let max_end = range.start + chrono::Duration::hours(MAX_RANGE_HOURS);
        if range.end > max_end {
            Interval::new(range.start, max_end)
        } else {
            range
        }
    }
}

#[async_trait]
impl CalendarClient for GoogleCalendarClient {
    #[instrument(skip(self))]
    async fn free_busy(&self, range: Interval, calendar_id: &str) -> FreeBusy {
        let range = Self::clamp_range(range);
        let body = json!({
            "timeMin": range.start.to_rfc3339(),
            "timeMax": range.end.to_rfc3339(),
            "items": [{"id": calendar_id}]
        });

        let degraded = FreeBusy {
            free: vec![range],
            busy: vec![],
            connected: false,
        };

        let response = match self
            .client
            .post("https://www.googleapis.com/calendar/v3/freeBusy")
            .bearer_auth(&self.oauth_token)
            .json(&body)
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => r,
            _ => return degraded,
        };

        let Ok(parsed) = response.json::<FreeBusyResponse>().await else {
            return degraded;
        };

        let busy: Vec<Interval> = parsed
            .calendars
            .get(calendar_id)
            .map(|entry| {
                entry
                    .busy
                    .iter()
                    .map(|b| Interval::new(b.start, b.end))
                    .collect()
            })
            .unwrap_or_default();

        let free = free_from_busy(range, &busy);
        FreeBusy {
            free,
            busy,
            connected: true,
        }
    }

    #[instrument(skip(self, draft))]
    async fn create_event(&self, calendar_id: &str, draft: &EventDraft) -> Result<String, CalendarError> {
        let url = format!(
            "https://www.googleapis.com/calendar/v3/calendars/{calendar_id}/events"
        );
        let body = json!({
            "summary": draft.summary,
            "description": draft.description,
            "start": {"dateTime": draft.window.start.to_rfc3339()},
            "end": {"dateTime": draft.window.end.to_rfc3339()},
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.oauth_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| CalendarError::RequestFailed(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(CalendarError::Auth("calendar token rejected".to_string()));
        }
        if !response.status().is_success() {
            return Err(CalendarError::RequestFailed(format!(
                "create_event returned {}",
                response.status()
            )));
        }

        #[derive(Deserialize)]
        struct CreatedEvent {
            id: String,
        }
        let created: CreatedEvent = response
            .json()
            .await
            .map_err(|e| CalendarError::RequestFailed(e.to_string()))?;
        Ok(created.id)
    }

    #[instrument(skip(self, draft))]
    async fn update_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        draft: &EventDraft,
    ) -> Result<(), CalendarError> {
        let url = format!(
            "https://www.googleapis.com/calendar/v3/calendars/{calendar_id}/events/{event_id}"
        );
        let body = json!({
            "summary": draft.summary,
            "description": draft.description,
            "start": {"dateTime": draft.window.start.to_rfc3339()},
            "end": {"dateTime": draft.window.end.to_rfc3339()},
        });

        let response = self
            .client
            .patch(&url)
            .bearer_auth(&self.oauth_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| CalendarError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CalendarError::RequestFailed(format!(
                "update_event returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> Result<(), CalendarError> {
        let url = format!(
            "https://www.googleapis.com/calendar/v3/calendars/{calendar_id}/events/{event_id}"
        );
        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.oauth_token)
            .send()
            .await
            .map_err(|e| CalendarError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() && response.status() != reqwest::StatusCode::GONE {
            return Err(CalendarError::RequestFailed(format!(
                "delete_event returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_events(
        &self,
        calendar_id: &str,
        range: Interval,
        summary_prefix: &str,
    ) -> Result<Vec<(String, Interval)>, CalendarError> {
        let url = format!(
            "https://www.googleapis.com/calendar/v3/calendars/{calendar_id}/events"
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.oauth_token)
            .query(&[
                ("timeMin", range.start.to_rfc3339()),
                ("timeMax", range.end.to_rfc3339()),
            ])
            .send()
            .await
            .map_err(|e| CalendarError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CalendarError::RequestFailed(format!(
                "list_events returned {}",
                response.status()
            )));
        }

        #[derive(Deserialize)]
        struct ListedEvent {
            id: String,
            summary: Option<String>,
            start: EventTime,
            end: EventTime,
        }
        #[derive(Deserialize)]
        struct EventTime {
            #[serde(rename = "dateTime")]
            date_time: DateTime<Utc>,
        }
        #[derive(Deserialize)]
        struct ListResponse {
            #[serde(default)]
            items: Vec<ListedEvent>,
        }

        let parsed: ListResponse = response
            .json()
            .await
            .map_err(|e| CalendarError::RequestFailed(e.to_string()))?;

        Ok(parsed
            .items
            .into_iter()
            .filter(|e| e.summary.as_deref().is_some_and(|s| s.starts_with(summary_prefix)))
            .map(|e| (e.id, Interval::new(e.start.date_time, e.end.date_time)))
            .collect())
    }
}

/// Complement busy intervals within `range` to produce free intervals.
fn free_from_busy(range: Interval, busy: &[Interval]) -> Vec<Interval> {
    let mut sorted = busy.to_vec();
    sorted.sort_by_key(|b| b.start);

    let mut free = Vec::new();
    let mut cursor = range.start;
    for b in &sorted {
        if b.start > cursor {
            free.push(Interval::new(cursor, b.start.min(range.end)));
        }
        if b.end > cursor {
            cursor = b.end;
        }
        if cursor >= range.end {
            break;
        }
    }
    if cursor < range.end {
        free.push(Interval::new(cursor, range.end));
    }
    free
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn free_from_busy_fills_gaps() {
        let range = Interval::new(dt("2025-01-01T09:00:00Z"), dt("2025-01-01T11:00:00Z"));
        let busy = vec![Interval::new(
            dt("2025-01-01T09:30:00Z"),
            dt("2025-01-01T10:00:00Z"),
        )];
        let free = free_from_busy(range, &busy);
        assert_eq!(free.len(), 2);
        assert_eq!(free[0].start, dt("2025-01-01T09:00:00Z"));
        assert_eq!(free[0].end, dt("2025-01-01T09:30:00Z"));
        assert_eq!(free[1].start, dt("2025-01-01T10:00:00Z"));
        assert_eq!(free[1].end, dt("2025-01-01T11:00:00Z"));
    }

    #[test]
    fn free_from_busy_with_no_busy_returns_whole_range() {
        let range = Interval::new(dt("2025-01-01T09:00:00Z"), dt("2025-01-01T11:00:00Z"));
        let free = free_from_busy(range, &[]);
        assert_eq!(free.len(), 1);
        assert_eq!(free[0], range);
    }
}
