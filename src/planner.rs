//! Planner (C6): decomposes a task into 2-5 short subtasks with resources
//! and time estimates.
//!
//! Grounded directly on this codebase's existing planner module: prompt
//! composition from a context struct, strip-reasoning-tags-then-parse, a
//! structured error enum, and the validate/retry-once/hard-fallback shape —
//! domain-adapted from a tool-call plan to a subtask breakdown, with a
//! research-resource-enrichment pass appended after a successful parse.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use crate::llm::LlmClient;
use crate::research::ResearchClient;
use crate::types::{Preferences, Subtask, Task};

/// Inclusive bounds on a planned subtask's time estimate, in minutes.
const MIN_SUBTASK_MINUTES: u32 = 15;
const MAX_SUBTASK_MINUTES: u32 = 30;
const MIN_SUBTASKS: usize = 2;
const MAX_SUBTASKS: usize = 5;

/// Errors raised while planning; all are handled internally by `Planner::plan`
/// (retry once, then the final fallback subtask), so this type is not part
/// of the public pipeline error surface.
#[derive(Debug, thiserror::Error)]
enum PlannerError {
    #[error("invalid plan format: {0}")]
    InvalidFormat(String),
    #[error("plan failed validation: {0}")]
    ValidationFailed(String),
    #[error("inference error: {0}")]
    Inference(String),
}

#[derive(Debug, Deserialize)]
struct RawPlannedSubtask {
    heading: String,
    details: Option<String>,
    time_estimate_minutes: u32,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    subtasks: Vec<RawPlannedSubtask>,
}

/// Decomposes newly-created tasks into short, ordered subtasks.
pub struct Planner {
    llm: Arc<LlmClient>,
    research: Arc<ResearchClient>,
}

impl Planner {
    /// Build a planner backed by the given LLM and research clients.
    pub fn new(llm: Arc<LlmClient>, research: Arc<ResearchClient>) -> Self {
        Self { llm, research }
    }

    /// Produce between 2 and 5 subtasks for `task`, each with a research
    /// resource attached where available. Never fails: on repeated invalid
    /// output it returns the single-subtask fallback.
    pub async fn plan(&self, task: &Task, preferences: &Preferences) -> Vec<Subtask> {
        match self.plan_once(task, preferences, false).await {
            Ok(subtasks) => return self.enrich(subtasks).await,
            Err(e) => warn!(error = %e, task = %task.heading, "planner first attempt failed, retrying"),
        }

        match self.plan_once(task, preferences, true).await {
            Ok(subtasks) => self.enrich(subtasks).await,
            Err(e) => {
                warn!(error = %e, task = %task.heading, "planner second attempt failed, using fallback subtask");
                vec![fallback_subtask(task)]
            }
        }
    }

    async fn plan_once(
        &self,
        task: &Task,
        preferences: &Preferences,
        clarify: bool,
    ) -> Result<Vec<Subtask>, PlannerError> {
        let task_json = serde_json::to_string(&serde_json::json!({
            "heading": task.heading,
            "details": task.details,
            "deadline": task.deadline,
        }))
        .map_err(|e| PlannerError::InvalidFormat(e.to_string()))?;
        let preferences_json =
            serde_json::to_string(preferences).map_err(|e| PlannerError::InvalidFormat(e.to_string()))?;

        let mut variables = HashMap::new();
        variables.insert("task_json", task_json);
        variables.insert("preferences_json", preferences_json);
        let template = if clarify {
            "plan_breakdown_retry"
        } else {
            "plan_breakdown"
        };

        let raw_text = self
            .llm
            .complete(template, &variables)
            .await
            .map_err(|e| PlannerError::Inference(e.to_string()))?;

        let raw_plan: RawPlan =
            serde_json::from_str(&raw_text).map_err(|e| PlannerError::InvalidFormat(e.to_string()))?;

        validate_plan(&raw_plan)?;

        Ok(raw_plan
            .subtasks
            .into_iter()
            .map(|s| {
                let mut subtask = Subtask::new(s.heading, s.details.unwrap_or_default());
                subtask.time_estimate_minutes = Some(s.time_estimate_minutes);
                subtask
            })
            .collect())
    }

    async fn enrich(&self, mut subtasks: Vec<Subtask>) -> Vec<Subtask> {
        for subtask in &mut subtasks {
            let resources = self.research.find_resources(&subtask.heading, 1).await;
            if let Some(resource) = resources.into_iter().next() {
                subtask.resource_link = Some(resource.url);
            }
        }
        subtasks
    }
}

fn validate_plan(plan: &RawPlan) -> Result<(), PlannerError> {
    if !(MIN_SUBTASKS..=MAX_SUBTASKS).contains(&plan.subtasks.len()) {
        return Err(PlannerError::ValidationFailed(format!(
            "expected {MIN_SUBTASKS}-{MAX_SUBTASKS} subtasks, got {}",
            plan.subtasks.len()
        )));
    }
    for subtask in &plan.subtasks {
        if subtask.heading.trim().is_empty() {
            return Err(PlannerError::ValidationFailed("empty subtask heading".to_string()));
        }
        if !(MIN_SUBTASK_MINUTES..=MAX_SUBTASK_MINUTES).contains(&subtask.time_estimate_minutes) {
            return Err(PlannerError::ValidationFailed(format!(
                "subtask '{}' estimate {} out of [{MIN_SUBTASK_MINUTES}, {MAX_SUBTASK_MINUTES}]",
                subtask.heading, subtask.time_estimate_minutes
            )));
        }
    }
    Ok(())
}

fn fallback_subtask(task: &Task) -> Subtask {
    let mut subtask = Subtask::new(task.heading.clone(), task.details.clone());
    subtask.time_estimate_minutes = Some(MAX_SUBTASK_MINUTES);
    subtask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_plan_rejects_too_few_subtasks() {
        let plan = RawPlan {
            subtasks: vec![RawPlannedSubtask {
                heading: "only one".to_string(),
                details: None,
                time_estimate_minutes: 20,
            }],
        };
        assert!(validate_plan(&plan).is_err());
    }

    #[test]
    fn validate_plan_rejects_out_of_range_estimate() {
        let plan = RawPlan {
            subtasks: vec![
                RawPlannedSubtask {
                    heading: "a".to_string(),
                    details: None,
                    time_estimate_minutes: 45,
                },
                RawPlannedSubtask {
                    heading: "b".to_string(),
                    details: None,
                    time_estimate_minutes: 20,
                },
            ],
        };
        assert!(validate_plan(&plan).is_err());
    }

    #[test]
    fn validate_plan_accepts_well_formed_plan() {
        let plan = RawPlan {
            subtasks: vec![
                RawPlannedSubtask {
                    heading: "design outline".to_string(),
                    details: None,
                    time_estimate_minutes: 20,
                },
                RawPlannedSubtask {
                    heading: "write draft".to_string(),
                    details: None,
                    time_estimate_minutes: 30,
                },
            ],
        };
        assert!(validate_plan(&plan).is_ok());
    }

    #[test]
    fn fallback_subtask_matches_task_heading_and_caps_at_thirty_minutes() {
        let task = Task::new("Learn Python", "finish the book");
        let subtask = fallback_subtask(&task);
        assert_eq!(subtask.heading, "Learn Python");
        assert_eq!(subtask.time_estimate_minutes, Some(30));
    }
}
