//! Intent Extractor (C5): utterance + task graph -> ordered list of typed
//! actions.
//!
//! Grounded on the parse-then-validate-against-an-explicit-schema
//! discipline already used for plan-step validation elsewhere in this
//! codebase (structure reused, domain narrowed from an open tool catalog to
//! the eight fixed action kinds in [`crate::types::Action`]).

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::llm::LlmClient;
use crate::types::{Action, NewSubtask, Task, TargetRef, TaskPatch};

/// Raw action shape as produced by the LLM, before target resolution.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RawAction {
    Add {
        heading: String,
        details: Option<String>,
        deadline: Option<chrono::DateTime<chrono::Utc>>,
        priority: Option<String>,
    },
    Edit {
        target: RawTarget,
        #[serde(default)]
        patch: TaskPatch,
    },
    MarkDone {
        target: RawTarget,
    },
    Reschedule {
        target: RawTarget,
        deadline: chrono::DateTime<chrono::Utc>,
    },
    AddSubtask {
        target: RawTarget,
        subtask: NewSubtask,
    },
    Delete {
        target: RawTarget,
    },
    QueryProgress,
    QueryNext,
}

/// A target reference as the LLM names it: an id, a heading string, or the
/// literal `"last_task"`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawTarget {
    /// Target identified by its UUID.
    Id(Uuid),
    /// Target identified by its heading string.
    Name(String),
}

/// Resolve `target` against the current task list, in order: exact id,
/// case-insensitive heading equality, unique case-insensitive substring,
/// `"last_task"`.
pub fn resolve_target(tasks: &[Task], target: &RawTarget) -> Option<Uuid> {
    match target {
        RawTarget::Id(id) => tasks.iter().find(|t| &t.id == id).map(|t| t.id),
        RawTarget::Name(name) => {
            if name.eq_ignore_ascii_case("last_task") {
                return tasks.iter().max_by_key(|t| t.created_at).map(|t| t.id);
            }
            let lower = name.to_lowercase();
            if let Some(t) = tasks.iter().find(|t| t.heading.to_lowercase() == lower) {
                return Some(t.id);
            }
            let matches: Vec<&Task> = tasks
                .iter()
                .filter(|t| t.heading.to_lowercase().contains(&lower))
                .collect();
            if matches.len() == 1 {
                return Some(matches[0].id);
            }
            None
        }
    }
}

/// Parses and validates one LLM-produced action array into typed,
/// target-resolved [`Action`]s. Unknown kinds and malformed actions are
/// dropped with a warning; ambiguous targets are dropped with a warning.
pub struct IntentExtractor {
    llm: std::sync::Arc<LlmClient>,
}

impl IntentExtractor {
    /// Build an extractor backed by the given LLM client.
    pub fn new(llm: std::sync::Arc<LlmClient>) -> Self {
        Self { llm }
    }

    /// Extract actions from `utterance` given the user's current `tasks`.
    /// On total parse failure, falls back to a single `add` action carrying
    /// the raw utterance, so the user's input is never lost.
    pub async fn extract(&self, utterance: &str, tasks: &[Task]) -> Vec<Action> {
        let task_graph_json = serde_json::to_string(
            &tasks
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "id": t.id,
                        "heading": t.heading,
                        "status": t.status,
                        "deadline": t.deadline,
                        "subtasks": t.subtasks.iter().map(|s| serde_json::json!({
                            "id": s.id, "status": s.status,
                        })).collect::<Vec<_>>(),
                    })
                })
                .collect::<Vec<_>>(),
        )
        .unwrap_or_else(|_| "[]".to_string());

        let mut variables = HashMap::new();
        variables.insert("existing_tasks_json", task_graph_json);
        variables.insert("user_input", utterance.to_string());

        let raw_text = match self.llm.complete("extract_intent", &variables).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "intent extraction LLM call failed, falling back to raw add");
                return vec![fallback_add(utterance)];
            }
        };

        let raw_actions: Vec<Value> = match serde_json::from_str(&raw_text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "LLM output did not parse as a JSON array, falling back to raw add");
                return vec![fallback_add(utterance)];
            }
        };

        let mut actions = Vec::new();
        for raw in raw_actions {
            match serde_json::from_value::<RawAction>(raw.clone()) {
                Ok(parsed) => match resolve_action(parsed, tasks) {
                    Some(action) => actions.push(action),
                    None => warn!(raw = %raw, "dropping action with ambiguous or unresolved target"),
                },
                Err(e) => warn!(error = %e, raw = %raw, "dropping malformed action"),
            }
        }

        if actions.is_empty() && raw_actions_were_nonempty(&raw_text) {
            return vec![fallback_add(utterance)];
        }

        actions
    }
}

fn raw_actions_were_nonempty(raw_text: &str) -> bool {
    serde_json::from_str::<Vec<Value>>(raw_text)
        .map(|v| !v.is_empty())
        .unwrap_or(false)
}

fn fallback_add(utterance: &str) -> Action {
    Action::Add {
        heading: utterance.to_string(),
        details: Some(utterance.to_string()),
        deadline: None,
        priority: None,
    }
}

fn resolve_action(raw: RawAction, tasks: &[Task]) -> Option<Action> {
    match raw {
        RawAction::Add {
            heading,
            details,
            deadline,
            priority,
        } => Some(Action::Add {
            heading,
            details,
            deadline,
            priority,
        }),
        RawAction::Edit { target, patch } => resolve_target(tasks, &target).map(|id| Action::Edit {
            target: TargetRef::Id(id),
            patch,
        }),
        RawAction::MarkDone { target } => {
            resolve_target(tasks, &target).map(|id| Action::MarkDone {
                target: TargetRef::Id(id),
            })
        }
        RawAction::Reschedule { target, deadline } => {
            resolve_target(tasks, &target).map(|id| Action::Reschedule {
                target: TargetRef::Id(id),
                deadline,
            })
        }
        RawAction::AddSubtask { target, subtask } => {
            resolve_target(tasks, &target).map(|id| Action::AddSubtask {
                target: TargetRef::Id(id),
                subtask,
            })
        }
        RawAction::Delete { target } => resolve_target(tasks, &target).map(|id| Action::Delete {
            target: TargetRef::Id(id),
        }),
        RawAction::QueryProgress => Some(Action::QueryProgress),
        RawAction::QueryNext => Some(Action::QueryNext),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Task;

    fn tasks_fixture() -> Vec<Task> {
        vec![Task::new("Learn Rust", ""), Task::new("Buy groceries", "")]
    }

    #[test]
    fn resolves_exact_heading_case_insensitive() {
        let tasks = tasks_fixture();
        let target = RawTarget::Name("learn rust".to_string());
        assert_eq!(resolve_target(&tasks, &target), Some(tasks[0].id));
    }

    #[test]
    fn resolves_unique_substring() {
        let tasks = tasks_fixture();
        let target = RawTarget::Name("rust".to_string());
        assert_eq!(resolve_target(&tasks, &target), Some(tasks[0].id));
    }

    #[test]
    fn ambiguous_substring_resolves_to_none() {
        let mut tasks = tasks_fixture();
        tasks.push(Task::new("Learn Python", ""));
        let target = RawTarget::Name("learn".to_string());
        assert_eq!(resolve_target(&tasks, &target), None);
    }

    #[test]
    fn last_task_resolves_to_most_recently_created() {
        let tasks = tasks_fixture();
        let target = RawTarget::Name("last_task".to_string());
        assert_eq!(resolve_target(&tasks, &target), Some(tasks[1].id));
    }

    #[test]
    fn fallback_add_preserves_raw_utterance() {
        let action = fallback_add("write blog post about caching");
        match action {
            Action::Add { heading, details, .. } => {
                assert_eq!(heading, "write blog post about caching");
                assert_eq!(details.as_deref(), Some("write blog post about caching"));
            }
            _ => panic!("expected Add action"),
        }
    }
}
