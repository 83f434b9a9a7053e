//! Prompt template loading: prompts are data, not code.
//!
//! Templates live as plain `.txt` files under a known directory, loaded once
//! at startup and addressed by name. Variable substitution is literal
//! `{{name}}` replacement — no conditionals, no control flow.

use std::collections::HashMap;
use std::path::Path;

/// In-memory registry of named prompt templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    templates: HashMap<String, String>,
}

impl TemplateStore {
    /// Load every `*.txt` file in `dir`; the file stem (without extension)
    /// becomes the template name.
    ///
    /// # Errors
    ///
    /// Returns an error if `dir` cannot be read.
    pub fn load_dir(dir: &Path) -> anyhow::Result<Self> {
        let mut templates = HashMap::new();
        for entry in std::fs::read_dir(dir)
            .map_err(|e| anyhow::anyhow!("failed to read prompts dir {}: {e}", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("txt") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("failed to read template {}: {e}", path.display()))?;
            templates.insert(name.to_string(), contents);
        }
        Ok(Self { templates })
    }

    /// Build a store directly from name/body pairs, bypassing the
    /// filesystem — used by tests and by callers embedding default
    /// templates.
    pub fn from_map(templates: HashMap<String, String>) -> Self {
        Self { templates }
    }

    /// Render `name` with `{{key}}` placeholders replaced by `variables[key]`.
    ///
    /// # Errors
    ///
    /// Returns an error if no template named `name` is registered.
    pub fn render(&self, name: &str, variables: &HashMap<&str, String>) -> anyhow::Result<String> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown prompt template: {name}"))?;
        let mut rendered = template.clone();
        for (key, value) in variables {
            rendered = rendered.replace(&format!("{{{{{key}}}}}"), value);
        }
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_literal_placeholders() {
        let mut templates = HashMap::new();
        templates.insert(
            "extract".to_string(),
            "User said: {{user_input}}\nTasks: {{existing_tasks_json}}".to_string(),
        );
        let store = TemplateStore::from_map(templates);

        let mut vars = HashMap::new();
        vars.insert("user_input", "learn rust".to_string());
        vars.insert("existing_tasks_json", "[]".to_string());

        let rendered = store.render("extract", &vars).unwrap();
        assert_eq!(rendered, "User said: learn rust\nTasks: []");
    }

    #[test]
    fn unknown_template_errors() {
        let store = TemplateStore::default();
        assert!(store.render("missing", &HashMap::new()).is_err());
    }
}
