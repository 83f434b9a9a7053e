#![allow(missing_docs)]

//! Genie binary entry point: wires configuration, starts tracing, loads
//! prompt templates, builds the component graph, and drives a small
//! line-oriented demo loop over `handle_utterance`. The HTTP surface that
//! would normally front this pipeline is out of scope here; this binary
//! exists to exercise the crate end to end.

use std::io::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use genie::calendar::{CalendarClient, GoogleCalendarClient};
use genie::config::Config;
use genie::extractor::IntentExtractor;
use genie::llm::{LlmClient, OllamaHttpProvider, TemplateStore};
use genie::pipeline::Genie;
use genie::planner::Planner;
use genie::research::{HttpResearchProvider, ResearchClient};
use genie::store::Store;

/// Default local Ollama endpoint.
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Default local model name.
const DEFAULT_OLLAMA_MODEL: &str = "llama3";

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    genie::logging::init_cli();

    info!("genie starting");

    let templates = TemplateStore::load_dir(&config.prompts_dir).context("failed to load prompt templates")?;

    let ollama_url = std::env::var("OLLAMA_URL").unwrap_or_else(|_| DEFAULT_OLLAMA_URL.to_string());
    let ollama_model = std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| DEFAULT_OLLAMA_MODEL.to_string());
    let llm_provider = Box::new(OllamaHttpProvider::new(ollama_url, ollama_model));
    let llm = Arc::new(LlmClient::new(llm_provider, templates, config.llm_deadline));

    let research_provider = Box::new(HttpResearchProvider::new(
        std::env::var("RESEARCH_ENDPOINT").unwrap_or_else(|_| "https://example.com/search".to_string()),
        config.research_api_key.clone(),
    ));
    let research = Arc::new(ResearchClient::new(research_provider, config.research_deadline));

    let calendar_token = std::env::var("CALENDAR_OAUTH_TOKEN").unwrap_or_default();
    let calendar: Arc<dyn CalendarClient> = Arc::new(GoogleCalendarClient::new(calendar_token));

    let store = Arc::new(
        Store::open(
            &config.storage_path,
            &config.backup_dir,
            config.auto_backup,
            config.backup_retention_days,
        )
        .await
        .context("failed to open store")?,
    );

    let extractor = Arc::new(IntentExtractor::new(llm.clone()));
    let planner = Arc::new(Planner::new(llm, research));

    let app = Genie::new(
        store,
        extractor,
        planner,
        calendar,
        config.default_calendar_id.clone(),
        config.event_summary_prefix.clone(),
        config.overall_deadline,
        config.calendar_deadline,
        config.max_concurrent_utterances,
    );

    run_demo_loop(&app).await
}

/// A minimal stdin/stdout REPL: each line is treated as one utterance from a
/// fixed demo user. Type `quit` to exit.
async fn run_demo_loop(app: &Genie) -> Result<()> {
    const DEMO_USER: &str = "demo";
    println!("genie ready. Type a task, or 'quit' to exit.");

    let mut input = String::new();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        input.clear();
        if std::io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let line = input.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("quit") {
            break;
        }

        let outcome = app.handle_utterance(DEMO_USER, line).await;
        for result in &outcome.applied {
            if result.ok {
                println!("ok: {:?}", result.task_id);
            } else {
                println!("error: {:?} {}", result.kind, result.message.as_deref().unwrap_or(""));
            }
        }
        println!("next up: {}", outcome.recommendation.reasoning);
        if outcome.timed_out {
            println!("(warning: response was partial, overall deadline exceeded)");
        }
    }

    Ok(())
}
