//! Research Client (C3): web-research query returning ranked resources.
//!
//! No direct grounding module exists in this codebase; authored in the same
//! external-HTTP-call idiom used for the calendar integration: one
//! `reqwest::Client`, one async trait, one HTTP-backed implementation, never
//! raising on upstream failure (research is never critical to the pipeline).

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

/// Kind of resource a research query can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A written article or blog post.
    Article,
    /// A video walkthrough.
    Video,
    /// A step-by-step tutorial.
    Tutorial,
    /// Reference documentation.
    Docs,
}

/// A single ranked resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    /// Display title.
    pub title: String,
    /// Link to the resource.
    pub url: String,
    /// What kind of resource this is.
    pub kind: ResourceKind,
    /// What aspect of the subtask this resource addresses.
    pub focus: String,
}

/// The seam a research provider implements.
#[async_trait]
pub trait ResearchProvider: Send + Sync {
    /// Search for up to `max_results` resources matching `query`.
    async fn search(&self, query: &str, max_results: usize) -> anyhow::Result<Vec<Resource>>;
}

/// HTTP-backed research client. `findResources` never propagates upstream
/// failure: it logs a warning and returns an empty list instead.
pub struct ResearchClient {
    provider: Box<dyn ResearchProvider>,
    deadline: std::time::Duration,
}

impl ResearchClient {
    /// Build a client over `provider`, bounding each search by `deadline`.
    pub fn new(provider: Box<dyn ResearchProvider>, deadline: std::time::Duration) -> Self {
        Self { provider, deadline }
    }

    /// `findResources(query, maxResults) -> [Resource]`.
    #[instrument(skip(self))]
    pub async fn find_resources(&self, query: &str, max_results: usize) -> Vec<Resource> {
        let result = tokio::time::timeout(self.deadline, self.provider.search(query, max_results)).await;

        let resources = match result {
            Ok(Ok(resources)) => resources,
            Ok(Err(e)) => {
                warn!(error = %e, query, "research query failed, returning empty result");
                return Vec::new();
            }
            Err(_) => {
                warn!(query, "research query timed out, returning empty result");
                return Vec::new();
            }
        };

        dedupe_by_url(resources).into_iter().take(max_results).collect()
    }
}

fn dedupe_by_url(resources: Vec<Resource>) -> Vec<Resource> {
    let mut seen = HashSet::new();
    resources
        .into_iter()
        .filter(|r| seen.insert(r.url.clone()))
        .collect()
}

/// A minimal HTTP provider hitting a generic search-style JSON API. Real
/// deployments supply the endpoint and key via configuration; the exact
/// upstream is an external collaborator outside this crate.
pub struct HttpResearchProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpResearchProvider {
    /// Build a provider targeting `endpoint`, authenticating with `api_key`
    /// when set.
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponseItem {
    title: String,
    url: String,
    #[serde(default)]
    kind: Option<ResourceKind>,
    #[serde(default)]
    focus: String,
}

#[async_trait]
impl ResearchProvider for HttpResearchProvider {
    async fn search(&self, query: &str, max_results: usize) -> anyhow::Result<Vec<Resource>> {
        let mut request = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("limit", &max_results.to_string())]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let items: Vec<SearchResponseItem> = request.send().await?.json().await?;
        Ok(items
            .into_iter()
            .map(|item| Resource {
                title: item.title,
                url: item.url,
                kind: item.kind.unwrap_or(ResourceKind::Article),
                focus: item.focus,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingProvider;

    #[async_trait]
    impl ResearchProvider for FailingProvider {
        async fn search(&self, _query: &str, _max_results: usize) -> anyhow::Result<Vec<Resource>> {
            Err(anyhow::anyhow!("upstream unreachable"))
        }
    }

    struct DuplicateUrlProvider;

    #[async_trait]
    impl ResearchProvider for DuplicateUrlProvider {
        async fn search(&self, _query: &str, _max_results: usize) -> anyhow::Result<Vec<Resource>> {
            Ok(vec![
                Resource {
                    title: "A".to_string(),
                    url: "https://example.com/x".to_string(),
                    kind: ResourceKind::Article,
                    focus: "intro".to_string(),
                },
                Resource {
                    title: "A duplicate".to_string(),
                    url: "https://example.com/x".to_string(),
                    kind: ResourceKind::Article,
                    focus: "intro again".to_string(),
                },
            ])
        }
    }

    #[tokio::test]
    async fn failure_returns_empty_list_not_error() {
        let client = ResearchClient::new(Box::new(FailingProvider), std::time::Duration::from_secs(1));
        let resources = client.find_resources("rust", 5).await;
        assert!(resources.is_empty());
    }

    #[tokio::test]
    async fn dedupes_by_url() {
        let client = ResearchClient::new(Box::new(DuplicateUrlProvider), std::time::Duration::from_secs(1));
        let resources = client.find_resources("rust", 5).await;
        assert_eq!(resources.len(), 1);
    }
}
