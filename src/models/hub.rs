//! Remote model hub client
//!
//! Search and file listing go straight to the hub's JSON API; download
//! URLs come from hf-hub so they follow its endpoint and revision rules.

use crate::models::catalog::has_model_extension;
use anyhow::{Context, Result};
use hf_hub::api::tokio::{Api, ApiBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Repositories checked for GGUF files per search
const MAX_VERIFY: usize = 12;

/// A downloadable file in a remote repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub name: String,
    pub size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    #[serde(default)]
    path: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

pub struct HubClient {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    api: Api,
}

impl HubClient {
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self> {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to build hub HTTP client")?;
        let api = ApiBuilder::new()
            .with_endpoint(endpoint.clone())
            .with_token(token.clone())
            .build()
            .context("Failed to create HF API client")?;

        Ok(Self {
            client,
            endpoint,
            token,
            api,
        })
    }

    /// Attach the bearer token, if configured
    pub fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .with_context(|| format!("Request to {url} failed"))?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// Search repositories, annotating each with `has_gguf` / `gguf_count`
    pub async fn search(&self, query: &str, limit: usize, only_gguf: bool) -> Result<Vec<Value>> {
        let mut request = self
            .client
            .get(format!("{}/api/models", self.endpoint))
            .query(&[("search", query), ("limit", &limit.to_string())]);
        if only_gguf {
            request = request.query(&[("filter", "gguf")]);
        }
        let raw: Vec<Value> = self
            .authorize(request)
            .send()
            .await
            .context("Hub search failed")?
            .error_for_status()?
            .json()
            .await?;

        let mut verified = 0;
        let mut results = Vec::with_capacity(raw.len());
        for mut item in raw {
            let Some(repo) = repo_id(&item) else {
                results.push(item);
                continue;
            };
            let hinted = has_gguf_hint(&item, &repo);

            let (has_gguf, count) = if verified < MAX_VERIFY {
                verified += 1;
                match self.list_files(&repo).await {
                    Ok(files) => {
                        let count = files.iter().filter(|f| is_gguf(&f.name)).count();
                        (Some(count > 0), Some(count))
                    }
                    Err(e) => {
                        tracing::debug!(
                            repo = %repo,
                            error = %e,
                            "Could not verify repository files"
                        );
                        (hinted.then_some(true), None)
                    }
                }
            } else {
                (hinted.then_some(true), None)
            };

            if let Some(map) = item.as_object_mut() {
                map.insert("has_gguf".into(), serde_json::json!(has_gguf));
                map.insert("gguf_count".into(), serde_json::json!(count));
            }
            results.push(item);
        }
        Ok(results)
    }

    /// Model files in a repository with their sizes
    ///
    /// Uses the tree listing, falling back to the repository's sibling list
    /// (which may lack sizes) when the tree is unavailable.
    pub async fn list_files(&self, repo: &str) -> Result<Vec<RemoteFile>> {
        let tree_url = format!("{}/api/models/{}/tree/main", self.endpoint, repo);
        let mut files = match self.get_json::<Vec<TreeEntry>>(&tree_url).await {
            Ok(entries) => entries
                .into_iter()
                .filter(|e| e.kind.as_deref() != Some("directory"))
                .filter(|e| has_model_extension(&e.path))
                .map(|e| RemoteFile {
                    name: e.path,
                    size: e.size,
                })
                .collect::<Vec<_>>(),
            Err(e) => {
                tracing::debug!(
                    repo = %repo,
                    error = %e,
                    "Tree listing failed, using repository info"
                );
                let info = self
                    .api
                    .model(repo.to_string())
                    .info()
                    .await
                    .with_context(|| format!("Failed to fetch repository info for {repo}"))?;
                info.siblings
                    .into_iter()
                    .filter(|s| has_model_extension(&s.rfilename))
                    .map(|s| RemoteFile {
                        name: s.rfilename,
                        size: None,
                    })
                    .collect()
            }
        };
        files.sort_by_key(|f| f.name.to_lowercase());
        Ok(files)
    }

    /// Direct download URL for a file on the main revision
    pub fn resolve_url(&self, repo: &str, file: &str) -> String {
        self.api.model(repo.to_string()).url(file)
    }
}

fn repo_id(item: &Value) -> Option<String> {
    item.get("modelId")
        .or_else(|| item.get("id"))
        .and_then(Value::as_str)
        .map(String::from)
}

fn is_gguf(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".gguf")
}

fn has_gguf_hint(item: &Value, repo: &str) -> bool {
    let tagged = item
        .get("tags")
        .and_then(Value::as_array)
        .is_some_and(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .any(|t| t.eq_ignore_ascii_case("gguf"))
        });
    tagged || repo.to_ascii_lowercase().contains("gguf")
}
