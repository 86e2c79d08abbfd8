//! GitHub code-host adapter (REST v3).

use chrono::{DateTime, Utc};
use serde_json::Value;

use fl_domain::{Error, Result};

use crate::adapter::{
    http_client, status_err, transport_err, CodeAdapter, CodeMatch, CommitInfo, Credentials,
    RepoInfo,
};

const DEFAULT_BASE: &str = "https://api.github.com";

pub struct GithubAdapter {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl GithubAdapter {
    pub fn new(creds: &Credentials) -> Result<Self> {
        let token = creds
            .token
            .clone()
            .ok_or_else(|| Error::Config("github credentials missing token".into()))?;
        Ok(Self {
            base_url: creds
                .base_url
                .as_deref()
                .unwrap_or(DEFAULT_BASE)
                .trim_end_matches('/')
                .to_string(),
            token,
            client: http_client()?,
        })
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(query)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "faultline")
            .send()
            .await
            .map_err(|e| transport_err("github", e))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| transport_err("github", e))?;
        if !status.is_success() {
            return Err(status_err("github", status, &body));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait::async_trait]
impl CodeAdapter for GithubAdapter {
    async fn list_repos(&self) -> Result<Vec<RepoInfo>> {
        let v = self
            .get_json("/user/repos", &[("per_page", "100".to_string())])
            .await?;
        let repos = v
            .as_array()
            .ok_or_else(|| Error::Http("github: expected repo array".into()))?;
        Ok(repos
            .iter()
            .filter_map(|r| {
                Some(RepoInfo {
                    full_name: r.get("full_name")?.as_str()?.to_string(),
                    default_branch: r
                        .get("default_branch")
                        .and_then(|b| b.as_str())
                        .unwrap_or("main")
                        .to_string(),
                })
            })
            .collect())
    }

    async fn read_file(&self, repo: &str, path: &str, reference: Option<&str>) -> Result<String> {
        let mut query = Vec::new();
        if let Some(r) = reference {
            query.push(("ref", r.to_string()));
        }
        let v = self
            .get_json(&format!("/repos/{repo}/contents/{path}"), &query)
            .await?;

        let encoded = v
            .get("content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| Error::Http("github: file has no content".into()))?;
        decode_base64(encoded)
    }

    async fn search(&self, repo: Option<&str>, text: &str) -> Result<Vec<CodeMatch>> {
        let q = match repo {
            Some(r) => format!("{text} repo:{r}"),
            None => text.to_string(),
        };
        let v = self
            .get_json("/search/code", &[("q", q), ("per_page", "30".to_string())])
            .await?;
        let items = v
            .get("items")
            .and_then(|i| i.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(items
            .iter()
            .filter_map(|item| {
                Some(CodeMatch {
                    repo: item.pointer("/repository/full_name")?.as_str()?.to_string(),
                    path: item.get("path")?.as_str()?.to_string(),
                    snippet: None,
                })
            })
            .collect())
    }

    async fn list_commits(
        &self,
        repo: &str,
        branch: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CommitInfo>> {
        let mut query = vec![("per_page", limit.clamp(1, 100).to_string())];
        if let Some(b) = branch {
            query.push(("sha", b.to_string()));
        }
        let v = self.get_json(&format!("/repos/{repo}/commits"), &query).await?;
        let commits = v
            .as_array()
            .ok_or_else(|| Error::Http("github: expected commit array".into()))?;
        Ok(commits.iter().filter_map(parse_commit).collect())
    }
}

fn parse_commit(v: &Value) -> Option<CommitInfo> {
    let sha = v.get("sha")?.as_str()?.to_string();
    let commit = v.get("commit")?;
    let author = commit
        .pointer("/author/name")
        .and_then(|a| a.as_str())
        .unwrap_or("unknown")
        .to_string();
    let message = commit
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .lines()
        .next()
        .unwrap_or_default()
        .to_string();
    let timestamp = commit
        .pointer("/author/date")
        .and_then(|d| d.as_str())
        .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
        .map(|d| d.with_timezone(&Utc));
    Some(CommitInfo {
        sha,
        author,
        message,
        timestamp,
    })
}

/// Decode GitHub's newline-wrapped base64 content payloads.
fn decode_base64(encoded: &str) -> Result<String> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    let compact: String = encoded
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let bytes = STANDARD
        .decode(compact)
        .map_err(|_| Error::Http("github: invalid base64 content".into()))?;
    String::from_utf8(bytes).map_err(|_| Error::Http("github: file is not valid UTF-8".into()))
}
