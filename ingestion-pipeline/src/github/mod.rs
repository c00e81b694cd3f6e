pub mod auth;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::debug;
use url::Url;

use common::error::AppError;

use auth::CredentialBroker;

pub(crate) const USER_AGENT: &str = concat!("repo-ingest/", env!("CARGO_PKG_VERSION"));
pub(crate) const ACCEPT_HEADER: (&str, &str) = ("Accept", "application/vnd.github+json");
pub(crate) const API_VERSION_HEADER: &str = "X-GitHub-Api-Version";
pub(crate) const API_VERSION: &str = "2022-11-28";

const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

#[derive(Debug, Clone, Deserialize)]
pub struct RepoMetadata {
    pub default_branch: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitTree {
    pub tree: Vec<TreeItem>,
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TreeItem {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl TreeItem {
    pub fn is_blob(&self) -> bool {
        self.kind == "blob"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitBlob {
    pub content: String,
    pub encoding: String,
}

impl GitBlob {
    /// Raw bytes of the blob. The host wraps base64 payloads with
    /// interleaved newlines, which must be stripped before decoding.
    pub fn decoded_bytes(&self) -> Result<Vec<u8>, AppError> {
        match self.encoding.as_str() {
            "base64" => {
                let compact: String = self
                    .content
                    .chars()
                    .filter(|c| !c.is_whitespace())
                    .collect();
                STANDARD.decode(compact).map_err(|e| {
                    AppError::Processing(format!("invalid base64 blob payload: {e}"))
                })
            }
            "utf-8" => Ok(self.content.clone().into_bytes()),
            other => Err(AppError::Processing(format!(
                "unsupported blob encoding: {other}"
            ))),
        }
    }
}

/// Read-only client for the code-host content API.
pub struct GithubClient {
    http: reqwest::Client,
    api_base: String,
    broker: CredentialBroker,
}

impl GithubClient {
    pub fn new(api_base: String, broker: CredentialBroker) -> Result<Self, AppError> {
        let http = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            http,
            api_base,
            broker,
        })
    }

    pub async fn get_repo(&self, owner: &str, repo: &str) -> Result<RepoMetadata, AppError> {
        let url = format!("{}/repos/{owner}/{repo}", self.api_base);
        self.request_json(owner, repo, &url).await
    }

    /// Fetches the full recursive tree for the given reference.
    pub async fn get_tree(
        &self,
        owner: &str,
        repo: &str,
        ref_name: &str,
    ) -> Result<GitTree, AppError> {
        let url = format!(
            "{}/repos/{owner}/{repo}/git/trees/{ref_name}?recursive=1",
            self.api_base
        );
        self.request_json(owner, repo, &url).await
    }

    pub async fn get_blob(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> Result<GitBlob, AppError> {
        let url = format!("{}/repos/{owner}/{repo}/git/blobs/{sha}", self.api_base);
        self.request_json(owner, repo, &url).await
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        owner: &str,
        repo: &str,
        url: &str,
    ) -> Result<T, AppError> {
        let mut request = self
            .http
            .get(url)
            .header(ACCEPT_HEADER.0, ACCEPT_HEADER.1)
            .header(API_VERSION_HEADER, API_VERSION);

        if let Some(token) = self.broker.bearer_token(owner, repo).await? {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response.json().await?);
        }

        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        debug!(%url, status = status.as_u16(), "host API request failed");

        Err(classify_failure(status, &headers, body))
    }
}

/// An exhausted primary quota answers 403 with a zeroed remaining-quota
/// header; every other non-success status is a plain host API error.
fn classify_failure(
    status: reqwest::StatusCode,
    headers: &reqwest::header::HeaderMap,
    body: String,
) -> AppError {
    let rate_limited = status.as_u16() == 403
        && headers
            .get(RATE_LIMIT_REMAINING_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "0");

    if rate_limited {
        return AppError::RateLimit(
            "GitHub API rate limit exhausted; configure github_token or GitHub App credentials"
                .into(),
        );
    }

    AppError::HostApi {
        status: status.as_u16(),
        message: body,
    }
}

/// Extracts `(owner, repo)` from a repository URL, tolerating trailing
/// slashes, extra path segments, and a `.git` suffix.
pub fn parse_repo_url(repo_url: &str) -> Result<(String, String), AppError> {
    let parsed = Url::parse(repo_url)
        .map_err(|e| AppError::Validation(format!("invalid repository URL '{repo_url}': {e}")))?;

    let mut segments = parsed
        .path_segments()
        .ok_or_else(|| {
            AppError::Validation(format!("repository URL '{repo_url}' has no path"))
        })?
        .filter(|s| !s.is_empty());

    let owner = segments.next().ok_or_else(|| {
        AppError::Validation(format!("repository URL '{repo_url}' is missing the owner"))
    })?;
    let repo = segments.next().ok_or_else(|| {
        AppError::Validation(format!(
            "repository URL '{repo_url}' is missing the repository name"
        ))
    })?;

    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    if owner.is_empty() || repo.is_empty() {
        return Err(AppError::Validation(format!(
            "repository URL '{repo_url}' is missing owner or repository name"
        )));
    }

    Ok((owner.to_string(), repo.to_string()))
}
