#![forbid(unsafe_code)]

//! GitHub REST API loader: resolves the ref to a commit, lists the tree
//! once, then fetches each blob on demand. Fetches are independent, so the
//! pipeline issues them from its worker pool.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{FetchError, PipelineError};
use crate::retry::RetryPolicy;
use crate::source::{FileFilter, LoadItem, SourceLoader, skipped};

pub const DEFAULT_API_BASE: &str = "https://api.github.com";

#[derive(Debug, Deserialize)]
struct CommitResponse {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    sha: String,
    #[serde(default)]
    size: Option<u64>,
}

pub struct GitHubLoader {
    agent: ureq::Agent,
    api_base: String,
    owner: String,
    repo: String,
    git_ref: Option<String>,
    token: Option<String>,
    retry: RetryPolicy,
    filter: FileFilter,
    max_file_size: u64,
    commit: Option<String>,
    entries: HashMap<String, TreeEntry>,
}

impl std::fmt::Debug for GitHubLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubLoader")
            .field("api_base", &self.api_base)
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("git_ref", &self.git_ref)
            .field("commit", &self.commit)
            .finish_non_exhaustive()
    }
}

impl GitHubLoader {
    pub fn new(
        owner: &str,
        repo: &str,
        git_ref: Option<String>,
        token: Option<String>,
        config: &PipelineConfig,
        filter: FileFilter,
    ) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.http_timeout_secs)))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            agent,
            api_base: DEFAULT_API_BASE.to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            git_ref,
            token,
            retry: RetryPolicy::for_fetch(config),
            filter,
            max_file_size: config.max_file_size,
            commit: None,
            entries: HashMap::new(),
        }
    }

    /// Points the loader at a GitHub Enterprise API root.
    #[must_use]
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn repo_url(&self, suffix: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.api_base, self.owner, self.repo, suffix
        )
    }

    fn resolve_commit(&self) -> Result<String, FetchError> {
        let git_ref = self.git_ref.as_deref().unwrap_or("HEAD");
        let url = self.repo_url(&format!("commits/{git_ref}"));
        let commit: CommitResponse = self.get_json(&url, git_ref)?;
        Ok(commit.sha)
    }

    fn list_tree(&self, commit: &str) -> Result<Vec<TreeEntry>, FetchError> {
        let url = self.repo_url(&format!("git/trees/{commit}?recursive=1"));
        let tree: TreeResponse = self.get_json(&url, "<tree>")?;
        if tree.truncated {
            warn!(
                repo = %self.describe(),
                "tree listing truncated by the host; some files will be missing"
            );
        }
        Ok(tree
            .tree
            .into_iter()
            .filter(|entry| entry.kind == "blob")
            .collect())
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        label: &str,
    ) -> Result<T, FetchError> {
        self.with_retry(label, |_| {
            let mut response = self
                .request(url)
                .header("Accept", "application/vnd.github+json")
                .call()
                .map_err(|err| FetchError::transport(label, err))?;
            check_status(label, &response)?;
            response
                .body_mut()
                .read_json::<T>()
                .map_err(|err| FetchError::transport(label, err))
        })
    }

    fn fetch_blob(&self, entry: &TreeEntry) -> Result<Vec<u8>, FetchError> {
        let url = self.repo_url(&format!("git/blobs/{}", entry.sha));
        self.with_retry(&entry.path, |_| {
            let mut response = self
                .request(&url)
                .header("Accept", "application/vnd.github.raw")
                .call()
                .map_err(|err| FetchError::transport(&entry.path, err))?;
            check_status(&entry.path, &response)?;
            response
                .body_mut()
                .with_config()
                .limit(self.max_file_size.saturating_add(1))
                .read_to_vec()
                .map_err(|err| FetchError::transport(&entry.path, err))
        })
    }

    fn request(&self, url: &str) -> ureq::RequestBuilder<ureq::typestate::WithoutBody> {
        let mut builder = self
            .agent
            .get(url)
            .header("User-Agent", concat!("repograph/", env!("CARGO_PKG_VERSION")))
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &self.token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        builder
    }

    fn with_retry<T>(
        &self,
        label: &str,
        op: impl FnMut(u32) -> Result<T, FetchError>,
    ) -> Result<T, FetchError> {
        self.retry.run(
            op,
            |err: &FetchError| err.retryable.then_some(err.retry_after),
            |attempt, delay, err| {
                warn!(
                    path = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying fetch"
                );
            },
        )
    }
}

impl SourceLoader for GitHubLoader {
    fn describe(&self) -> String {
        match &self.git_ref {
            Some(git_ref) => format!("github.com/{}/{}@{git_ref}", self.owner, self.repo),
            None => format!("github.com/{}/{}", self.owner, self.repo),
        }
    }

    fn snapshot(&self) -> Option<String> {
        self.commit.clone()
    }

    fn candidates(&mut self) -> Result<Vec<String>, PipelineError> {
        let commit = self.resolve_commit()?;
        let entries = self.list_tree(&commit)?;
        info!(repo = %self.describe(), commit = %commit, blobs = entries.len(), "listed remote tree");
        self.commit = Some(commit);

        self.entries = entries
            .into_iter()
            .filter(|entry| self.filter.is_candidate(&entry.path))
            .map(|entry| (entry.path.clone(), entry))
            .collect();
        let mut paths: Vec<String> = self.entries.keys().cloned().collect();
        paths.sort();
        debug!(candidates = paths.len(), "remote candidates after filtering");
        Ok(paths)
    }

    fn load(&self, path: &str) -> LoadItem {
        let Some(entry) = self.entries.get(path) else {
            return LoadItem::Failed(FetchError {
                path: path.to_string(),
                status: None,
                message: "path is not in the listed tree".to_string(),
                retryable: false,
                retry_after: None,
            });
        };
        if let Some(reason) = self.filter.precheck(&entry.path, entry.size.unwrap_or(0)) {
            return skipped(&entry.path, reason);
        }
        match self.fetch_blob(entry) {
            Ok(bytes) => self.filter.classify(&entry.path, bytes),
            Err(err) => {
                warn!(path = %entry.path, error = %err, "giving up on file");
                LoadItem::Failed(err)
            }
        }
    }
}

fn check_status(path: &str, response: &ureq::http::Response<ureq::Body>) -> Result<(), FetchError> {
    let status = response.status().as_u16();
    if (200..300).contains(&status) {
        return Ok(());
    }
    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let retry_after = rate_limit_delay(
        header("retry-after").as_deref(),
        header("x-ratelimit-remaining").as_deref(),
        header("x-ratelimit-reset").as_deref(),
        now_secs(),
    );
    Err(FetchError {
        path: path.to_string(),
        status: Some(status),
        message: format!("HTTP {status}"),
        retryable: is_retryable_status(status, retry_after.is_some()),
        retry_after,
    })
}

/// 5xx and 429 are transient; 403 only when the host says we are rate
/// limited.
fn is_retryable_status(status: u16, rate_limited: bool) -> bool {
    status == 429 || status >= 500 || (status == 403 && rate_limited)
}

/// Delay requested by the host, from `Retry-After` seconds or an exhausted
/// rate-limit window.
fn rate_limit_delay(
    retry_after: Option<&str>,
    remaining: Option<&str>,
    reset: Option<&str>,
    now: u64,
) -> Option<Duration> {
    if let Some(secs) = retry_after.and_then(|v| v.trim().parse::<u64>().ok()) {
        return Some(Duration::from_secs(secs));
    }
    if remaining.map(str::trim) == Some("0") {
        let reset_at = reset.and_then(|v| v.trim().parse::<u64>().ok())?;
        return Some(Duration::from_secs(reset_at.saturating_sub(now)));
    }
    None
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_header_wins() {
        assert_eq!(
            rate_limit_delay(Some("7"), Some("0"), Some("2000"), 1000),
            Some(Duration::from_secs(7))
        );
    }

    #[test]
    fn exhausted_window_waits_until_reset() {
        assert_eq!(
            rate_limit_delay(None, Some("0"), Some("1030"), 1000),
            Some(Duration::from_secs(30))
        );
        assert_eq!(rate_limit_delay(None, Some("12"), Some("1030"), 1000), None);
    }

    #[test]
    fn status_classification() {
        assert!(is_retryable_status(502, false));
        assert!(is_retryable_status(429, false));
        assert!(is_retryable_status(403, true));
        assert!(!is_retryable_status(403, false));
        assert!(!is_retryable_status(404, false));
    }

    #[test]
    fn tree_response_keeps_blob_metadata() {
        let raw = r#"{"sha":"abc","tree":[
            {"path":"a.py","type":"blob","sha":"1","size":10},
            {"path":"pkg","type":"tree","sha":"2"}
        ],"truncated":false}"#;
        let tree: TreeResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(tree.tree.len(), 2);
        assert_eq!(tree.tree[0].size, Some(10));
        assert_eq!(tree.tree[1].size, None);
        assert!(!tree.truncated);
    }

    #[test]
    fn describe_includes_ref() {
        let config = PipelineConfig::default();
        let loader = GitHubLoader::new(
            "acme",
            "widgets",
            Some("main".into()),
            None,
            &config,
            FileFilter::new(&config).unwrap(),
        );
        assert_eq!(loader.describe(), "github.com/acme/widgets@main");
        assert_eq!(
            loader.repo_url("commits/main"),
            "https://api.github.com/repos/acme/widgets/commits/main"
        );
    }
}
