use crate::constants::GITHUB_API_BASE;
use crate::types::{FileChange, PatchflowError, RepoRef, Result};
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    pub sha: String,
    pub url: Option<String>,
}

/// Commits a set of full-content file writes onto a branch.
#[async_trait]
pub trait RepositoryApply: Send + Sync {
    async fn apply(
        &self,
        repo: &RepoRef,
        branch: &str,
        commit_message: &str,
        files: &[FileChange],
    ) -> Result<CommitRef>;
}

/// File listing used to guess deploy roots.
#[async_trait]
pub trait RepositoryMetadataSource: Send + Sync {
    async fn list_paths(&self, repo: &RepoRef, branch: &str) -> Result<Vec<String>>;
}

const NOT_FOUND: u16 = 404;

/// GitHub REST client using the git data API (refs, trees, commits), so a
/// multi-file change lands as one commit.
pub struct GitHubClient {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl GitHubClient {
    pub fn new(client: reqwest::Client, token: impl Into<String>) -> Self {
        Self {
            client,
            token: token.into(),
            base_url: GITHUB_API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Returns `(status, json)`; only transport failures are `Err`.
    async fn api_json(&self, method: Method, path: &str, body: Option<&Value>) -> Result<(u16, Value)> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("[⚙️  -> 🐙] {} {}", method, url);
        let mut builder = self
            .client
            .request(method, &url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder.send().await.map_err(PatchflowError::Network)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(PatchflowError::Network)?;
        let value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok((status, value))
    }

    async fn api_ok(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let (status, value) = self.api_json(method, path, body).await?;
        if (200..300).contains(&status) {
            Ok(value)
        } else {
            Err(api_error(status, &value).into())
        }
    }

    async fn branch_head(&self, repo: &RepoRef, branch: &str) -> Result<Option<String>> {
        let (status, value) = self
            .api_json(
                Method::GET,
                &format!("/repos/{}/git/ref/heads/{}", repo, branch),
                None,
            )
            .await?;
        match status {
            NOT_FOUND => Ok(None),
            s if (200..300).contains(&s) => Ok(Some(required_str(&value, "/object/sha")?)),
            s => Err(api_error(s, &value).into()),
        }
    }

    /// Creates `branch` from the default branch's head and returns that sha.
    async fn create_branch(&self, repo: &RepoRef, branch: &str) -> Result<String> {
        let meta = self.api_ok(Method::GET, &format!("/repos/{}", repo), None).await?;
        let default_branch = required_str(&meta, "/default_branch")?;
        let Some(base_sha) = self.branch_head(repo, &default_branch).await? else {
            return Err(PatchflowError::Repository {
                status: Some(NOT_FOUND),
                message: format!("default branch {} has no head", default_branch),
            }
            .into());
        };
        tracing::info!(
            "[⚙️  -> 🐙] Creating {} on {} from {}@{}",
            branch,
            repo,
            default_branch,
            crate::str_utils::prefix_chars(&base_sha, 7)
        );
        self.api_ok(
            Method::POST,
            &format!("/repos/{}/git/refs", repo),
            Some(&json!({ "ref": format!("refs/heads/{}", branch), "sha": base_sha })),
        )
        .await?;
        Ok(base_sha)
    }

    async fn commit_files(
        &self,
        repo: &RepoRef,
        branch: &str,
        commit_message: &str,
        files: &[FileChange],
    ) -> Result<CommitRef> {
        let parent = match self.branch_head(repo, branch).await? {
            Some(sha) => sha,
            None => self.create_branch(repo, branch).await?,
        };
        let parent_commit = self
            .api_ok(Method::GET, &format!("/repos/{}/git/commits/{}", repo, parent), None)
            .await?;
        let base_tree = required_str(&parent_commit, "/tree/sha")?;

        let entries: Vec<Value> = files
            .iter()
            .map(|f| json!({ "path": f.path, "mode": "100644", "type": "blob", "content": f.content }))
            .collect();
        let tree = self
            .api_ok(
                Method::POST,
                &format!("/repos/{}/git/trees", repo),
                Some(&json!({ "base_tree": base_tree, "tree": entries })),
            )
            .await?;
        let tree_sha = required_str(&tree, "/sha")?;

        let commit = self
            .api_ok(
                Method::POST,
                &format!("/repos/{}/git/commits", repo),
                Some(&json!({ "message": commit_message, "tree": tree_sha, "parents": [parent] })),
            )
            .await?;
        let sha = required_str(&commit, "/sha")?;

        self.api_ok(
            Method::PATCH,
            &format!("/repos/{}/git/refs/heads/{}", repo, branch),
            Some(&json!({ "sha": sha, "force": false })),
        )
        .await?;

        Ok(CommitRef {
            url: commit
                .get("html_url")
                .and_then(Value::as_str)
                .map(str::to_string),
            sha,
        })
    }
}

fn api_error(status: u16, body: &Value) -> PatchflowError {
    let message = match body.get("message").and_then(Value::as_str) {
        Some(m) => m.to_string(),
        None => crate::str_utils::snippet(&body.to_string(), 300),
    };
    PatchflowError::Repository {
        status: Some(status),
        message,
    }
}

fn required_str(value: &Value, pointer: &str) -> Result<String> {
    match value.pointer(pointer).and_then(Value::as_str) {
        Some(s) => Ok(s.to_string()),
        None => Err(PatchflowError::Repository {
            status: None,
            message: format!("response missing {}", pointer),
        }
        .into()),
    }
}

#[async_trait]
impl RepositoryApply for GitHubClient {
    async fn apply(
        &self,
        repo: &RepoRef,
        branch: &str,
        commit_message: &str,
        files: &[FileChange],
    ) -> Result<CommitRef> {
        if files.is_empty() {
            return Err(PatchflowError::Apply("change set has no files".to_string()).into());
        }
        tracing::info!(
            "[⚙️  -> 🐙] Committing {} file(s) to {}@{}",
            files.len(),
            repo,
            branch
        );
        match self.commit_files(repo, branch, commit_message, files).await {
            Ok(commit) => {
                tracing::info!(
                    "[🐙 -> ⚙️ ] Committed {} to {}@{}",
                    crate::str_utils::prefix_chars(&commit.sha, 7),
                    repo,
                    branch
                );
                Ok(commit)
            }
            Err(e) => Err(PatchflowError::Apply(format!("{}@{}: {}", repo, branch, e)).into()),
        }
    }
}

#[async_trait]
impl RepositoryMetadataSource for GitHubClient {
    async fn list_paths(&self, repo: &RepoRef, branch: &str) -> Result<Vec<String>> {
        let listing = self
            .api_ok(
                Method::GET,
                &format!("/repos/{}/git/trees/{}?recursive=1", repo, branch),
                None,
            )
            .await?;
        if listing.get("truncated").and_then(Value::as_bool) == Some(true) {
            tracing::warn!("[🐙 -> ⚙️ ] Tree listing for {}@{} was truncated", repo, branch);
        }
        Ok(blob_paths(&listing))
    }
}

fn blob_paths(listing: &Value) -> Vec<String> {
    let Some(entries) = listing.get("tree").and_then(Value::as_array) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter(|e| e.get("type").and_then(Value::as_str) == Some("blob"))
        .filter_map(|e| e.get("path").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

/// Metadata source for when no repository token is configured: root only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRepositoryMetadata;

#[async_trait]
impl RepositoryMetadataSource for NoRepositoryMetadata {
    async fn list_paths(&self, _repo: &RepoRef, _branch: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_paths_skip_trees() {
        let listing = json!({
            "tree": [
                { "path": "frontend", "type": "tree" },
                { "path": "frontend/package.json", "type": "blob" },
                { "path": "README.md", "type": "blob" }
            ],
            "truncated": false
        });
        assert_eq!(blob_paths(&listing), vec!["frontend/package.json", "README.md"]);
        assert!(blob_paths(&Value::Null).is_empty());
    }

    #[test]
    fn test_api_error_prefers_message() {
        let err = api_error(409, &json!({ "message": "Update is not a fast forward" }));
        assert_eq!(
            err.to_string(),
            "Repository API error (status 409): Update is not a fast forward"
        );
    }

    #[test]
    fn test_required_str_reports_pointer() {
        match required_str(&json!({ "object": {} }), "/object/sha") {
            Ok(v) => panic!("Expected error, got {}", v),
            Err(e) => assert!(e.to_string().contains("/object/sha")),
        }
    }
}
