pub mod render;
pub mod strategy;
pub mod vercel;

use crate::config::PollConfig;
use crate::repository::RepositoryMetadataSource;
use crate::types::{
    DeployAttemptFailure, DeployState, DeploymentOutcome, HostingProvider, PatchflowError, RepoRef,
    Result,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use strategy::{build_candidates, DeployStrategyCandidate, RepoMetadata};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedDeployment {
    pub id: String,
    pub url: Option<String>,
    pub diagnostics_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    pub provider: HostingProvider,
    pub repo: RepoRef,
    pub branch: String,
    pub project_name: String,
}

/// Hosting provider API: start, poll, and read logs of one deployment.
#[async_trait]
pub trait DeployClient: Send + Sync {
    fn provider(&self) -> HostingProvider;

    async fn start(&self, body: &Value) -> Result<StartedDeployment>;

    async fn status(&self, deployment_id: &str) -> Result<DeploymentOutcome>;

    async fn fetch_logs(&self, deployment_id: &str) -> Result<String>;
}

/// Reads a hosting API response as JSON; non-2xx becomes `PatchflowError::Hosting`.
pub(crate) async fn read_hosting_json(
    provider: HostingProvider,
    response: reqwest::Response,
) -> Result<Value> {
    let status = response.status();
    let body = response.text().await.map_err(PatchflowError::Network)?;
    if !status.is_success() {
        return Err(PatchflowError::Hosting {
            provider,
            status: Some(status.as_u16()),
            message: crate::adapters::extract_error_message(&body),
        }
        .into());
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&body)?)
}

pub const START_FAILED: &str = "START_FAILED";
pub const POLL_TIMEOUT: &str = "POLL_TIMEOUT";
pub const STATUS_UNAVAILABLE: &str = "STATUS_UNAVAILABLE";
pub const BUILD_FAILED: &str = "BUILD_FAILED";

pub struct DeployEngine {
    client: Arc<dyn DeployClient>,
    metadata: Arc<dyn RepositoryMetadataSource>,
    poll: PollConfig,
}

impl DeployEngine {
    pub fn new(
        client: Arc<dyn DeployClient>,
        metadata: Arc<dyn RepositoryMetadataSource>,
        poll: PollConfig,
    ) -> Self {
        Self {
            client,
            metadata,
            poll,
        }
    }

    pub fn client(&self) -> &Arc<dyn DeployClient> {
        &self.client
    }

    fn poll_delay(&self) -> Duration {
        let base_ms = self.poll.interval.as_millis() as u64;
        if base_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(base_ms + fastrand::u64(0..=base_ms / 10))
    }

    async fn repo_metadata(&self, request: &DeployRequest, cancel: &CancellationToken) -> Result<RepoMetadata> {
        let listed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PatchflowError::Cancelled.into()),
            r = self.metadata.list_paths(&request.repo, &request.branch) => r,
        };
        match listed {
            Ok(paths) => Ok(RepoMetadata { paths }),
            Err(e) => {
                tracing::warn!(
                    "[⚙️  -> 🚀] Could not list {}@{} ({}); only the repository root will be tried",
                    request.repo,
                    request.branch,
                    e
                );
                Ok(RepoMetadata::default())
            }
        }
    }

    /// Tries each strategy candidate in order until one reaches `ready`.
    pub async fn run_deploy_attempt(
        &self,
        request: &DeployRequest,
        cancel: &CancellationToken,
    ) -> Result<DeploymentOutcome> {
        if request.provider != self.client.provider() {
            return Err(PatchflowError::Configuration(format!(
                "deploy client targets {}, request asks for {}",
                self.client.provider(),
                request.provider
            ))
            .into());
        }

        let metadata = self.repo_metadata(request, cancel).await?;
        let candidates = build_candidates(request, &metadata);
        tracing::info!(
            "[⚙️  -> 🚀] {} deploy of {}@{}: {} strategy candidate(s)",
            request.provider,
            request.repo,
            request.branch,
            candidates.len()
        );

        let mut failures: Vec<DeployAttemptFailure> = Vec::with_capacity(candidates.len());
        for (index, candidate) in candidates.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(PatchflowError::Cancelled.into());
            }
            tracing::info!(
                "[⚙️  -> 🚀] Candidate {}/{}: {}",
                index + 1,
                candidates.len(),
                candidate.label
            );
            match self.try_candidate(request, candidate, cancel).await? {
                Ok(outcome) => {
                    tracing::info!(
                        "[⚙️  -> 🚀] Deployment {} ready at {}",
                        outcome.id,
                        outcome.url.as_deref().unwrap_or("(no url)")
                    );
                    return Ok(outcome);
                }
                Err(failure) => {
                    tracing::warn!("[🚀 -> ⚙️ ] {}", failure);
                    failures.push(failure);
                }
            }
        }

        match failures.last().cloned() {
            Some(last) => Err(PatchflowError::DeployFailed {
                last: Box::new(last),
                attempts: failures,
            }
            .into()),
            None => Err(PatchflowError::Internal(
                "no deploy strategy candidates were generated".to_string(),
                tracing_error::SpanTrace::capture(),
            )
            .into()),
        }
    }

    fn failure(
        &self,
        request: &DeployRequest,
        candidate: &DeployStrategyCandidate,
        started: Option<&StartedDeployment>,
        error_code: &str,
        error_message: String,
    ) -> DeployAttemptFailure {
        DeployAttemptFailure {
            provider: request.provider,
            repo: request.repo.clone(),
            branch: request.branch.clone(),
            project_name: candidate.project_name.clone(),
            strategy_label: candidate.label.clone(),
            deployment_id: started.map(|s| s.id.clone()),
            diagnostics_ref: started.and_then(|s| s.diagnostics_ref.clone()),
            error_code: error_code.to_string(),
            error_message,
        }
    }

    /// Outer `Err` only for cancellation; a failed candidate is `Ok(Err(..))`.
    async fn try_candidate(
        &self,
        request: &DeployRequest,
        candidate: &DeployStrategyCandidate,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<DeploymentOutcome, DeployAttemptFailure>> {
        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PatchflowError::Cancelled.into()),
            r = self.client.start(&candidate.body) => r,
        };
        let started = match started {
            Ok(s) => s,
            Err(e) => {
                return Ok(Err(self.failure(request, candidate, None, START_FAILED, e.to_string())));
            }
        };
        tracing::info!(
            "[⚙️  -> 🚀] Started {} (diagnostics: {})",
            started.id,
            started.diagnostics_ref.as_deref().unwrap_or("n/a")
        );

        let mut consecutive_errors = 0u32;
        for poll in 1..=self.poll.max_polls {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PatchflowError::Cancelled.into()),
                _ = tokio::time::sleep(self.poll_delay()) => {}
            }
            let status = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PatchflowError::Cancelled.into()),
                r = self.client.status(&started.id) => r,
            };

            let mut outcome = match status {
                Ok(o) => o,
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        "[🚀 -> ⚙️ ] Status check {} for {} failed ({}/{}): {}",
                        poll,
                        started.id,
                        consecutive_errors,
                        self.poll.max_status_errors,
                        e
                    );
                    if consecutive_errors > self.poll.max_status_errors {
                        return Ok(Err(self.failure(
                            request,
                            candidate,
                            Some(&started),
                            STATUS_UNAVAILABLE,
                            e.to_string(),
                        )));
                    }
                    continue;
                }
            };
            consecutive_errors = 0;
            if outcome.diagnostics_ref.is_none() {
                outcome.diagnostics_ref = started.diagnostics_ref.clone();
            }
            if outcome.url.is_none() {
                outcome.url = started.url.clone();
            }

            match outcome.state {
                DeployState::Ready => return Ok(Ok(outcome)),
                DeployState::Error => {
                    let mut failure = self.failure(
                        request,
                        candidate,
                        Some(&started),
                        outcome.error_code.as_deref().unwrap_or(BUILD_FAILED),
                        outcome
                            .error_message
                            .clone()
                            .unwrap_or_else(|| "deployment failed".to_string()),
                    );
                    failure.diagnostics_ref = outcome.diagnostics_ref.clone();
                    return Ok(Err(failure));
                }
                state => tracing::debug!("[🚀 -> ⚙️ ] {} is {:?} (poll {})", started.id, state, poll),
            }
        }

        Ok(Err(self.failure(
            request,
            candidate,
            Some(&started),
            POLL_TIMEOUT,
            format!(
                "deployment {} did not finish after {} status checks",
                started.id, self.poll.max_polls
            ),
        )))
    }
}
