use crate::change_block::extract_change_set;
use crate::config::AutoFixConfig;
use crate::constants::{DEFAULT_COMMIT_MESSAGE, MAX_LOG_CHARS};
use crate::deploy::{DeployEngine, DeployRequest};
use crate::gateway::{collect_reply, ChatTurnRequest, StreamingGateway};
use crate::repository::RepositoryApply;
use crate::str_utils::log_tail;
use crate::types::{
    AutoFixRound, ChangeSet, ChatMessage, DeployAttemptFailure, DeploymentOutcome, HostingProvider,
    PatchflowError, ProviderId, RepoRef, Result, RoundOutcome,
};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub const REMEDIATION_SYSTEM_PROMPT: &str = "You are a build engineer repairing a failed deployment. \
You change as little as possible, you never ask questions, and you always answer with complete file \
contents inside the requested change block.";

/// Everything a round needs besides the failure itself.
#[derive(Debug, Clone)]
pub struct AutoFixContext {
    pub hosting: HostingProvider,
    pub repo: RepoRef,
    pub branch: String,
    pub project_name: String,
    /// Model the user had selected in chat; tried first when its provider is configured.
    pub selected_model: Option<(ProviderId, String)>,
}

impl AutoFixContext {
    pub fn deploy_request(&self) -> DeployRequest {
        DeployRequest {
            provider: self.hosting,
            repo: self.repo.clone(),
            branch: self.branch.clone(),
            project_name: self.project_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoFixReport {
    pub rounds: Vec<AutoFixRound>,
    pub outcome: DeploymentOutcome,
}

pub fn build_remediation_prompt(
    ctx: &AutoFixContext,
    failure: &DeployAttemptFailure,
    logs: Option<&str>,
) -> String {
    let mut prompt = format!(
        "The {} deployment of repository {} (branch {}) for project \"{}\" failed.\n\n\
Strategy: {}\n\
Deployment id: {}\n\
Diagnostics: {}\n\
Error code: {}\n\
Error message: {}\n\n",
        ctx.hosting,
        ctx.repo,
        ctx.branch,
        failure.project_name,
        failure.strategy_label,
        failure.deployment_id.as_deref().unwrap_or("n/a"),
        failure.diagnostics_ref.as_deref().unwrap_or("n/a"),
        failure.error_code,
        failure.error_message,
    );

    match logs.map(str::trim).filter(|l| !l.is_empty()) {
        Some(logs) => prompt.push_str(&format!(
            "Recent build logs:\n```text\n{}\n```\n\n",
            log_tail(logs, MAX_LOG_CHARS)
        )),
        None => prompt.push_str("No build logs were available for this deployment.\n\n"),
    }

    prompt.push_str(
        "Respond with the smallest safe fix that makes this deployment succeed. \
Do not refactor or touch unrelated files. Give complete file contents, never diffs.\n\n",
    );
    prompt.push_str(
        "End your reply with a change block in exactly this format, one File entry per changed file:\n\n\
Commit message: <one line summary>\n\
File: path/from/repository/root\n\
```\n<complete file content>\n```\n\n",
    );
    prompt.push_str(&format!(
        "You are pre-authorized to make this change. It will be committed to {} and redeployed \
automatically, so do not ask for confirmation or further input.",
        ctx.branch
    ));
    prompt
}

fn model_label(provider: ProviderId, model: &str) -> String {
    format!("{}/{}", provider, model)
}

enum RoundResult {
    Deployed(DeploymentOutcome),
    StillFailing(DeployAttemptFailure),
}

/// Drives fetch logs, ask for a fix, apply, redeploy; for at most `max_rounds` rounds.
pub struct AutoFixOrchestrator {
    gateway: StreamingGateway,
    engine: Arc<DeployEngine>,
    repository: Arc<dyn RepositoryApply>,
    config: AutoFixConfig,
}

impl AutoFixOrchestrator {
    pub fn new(
        gateway: StreamingGateway,
        engine: Arc<DeployEngine>,
        repository: Arc<dyn RepositoryApply>,
        config: AutoFixConfig,
    ) -> Self {
        Self {
            gateway,
            engine,
            repository,
            config,
        }
    }

    /// Selected model first (if configured), then the configured repair models.
    pub fn fix_candidates(&self, ctx: &AutoFixContext) -> Vec<(ProviderId, String)> {
        let mut candidates: Vec<(ProviderId, String)> = Vec::new();
        let ordered = ctx.selected_model.iter().chain(self.config.fix_models.iter());
        for (provider, model) in ordered {
            if !self.gateway.is_configured(*provider) {
                continue;
            }
            if !candidates.iter().any(|(p, m)| p == provider && m == model) {
                candidates.push((*provider, model.clone()));
            }
        }
        candidates
    }

    async fn fetch_logs(&self, failure: &DeployAttemptFailure, cancel: &CancellationToken) -> Result<Option<String>> {
        let Some(deployment_id) = failure.deployment_id.as_deref() else {
            return Ok(None);
        };
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PatchflowError::Cancelled.into()),
            r = self.engine.client().fetch_logs(deployment_id) => r,
        };
        match fetched {
            Ok(logs) => Ok(Some(logs)),
            Err(e) => {
                tracing::warn!("[🔧] Could not fetch logs for {}: {}", deployment_id, e);
                Ok(None)
            }
        }
    }

    /// Inner `Err` carries the last per-model failure reason.
    async fn request_fix(
        &self,
        prompt: &str,
        candidates: &[(ProviderId, String)],
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<(String, ChangeSet), String>> {
        let mut last_reason = "no repair model has a configured provider".to_string();

        for (provider, model) in candidates {
            if cancel.is_cancelled() {
                return Err(PatchflowError::Cancelled.into());
            }
            let label = model_label(*provider, model);
            tracing::info!("[🔧] Asking {} for a fix", label);

            let request = ChatTurnRequest {
                system_prompt: REMEDIATION_SYSTEM_PROMPT.to_string(),
                messages: vec![ChatMessage::user(prompt)],
                attachments: Vec::new(),
                provider: *provider,
                model_id: model.clone(),
            };
            let reply = collect_reply(self.gateway.run_chat_turn(request, cancel.clone())).await;

            if !reply.completed {
                if cancel.is_cancelled() {
                    return Err(PatchflowError::Cancelled.into());
                }
                last_reason = format!("{}: stream ended without completing", label);
            } else if let Some(error) = reply.error {
                last_reason = format!("{}: {}", label, error);
            } else {
                match extract_change_set(&reply.text) {
                    Some(change_set) => return Ok(Ok((label, change_set))),
                    None => last_reason = format!("{}: reply contained no change block", label),
                }
            }
            tracing::warn!("[🔧] {}", last_reason);
        }
        Ok(Err(last_reason))
    }

    async fn redeploy(&self, ctx: &AutoFixContext, cancel: &CancellationToken) -> Result<RoundResult> {
        match self.engine.run_deploy_attempt(&ctx.deploy_request(), cancel).await {
            Ok(outcome) => Ok(RoundResult::Deployed(outcome)),
            Err(e) => {
                if let PatchflowError::DeployFailed { last, .. } = &e.inner {
                    return Ok(RoundResult::StillFailing((**last).clone()));
                }
                Err(e)
            }
        }
    }

    /// One round: logs, fix, apply, redeploy. Inner `Err` is "no usable fix".
    async fn run_round(
        &self,
        index: u32,
        failure: &DeployAttemptFailure,
        round: &mut AutoFixRound,
        ctx: &AutoFixContext,
        candidates: &[(ProviderId, String)],
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<RoundResult, String>> {
        tracing::info!(
            "[🔧] Round {}/{}: {} [{}]",
            index,
            self.config.max_rounds,
            failure.strategy_label,
            failure.error_code
        );
        let logs = self.fetch_logs(failure, cancel).await?;
        let prompt = build_remediation_prompt(ctx, failure, logs.as_deref());

        let (label, change_set) = match self.request_fix(&prompt, candidates, cancel).await? {
            Ok(fix) => fix,
            Err(reason) => return Ok(Err(reason)),
        };
        round.model = Some(label);

        let commit_message = if change_set.commit_message == DEFAULT_COMMIT_MESSAGE {
            format!("Fix {} deployment failure (auto-fix round {})", ctx.hosting, index)
        } else {
            change_set.commit_message.clone()
        };
        let files = change_set.file_changes();
        let applied = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PatchflowError::Cancelled.into()),
            r = self.repository.apply(&ctx.repo, &ctx.branch, &commit_message, &files) => r,
        };
        let commit = match applied {
            Ok(c) => c,
            Err(e) => match e.inner {
                PatchflowError::Apply(_) | PatchflowError::Cancelled => return Err(e),
                other => return Err(PatchflowError::Apply(other.to_string()).into()),
            },
        };
        tracing::info!("[🔧] Applied {} file(s) as {}", files.len(), commit.sha);
        round.commit = Some(commit.sha);

        self.redeploy(ctx, cancel).await.map(Ok)
    }

    /// Runs repair rounds starting from `initial_failure`. Apply failures and
    /// cancellation abort immediately; a round with no usable fix ends the session.
    pub async fn run_auto_fix(
        &self,
        initial_failure: DeployAttemptFailure,
        ctx: &AutoFixContext,
        cancel: &CancellationToken,
    ) -> Result<AutoFixReport> {
        let candidates = self.fix_candidates(ctx);
        let mut rounds: Vec<AutoFixRound> = Vec::new();
        let mut failure = initial_failure;

        for index in 1..=self.config.max_rounds {
            if cancel.is_cancelled() {
                return Err(PatchflowError::Cancelled.into());
            }
            let span = tracing::info_span!("autofix_round", round = index, repo = %ctx.repo);
            let mut round = AutoFixRound {
                index,
                failure: failure.clone(),
                model: None,
                commit: None,
                outcome: None,
            };

            let step = self
                .run_round(index, &failure, &mut round, ctx, &candidates, cancel)
                .instrument(span)
                .await?;

            match step {
                Err(reason) => {
                    rounds.push(round);
                    return Err(PatchflowError::AutoFixNoFix { reason, rounds }.into());
                }
                Ok(RoundResult::Deployed(outcome)) => {
                    tracing::info!("[🔧] Round {} fixed the deployment ({})", index, outcome.id);
                    round.outcome = Some(RoundOutcome::Deployed {
                        outcome: outcome.clone(),
                    });
                    rounds.push(round);
                    return Ok(AutoFixReport { rounds, outcome });
                }
                Ok(RoundResult::StillFailing(next)) => {
                    tracing::warn!("[🔧] Round {} redeploy still failing: {}", index, next);
                    round.outcome = Some(RoundOutcome::DeployFailed {
                        failure: next.clone(),
                    });
                    rounds.push(round);
                    failure = next;
                }
            }
        }

        tracing::error!("[🔧] Round budget of {} exhausted", self.config.max_rounds);
        Err(PatchflowError::AutoFixBudgetExceeded {
            rounds,
            last_failure: Box::new(failure),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> AutoFixContext {
        AutoFixContext {
            hosting: HostingProvider::Vercel,
            repo: RepoRef::new("acme", "shop"),
            branch: "main".into(),
            project_name: "shop".into(),
            selected_model: None,
        }
    }

    fn failure() -> DeployAttemptFailure {
        DeployAttemptFailure {
            provider: HostingProvider::Vercel,
            repo: RepoRef::new("acme", "shop"),
            branch: "main".into(),
            project_name: "shop".into(),
            strategy_label: "root=. name=shop".into(),
            deployment_id: Some("dpl_1".into()),
            diagnostics_ref: Some("https://vercel.com/acme/shop/dpl_1".into()),
            error_code: "BUILD_FAILED".into(),
            error_message: "npm run build exited with 1".into(),
        }
    }

    #[test]
    fn test_prompt_carries_identifiers_and_instructions() {
        let prompt = build_remediation_prompt(&ctx(), &failure(), Some("Error: Cannot find module 'react'"));
        assert!(prompt.contains("acme/shop"));
        assert!(prompt.contains("branch main"));
        assert!(prompt.contains("https://vercel.com/acme/shop/dpl_1"));
        assert!(prompt.contains("BUILD_FAILED"));
        assert!(prompt.contains("Cannot find module 'react'"));
        assert!(prompt.contains("smallest safe fix"));
        assert!(prompt.contains("Commit message:"));
        assert!(prompt.contains("pre-authorized"));
    }

    #[test]
    fn test_prompt_keeps_only_log_tail() {
        let logs = format!("{}END", "x".repeat(MAX_LOG_CHARS * 2));
        let prompt = build_remediation_prompt(&ctx(), &failure(), Some(&logs));
        assert!(prompt.contains("END"));
        assert!(prompt.len() < MAX_LOG_CHARS + 2_000);
    }

    #[test]
    fn test_prompt_header_lines_without_deployment() {
        let mut f = failure();
        f.deployment_id = None;
        f.diagnostics_ref = None;
        let prompt = build_remediation_prompt(&ctx(), &f, None);
        assert!(prompt.contains("Strategy: root=. name=shop\nDeployment id: n/a\nDiagnostics: n/a\n"));
        assert!(prompt.contains("Error message: npm run build exited with 1\n\nNo build logs"));
        assert!(prompt.ends_with("further input."));
    }

    #[test]
    fn test_prompt_without_logs() {
        let prompt = build_remediation_prompt(&ctx(), &failure(), None);
        assert!(prompt.contains("No build logs were available"));
    }
}
