use clap::Parser;
use colored::*;
use futures_util::StreamExt;
use patchflow::attachments::{normalize_attachments, AttachmentLimits, RawAttachment};
use patchflow::autofix::{AutoFixContext, AutoFixOrchestrator};
use patchflow::change_block::{extract_change_set, strip_change_block};
use patchflow::config::{ChatArgs, Cli, Command, DeployTarget, GlobalArgs};
use patchflow::credentials::EnvCredentialStore;
use patchflow::deploy::render::RenderClient;
use patchflow::deploy::vercel::VercelClient;
use patchflow::deploy::{DeployClient, DeployEngine, DeployRequest};
use patchflow::gateway::{ChatTurnRequest, StreamingGateway};
use patchflow::repository::{GitHubClient, NoRepositoryMetadata, RepositoryApply, RepositoryMetadataSource};
use patchflow::transport::{build_http_client, ReqwestTransport};
use patchflow::*;
use std::io::Write;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

struct Services {
    http: reqwest::Client,
    gateway: StreamingGateway,
}

impl Services {
    fn new(global: &GlobalArgs) -> Result<Self> {
        let config = global.gateway_config();
        let http = build_http_client(&config)?;
        let transport = Arc::new(ReqwestTransport::with_client(http.clone()));
        let gateway = StreamingGateway::new(transport, Arc::new(EnvCredentialStore));
        Ok(Self { http, gateway })
    }

    fn github(&self, target: &DeployTarget) -> Option<Arc<GitHubClient>> {
        target
            .github_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|token| Arc::new(GitHubClient::new(self.http.clone(), token)))
    }

    fn deploy_client(&self, target: &DeployTarget) -> Result<Arc<dyn DeployClient>> {
        match target.hosting {
            HostingProvider::Vercel => {
                let Some(token) = target.vercel_token.clone().filter(|t| !t.trim().is_empty()) else {
                    return Err(PatchflowError::Configuration(
                        "no Vercel token; set VERCEL_TOKEN or pass --vercel-token".to_string(),
                    )
                    .into());
                };
                Ok(Arc::new(VercelClient::new(
                    self.http.clone(),
                    token,
                    target.vercel_team.clone(),
                )))
            }
            HostingProvider::Render => {
                let (Some(token), Some(owner)) = (target.render_token.clone(), target.render_owner.clone()) else {
                    return Err(PatchflowError::Configuration(
                        "Render needs RENDER_API_KEY and RENDER_OWNER_ID".to_string(),
                    )
                    .into());
                };
                Ok(Arc::new(RenderClient::new(self.http.clone(), token, owner)))
            }
        }
    }

    fn deploy_engine(&self, target: &DeployTarget) -> Result<Arc<DeployEngine>> {
        let metadata: Arc<dyn RepositoryMetadataSource> = match self.github(target) {
            Some(github) => github,
            None => {
                tracing::warn!("No GITHUB_TOKEN; deploy roots will not be guessed from the file tree");
                Arc::new(NoRepositoryMetadata)
            }
        };
        Ok(Arc::new(DeployEngine::new(
            self.deploy_client(target)?,
            metadata,
            target.poll_config(),
        )))
    }
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling");
            cancel.cancel();
        }
    });
}

async fn load_attachments(args: &ChatArgs) -> Result<Vec<NormalizedAttachment>> {
    let mut raw = Vec::with_capacity(args.attachments.len());
    for path in &args.attachments {
        raw.push(RawAttachment::from_path(path).await?);
    }
    Ok(normalize_attachments(&raw, &AttachmentLimits::default())?)
}

/// Streams the turn to stdout as NDJSON and returns the assembled text and
/// the terminal error, if any.
async fn stream_chat(
    services: &Services,
    args: &ChatArgs,
    cancel: &CancellationToken,
) -> Result<(String, Option<String>)> {
    let request = ChatTurnRequest {
        system_prompt: args.system.clone(),
        messages: vec![ChatMessage::user(args.prompt.clone())],
        attachments: load_attachments(args).await?,
        provider: args.provider,
        model_id: args.model.clone(),
    };

    let events = services.gateway.run_chat_turn(request, cancel.clone());
    futures_util::pin_mut!(events);
    let mut stdout = std::io::stdout();
    let mut text = String::new();
    let mut error = None;
    let mut terminal = false;
    while let Some(event) = events.next().await {
        writeln!(stdout, "{}", event.to_ndjson_line())?;
        stdout.flush()?;
        match event {
            CanonicalStreamEvent::Text { content } => text.push_str(&content),
            CanonicalStreamEvent::Error { message } => {
                error = Some(message);
                terminal = true;
            }
            CanonicalStreamEvent::Done => terminal = true,
            CanonicalStreamEvent::RateLimit { .. } => {}
        }
    }
    if !terminal {
        return Err(PatchflowError::Cancelled.into());
    }
    Ok((text, error))
}

async fn read_reply(file: Option<&std::path::Path>) -> Result<String> {
    match file {
        Some(path) => Ok(tokio::fs::read_to_string(path).await?),
        None => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            Ok(buf)
        }
    }
}

fn print_extraction(reply: &str) -> Result<Option<ChangeSet>> {
    let change_set = extract_change_set(reply);
    let prose = strip_change_block(reply, change_set.as_ref());
    let report = serde_json::json!({ "change_set": change_set, "prose": prose });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(change_set)
}

/// Deploys, and when that fails and auto-fix is on, hands the failure to the orchestrator.
async fn deploy_and_fix(
    services: &Services,
    target: &DeployTarget,
    branch: &str,
    selected_model: Option<(ProviderId, String)>,
    cancel: &CancellationToken,
) -> Result<DeploymentOutcome> {
    let repo: RepoRef = target.repo.parse()?;
    let engine = services.deploy_engine(target)?;
    let request = DeployRequest {
        provider: target.hosting,
        repo: repo.clone(),
        branch: branch.to_string(),
        project_name: target.project.clone(),
    };

    let failure = match engine.run_deploy_attempt(&request, cancel).await {
        Ok(outcome) => return Ok(outcome),
        Err(e) => match e.inner {
            PatchflowError::DeployFailed { last, .. } if target.auto_fix => *last,
            _ => return Err(e),
        },
    };

    let Some(github) = services.github(target) else {
        return Err(PatchflowError::Configuration(
            "auto-fix commits through GitHub; set GITHUB_TOKEN".to_string(),
        )
        .into());
    };
    eprintln!("{} {}", "Deploy failed, starting auto-fix:".yellow().bold(), failure);

    let repository: Arc<dyn RepositoryApply> = github;
    let orchestrator = AutoFixOrchestrator::new(
        services.gateway.clone(),
        engine,
        repository,
        target.autofix_config(),
    );
    let ctx = AutoFixContext {
        hosting: target.hosting,
        repo,
        branch: branch.to_string(),
        project_name: target.project.clone(),
        selected_model,
    };
    let report = orchestrator.run_auto_fix(failure, &ctx, cancel).await?;
    for round in &report.rounds {
        eprintln!(
            "  round {}: {} -> {}",
            round.index,
            round.model.as_deref().unwrap_or("-"),
            round.commit.as_deref().unwrap_or("-")
        );
    }
    Ok(report.outcome)
}

fn print_outcome(outcome: &DeploymentOutcome) {
    eprintln!(
        "{} {} {}",
        "Deployed".green().bold(),
        outcome.id,
        outcome.url.as_deref().unwrap_or("")
    );
    if let Some(diag) = &outcome.diagnostics_ref {
        eprintln!("  {}", diag.dimmed());
    }
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<i32> {
    let services = Services::new(&cli.global)?;

    match cli.command {
        Command::Chat(args) => {
            let (_, error) = stream_chat(&services, &args, &cancel).await?;
            Ok(if error.is_some() { 1 } else { 0 })
        }
        Command::Extract { file } => {
            let reply = read_reply(file.as_deref()).await?;
            Ok(if print_extraction(&reply)?.is_some() { 0 } else { 2 })
        }
        Command::Deploy(args) => {
            let selected = match (args.provider, args.model.clone()) {
                (Some(p), Some(m)) => Some((p, m)),
                _ => None,
            };
            let outcome = deploy_and_fix(&services, &args.target, &args.target.branch, selected, &cancel).await?;
            print_outcome(&outcome);
            Ok(0)
        }
        Command::Ship { chat, target } => {
            let (text, error) = stream_chat(&services, &chat, &cancel).await?;
            if let Some(error) = error {
                eprintln!("{} {}", "Chat failed:".red().bold(), error);
                return Ok(1);
            }
            let Some(change_set) = extract_change_set(&text) else {
                eprintln!("{}", "Reply contained no change block; nothing to ship.".yellow());
                return Ok(2);
            };
            let Some(github) = services.github(&target) else {
                return Err(PatchflowError::Configuration("ship needs GITHUB_TOKEN".to_string()).into());
            };

            let repo: RepoRef = target.repo.parse()?;
            let branch = change_set.branch.clone().unwrap_or_else(|| target.branch.clone());
            let commit = github
                .apply(&repo, &branch, &change_set.commit_message, &change_set.file_changes())
                .await?;
            eprintln!(
                "{} {} file(s) to {}@{} ({})",
                "Committed".green().bold(),
                change_set.files.len(),
                repo,
                branch,
                commit.url.as_deref().unwrap_or(&commit.sha)
            );

            let selected = Some((chat.provider, chat.model.clone()));
            let outcome = deploy_and_fix(&services, &target, &branch, selected, &cancel).await?;
            print_outcome(&outcome);
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let _guard = patchflow::logging::init_tracing(cli.global.log_dir.as_deref());
    patchflow::logging::setup_panic_hook();

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    let code = match run(cli, cancel).await {
        Ok(code) => code,
        Err(e) if e.is_cancelled() => {
            eprintln!("{}", "Cancelled.".yellow());
            130
        }
        Err(e) => {
            tracing::debug!("Failure span trace:\n{}", e.span_trace);
            eprintln!("{} {}", "Error:".red().bold(), e);
            1
        }
    };
    std::process::exit(code);
}
