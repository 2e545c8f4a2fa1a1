use crate::constants::{
    AUTOFIX_MODEL_CANDIDATES, DEFAULT_AUTOFIX_ROUNDS, DEFAULT_MAX_POLLS, DEFAULT_MAX_STATUS_ERRORS,
    DEFAULT_POLL_INTERVAL_MS,
};
use crate::types::{HostingProvider, ProviderId};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_polls: u32,
    /// Consecutive status-call failures tolerated before the candidate is abandoned.
    pub max_status_errors: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_polls: DEFAULT_MAX_POLLS,
            max_status_errors: DEFAULT_MAX_STATUS_ERRORS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutoFixConfig {
    pub max_rounds: u32,
    pub fix_models: Vec<(ProviderId, String)>,
}

impl Default for AutoFixConfig {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_AUTOFIX_ROUNDS,
            fix_models: AUTOFIX_MODEL_CANDIDATES
                .iter()
                .map(|(p, m)| (*p, m.to_string()))
                .collect(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Chat-to-deploy pipeline for LLM-authored changes", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    #[arg(long, global = true, env = "PATCHFLOW_REQUEST_TIMEOUT_SECS", default_value_t = 300)]
    pub request_timeout_secs: u64,
    #[arg(long, global = true, env = "PATCHFLOW_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub connect_timeout_secs: u64,
    /// Directory for the daily-rolling log file; stderr only when unset.
    #[arg(long, global = true, env = "PATCHFLOW_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ChatArgs {
    #[arg(long, env = "PATCHFLOW_PROVIDER")]
    pub provider: ProviderId,
    #[arg(long, env = "PATCHFLOW_MODEL")]
    pub model: String,
    #[arg(long, default_value = "")]
    pub system: String,
    #[arg(long = "attach")]
    pub attachments: Vec<PathBuf>,
    pub prompt: String,
}

/// Where and how to deploy; shared by `deploy` and `ship`.
#[derive(Args, Debug, Clone)]
pub struct DeployTarget {
    /// `owner/name`
    #[arg(long)]
    pub repo: String,
    #[arg(long, default_value = "main")]
    pub branch: String,
    #[arg(long)]
    pub project: String,
    #[arg(long, default_value = "vercel")]
    pub hosting: HostingProvider,
    #[arg(long, env = "VERCEL_TOKEN", hide_env_values = true)]
    pub vercel_token: Option<String>,
    #[arg(long, env = "VERCEL_TEAM_ID")]
    pub vercel_team: Option<String>,
    #[arg(long, env = "RENDER_API_KEY", hide_env_values = true)]
    pub render_token: Option<String>,
    #[arg(long, env = "RENDER_OWNER_ID")]
    pub render_owner: Option<String>,
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,
    #[arg(long, env = "PATCHFLOW_POLL_INTERVAL_MS", default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    pub poll_interval_ms: u64,
    #[arg(long, env = "PATCHFLOW_MAX_POLLS", default_value_t = DEFAULT_MAX_POLLS)]
    pub max_polls: u32,
    #[arg(long, default_value_t = false)]
    pub auto_fix: bool,
    #[arg(long, env = "PATCHFLOW_AUTOFIX_ROUNDS", default_value_t = DEFAULT_AUTOFIX_ROUNDS)]
    pub auto_fix_rounds: u32,
}

impl DeployTarget {
    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_polls: self.max_polls,
            ..PollConfig::default()
        }
    }

    pub fn autofix_config(&self) -> AutoFixConfig {
        AutoFixConfig {
            max_rounds: self.auto_fix_rounds,
            ..AutoFixConfig::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct DeployArgs {
    #[command(flatten)]
    pub target: DeployTarget,
    /// Model the user had selected; tried first by auto-fix.
    #[arg(long, env = "PATCHFLOW_PROVIDER")]
    pub provider: Option<ProviderId>,
    #[arg(long, env = "PATCHFLOW_MODEL")]
    pub model: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream one chat turn as NDJSON canonical events.
    Chat(ChatArgs),
    /// Pull a change set out of a reply (stdin when FILE is omitted).
    Extract { file: Option<PathBuf> },
    /// Deploy a repository branch, optionally repairing failures.
    Deploy(DeployArgs),
    /// Chat, apply the resulting change set, then deploy.
    Ship {
        #[command(flatten)]
        chat: ChatArgs,
        #[command(flatten)]
        target: DeployTarget,
    },
}

impl GlobalArgs {
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let poll = PollConfig::default();
        assert_eq!(poll.max_polls, DEFAULT_MAX_POLLS);
        let fix = AutoFixConfig::default();
        assert_eq!(fix.max_rounds, 2);
        assert_eq!(fix.fix_models.len(), AUTOFIX_MODEL_CANDIDATES.len());
    }

    #[test]
    fn test_cli_parses_deploy() {
        let cli = Cli::try_parse_from([
            "patchflow",
            "deploy",
            "--repo",
            "acme/shop",
            "--project",
            "shop",
            "--auto-fix",
            "--provider",
            "openrouter",
            "--model",
            "x:free",
        ]);
        match cli {
            Ok(Cli {
                command: Command::Deploy(args),
                ..
            }) => {
                assert_eq!(args.target.branch, "main");
                assert_eq!(args.target.hosting, HostingProvider::Vercel);
                assert!(args.target.auto_fix);
                assert_eq!(args.provider, Some(ProviderId::OpenRouter));
            }
            other => panic!("Expected deploy command, got {:?}", other),
        }
    }
}
