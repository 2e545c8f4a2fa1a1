use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// --- CHAT MODEL ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<NormalizedAttachment>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            attachments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizedAttachment {
    Image {
        name: String,
        mime_type: String,
        base64: String,
        /// `data:<mime>;base64,<payload>`
        data_url: String,
    },
    Text {
        name: String,
        content: String,
        truncated: bool,
    },
    Binary {
        name: String,
        mime_type: String,
        size_bytes: u64,
    },
}

impl NormalizedAttachment {
    pub fn name(&self) -> &str {
        match self {
            Self::Image { name, .. } | Self::Text { name, .. } | Self::Binary { name, .. } => name,
        }
    }

    /// Plain-text rendering for providers (or history turns) that cannot carry
    /// the native multi-part form.
    pub fn as_text_marker(&self) -> String {
        match self {
            Self::Image {
                name, mime_type, ..
            } => format!("[Attached image: {} ({})]", name, mime_type),
            Self::Text { name, content, .. } => {
                format!("--- Attached file: {} ---\n{}\n--- End of {} ---", name, content, name)
            }
            Self::Binary {
                name,
                mime_type,
                size_bytes,
            } => format!(
                "[Attached binary file: {} ({}, {} bytes; contents not included)]",
                name, mime_type, size_bytes
            ),
        }
    }
}

/// --- PROVIDERS ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    OpenAi,
    OpenRouter,
    Groq,
    Anthropic,
    Gemini,
    Ollama,
    Cohere,
}

impl ProviderId {
    pub const ALL: [ProviderId; 7] = [
        ProviderId::OpenAi,
        ProviderId::OpenRouter,
        ProviderId::Groq,
        ProviderId::Anthropic,
        ProviderId::Gemini,
        ProviderId::Ollama,
        ProviderId::Cohere,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::OpenRouter => "openrouter",
            Self::Groq => "groq",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Ollama => "ollama",
            Self::Cohere => "cohere",
        }
    }

    pub fn requires_api_key(&self) -> bool {
        !matches!(self, Self::Ollama)
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = PatchflowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == needle)
            .ok_or_else(|| PatchflowError::Configuration(format!("unknown provider: {}", s)))
    }
}

/// --- CANONICAL STREAM ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RateLimitWindow {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitWindow {
    pub fn is_empty(&self) -> bool {
        self.limit.is_none() && self.remaining.is_none() && self.reset_at.is_none()
    }
}

/// The only event vocabulary the rest of the pipeline depends on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalStreamEvent {
    Text {
        content: String,
    },
    RateLimit {
        provider: ProviderId,
        resource: String,
        window: RateLimitWindow,
    },
    Error {
        message: String,
    },
    Done,
}

impl CanonicalStreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Done)
    }

    pub fn to_ndjson_line(&self) -> String {
        match serde_json::to_string(self) {
            Ok(s) => s,
            Err(e) => format!(
                "{{\"type\":\"error\",\"message\":\"event serialization failed: {}\"}}",
                e
            ),
        }
    }
}

/// --- CHANGE SETS ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeSet {
    pub commit_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub files: IndexMap<String, String>,
}

impl ChangeSet {
    /// Last write wins; a re-declared path moves to the position of its last declaration.
    pub fn insert_file(&mut self, path: String, content: String) {
        self.files.shift_remove(&path);
        self.files.insert(path, content);
    }

    pub fn file_changes(&self) -> Vec<FileChange> {
        self.files
            .iter()
            .map(|(path, content)| FileChange {
                path: path.clone(),
                content: content.clone(),
            })
            .collect()
    }
}

/// --- REPOSITORIES & DEPLOYMENTS ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepoRef {
    type Err = PatchflowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim().trim_end_matches(".git");
        let trimmed = trimmed
            .strip_prefix("https://github.com/")
            .unwrap_or(trimmed);
        match trimmed.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(owner, name))
            }
            _ => Err(PatchflowError::Configuration(format!(
                "repository must look like owner/name, got: {}",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HostingProvider {
    Vercel,
    Render,
}

impl fmt::Display for HostingProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vercel => write!(f, "vercel"),
            Self::Render => write!(f, "render"),
        }
    }
}

impl FromStr for HostingProvider {
    type Err = PatchflowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "vercel" => Ok(Self::Vercel),
            "render" => Ok(Self::Render),
            other => Err(PatchflowError::Configuration(format!(
                "unknown hosting provider: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeployState {
    Pending,
    Building,
    Ready,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentOutcome {
    pub state: DeployState,
    pub id: String,
    pub url: Option<String>,
    /// Inspector or build-log URL.
    pub diagnostics_ref: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployAttemptFailure {
    pub provider: HostingProvider,
    pub repo: RepoRef,
    pub branch: String,
    pub project_name: String,
    pub strategy_label: String,
    pub deployment_id: Option<String>,
    pub diagnostics_ref: Option<String>,
    pub error_code: String,
    pub error_message: String,
}

impl fmt::Display for DeployAttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} deploy of {}@{} ({}, {}) failed: [{}] {}",
            self.provider,
            self.repo,
            self.branch,
            self.project_name,
            self.strategy_label,
            self.error_code,
            self.error_message
        )?;
        if let Some(diag) = &self.diagnostics_ref {
            write!(f, " (see {})", diag)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RoundOutcome {
    Deployed { outcome: DeploymentOutcome },
    DeployFailed { failure: DeployAttemptFailure },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoFixRound {
    pub index: u32,
    pub failure: DeployAttemptFailure,
    /// `provider/model` that produced the applied fix.
    pub model: Option<String>,
    pub commit: Option<String>,
    pub outcome: Option<RoundOutcome>,
}

/// --- ERRORS ---

#[derive(Error, Debug)]
pub enum PatchflowError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Attachment rejected: {0}")]
    Validation(String),

    #[error("Upstream error from {provider} (status {}): {message}", status_label(.status))]
    Upstream {
        provider: ProviderId,
        status: Option<u16>,
        message: String,
        fallback_eligible: bool,
    },

    #[error("Hosting API error from {provider} (status {}): {message}", status_label(.status))]
    Hosting {
        provider: HostingProvider,
        status: Option<u16>,
        message: String,
    },

    #[error("Repository API error (status {}): {message}", status_label(.status))]
    Repository { status: Option<u16>, message: String },

    #[error("Repository apply failed: {0}")]
    Apply(String),

    #[error("All {} deploy strategies failed; last: {last}", .attempts.len())]
    DeployFailed {
        last: Box<DeployAttemptFailure>,
        attempts: Vec<DeployAttemptFailure>,
    },

    #[error("Auto-fix round budget exhausted after {} rounds; last failure: {last_failure}", .rounds.len())]
    AutoFixBudgetExceeded {
        rounds: Vec<AutoFixRound>,
        last_failure: Box<DeployAttemptFailure>,
    },

    #[error("Auto-fix could not obtain a fix: {reason}")]
    AutoFixNoFix {
        reason: String,
        rounds: Vec<AutoFixRound>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

fn status_label(status: &Option<u16>) -> String {
    match status {
        Some(s) => s.to_string(),
        None => "n/a".to_string(),
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: PatchflowError,
    pub span_trace: SpanTrace,
}

impl ObservedError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner, PatchflowError::Cancelled)
    }
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<PatchflowError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_set_last_write_wins_moves_path() {
        let mut cs = ChangeSet {
            commit_message: "m".into(),
            branch: None,
            files: IndexMap::new(),
        };
        cs.insert_file("a.txt".into(), "1".into());
        cs.insert_file("b.txt".into(), "2".into());
        cs.insert_file("a.txt".into(), "3".into());

        let paths: Vec<&String> = cs.files.keys().collect();
        assert_eq!(paths, vec!["b.txt", "a.txt"]);
        assert_eq!(cs.files.get("a.txt").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_canonical_event_wire_shape() {
        let line = CanonicalStreamEvent::Text {
            content: "hi".into(),
        }
        .to_ndjson_line();
        assert_eq!(line, r#"{"type":"text","content":"hi"}"#);
        assert_eq!(CanonicalStreamEvent::Done.to_ndjson_line(), r#"{"type":"done"}"#);
    }

    #[test]
    fn test_repo_ref_parsing() {
        match "acme/shop".parse::<RepoRef>() {
            Ok(r) => assert_eq!(r, RepoRef::new("acme", "shop")),
            Err(e) => panic!("Expected repo ref, got {}", e),
        }
        match "https://github.com/acme/shop.git".parse::<RepoRef>() {
            Ok(r) => assert_eq!(r.to_string(), "acme/shop"),
            Err(e) => panic!("Expected repo ref, got {}", e),
        }
        assert!("acme".parse::<RepoRef>().is_err());
    }

    #[test]
    fn test_provider_round_trip_names() {
        for p in ProviderId::ALL {
            match p.as_str().parse::<ProviderId>() {
                Ok(parsed) => assert_eq!(parsed, p),
                Err(e) => panic!("{} did not parse: {}", p, e),
            }
        }
        assert!("bogus".parse::<ProviderId>().is_err());
    }
}
