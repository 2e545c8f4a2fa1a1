use crate::types::ProviderId;

/// HTTP statuses worth retrying on a different model.
pub const FALLBACK_ELIGIBLE_STATUS_CODES: &[u16] = &[404, 408, 409, 425, 429, 500, 502, 503, 504, 520, 529];

/// Upstream error text that signals a model-level (not request-level) failure.
pub const FALLBACK_ELIGIBLE_MARKERS: &[&str] = &[
    "rate limit",
    "rate-limit",
    "ratelimit",
    "overloaded",
    "no endpoints",
    "model not found",
    "model_not_found",
    "not found",
    "does not exist",
    "resource_exhausted",
    "unavailable",
    "timeout",
    "empty response",
];

/// Default upstream endpoints (overridable via `<PROVIDER>_BASE_URL`).
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const OLLAMA_BASE_URL: &str = "http://localhost:11434";
pub const COHERE_BASE_URL: &str = "https://api.cohere.com/v2";

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 8192;

pub fn default_base_url(provider: ProviderId) -> &'static str {
    match provider {
        ProviderId::OpenAi => OPENAI_BASE_URL,
        ProviderId::OpenRouter => OPENROUTER_BASE_URL,
        ProviderId::Groq => GROQ_BASE_URL,
        ProviderId::Anthropic => ANTHROPIC_BASE_URL,
        ProviderId::Gemini => GEMINI_BASE_URL,
        ProviderId::Ollama => OLLAMA_BASE_URL,
        ProviderId::Cohere => COHERE_BASE_URL,
    }
}

/// Suffix that marks the OpenRouter free-tier model family.
pub const FREE_TIER_SUFFIX: &str = ":free";

/// Free-tier models tried, in order, after the requested one fails.
pub const FREE_TIER_FALLBACK_MODELS: &[&str] = &[
    "meta-llama/llama-3.3-70b-instruct:free",
    "deepseek/deepseek-chat-v3-0324:free",
    "qwen/qwen-2.5-coder-32b-instruct:free",
    "mistralai/mistral-7b-instruct:free",
];

/// Repair-model candidates for auto-fix, after the user's own selection.
pub const AUTOFIX_MODEL_CANDIDATES: &[(ProviderId, &str)] = &[
    (ProviderId::Anthropic, "claude-sonnet-4-20250514"),
    (ProviderId::OpenAi, "gpt-4o"),
    (ProviderId::Gemini, "gemini-2.5-pro"),
    (ProviderId::OpenRouter, "deepseek/deepseek-chat-v3-0324:free"),
];

pub const DEFAULT_AUTOFIX_ROUNDS: u32 = 2;
/// Tail of the build log embedded in a remediation prompt.
pub const MAX_LOG_CHARS: usize = 12_000;

/// Attachment caps
pub const MAX_ATTACHMENTS: usize = 8;
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;
pub const MAX_TEXT_CHARS: usize = 100_000;
pub const MAX_TOTAL_ATTACHMENT_BYTES: usize = 20 * 1024 * 1024;
pub const SUPPORTED_IMAGE_MIME_TYPES: &[&str] =
    &["image/png", "image/jpeg", "image/gif", "image/webp"];

/// Stream guards
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;
pub const MAX_STREAM_FRAMES: usize = 100_000;

/// Deploy defaults
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_MAX_POLLS: u32 = 180;
pub const DEFAULT_MAX_STATUS_ERRORS: u32 = 3;
pub const MAX_ROOT_GUESSES: usize = 4;
pub const MAX_DEPLOY_CANDIDATES: usize = 8;
pub const MAX_PROJECT_NAME_LEN: usize = 100;

/// Files whose presence marks a directory as a build root.
pub const BUILD_MANIFESTS: &[&str] = &[
    "package.json",
    "index.html",
    "requirements.txt",
    "pyproject.toml",
    "go.mod",
    "Cargo.toml",
    "Gemfile",
    "composer.json",
];

/// Directories never treated as deploy roots.
pub const IGNORED_ROOT_SEGMENTS: &[&str] = &["node_modules", "vendor", "dist", "build", "target", "test", "tests"];

/// Conventional app folders, most likely first.
pub const PREFERRED_APP_DIRS: &[&str] = &["frontend", "web", "app", "client", "site", "www", "apps/web"];

pub const VERCEL_API_BASE: &str = "https://api.vercel.com";
pub const RENDER_API_BASE: &str = "https://api.render.com/v1";
pub const GITHUB_API_BASE: &str = "https://api.github.com";

/// Extractor defaults
pub const DEFAULT_COMMIT_MESSAGE: &str = "Apply changes suggested by assistant";
pub const CHANGES_APPLIED_PLACEHOLDER: &str = "Changes applied.";
