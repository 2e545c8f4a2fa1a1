use crate::types::ProviderId;
use std::collections::HashMap;

pub const API_KEY: &str = "api_key";
pub const BASE_URL: &str = "base_url";

/// Secret lookup per (provider, key name). Blank values count as missing.
pub trait CredentialStore: Send + Sync {
    fn lookup(&self, provider: ProviderId, key_name: &str) -> Option<String>;
}

/// Reads `OPENAI_API_KEY`, `GEMINI_API_KEY`, ..., and `<PROVIDER>_BASE_URL`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentialStore;

impl EnvCredentialStore {
    pub fn env_var_name(provider: ProviderId, key_name: &str) -> String {
        format!(
            "{}_{}",
            provider.as_str().to_uppercase(),
            key_name.to_uppercase()
        )
    }
}

impl CredentialStore for EnvCredentialStore {
    fn lookup(&self, provider: ProviderId, key_name: &str) -> Option<String> {
        let mut names = vec![Self::env_var_name(provider, key_name)];
        // Google's own SDKs read GOOGLE_API_KEY.
        if provider == ProviderId::Gemini && key_name == API_KEY {
            names.push("GOOGLE_API_KEY".to_string());
        }
        names
            .iter()
            .filter_map(|n| std::env::var(n).ok())
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
    }
}

/// Fixed in-memory credentials, for tests and embedding.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    values: HashMap<(ProviderId, String), String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: ProviderId, key_name: &str, value: impl Into<String>) -> Self {
        self.values
            .insert((provider, key_name.to_string()), value.into());
        self
    }

    pub fn with_api_key(self, provider: ProviderId, value: impl Into<String>) -> Self {
        self.with(provider, API_KEY, value)
    }
}

impl CredentialStore for StaticCredentials {
    fn lookup(&self, provider: ProviderId, key_name: &str) -> Option<String> {
        self.values
            .get(&(provider, key_name.to_string()))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}
