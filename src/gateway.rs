use crate::adapters::{adapter_for, build_request, decode, FrameEvent, UpstreamFailure};
use crate::constants::{default_base_url, FREE_TIER_FALLBACK_MODELS, FREE_TIER_SUFFIX};
use crate::credentials::{CredentialStore, EnvCredentialStore, API_KEY, BASE_URL};
use crate::logging::StreamMetric;
use crate::rate_limit::extract_windows;
use crate::transport::UpstreamTransport;
use crate::types::{
    CanonicalStreamEvent, ChatMessage, NormalizedAttachment, ObservedError, PatchflowError,
    ProviderId, RateLimitWindow, RequestId,
};
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ChatTurnRequest {
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    pub attachments: Vec<NormalizedAttachment>,
    pub provider: ProviderId,
    pub model_id: String,
}

/// Requested model first; the OpenRouter free tier then walks the shared free list.
pub fn model_candidates(provider: ProviderId, model_id: &str) -> Vec<String> {
    let mut candidates = vec![model_id.to_string()];
    if provider == ProviderId::OpenRouter && model_id.ends_with(FREE_TIER_SUFFIX) {
        for fallback in FREE_TIER_FALLBACK_MODELS {
            if !candidates.iter().any(|c| c == fallback) {
                candidates.push(fallback.to_string());
            }
        }
    }
    candidates
}

fn transport_failure(error: ObservedError) -> UpstreamFailure {
    match error.inner {
        PatchflowError::Network(e) => UpstreamFailure::network(format!("network error: {}", e)),
        PatchflowError::Io(e) => UpstreamFailure::network(format!("network error: {}", e)),
        other => UpstreamFailure::fatal(other.to_string()),
    }
}

#[derive(Clone)]
pub struct StreamingGateway {
    transport: Arc<dyn UpstreamTransport>,
    credentials: Arc<dyn CredentialStore>,
}

impl StreamingGateway {
    pub fn new(transport: Arc<dyn UpstreamTransport>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            transport,
            credentials,
        }
    }

    pub fn is_configured(&self, provider: ProviderId) -> bool {
        !provider.requires_api_key() || self.credentials.lookup(provider, API_KEY).is_some()
    }

    fn base_url(&self, provider: ProviderId) -> String {
        match self.credentials.lookup(provider, BASE_URL) {
            Some(url) => url,
            None => default_base_url(provider).to_string(),
        }
    }

    /// Streams one chat turn as canonical events. Nothing happens until the stream
    /// is polled. The sequence ends with exactly one `done` or `error`, unless
    /// `cancel` fires first, in which case it simply stops.
    pub fn run_chat_turn(
        &self,
        request: ChatTurnRequest,
        cancel: CancellationToken,
    ) -> impl Stream<Item = CanonicalStreamEvent> + Send + 'static {
        let gateway = self.clone();
        async_stream::stream! {
            let request_id = RequestId::new();
            let started = Instant::now();
            let mut metrics = StreamMetric::new();
            let provider = request.provider;
            let adapter = adapter_for(provider);

            let api_key = gateway.credentials.lookup(provider, API_KEY);
            if api_key.is_none() && provider.requires_api_key() {
                let error = PatchflowError::Configuration(format!(
                    "no API key for {}; set {}",
                    provider,
                    EnvCredentialStore::env_var_name(provider, API_KEY)
                ));
                tracing::warn!("[⚙️ ] {} {}", request_id.short(), error);
                metrics.log_summary(provider, &request.model_id, "config_error", started.elapsed());
                yield CanonicalStreamEvent::Error { message: error.to_string() };
                return;
            }
            let base_url = gateway.base_url(provider);
            let candidates = model_candidates(provider, &request.model_id);
            let mut forwarded_text = false;

            for (index, model) in candidates.iter().enumerate() {
                if cancel.is_cancelled() {
                    tracing::info!("[⚙️ ] {} cancelled before attempt {}", request_id.short(), index + 1);
                    return;
                }
                metrics.record_attempt();

                let outgoing = match build_request(
                    adapter,
                    &request.system_prompt,
                    &request.messages,
                    &request.attachments,
                    model,
                    &base_url,
                    api_key.as_deref(),
                ) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::error!("[⚙️ ] {} failed to build {} request: {}", request_id.short(), provider, e);
                        yield CanonicalStreamEvent::Error { message: e.to_string() };
                        return;
                    }
                };

                tracing::info!(
                    "[⚙️  -> ☁️ ] {} {}/{} (attempt {}/{})",
                    request_id.short(),
                    provider,
                    model,
                    index + 1,
                    candidates.len()
                );

                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    r = gateway.transport.send(outgoing) => Some(r),
                };
                let response = match sent {
                    Some(r) => r,
                    None => {
                        tracing::info!("[⚙️ ] {} cancelled while connecting", request_id.short());
                        return;
                    }
                };

                let failure = match response {
                    Err(e) => transport_failure(e),
                    Ok(resp) if !resp.is_success() => {
                        let status = resp.status;
                        let body = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => None,
                            text = resp.text() => Some(text),
                        };
                        match body {
                            Some(body) => adapter.classify_error_body(status, &body),
                            None => return,
                        }
                    }
                    Ok(resp) => {
                        for (resource, window) in extract_windows(provider, &resp.headers, Utc::now()) {
                            metrics.record_rate_limit();
                            yield CanonicalStreamEvent::RateLimit { provider, resource, window };
                        }

                        let events = decode(adapter, resp.body);
                        futures_util::pin_mut!(events);
                        let mut attempt_text = false;
                        let outcome = loop {
                            let next = tokio::select! {
                                biased;
                                _ = cancel.cancelled() => None,
                                n = events.next() => Some(n),
                            };
                            match next {
                                None => {
                                    tracing::info!(
                                        "[⚙️ ] {} cancelled mid-stream after {} chars",
                                        request_id.short(),
                                        metrics.text_chars
                                    );
                                    metrics.log_summary(provider, model, "cancelled", started.elapsed());
                                    return;
                                }
                                Some(Some(Ok(FrameEvent::Text(content)))) => {
                                    forwarded_text = true;
                                    attempt_text = true;
                                    metrics.record_text(&content);
                                    yield CanonicalStreamEvent::Text { content };
                                }
                                Some(Some(Ok(FrameEvent::Finished))) | Some(None) => break None,
                                Some(Some(Err(failure))) => break Some(failure),
                            }
                        };

                        match outcome {
                            None if attempt_text => {
                                metrics.log_summary(provider, model, "done", started.elapsed());
                                yield CanonicalStreamEvent::Done;
                                return;
                            }
                            None => UpstreamFailure::network(format!("empty response from {}", model)),
                            Some(failure) => failure,
                        }
                    }
                };

                let has_more = index + 1 < candidates.len();
                if !forwarded_text && failure.is_fallback_eligible() && has_more {
                    tracing::warn!(
                        "[☁️  -> ⚙️ ] {} {} failed before any output ({}); falling back to {}",
                        request_id.short(),
                        model,
                        failure,
                        candidates[index + 1]
                    );
                    continue;
                }

                if forwarded_text {
                    tracing::warn!(
                        "[☁️  -> ⚙️ ] {} {} failed after partial output; keeping {} chars",
                        request_id.short(),
                        model,
                        metrics.text_chars
                    );
                }
                let error = failure.into_error(provider);
                tracing::error!("[☁️  -> ⚙️ ] {} {}", request_id.short(), error);
                metrics.log_summary(provider, model, "error", started.elapsed());
                yield CanonicalStreamEvent::Error { message: error.to_string() };
                return;
            }
        }
    }
}

/// A drained chat turn.
#[derive(Debug, Clone, Default)]
pub struct CollectedReply {
    pub text: String,
    /// Set when the stream ended in `error`; `text` then holds the partial answer.
    pub error: Option<String>,
    pub rate_limits: Vec<(ProviderId, String, RateLimitWindow)>,
    /// False when the stream stopped without a terminal event (cancellation).
    pub completed: bool,
}

pub async fn collect_reply<S>(events: S) -> CollectedReply
where
    S: Stream<Item = CanonicalStreamEvent>,
{
    futures_util::pin_mut!(events);
    let mut reply = CollectedReply::default();
    while let Some(event) = events.next().await {
        match event {
            CanonicalStreamEvent::Text { content } => reply.text.push_str(&content),
            CanonicalStreamEvent::RateLimit {
                provider,
                resource,
                window,
            } => reply.rate_limits.push((provider, resource, window)),
            CanonicalStreamEvent::Error { message } => {
                reply.error = Some(message);
                reply.completed = true;
            }
            CanonicalStreamEvent::Done => reply.completed = true,
        }
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_tier_candidates_are_deduplicated() {
        let first = FREE_TIER_FALLBACK_MODELS[1];
        let candidates = model_candidates(ProviderId::OpenRouter, first);
        assert_eq!(candidates[0], first);
        assert_eq!(candidates.len(), FREE_TIER_FALLBACK_MODELS.len());
        let unique: std::collections::HashSet<&String> = candidates.iter().collect();
        assert_eq!(unique.len(), candidates.len());
    }

    #[test]
    fn test_paid_models_have_single_candidate() {
        assert_eq!(model_candidates(ProviderId::OpenRouter, "openai/gpt-4o"), vec!["openai/gpt-4o"]);
        assert_eq!(model_candidates(ProviderId::Groq, "llama:free"), vec!["llama:free"]);
    }
}
