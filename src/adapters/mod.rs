pub mod anthropic;
pub mod chat_delta;
pub mod json_array;
pub mod ndjson;
pub mod single_shot;

use crate::constants::{FALLBACK_ELIGIBLE_MARKERS, FALLBACK_ELIGIBLE_STATUS_CODES, MAX_STREAM_FRAMES};
use crate::framing::{Frame, FrameCodec, Framing};
use crate::transport::ProviderRequest;
use crate::types::{ChatMessage, NormalizedAttachment, PatchflowError, ProviderId, Result, Role};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

/// What a single upstream frame meant, before the gateway maps it to canonical events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    Text(String),
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Safe to retry on another model while nothing has been shown yet.
    FallbackEligible,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamFailure {
    pub status: Option<u16>,
    pub message: String,
    pub class: FailureClass,
}

impl UpstreamFailure {
    pub fn classified(status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        let class = classify_failure(status, &message);
        Self {
            status,
            message,
            class,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            class: FailureClass::FallbackEligible,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            class: FailureClass::Fatal,
        }
    }

    pub fn is_fallback_eligible(&self) -> bool {
        self.class == FailureClass::FallbackEligible
    }

    pub fn into_error(self, provider: ProviderId) -> PatchflowError {
        PatchflowError::Upstream {
            provider,
            status: self.status,
            fallback_eligible: self.is_fallback_eligible(),
            message: self.message,
        }
    }
}

impl std::fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {}: {}", status, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// 401/403 and malformed requests are never worth another model; throttling,
/// outages and missing models are.
pub fn classify_failure(status: Option<u16>, message: &str) -> FailureClass {
    if let Some(code) = status {
        if matches!(code, 400 | 401 | 403 | 422) {
            return FailureClass::Fatal;
        }
        if FALLBACK_ELIGIBLE_STATUS_CODES.contains(&code) || (500..600).contains(&code) {
            return FailureClass::FallbackEligible;
        }
    }
    let lower = message.to_lowercase();
    if FALLBACK_ELIGIBLE_MARKERS.iter().any(|m| lower.contains(m)) {
        FailureClass::FallbackEligible
    } else {
        FailureClass::Fatal
    }
}

/// Pulls a human-readable message out of the common vendor error shapes.
pub fn extract_error_message(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty error body".to_string();
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(v) => match error_message_from_value(&v) {
            Some(m) => m,
            None => crate::str_utils::snippet(trimmed, 500),
        },
        Err(_) => crate::str_utils::snippet(trimmed, 500),
    }
}

fn error_message_from_value(v: &Value) -> Option<String> {
    if let Value::Array(items) = v {
        return items.iter().find_map(error_message_from_value);
    }
    let candidates = [
        v.pointer("/error/message"),
        v.get("message"),
        v.get("error"),
        v.get("detail"),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|c| c.as_str().map(|s| s.to_string()))
}

/// One implementation per upstream wire style.
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn framing(&self) -> Framing;

    /// Request body. Attachments land on the last user message only; the system
    /// prompt goes into the provider's own slot exactly once.
    fn build_payload(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        attachments: &[NormalizedAttachment],
        model_id: &str,
    ) -> Result<Value>;

    fn endpoint(
        &self,
        base_url: &str,
        model_id: &str,
        api_key: Option<&str>,
    ) -> (String, Vec<(String, String)>);

    /// `Ok(vec![])` means "nothing useful in this frame"; unparsable frames end up there too.
    fn interpret_frame(&self, frame: &Frame) -> std::result::Result<Vec<FrameEvent>, UpstreamFailure>;

    fn classify_error_body(&self, status: u16, body: &str) -> UpstreamFailure {
        UpstreamFailure::classified(Some(status), extract_error_message(body))
    }
}

pub static OPENAI: chat_delta::ChatDeltaAdapter = chat_delta::ChatDeltaAdapter {
    provider: ProviderId::OpenAi,
};
pub static OPENROUTER: chat_delta::ChatDeltaAdapter = chat_delta::ChatDeltaAdapter {
    provider: ProviderId::OpenRouter,
};
pub static GROQ: chat_delta::ChatDeltaAdapter = chat_delta::ChatDeltaAdapter {
    provider: ProviderId::Groq,
};

pub fn adapter_for(provider: ProviderId) -> &'static dyn ProviderAdapter {
    match provider {
        ProviderId::OpenAi => &OPENAI,
        ProviderId::OpenRouter => &OPENROUTER,
        ProviderId::Groq => &GROQ,
        ProviderId::Anthropic => &anthropic::AnthropicAdapter,
        ProviderId::Gemini => &json_array::GeminiAdapter,
        ProviderId::Ollama => &ndjson::OllamaAdapter,
        ProviderId::Cohere => &single_shot::CohereAdapter,
    }
}

pub fn build_request(
    adapter: &dyn ProviderAdapter,
    system_prompt: &str,
    messages: &[ChatMessage],
    attachments: &[NormalizedAttachment],
    model_id: &str,
    base_url: &str,
    api_key: Option<&str>,
) -> Result<ProviderRequest> {
    let body = adapter.build_payload(system_prompt, messages, attachments, model_id)?;
    let (url, headers) = adapter.endpoint(base_url, model_id, api_key);
    Ok(ProviderRequest { url, headers, body })
}

/// Lazily frames and interprets an upstream body. Ends after `Finished`, after the
/// first failure, or when the body runs out.
pub fn decode<S>(
    adapter: &'static dyn ProviderAdapter,
    body: S,
) -> impl Stream<Item = std::result::Result<FrameEvent, UpstreamFailure>> + Send
where
    S: Stream<Item = std::io::Result<Bytes>> + Send + Unpin + 'static,
{
    async_stream::stream! {
        let mut frames = FramedRead::new(StreamReader::new(body), FrameCodec::new(adapter.framing()));
        let mut frame_count = 0usize;
        while let Some(next) = frames.next().await {
            let frame = match next {
                Ok(frame) => frame,
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                    yield Err(UpstreamFailure::fatal(format!("malformed upstream stream: {}", e)));
                    return;
                }
                Err(e) => {
                    yield Err(UpstreamFailure::network(format!("upstream read failed: {}", e)));
                    return;
                }
            };

            frame_count += 1;
            if frame_count > MAX_STREAM_FRAMES {
                tracing::error!("[☁️  -> ⚙️ ] {} stream exceeded {} frames", adapter.name(), MAX_STREAM_FRAMES);
                yield Err(UpstreamFailure::fatal("stream exceeded frame limit"));
                return;
            }

            match adapter.interpret_frame(&frame) {
                Ok(events) => {
                    for event in events {
                        let finished = event == FrameEvent::Finished;
                        yield Ok(event);
                        if finished {
                            return;
                        }
                    }
                }
                Err(failure) => {
                    tracing::warn!("[☁️  -> ⚙️ ] {} error frame: {}", adapter.name(), failure);
                    yield Err(failure);
                    return;
                }
            }
        }
    }
}

/// Index of the message that receives this turn's attachments.
pub(crate) fn last_user_index(messages: &[ChatMessage]) -> Option<usize> {
    messages.iter().rposition(|m| m.role == Role::User)
}

/// Attachments rendered natively for the current turn: explicit ones first, then
/// any already carried on the message.
pub(crate) fn turn_attachments<'a>(
    message: Option<&'a ChatMessage>,
    extra: &'a [NormalizedAttachment],
) -> Vec<&'a NormalizedAttachment> {
    let mut all: Vec<&NormalizedAttachment> = extra.iter().collect();
    if let Some(m) = message {
        all.extend(m.attachments.iter());
    }
    all
}

/// Earlier turns keep only a mention of what they carried.
pub(crate) fn history_text(message: &ChatMessage) -> String {
    if message.attachments.is_empty() {
        return message.text.clone();
    }
    let markers: Vec<String> = message
        .attachments
        .iter()
        .map(|a| format!("[Attached earlier: {}]", a.name()))
        .collect();
    format!("{}\n\n{}", message.text, markers.join("\n"))
}

/// Text with non-native attachments inlined as markers. Images are only inlined
/// when the provider has no way to carry them.
pub(crate) fn text_with_markers(
    text: &str,
    attachments: &[&NormalizedAttachment],
    inline_images: bool,
) -> String {
    let mut out = text.to_string();
    for a in attachments {
        if matches!(a, NormalizedAttachment::Image { .. }) && !inline_images {
            continue;
        }
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&a.as_text_marker());
    }
    out
}

pub(crate) fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_by_status() {
        assert_eq!(classify_failure(Some(429), "slow down"), FailureClass::FallbackEligible);
        assert_eq!(classify_failure(Some(503), ""), FailureClass::FallbackEligible);
        assert_eq!(classify_failure(Some(401), "rate limit"), FailureClass::Fatal);
        assert_eq!(classify_failure(Some(400), "bad field"), FailureClass::Fatal);
    }

    #[test]
    fn test_classification_by_message() {
        assert_eq!(
            classify_failure(None, "No endpoints found for model x"),
            FailureClass::FallbackEligible
        );
        assert_eq!(classify_failure(None, "Model is overloaded"), FailureClass::FallbackEligible);
        assert_eq!(classify_failure(None, "content policy violation"), FailureClass::Fatal);
    }

    #[test]
    fn test_extract_error_message_shapes() {
        assert_eq!(extract_error_message(r#"{"error":{"message":"boom"}}"#), "boom");
        assert_eq!(extract_error_message(r#"{"message":"nope"}"#), "nope");
        assert_eq!(extract_error_message(r#"[{"error":{"code":429,"message":"quota"}}]"#), "quota");
        assert_eq!(extract_error_message("plain text"), "plain text");
        assert_eq!(extract_error_message("  "), "empty error body");
    }

    #[test]
    fn test_adapter_dispatch_covers_every_provider() {
        for p in ProviderId::ALL {
            let adapter = adapter_for(p);
            assert!(!adapter.name().is_empty());
        }
        assert_eq!(adapter_for(ProviderId::Groq).name(), "groq");
        assert_eq!(adapter_for(ProviderId::Gemini).framing(), Framing::JsonArray);
        assert_eq!(adapter_for(ProviderId::Cohere).framing(), Framing::WholeBody);
    }

    #[test]
    fn test_history_text_mentions_attachments() {
        let mut m = ChatMessage::user("look");
        m.attachments.push(NormalizedAttachment::Text {
            name: "a.txt".into(),
            content: "x".into(),
            truncated: false,
        });
        assert_eq!(history_text(&m), "look\n\n[Attached earlier: a.txt]");
    }

    #[tokio::test]
    async fn test_decode_stops_at_finished_and_skips_noise() {
        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"he\"}}]}\n\n")),
            Ok(Bytes::from_static(b"data: not json\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\n")),
            Ok(Bytes::from_static(b"data: [DONE]\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n\n")),
        ];
        let body = futures_util::stream::iter(chunks);
        let events: Vec<_> = decode(adapter_for(ProviderId::OpenAi), body).collect().await;
        assert_eq!(
            events,
            vec![
                Ok(FrameEvent::Text("he".into())),
                Ok(FrameEvent::Text("llo".into())),
                Ok(FrameEvent::Finished),
            ]
        );
    }
}
