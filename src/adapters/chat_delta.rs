use super::{
    history_text, last_user_index, turn_attachments, FrameEvent, ProviderAdapter, UpstreamFailure,
};
use crate::framing::{Frame, Framing};
use crate::specs::openai::{
    OpenAiContent, OpenAiContentPart, OpenAiErrorEnvelope, OpenAiImageUrl, OpenAiMessage,
    OpenAiRequest, OpenAiStreamChunk,
};
use crate::types::{ChatMessage, NormalizedAttachment, ProviderId, Result, Role};
use serde_json::Value;

/// OpenAI-compatible `chat/completions` streaming (OpenAI, OpenRouter, Groq).
pub struct ChatDeltaAdapter {
    pub provider: ProviderId,
}

impl ChatDeltaAdapter {
    fn turn_content(text: &str, attachments: &[&NormalizedAttachment]) -> OpenAiContent {
        if attachments.is_empty() {
            return OpenAiContent::String(text.to_string());
        }
        let mut parts = Vec::with_capacity(attachments.len() + 1);
        if !text.is_empty() {
            parts.push(OpenAiContentPart::Text {
                text: text.to_string(),
            });
        }
        for a in attachments {
            match a {
                NormalizedAttachment::Image { data_url, .. } => {
                    parts.push(OpenAiContentPart::ImageUrl {
                        image_url: OpenAiImageUrl {
                            url: data_url.clone(),
                        },
                    })
                }
                other => parts.push(OpenAiContentPart::Text {
                    text: other.as_text_marker(),
                }),
            }
        }
        OpenAiContent::Parts(parts)
    }
}

impl ProviderAdapter for ChatDeltaAdapter {
    fn name(&self) -> &'static str {
        self.provider.as_str()
    }

    fn framing(&self) -> Framing {
        Framing::SseBlocks
    }

    fn build_payload(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        attachments: &[NormalizedAttachment],
        model_id: &str,
    ) -> Result<Value> {
        let target = last_user_index(messages);
        let mut out = Vec::with_capacity(messages.len() + 2);

        if !system_prompt.trim().is_empty() {
            out.push(OpenAiMessage::System {
                content: system_prompt.to_string(),
            });
        }

        for (i, m) in messages.iter().enumerate() {
            match m.role {
                Role::Assistant => out.push(OpenAiMessage::Assistant {
                    content: m.text.clone(),
                }),
                Role::User if Some(i) == target => out.push(OpenAiMessage::User {
                    content: Self::turn_content(&m.text, &turn_attachments(Some(m), attachments)),
                }),
                Role::User => out.push(OpenAiMessage::User {
                    content: OpenAiContent::String(history_text(m)),
                }),
            }
        }

        if target.is_none() && !attachments.is_empty() {
            out.push(OpenAiMessage::User {
                content: Self::turn_content("", &turn_attachments(None, attachments)),
            });
        }

        let request = OpenAiRequest {
            model: model_id.to_string(),
            messages: out,
            stream: Some(true),
            max_tokens: None,
        };
        Ok(serde_json::to_value(request)?)
    }

    fn endpoint(
        &self,
        base_url: &str,
        _model_id: &str,
        api_key: Option<&str>,
    ) -> (String, Vec<(String, String)>) {
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        let mut headers = Vec::new();
        if let Some(key) = api_key {
            headers.push(("Authorization".to_string(), format!("Bearer {}", key)));
        }
        if self.provider == ProviderId::OpenRouter {
            headers.push(("X-Title".to_string(), "patchflow".to_string()));
        }
        (url, headers)
    }

    fn interpret_frame(&self, frame: &Frame) -> std::result::Result<Vec<FrameEvent>, UpstreamFailure> {
        let data = frame.data.trim();
        if data.is_empty() {
            return Ok(Vec::new());
        }
        if data == "[DONE]" {
            return Ok(vec![FrameEvent::Finished]);
        }

        // OpenRouter reports mid-stream provider failures as a chunk with an `error` object.
        if let Ok(envelope) = serde_json::from_str::<OpenAiErrorEnvelope>(data) {
            return Err(UpstreamFailure::classified(
                envelope.error.status_code(),
                envelope.error.message,
            ));
        }

        match serde_json::from_str::<OpenAiStreamChunk>(data) {
            Ok(chunk) => Ok(chunk
                .choices
                .into_iter()
                .filter_map(|c| c.delta.content)
                .filter(|t| !t.is_empty())
                .map(FrameEvent::Text)
                .collect()),
            Err(e) => {
                tracing::debug!(
                    "[☁️  -> ⚙️ ] Skipping unparsable {} frame ({}): {}",
                    self.provider,
                    e,
                    crate::str_utils::snippet(data, 120)
                );
                Ok(Vec::new())
            }
        }
    }
}
