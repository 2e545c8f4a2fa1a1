use super::{
    history_text, last_user_index, role_name, text_with_markers, turn_attachments, FrameEvent,
    ProviderAdapter, UpstreamFailure,
};
use crate::framing::{Frame, Framing};
use crate::specs::cohere::{CohereError, CohereMessage, CohereRequest, CohereResponse};
use crate::types::{ChatMessage, NormalizedAttachment, Result};
use serde_json::Value;

/// Cohere chat v2 without streaming: the whole body is one response event.
pub struct CohereAdapter;

impl ProviderAdapter for CohereAdapter {
    fn name(&self) -> &'static str {
        "cohere"
    }

    fn framing(&self) -> Framing {
        Framing::WholeBody
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
            out.push(CohereMessage {
                role: "system".to_string(),
                content: system_prompt.to_string(),
            });
        }

        for (i, m) in messages.iter().enumerate() {
            let content = if Some(i) == target {
                text_with_markers(&m.text, &turn_attachments(Some(m), attachments), true)
            } else {
                history_text(m)
            };
            out.push(CohereMessage {
                role: role_name(m.role).to_string(),
                content,
            });
        }

        if target.is_none() && !attachments.is_empty() {
            out.push(CohereMessage {
                role: "user".to_string(),
                content: text_with_markers("", &turn_attachments(None, attachments), true),
            });
        }

        let request = CohereRequest {
            model: model_id.to_string(),
            messages: out,
            stream: false,
        };
        Ok(serde_json::to_value(request)?)
    }

    fn endpoint(
        &self,
        base_url: &str,
        _model_id: &str,
        api_key: Option<&str>,
    ) -> (String, Vec<(String, String)>) {
        let url = format!("{}/chat", base_url.trim_end_matches('/'));
        let headers = match api_key {
            Some(key) => vec![("Authorization".to_string(), format!("Bearer {}", key))],
            None => Vec::new(),
        };
        (url, headers)
    }

    fn interpret_frame(&self, frame: &Frame) -> std::result::Result<Vec<FrameEvent>, UpstreamFailure> {
        if let Ok(response) = serde_json::from_str::<CohereResponse>(&frame.data) {
            if let Some(message) = response.message {
                let mut events: Vec<FrameEvent> = message
                    .content
                    .into_iter()
                    .filter(|block| block.kind == "text")
                    .filter_map(|block| block.text)
                    .filter(|t| !t.is_empty())
                    .map(FrameEvent::Text)
                    .collect();
                events.push(FrameEvent::Finished);
                return Ok(events);
            }
        }

        if let Ok(error) = serde_json::from_str::<CohereError>(&frame.data) {
            return Err(UpstreamFailure::classified(None, error.message));
        }

        tracing::debug!(
            "[☁️  -> ⚙️ ] Unrecognized cohere body: {}",
            crate::str_utils::snippet(&frame.data, 120)
        );
        Ok(Vec::new())
    }
}
