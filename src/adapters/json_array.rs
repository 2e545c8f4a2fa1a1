use super::{history_text, last_user_index, turn_attachments, FrameEvent, ProviderAdapter, UpstreamFailure};
use crate::constants::DEFAULT_MAX_OUTPUT_TOKENS;
use crate::framing::{Frame, Framing};
use crate::specs::gemini::{
    GeminiBlob, GeminiContent, GeminiErrorEnvelope, GeminiGenerationConfig, GeminiPart,
    GeminiRequest, GeminiResponseChunk,
};
use crate::types::{ChatMessage, NormalizedAttachment, Result, Role};
use serde_json::Value;

/// Gemini `streamGenerateContent`, which streams one bracketed JSON array.
pub struct GeminiAdapter;

impl GeminiAdapter {
    fn turn_parts(text: &str, attachments: &[&NormalizedAttachment]) -> Vec<GeminiPart> {
        let mut parts = Vec::with_capacity(attachments.len() + 1);
        if !text.is_empty() {
            parts.push(GeminiPart::Text {
                text: text.to_string(),
            });
        }
        for a in attachments {
            match a {
                NormalizedAttachment::Image {
                    mime_type, base64, ..
                } => parts.push(GeminiPart::InlineData {
                    inline_data: GeminiBlob {
                        mime_type: mime_type.clone(),
                        data: base64.clone(),
                    },
                }),
                other => parts.push(GeminiPart::Text {
                    text: other.as_text_marker(),
                }),
            }
        }
        if parts.is_empty() {
            parts.push(GeminiPart::Text {
                text: String::new(),
            });
        }
        parts
    }

    fn role(role: Role) -> String {
        match role {
            Role::User => "user".to_string(),
            Role::Assistant => "model".to_string(),
        }
    }
}

impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn framing(&self) -> Framing {
        Framing::JsonArray
    }

    fn build_payload(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        attachments: &[NormalizedAttachment],
        _model_id: &str,
    ) -> Result<Value> {
        let target = last_user_index(messages);
        let mut contents = Vec::with_capacity(messages.len() + 1);

        for (i, m) in messages.iter().enumerate() {
            let parts = if Some(i) == target {
                Self::turn_parts(&m.text, &turn_attachments(Some(m), attachments))
            } else {
                vec![GeminiPart::Text {
                    text: history_text(m),
                }]
            };
            contents.push(GeminiContent {
                role: Some(Self::role(m.role)),
                parts,
            });
        }

        if target.is_none() && !attachments.is_empty() {
            contents.push(GeminiContent {
                role: Some("user".to_string()),
                parts: Self::turn_parts("", &turn_attachments(None, attachments)),
            });
        }

        let system_instruction = if system_prompt.trim().is_empty() {
            None
        } else {
            Some(GeminiContent {
                role: None,
                parts: vec![GeminiPart::Text {
                    text: system_prompt.to_string(),
                }],
            })
        };

        let request = GeminiRequest {
            contents,
            system_instruction,
            generation_config: GeminiGenerationConfig {
                max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            },
        };
        Ok(serde_json::to_value(request)?)
    }

    fn endpoint(
        &self,
        base_url: &str,
        model_id: &str,
        api_key: Option<&str>,
    ) -> (String, Vec<(String, String)>) {
        let model = model_id.strip_prefix("models/").unwrap_or(model_id);
        let url = format!(
            "{}/models/{}:streamGenerateContent",
            base_url.trim_end_matches('/'),
            model
        );
        // Key goes in a header, never the URL.
        let headers = api_key
            .map(|key| vec![("x-goog-api-key".to_string(), key.to_string())])
            .unwrap_or_default();
        (url, headers)
    }

    fn interpret_frame(&self, frame: &Frame) -> std::result::Result<Vec<FrameEvent>, UpstreamFailure> {
        // Error elements are more specific; every field of a chunk is optional.
        if let Ok(envelope) = serde_json::from_str::<GeminiErrorEnvelope>(&frame.data) {
            let message = match envelope.error.status {
                Some(status) => format!("{}: {}", status, envelope.error.message),
                None => envelope.error.message,
            };
            return Err(UpstreamFailure::classified(envelope.error.code, message));
        }

        let chunk = match serde_json::from_str::<GeminiResponseChunk>(&frame.data) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(
                    "[☁️  -> ⚙️ ] Skipping unparsable gemini element ({}): {}",
                    e,
                    crate::str_utils::snippet(&frame.data, 120)
                );
                return Ok(Vec::new());
            }
        };

        if let Some(reason) = chunk.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(UpstreamFailure::fatal(format!("prompt blocked: {}", reason)));
        }

        Ok(chunk
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|content| content.parts)
            .filter(|p| !p.thought)
            .filter_map(|p| p.text)
            .filter(|t| !t.is_empty())
            .map(FrameEvent::Text)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::FailureClass;

    #[test]
    fn test_payload_shape() {
        let messages = vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
            ChatMessage::user("see image"),
        ];
        let attachments = vec![NormalizedAttachment::Image {
            name: "a.webp".into(),
            mime_type: "image/webp".into(),
            base64: "UklG".into(),
            data_url: "data:image/webp;base64,UklG".into(),
        }];
        let body = match GeminiAdapter.build_payload("rules", &messages, &attachments, "gemini-2.5-pro") {
            Ok(b) => b,
            Err(e) => panic!("payload failed: {}", e),
        };
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "rules");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][2]["parts"][0]["text"], "see image");
        assert_eq!(body["contents"][2]["parts"][1]["inlineData"]["mimeType"], "image/webp");
        assert!(body["contents"][0]["parts"][0].get("inlineData").is_none());
        assert_eq!(body["generationConfig"]["maxOutputTokens"], DEFAULT_MAX_OUTPUT_TOKENS);
    }

    #[test]
    fn test_endpoint_sends_key_as_header() {
        let (url, headers) = GeminiAdapter.endpoint(
            "https://generativelanguage.googleapis.com/v1beta",
            "models/gemini-2.5-flash",
            Some("AIza/XYZ+&q=1"),
        );
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:streamGenerateContent"
        );
        assert!(!url.contains("AIza"));
        assert_eq!(
            headers,
            vec![("x-goog-api-key".to_string(), "AIza/XYZ+&q=1".to_string())]
        );
    }

    #[test]
    fn test_thought_parts_are_dropped() {
        let frame = Frame::data(
            r#"{"candidates":[{"content":{"parts":[{"text":"thinking","thought":true},{"text":"answer"}],"role":"model"}}]}"#,
        );
        assert_eq!(GeminiAdapter.interpret_frame(&frame), Ok(vec![FrameEvent::Text("answer".into())]));
    }

    #[test]
    fn test_error_element() {
        let frame = Frame::data(
            r#"{"error":{"code":429,"message":"Quota exceeded","status":"RESOURCE_EXHAUSTED"}}"#,
        );
        match GeminiAdapter.interpret_frame(&frame) {
            Err(f) => {
                assert_eq!(f.status, Some(429));
                assert_eq!(f.class, FailureClass::FallbackEligible);
                assert!(f.message.starts_with("RESOURCE_EXHAUSTED"));
            }
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_blocked_prompt_is_fatal() {
        let frame = Frame::data(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#);
        match GeminiAdapter.interpret_frame(&frame) {
            Err(f) => assert_eq!(f.class, FailureClass::Fatal),
            other => panic!("Expected failure, got {:?}", other),
        }
    }
}
