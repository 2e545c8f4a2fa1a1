use super::{
    history_text, last_user_index, role_name, turn_attachments, FrameEvent, ProviderAdapter,
    UpstreamFailure,
};
use crate::constants::{ANTHROPIC_VERSION, DEFAULT_MAX_OUTPUT_TOKENS};
use crate::framing::{Frame, Framing};
use crate::specs::anthropic::{
    AnthropicContent, AnthropicContentPart, AnthropicDelta, AnthropicErrorEnvelope,
    AnthropicImageSource, AnthropicMessage, AnthropicRequest, AnthropicStreamEvent,
};
use crate::types::{ChatMessage, NormalizedAttachment, Result, Role};
use serde_json::Value;

/// Anthropic Messages API with `event:`/`data:` SSE.
pub struct AnthropicAdapter;

impl AnthropicAdapter {
    fn turn_content(text: &str, attachments: &[&NormalizedAttachment]) -> AnthropicContent {
        if attachments.is_empty() {
            return AnthropicContent::String(text.to_string());
        }
        let mut parts = Vec::with_capacity(attachments.len() + 1);
        for a in attachments {
            match a {
                NormalizedAttachment::Image {
                    mime_type, base64, ..
                } => parts.push(AnthropicContentPart::Image {
                    source: AnthropicImageSource {
                        r#type: "base64".to_string(),
                        media_type: mime_type.clone(),
                        data: base64.clone(),
                    },
                }),
                other => parts.push(AnthropicContentPart::Text {
                    text: other.as_text_marker(),
                }),
            }
        }
        // Anthropic recommends images before the question that refers to them.
        if !text.is_empty() {
            parts.push(AnthropicContentPart::Text {
                text: text.to_string(),
            });
        }
        AnthropicContent::Parts(parts)
    }

    fn kind_to_status(kind: &str) -> Option<u16> {
        match kind {
            "rate_limit_error" => Some(429),
            "overloaded_error" => Some(529),
            "not_found_error" => Some(404),
            "api_error" => Some(500),
            "authentication_error" => Some(401),
            "permission_error" => Some(403),
            "invalid_request_error" => Some(400),
            _ => None,
        }
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
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
        let mut out = Vec::with_capacity(messages.len() + 1);

        for (i, m) in messages.iter().enumerate() {
            let content = if Some(i) == target {
                Self::turn_content(&m.text, &turn_attachments(Some(m), attachments))
            } else if m.role == Role::User {
                AnthropicContent::String(history_text(m))
            } else {
                AnthropicContent::String(m.text.clone())
            };
            out.push(AnthropicMessage {
                role: role_name(m.role).to_string(),
                content,
            });
        }

        if target.is_none() && !attachments.is_empty() {
            out.push(AnthropicMessage {
                role: "user".to_string(),
                content: Self::turn_content("", &turn_attachments(None, attachments)),
            });
        }

        let system = if system_prompt.trim().is_empty() {
            None
        } else {
            Some(system_prompt.to_string())
        };

        let request = AnthropicRequest {
            model: model_id.to_string(),
            system,
            messages: out,
            max_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            stream: Some(true),
        };
        Ok(serde_json::to_value(request)?)
    }

    fn endpoint(
        &self,
        base_url: &str,
        _model_id: &str,
        api_key: Option<&str>,
    ) -> (String, Vec<(String, String)>) {
        let url = format!("{}/messages", base_url.trim_end_matches('/'));
        let mut headers = vec![(
            "anthropic-version".to_string(),
            ANTHROPIC_VERSION.to_string(),
        )];
        if let Some(key) = api_key {
            headers.push(("x-api-key".to_string(), key.to_string()));
        }
        (url, headers)
    }

    fn interpret_frame(&self, frame: &Frame) -> std::result::Result<Vec<FrameEvent>, UpstreamFailure> {
        let data = frame.data.trim();
        if data.is_empty() {
            return Ok(Vec::new());
        }

        match serde_json::from_str::<AnthropicStreamEvent>(data) {
            Ok(AnthropicStreamEvent::ContentBlockDelta {
                delta: AnthropicDelta::TextDelta { text },
            }) if !text.is_empty() => Ok(vec![FrameEvent::Text(text)]),
            Ok(AnthropicStreamEvent::MessageStop) => Ok(vec![FrameEvent::Finished]),
            Ok(AnthropicStreamEvent::Error { error }) => Err(UpstreamFailure::classified(
                Self::kind_to_status(&error.kind),
                format!("{}: {}", error.kind, error.message),
            )),
            Ok(_) => Ok(Vec::new()),
            Err(e) => {
                tracing::debug!(
                    "[☁️  -> ⚙️ ] Skipping unparsable anthropic {:?} frame ({}): {}",
                    frame.event,
                    e,
                    crate::str_utils::snippet(data, 120)
                );
                Ok(Vec::new())
            }
        }
    }

    fn classify_error_body(&self, status: u16, body: &str) -> UpstreamFailure {
        match serde_json::from_str::<AnthropicErrorEnvelope>(body) {
            Ok(envelope) => UpstreamFailure::classified(
                Some(status),
                format!("{}: {}", envelope.error.kind, envelope.error.message),
            ),
            Err(_) => UpstreamFailure::classified(Some(status), super::extract_error_message(body)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::FailureClass;

    #[test]
    fn test_payload_uses_top_level_system_and_image_blocks() {
        let messages = vec![ChatMessage::user("what is this?")];
        let attachments = vec![NormalizedAttachment::Image {
            name: "a.jpg".into(),
            mime_type: "image/jpeg".into(),
            base64: "Zm9v".into(),
            data_url: "data:image/jpeg;base64,Zm9v".into(),
        }];
        let body = match AnthropicAdapter.build_payload("sys", &messages, &attachments, "claude") {
            Ok(b) => b,
            Err(e) => panic!("payload failed: {}", e),
        };
        assert_eq!(body["system"], "sys");
        assert_eq!(body["max_tokens"], DEFAULT_MAX_OUTPUT_TOKENS);
        let content = &body["messages"][0]["content"];
        assert_eq!(content[0]["type"], "image");
        assert_eq!(content[0]["source"]["type"], "base64");
        assert_eq!(content[0]["source"]["media_type"], "image/jpeg");
        assert_eq!(content[1]["type"], "text");
        assert_eq!(content[1]["text"], "what is this?");
    }

    #[test]
    fn test_empty_system_prompt_is_omitted() {
        let body = match AnthropicAdapter.build_payload(" ", &[ChatMessage::user("hi")], &[], "m") {
            Ok(b) => b,
            Err(e) => panic!("payload failed: {}", e),
        };
        assert!(body.get("system").is_none());
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[test]
    fn test_event_frames() {
        let delta = Frame {
            event: Some("content_block_delta".into()),
            data: r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#.into(),
        };
        assert_eq!(AnthropicAdapter.interpret_frame(&delta), Ok(vec![FrameEvent::Text("Hel".into())]));

        let ping = Frame {
            event: Some("ping".into()),
            data: r#"{"type":"ping"}"#.into(),
        };
        assert_eq!(AnthropicAdapter.interpret_frame(&ping), Ok(vec![]));

        let stop = Frame {
            event: Some("message_stop".into()),
            data: r#"{"type":"message_stop"}"#.into(),
        };
        assert_eq!(AnthropicAdapter.interpret_frame(&stop), Ok(vec![FrameEvent::Finished]));
    }

    #[test]
    fn test_overloaded_error_event_is_fallback_eligible() {
        let frame = Frame {
            event: Some("error".into()),
            data: r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#.into(),
        };
        match AnthropicAdapter.interpret_frame(&frame) {
            Err(f) => {
                assert_eq!(f.status, Some(529));
                assert_eq!(f.class, FailureClass::FallbackEligible);
            }
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_auth_error_body_is_fatal() {
        let body = r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#;
        let failure = AnthropicAdapter.classify_error_body(401, body);
        assert_eq!(failure.class, FailureClass::Fatal);
        assert!(failure.message.contains("invalid x-api-key"));
    }
}
