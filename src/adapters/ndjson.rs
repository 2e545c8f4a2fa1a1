use super::{
    history_text, last_user_index, role_name, text_with_markers, turn_attachments, FrameEvent,
    ProviderAdapter, UpstreamFailure,
};
use crate::framing::{Frame, Framing};
use crate::specs::ollama::{OllamaChunk, OllamaMessage, OllamaRequest};
use crate::types::{ChatMessage, NormalizedAttachment, Result};
use serde_json::Value;

/// Ollama `/api/chat`: one JSON object per line, images as a side-channel list.
pub struct OllamaAdapter;

impl OllamaAdapter {
    fn turn_message(text: &str, attachments: &[&NormalizedAttachment]) -> OllamaMessage {
        let images = attachments
            .iter()
            .filter_map(|a| match a {
                NormalizedAttachment::Image { base64, .. } => Some(base64.clone()),
                _ => None,
            })
            .collect();
        OllamaMessage {
            role: "user".to_string(),
            content: text_with_markers(text, attachments, false),
            images,
        }
    }
}

impl ProviderAdapter for OllamaAdapter {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn framing(&self) -> Framing {
        Framing::Lines
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
            out.push(OllamaMessage {
                role: "system".to_string(),
                content: system_prompt.to_string(),
                images: Vec::new(),
            });
        }

        for (i, m) in messages.iter().enumerate() {
            if Some(i) == target {
                out.push(Self::turn_message(&m.text, &turn_attachments(Some(m), attachments)));
            } else {
                out.push(OllamaMessage {
                    role: role_name(m.role).to_string(),
                    content: history_text(m),
                    images: Vec::new(),
                });
            }
        }

        if target.is_none() && !attachments.is_empty() {
            out.push(Self::turn_message("", &turn_attachments(None, attachments)));
        }

        let request = OllamaRequest {
            model: model_id.to_string(),
            messages: out,
            stream: true,
        };
        Ok(serde_json::to_value(request)?)
    }

    fn endpoint(
        &self,
        base_url: &str,
        _model_id: &str,
        api_key: Option<&str>,
    ) -> (String, Vec<(String, String)>) {
        let url = format!("{}/api/chat", base_url.trim_end_matches('/'));
        // Only reverse proxies in front of Ollama care about a key.
        let headers = match api_key {
            Some(key) => vec![("Authorization".to_string(), format!("Bearer {}", key))],
            None => Vec::new(),
        };
        (url, headers)
    }

    fn interpret_frame(&self, frame: &Frame) -> std::result::Result<Vec<FrameEvent>, UpstreamFailure> {
        let chunk = match serde_json::from_str::<OllamaChunk>(&frame.data) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(
                    "[☁️  -> ⚙️ ] Skipping unparsable ollama line ({}): {}",
                    e,
                    crate::str_utils::snippet(&frame.data, 120)
                );
                return Ok(Vec::new());
            }
        };

        if let Some(error) = chunk.error {
            return Err(UpstreamFailure::classified(None, error));
        }

        let mut events = Vec::new();
        if let Some(message) = chunk.message {
            if !message.content.is_empty() {
                events.push(FrameEvent::Text(message.content));
            }
        }
        if chunk.done {
            events.push(FrameEvent::Finished);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::FailureClass;

    #[test]
    fn test_images_go_to_side_channel_and_text_inline() {
        let attachments = vec![
            NormalizedAttachment::Image {
                name: "a.png".into(),
                mime_type: "image/png".into(),
                base64: "AAAA".into(),
                data_url: "data:image/png;base64,AAAA".into(),
            },
            NormalizedAttachment::Text {
                name: "log.txt".into(),
                content: "boom".into(),
                truncated: false,
            },
        ];
        let body = match OllamaAdapter.build_payload("", &[ChatMessage::user("why")], &attachments, "llama3") {
            Ok(b) => b,
            Err(e) => panic!("payload failed: {}", e),
        };
        let msg = &body["messages"][0];
        assert_eq!(msg["role"], "user");
        assert_eq!(msg["images"][0], "AAAA");
        let content = msg["content"].as_str().unwrap_or_default();
        assert!(content.starts_with("why"));
        assert!(content.contains("--- Attached file: log.txt ---"));
        assert!(!content.contains("a.png"));
    }

    #[test]
    fn test_lines_map_to_text_and_done() {
        let line = Frame::data(r#"{"model":"m","message":{"role":"assistant","content":"Hi"},"done":false}"#);
        assert_eq!(OllamaAdapter.interpret_frame(&line), Ok(vec![FrameEvent::Text("Hi".into())]));
        let last = Frame::data(r#"{"model":"m","message":{"role":"assistant","content":""},"done":true}"#);
        assert_eq!(OllamaAdapter.interpret_frame(&last), Ok(vec![FrameEvent::Finished]));
    }

    #[test]
    fn test_missing_model_error_line() {
        let line = Frame::data(r#"{"error":"model \"nope\" not found, try pulling it first"}"#);
        match OllamaAdapter.interpret_frame(&line) {
            Err(f) => assert_eq!(f.class, FailureClass::FallbackEligible),
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_endpoint_without_key() {
        let (url, headers) = OllamaAdapter.endpoint("http://localhost:11434/", "m", None);
        assert_eq!(url, "http://localhost:11434/api/chat");
        assert!(headers.is_empty());
    }
}
