use serde::{Deserialize, Serialize};

/// Cohere chat v2, non-streamed.
#[derive(Debug, Serialize)]
pub struct CohereRequest {
    pub model: String,
    pub messages: Vec<CohereMessage>,
    pub stream: bool,
}

#[derive(Debug, Serialize)]
pub struct CohereMessage {
    pub role: String, // "system" | "user" | "assistant"
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct CohereResponse {
    pub message: Option<CohereResponseMessage>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CohereResponseMessage {
    #[serde(default)]
    pub content: Vec<CohereContentBlock>,
}

#[derive(Debug, Deserialize)]
pub struct CohereContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: Option<String>,
}

/// Error bodies carry only a message.
#[derive(Debug, Deserialize)]
pub struct CohereError {
    pub message: String,
}
