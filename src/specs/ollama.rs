use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct OllamaRequest {
    pub model: String,
    pub messages: Vec<OllamaMessage>,
    pub stream: bool,
}

#[derive(Debug, Serialize)]
pub struct OllamaMessage {
    pub role: String,
    pub content: String,
    /// Base64 images, side-channel to the text content.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

/// One line of `/api/chat` output.
#[derive(Debug, Deserialize)]
pub struct OllamaChunk {
    pub message: Option<OllamaChunkMessage>,
    #[serde(default)]
    pub done: bool,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OllamaChunkMessage {
    #[serde(default)]
    pub content: String,
}
