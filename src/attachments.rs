use crate::constants::{
    MAX_ATTACHMENTS, MAX_IMAGE_BYTES, MAX_TEXT_CHARS, MAX_TOTAL_ATTACHMENT_BYTES,
    SUPPORTED_IMAGE_MIME_TYPES,
};
use crate::types::{NormalizedAttachment, PatchflowError};
use base64::Engine;
use std::path::Path;
use thiserror::Error;

/// A user-supplied blob before validation.
#[derive(Debug, Clone)]
pub struct RawAttachment {
    pub name: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl RawAttachment {
    pub async fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let name = match path.file_name() {
            Some(n) => n.to_string_lossy().to_string(),
            None => path.display().to_string(),
        };
        Ok(Self {
            name,
            mime_type: None,
            bytes,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AttachmentLimits {
    pub max_count: usize,
    pub max_image_bytes: usize,
    pub max_text_chars: usize,
    pub max_total_bytes: usize,
}

impl Default for AttachmentLimits {
    fn default() -> Self {
        Self {
            max_count: MAX_ATTACHMENTS,
            max_image_bytes: MAX_IMAGE_BYTES,
            max_text_chars: MAX_TEXT_CHARS,
            max_total_bytes: MAX_TOTAL_ATTACHMENT_BYTES,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttachmentError {
    #[error("too many attachments: {count} (limit {max})")]
    TooMany { count: usize, max: usize },

    #[error("image {name} is {size} bytes (limit {max})")]
    ImageTooLarge { name: String, size: usize, max: usize },

    #[error("image {name} has unsupported type {mime_type}")]
    UnsupportedImage { name: String, mime_type: String },

    #[error("attachments total {total} bytes (limit {max})")]
    TotalTooLarge { total: usize, max: usize },
}

impl From<AttachmentError> for PatchflowError {
    fn from(e: AttachmentError) -> Self {
        PatchflowError::Validation(e.to_string())
    }
}

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "rs", "py", "js", "jsx", "ts", "tsx", "json", "toml", "yaml", "yml", "html",
    "css", "scss", "sh", "go", "java", "kt", "c", "h", "cpp", "hpp", "rb", "php", "sql", "xml",
    "csv", "env", "ini", "cfg", "lock", "svelte", "vue", "svg",
];

/// Best-effort MIME guess from the file extension.
pub fn guess_mime(name: &str) -> &'static str {
    let ext = match name.rsplit_once('.') {
        Some((_, ext)) => ext.to_lowercase(),
        None => return "application/octet-stream",
    };
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "json" => "application/json",
        "md" => "text/markdown",
        "html" => "text/html",
        "csv" => "text/csv",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        e if TEXT_EXTENSIONS.contains(&e) => "text/plain",
        _ => "application/octet-stream",
    }
}

fn is_text_like(mime_type: &str, name: &str) -> bool {
    if mime_type.starts_with("text/")
        || mime_type == "application/json"
        || mime_type == "image/svg+xml"
        || mime_type.ends_with("+xml")
        || mime_type.contains("javascript")
        || mime_type.contains("yaml")
        || mime_type.contains("toml")
    {
        return true;
    }
    match name.rsplit_once('.') {
        Some((_, ext)) => TEXT_EXTENSIONS.contains(&ext.to_lowercase().as_str()),
        None => false,
    }
}

/// Normalizes one blob. Oversized text is truncated, oversized images are rejected.
pub fn normalize_attachment(
    raw: &RawAttachment,
    limits: &AttachmentLimits,
) -> std::result::Result<NormalizedAttachment, AttachmentError> {
    let mime_type = match &raw.mime_type {
        Some(m) if !m.trim().is_empty() => m.trim().to_lowercase(),
        _ => guess_mime(&raw.name).to_string(),
    };

    if mime_type.starts_with("image/") && mime_type != "image/svg+xml" {
        if !SUPPORTED_IMAGE_MIME_TYPES.contains(&mime_type.as_str()) {
            return Err(AttachmentError::UnsupportedImage {
                name: raw.name.clone(),
                mime_type,
            });
        }
        if raw.bytes.len() > limits.max_image_bytes {
            return Err(AttachmentError::ImageTooLarge {
                name: raw.name.clone(),
                size: raw.bytes.len(),
                max: limits.max_image_bytes,
            });
        }
        let encoded = base64::engine::general_purpose::STANDARD.encode(&raw.bytes);
        let data_url = format!("data:{};base64,{}", mime_type, encoded);
        return Ok(NormalizedAttachment::Image {
            name: raw.name.clone(),
            mime_type,
            base64: encoded,
            data_url,
        });
    }

    if is_text_like(&mime_type, &raw.name) {
        if let Ok(text) = std::str::from_utf8(&raw.bytes) {
            let total_chars = text.chars().count();
            if total_chars > limits.max_text_chars {
                let kept = crate::str_utils::prefix_chars(text, limits.max_text_chars);
                tracing::debug!(
                    "Truncating text attachment {} from {} to {} chars",
                    raw.name,
                    total_chars,
                    limits.max_text_chars
                );
                return Ok(NormalizedAttachment::Text {
                    name: raw.name.clone(),
                    content: format!(
                        "[Truncated: showing first {} of {} characters]\n{}",
                        limits.max_text_chars, total_chars, kept
                    ),
                    truncated: true,
                });
            }
            return Ok(NormalizedAttachment::Text {
                name: raw.name.clone(),
                content: text.to_string(),
                truncated: false,
            });
        }
    }

    Ok(NormalizedAttachment::Binary {
        name: raw.name.clone(),
        mime_type,
        size_bytes: raw.bytes.len() as u64,
    })
}

/// Validates the whole batch against count and aggregate caps, then normalizes each blob.
pub fn normalize_attachments(
    raw: &[RawAttachment],
    limits: &AttachmentLimits,
) -> std::result::Result<Vec<NormalizedAttachment>, AttachmentError> {
    if raw.len() > limits.max_count {
        return Err(AttachmentError::TooMany {
            count: raw.len(),
            max: limits.max_count,
        });
    }

    let mut normalized = Vec::with_capacity(raw.len());
    let mut total = 0usize;
    for blob in raw {
        let attachment = normalize_attachment(blob, limits)?;
        // Binary contents are never sent upstream, so they do not count against the budget.
        if !matches!(attachment, NormalizedAttachment::Binary { .. }) {
            total += blob.bytes.len();
        }
        if total > limits.max_total_bytes {
            return Err(AttachmentError::TotalTooLarge {
                total,
                max: limits.max_total_bytes,
            });
        }
        normalized.push(attachment);
    }
    Ok(normalized)
}
