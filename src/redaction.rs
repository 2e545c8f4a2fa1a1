use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::borrow::Cow;
use std::io::Write;

lazy_static! {
    static ref REDACTION_REGEX: Regex = Regex::new(
        r"(?i)(sk-[A-Za-z0-9_\-]{20,}|Bearer\s+[^\s]+|x-(?:goog-)?api-key:\s*[^\s]+|([?&]key=)[^&\s]+|gh[pousr]_[A-Za-z0-9]{20,}|github_pat_[A-Za-z0-9_]{20,}|AIza[0-9A-Za-z_\-]{30,})"
    ).expect("Invalid redaction regex");
}

/// Scrubs credentials from free text (URLs, headers, log lines).
pub fn redact_text(input: &str) -> Cow<'_, str> {
    REDACTION_REGEX.replace_all(input, |caps: &regex::Captures| match caps.get(2) {
        Some(query_key) => format!("{}[REDACTED]", query_key.as_str()),
        None => "[REDACTED]".to_string(),
    })
}

/// Redacts secrets and inline binary payloads from a request body before it is logged.
pub fn redact_value(v: &mut Value) {
    match v {
        Value::Object(map) => {
            for (k, val) in map.iter_mut() {
                let k_lower = k.to_lowercase();

                if k_lower.contains("api_key")
                    || k_lower.contains("apikey")
                    || k_lower.contains("auth")
                    || k_lower.contains("token") && val.is_string()
                    || k_lower.contains("secret")
                    || k_lower.contains("password")
                {
                    *val = Value::String("[REDACTED]".to_string());
                    continue;
                }

                let is_blob = match val.as_str() {
                    Some(s) => (k_lower == "data" && s.len() > 100) || s.starts_with("data:"),
                    None => false,
                };
                if is_blob {
                    *val = Value::String("[REDACTED-DATA]".to_string());
                } else if k_lower == "images" && val.is_array() {
                    let count = val.as_array().map(|a| a.len()).unwrap_or_default();
                    *val = Value::String(format!("[REDACTED-{}-IMAGES]", count));
                } else {
                    redact_value(val);
                }
            }
        }
        Value::Array(arr) => {
            for val in arr {
                redact_value(val);
            }
        }
        _ => {}
    }
}

pub struct RedactingWriter<W: Write> {
    inner: W,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let input = String::from_utf8_lossy(buf);
        let redacted = redact_text(&input);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
