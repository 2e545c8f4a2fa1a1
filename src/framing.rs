use crate::constants::MAX_FRAME_BYTES;
use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// One upstream frame. `event` is only set by SSE framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: Option<String>,
    pub data: String,
}

impl Frame {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `event:`/`data:` blocks separated by a blank line.
    SseBlocks,
    /// One JSON object per line.
    Lines,
    /// A top-level JSON array streamed element by element.
    JsonArray,
    /// The whole body is a single JSON document.
    WholeBody,
}

#[derive(Debug, Default)]
struct PendingSse {
    event: Option<String>,
    data_lines: Vec<String>,
}

impl PendingSse {
    fn take(&mut self) -> Option<Frame> {
        if self.data_lines.is_empty() {
            self.event = None;
            return None;
        }
        let frame = Frame {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        };
        self.data_lines.clear();
        Some(frame)
    }
}

/// Buffers partial reads until a full frame of the configured framing is available.
pub struct FrameCodec {
    framing: Framing,
    sse: PendingSse,
    array_depth: usize,
    array_in_string: bool,
    array_escape: bool,
    array_scan_pos: usize,
}

impl FrameCodec {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            sse: PendingSse::default(),
            array_depth: 0,
            array_in_string: false,
            array_escape: false,
            array_scan_pos: 0,
        }
    }

    fn oversized(len: usize) -> std::io::Error {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("upstream frame exceeds {} bytes (buffered {})", MAX_FRAME_BYTES, len),
        )
    }

    fn next_line(src: &mut BytesMut) -> Option<String> {
        let nl = src.iter().position(|b| *b == b'\n')?;
        let raw = src.split_to(nl + 1);
        let line = String::from_utf8_lossy(&raw);
        Some(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn apply_sse_line(&mut self, line: &str) -> Option<Frame> {
        if line.is_empty() {
            return self.sse.take();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.sse.event = Some(value.to_string()),
            "data" => self.sse.data_lines.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn decode_sse(&mut self, src: &mut BytesMut) -> std::io::Result<Option<Frame>> {
        while let Some(line) = Self::next_line(src) {
            if let Some(frame) = self.apply_sse_line(&line) {
                return Ok(Some(frame));
            }
        }
        if src.len() > MAX_FRAME_BYTES {
            return Err(Self::oversized(src.len()));
        }
        Ok(None)
    }

    fn decode_lines(&mut self, src: &mut BytesMut) -> std::io::Result<Option<Frame>> {
        while let Some(line) = Self::next_line(src) {
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(Some(Frame::data(trimmed)));
            }
        }
        if src.len() > MAX_FRAME_BYTES {
            return Err(Self::oversized(src.len()));
        }
        Ok(None)
    }

    fn decode_json_array(&mut self, src: &mut BytesMut) -> std::io::Result<Option<Frame>> {
        loop {
            if self.array_depth == 0 {
                let skip = src
                    .iter()
                    .take_while(|b| matches!(b, b' ' | b'\n' | b'\r' | b'\t' | b',' | b'[' | b']'))
                    .count();
                src.advance(skip);
                self.array_scan_pos = 0;
                if src.is_empty() {
                    return Ok(None);
                }
                if src[0] != b'{' {
                    let next = match src.iter().position(|b| *b == b'{') {
                        Some(p) => p,
                        None => src.len(),
                    };
                    tracing::debug!("[FRAMING] Skipping {} stray bytes between array elements", next);
                    src.advance(next);
                    continue;
                }
            }

            while self.array_scan_pos < src.len() {
                let b = src[self.array_scan_pos];
                self.array_scan_pos += 1;
                if self.array_in_string {
                    if self.array_escape {
                        self.array_escape = false;
                    } else if b == b'\\' {
                        self.array_escape = true;
                    } else if b == b'"' {
                        self.array_in_string = false;
                    }
                    continue;
                }
                match b {
                    b'"' => self.array_in_string = true,
                    b'{' | b'[' => self.array_depth += 1,
                    b'}' | b']' => {
                        self.array_depth = self.array_depth.saturating_sub(1);
                        if self.array_depth == 0 {
                            let element = src.split_to(self.array_scan_pos);
                            self.array_scan_pos = 0;
                            return Ok(Some(Frame::data(
                                String::from_utf8_lossy(&element).into_owned(),
                            )));
                        }
                    }
                    _ => {}
                }
            }

            if src.len() > MAX_FRAME_BYTES {
                return Err(Self::oversized(src.len()));
            }
            return Ok(None);
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<Frame>> {
        match self.framing {
            Framing::SseBlocks => self.decode_sse(src),
            Framing::Lines => self.decode_lines(src),
            Framing::JsonArray => self.decode_json_array(src),
            Framing::WholeBody => {
                if src.len() > MAX_FRAME_BYTES {
                    return Err(Self::oversized(src.len()));
                }
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> std::io::Result<Option<Frame>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        match self.framing {
            Framing::SseBlocks => {
                if !src.is_empty() {
                    let rest = src.split_to(src.len());
                    let line = String::from_utf8_lossy(&rest).trim_end().to_string();
                    if let Some(frame) = self.apply_sse_line(&line) {
                        return Ok(Some(frame));
                    }
                }
                Ok(self.sse.take())
            }
            Framing::Lines => {
                let rest = src.split_to(src.len());
                let line = String::from_utf8_lossy(&rest).trim().to_string();
                if line.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(Frame::data(line)))
                }
            }
            Framing::JsonArray => {
                if !src.is_empty() {
                    tracing::debug!(
                        "[FRAMING] Dropping {} bytes of incomplete array element at end of stream",
                        src.len()
                    );
                    src.clear();
                }
                Ok(None)
            }
            Framing::WholeBody => {
                if src.is_empty() {
                    return Ok(None);
                }
                let body = src.split_to(src.len());
                Ok(Some(Frame::data(String::from_utf8_lossy(&body).into_owned())))
            }
        }
    }
}
