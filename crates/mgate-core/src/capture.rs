//! Payload capture for the audit log: a bounded preview for admin tooling
//! and an unbounded full copy kept only for the retention window.

const PREVIEW_LIMIT: usize = 2048;
const BINARY_SNIFF_LEN: usize = 256;
const BINARY_CONTROL_RATIO: f64 = 0.10;

/// One direction (request or response) of captured payload.
#[derive(Debug, Default)]
pub struct Capture {
    preview: String,
    preview_chars: usize,
    truncated_chars: usize,
    full: Vec<String>,
    binary: bool,
}

impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture a complete buffered body.
    pub fn set_body(&mut self, body: &[u8]) {
        if let Some(note) = binary_note(body) {
            self.binary = true;
            self.preview = note;
            self.full.clear();
            return;
        }
        let text = String::from_utf8_lossy(body);
        self.append(&text);
    }

    /// Capture one streamed event string. Trimmed empties and the `[DONE]`
    /// sentinel are dropped. A truncated preview stops growing while the
    /// full payload keeps accumulating.
    pub fn push_chunk(&mut self, chunk: &str) {
        let trimmed = chunk.trim();
        if trimmed.is_empty() || trimmed == "[DONE]" {
            return;
        }
        self.append(trimmed);
    }

    fn append(&mut self, text: &str) {
        if self.binary {
            return;
        }
        self.full.push(text.to_string());
        if self.truncated_chars > 0 {
            self.truncated_chars += text.chars().count();
            return;
        }
        for ch in text.chars() {
            if self.preview_chars < PREVIEW_LIMIT {
                self.preview.push(ch);
                self.preview_chars += 1;
            } else {
                self.truncated_chars += 1;
            }
        }
    }

    /// The bounded preview, suffixed with the truncation note when the
    /// source exceeded the limit.
    pub fn preview(&self) -> String {
        if self.binary || self.truncated_chars == 0 {
            return self.preview.clone();
        }
        format!("{}… [truncated {} chars]", self.preview, self.truncated_chars)
    }

    /// The exact bytes the client saw, concatenated.
    pub fn full(&self) -> String {
        self.full.concat()
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }
}

fn binary_note(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    if std::str::from_utf8(body).is_err() {
        return Some(format!("[binary payload omitted: {} bytes]", body.len()));
    }
    let window = &body[..body.len().min(BINARY_SNIFF_LEN)];
    let control = window
        .iter()
        .filter(|byte| byte.is_ascii_control() && !byte.is_ascii_whitespace())
        .count();
    if control as f64 > window.len() as f64 * BINARY_CONTROL_RATIO {
        return Some(format!("[binary payload omitted: {} bytes]", body.len()));
    }
    None
}
