// Presentation helpers for logged message content.

pub const DISPLAY_WIDTH: usize = 70;
pub const HEX_PREVIEW_BYTES: usize = 50;

/// Splits `text` into display lines: one per input line, long lines cut every
/// `width` characters.
pub fn wrap_text(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();

    for line in text.split('\n') {
        let chars: Vec<char> = line.chars().collect();
        if chars.len() <= width {
            lines.push(line.to_string());
            continue;
        }
        for chunk in chars.chunks(width) {
            lines.push(chunk.iter().collect());
        }
    }
    lines
}

/// Upper-case hex of the first [`HEX_PREVIEW_BYTES`] bytes, `...` when truncated.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = bytes
        .iter()
        .take(HEX_PREVIEW_BYTES)
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ");
    if bytes.len() > HEX_PREVIEW_BYTES {
        out.push_str(" ...");
    }
    out
}
