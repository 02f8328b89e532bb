//! Chat text handling: line wrapping with colour carry-over and validation.
//!
//! Classic clients display at most 64 characters per chat packet, so longer
//! messages are split into several lines. Colour codes are two characters, a
//! `&` followed by a hex digit, and stay in effect across line breaks.

use crate::codec::{CodecError, Message, Packet, STRING_LEN};

pub const COLOR_SIGIL: u8 = b'&';
/// Prefix for every wrapped line after the first.
pub const CONTINUATION: &str = "> ";

fn is_color_code(byte: u8) -> bool {
    byte.is_ascii_hexdigit()
}

fn is_marker(bytes: &[u8], index: usize) -> bool {
    index + 1 < bytes.len() && bytes[index] == COLOR_SIGIL && is_color_code(bytes[index + 1])
}

/// Last colour marker in `text`, if any.
fn last_marker(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    (0..bytes.len())
        .rev()
        .find(|&index| is_marker(bytes, index))
        .map(|index| &text[index..index + 2])
}

/// Splits text after runs of spaces and before colour markers.
fn segments(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut segments = Vec::new();
    let mut start = 0;
    let mut index = 0;

    while index < bytes.len() {
        if is_marker(bytes, index) {
            segments.push(&text[start..index]);
            start = index;
            index += 2;
        } else if bytes[index] == b' ' {
            while index < bytes.len() && bytes[index] == b' ' {
                index += 1;
            }
            segments.push(&text[start..index]);
            start = index;
        } else {
            index += 1;
        }
    }
    segments.push(&text[start..]);

    segments.retain(|segment| !segment.is_empty());
    segments
}

/// Largest cut not exceeding `room` that does not split a colour marker.
fn split_point(segment: &str, room: usize) -> usize {
    let bytes = segment.as_bytes();
    if room > 0 && room < bytes.len() && is_marker(bytes, room - 1) {
        room - 1
    } else {
        room
    }
}

fn collapse_markers(line: &str) -> String {
    let bytes = line.as_bytes();
    let mut out = String::with_capacity(line.len());
    let mut index = 0;
    while index < bytes.len() {
        if is_marker(bytes, index) && is_marker(bytes, index + 2) {
            index += 2;
            continue;
        }
        out.push(bytes[index] as char);
        index += 1;
    }
    out
}

fn trim_line(line: &str) -> &str {
    let mut trimmed = line;
    loop {
        trimmed = trimmed.trim_end();
        let len = trimmed.len();
        if len >= 2 && is_marker(trimmed.as_bytes(), len - 2) {
            trimmed = &trimmed[..len - 2];
        } else {
            return trimmed;
        }
    }
}

struct Line {
    text: String,
    continuation: bool,
    has_content: bool,
}

impl Line {
    fn first() -> Self {
        Line {
            text: String::new(),
            continuation: false,
            has_content: false,
        }
    }

    fn next(color: Option<&str>) -> Self {
        let mut text = String::from(CONTINUATION);
        if let Some(color) = color {
            text.push_str(color);
        }
        Line {
            text,
            continuation: true,
            has_content: false,
        }
    }

    fn push(&mut self, piece: &str) {
        self.text.push_str(piece);
        self.has_content = true;
    }
}

/// Wraps `text` into lines of at most 64 characters.
pub fn wrap(text: &str) -> Vec<String> {
    let text: String = text
        .chars()
        .map(|ch| if ch.is_ascii() { ch } else { '?' })
        .collect();

    let mut lines = Vec::new();
    let mut line = Line::first();
    let mut color: Option<String> = None;

    for segment in segments(&text) {
        // Trailing spaces are trimmed from finished lines, so they never count.
        if line.has_content && line.text.len() + segment.trim_end().len() > STRING_LEN {
            lines.push(line);
            line = Line::next(color.as_deref());
        }

        let mut rest = segment;
        while line.text.len() + rest.trim_end().len() > STRING_LEN {
            let cut = split_point(rest, STRING_LEN - line.text.len());
            let (head, tail) = rest.split_at(cut);
            line.push(head);
            if let Some(marker) = last_marker(head) {
                color = Some(marker.to_string());
            }
            rest = tail;
            lines.push(line);
            line = Line::next(color.as_deref());
        }

        line.push(rest);
        if let Some(marker) = last_marker(rest) {
            color = Some(marker.to_string());
        }
    }
    lines.push(line);

    lines
        .into_iter()
        .filter_map(|line| {
            let collapsed = collapse_markers(&line.text);
            let trimmed = trim_line(&collapsed);
            let body = if line.continuation {
                trimmed.strip_prefix(CONTINUATION.trim_end()).unwrap_or(trimmed)
            } else {
                trimmed
            };
            if trim_line(body.trim_start()).is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

/// Wraps `text` and encodes one chat packet per line.
pub fn wrap_packets(text: &str) -> Result<Vec<Packet>, CodecError> {
    wrap(text)
        .iter()
        .map(|line| Message::chat(line).encode())
        .collect()
}

/// Chat from clients may only contain printable ASCII.
pub fn is_valid_chat(text: &str) -> bool {
    text.chars().all(|ch| (' '..='~').contains(&ch))
}
