//! Compact rendering helpers for terminal output.

/// Collapse newlines/extra whitespace and bound length for terminal display.
pub fn compact_line(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

/// Keep the head and tail of a long value (paths mostly), eliding the middle.
pub fn elide_middle(input: &str, max_chars: usize) -> String {
    let total = input.chars().count();
    if total <= max_chars || max_chars < 5 {
        return input.to_string();
    }
    let keep = max_chars - 3;
    let head = keep / 2;
    let tail = keep - head;
    let start: String = input.chars().take(head).collect();
    let end: String = input.chars().skip(total - tail).collect();
    format!("{}...{}", start, end)
}

/// Pad `value` on the right to `width` characters.
pub fn pad(value: &str, width: usize) -> String {
    let len = value.chars().count();
    if len >= width {
        value.to_string()
    } else {
        format!("{}{}", value, " ".repeat(width - len))
    }
}
