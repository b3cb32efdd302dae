//! Text checks applied before anything reaches the model.

/// Length of the text excerpt carried in progress events and logs.
pub const PREVIEW_CHARS: usize = 50;

/// True when the text has nothing to synthesize.
pub fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}

/// Short excerpt for logs and progress events, cut on a char boundary.
pub fn preview(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
