/// Truncate `text` to at most `max_chars` characters without splitting a
/// UTF-8 sequence. Returns the input unchanged when it already fits.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}
