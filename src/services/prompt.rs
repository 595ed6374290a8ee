use std::borrow::Cow;

/// Longest prompt the generation API accepts, in characters.
pub const MAX_PROMPT_CHARS: usize = 999;

/// Truncate `prompt` to at most `max_chars` Unicode scalar values.
///
/// The cut always lands on a `char` boundary. Prompts already within the
/// limit are returned borrowed.
pub fn normalize_prompt(prompt: &str, max_chars: usize) -> Cow<'_, str> {
    match prompt.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => Cow::Owned(prompt[..byte_idx].to_string()),
        None => Cow::Borrowed(prompt),
    }
}
