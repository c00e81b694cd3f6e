//! Fixed-width character chunking with overlap.

/// Splits `text` into character windows of at most `width` characters,
/// where consecutive windows share `overlap` characters. Overlap is clamped
/// below the width so every step makes forward progress. Line endings are
/// normalized to `\n` first; windows are trimmed and empty windows dropped.
pub fn chunk_text(text: &str, width: usize, overlap: usize) -> Vec<String> {
    if width == 0 {
        return Vec::new();
    }

    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let chars: Vec<char> = normalized.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }

    let overlap = overlap.min(width.saturating_sub(1));
    let step = width.saturating_sub(overlap).max(1);

    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
        let end = start.saturating_add(width).min(chars.len());
        let window: String = chars.get(start..end).unwrap_or_default().iter().collect();
        let trimmed = window.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }

        if end >= chars.len() {
            break;
        }
        start = start.saturating_add(step);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_yields_single_chunk() {
        let chunks = chunk_text("hello world", 100, 20);
        assert_eq!(chunks, vec!["hello world"]);
    }

    #[test]
    fn windows_overlap_by_the_requested_amount() {
        let text = "abcdefghij";
        let chunks = chunk_text(text, 4, 2);
        assert_eq!(chunks, vec!["abcd", "cdef", "efgh", "ghij"]);
    }

    #[test]
    fn oversized_overlap_clamps_but_still_advances() {
        let text = "abcdef";
        let chunks = chunk_text(text, 3, 10);
        // Clamped to width - 1, so the step is one character.
        assert_eq!(chunks, vec!["abc", "bcd", "cde", "def"]);
    }

    #[test]
    fn line_endings_are_normalized() {
        let chunks = chunk_text("a\r\nb\rc", 100, 0);
        assert_eq!(chunks, vec!["a\nb\nc"]);
    }

    #[test]
    fn whitespace_only_windows_are_dropped() {
        let chunks = chunk_text("ab      cd", 4, 0);
        assert_eq!(chunks, vec!["ab", "cd"]);
        assert!(chunk_text("    \n   ", 4, 0).is_empty());
    }

    #[test]
    fn zero_width_and_empty_input_yield_nothing() {
        assert!(chunk_text("abc", 0, 0).is_empty());
        assert!(chunk_text("", 10, 2).is_empty());
    }

    #[test]
    fn every_character_is_covered() {
        let text: String = ('a'..='z').cycle().take(5000).collect();
        let chunks = chunk_text(&text, 1200, 200);
        let rebuilt: String = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| {
                if i == 0 {
                    c.clone()
                } else {
                    c.chars().skip(200).collect()
                }
            })
            .collect();
        assert_eq!(rebuilt, text);
    }
}
