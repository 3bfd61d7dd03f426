//! Outbound text chunking under provider size caps.

pub const TELEPHONY_CHUNK_LIMIT: usize = 1600;
pub const WEB_CHUNK_LIMIT: usize = 4000;

/// Split `text` into chunks of at most `max_len` characters, preferring
/// newline boundaries, then word boundaries. A single word longer than
/// `max_len` is hard-split. Never emits an empty chunk.
pub fn chunk_text(text: &str, max_len: usize) -> Vec<String> {
    if max_len == 0 || text.trim().is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let remaining = chars.len() - start;
        if remaining <= max_len {
            push_chunk(&mut chunks, &chars[start..]);
            break;
        }

        // A separator at `window_end` splits exactly at the cap.
        let window_end = start + max_len;
        let split = find_separator(&chars, start, window_end, '\n')
            .or_else(|| find_separator(&chars, start, window_end, ' '));

        match split {
            Some(sep) => {
                push_chunk(&mut chunks, &chars[start..sep]);
                start = sep + 1;
            }
            None => {
                push_chunk(&mut chunks, &chars[start..window_end]);
                start = window_end;
            }
        }
    }

    chunks
}

fn find_separator(chars: &[char], start: usize, window_end: usize, sep: char) -> Option<usize> {
    (start + 1..=window_end).rev().find(|&idx| chars[idx] == sep)
}

fn push_chunk(chunks: &mut Vec<String>, chars: &[char]) {
    let chunk: String = chars.iter().collect();
    let chunk = chunk.trim_matches('\n').to_string();
    if !chunk.trim().is_empty() {
        chunks.push(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_passes_through() {
        assert_eq!(chunk_text("hello", 1600), vec!["hello".to_string()]);
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk_text("", 1600).is_empty());
        assert!(chunk_text("   \n  ", 1600).is_empty());
    }

    #[test]
    fn prefers_newline_boundaries() {
        let text = format!("{}\n{}", "a".repeat(10), "b".repeat(10));
        let chunks = chunk_text(&text, 15);
        assert_eq!(chunks, vec!["a".repeat(10), "b".repeat(10)]);
    }

    #[test]
    fn falls_back_to_word_boundaries() {
        let chunks = chunk_text("alpha beta gamma delta", 11);
        assert_eq!(
            chunks,
            vec!["alpha beta".to_string(), "gamma delta".to_string()]
        );
    }

    #[test]
    fn hard_splits_oversized_words() {
        let chunks = chunk_text(&"x".repeat(25), 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chars().count(), 10);
        assert_eq!(chunks[2].chars().count(), 5);
    }

    #[test]
    fn every_chunk_respects_the_cap() {
        let text = "word ".repeat(2_000);
        for cap in [TELEPHONY_CHUNK_LIMIT, WEB_CHUNK_LIMIT, 7] {
            for chunk in chunk_text(&text, cap) {
                assert!(chunk.chars().count() <= cap);
                assert!(!chunk.trim().is_empty());
            }
        }
    }

    #[test]
    fn concatenation_preserves_content_and_order() {
        let text = "the quick brown fox\njumps over the lazy dog";
        let chunks = chunk_text(text, 12);
        let rejoined = chunks.join(" ");
        let normalise = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
        assert_eq!(normalise(&rejoined), normalise(text));
    }
}
