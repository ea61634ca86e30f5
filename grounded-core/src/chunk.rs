//! Boundary-preferring text chunker.
//!
//! Splits fetched page text into overlapping windows for embedding.
//! Windows are cut at the strongest available boundary inside the size
//! limit: paragraph break, then line break, then sentence end, then word
//! boundary, then a hard character split. Adjacent chunks share a tail
//! overlap so context that straddles a cut survives retrieval.

use crate::config::ChunkingConfig;

/// Boundary separators in descending preference order. The empty string
/// is the hard-split fallback.
const SEPARATORS: [&str; 5] = ["\n\n", "\n", ". ", " ", ""];

/// Sliding-window text splitter with boundary-preferring cuts.
#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl Chunker {
    /// Build a chunker from validated config. `chunk_overlap` must be
    /// strictly smaller than `chunk_size` (enforced at config load).
    pub fn new(config: &ChunkingConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
        }
    }

    /// Split `text` into chunks of at most `chunk_size` characters, with
    /// `chunk_overlap` characters carried over between adjacent chunks.
    ///
    /// Whitespace-only input yields no chunks. Text at or under the size
    /// limit comes back as a single chunk.
    pub fn split(&self, text: &str) -> Vec<String> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        let chars: Vec<char> = trimmed.chars().collect();
        if chars.len() <= self.chunk_size {
            return vec![trimmed.to_string()];
        }

        let mut chunks = Vec::new();
        let mut start = 0;

        while start < chars.len() {
            let window_end = (start + self.chunk_size).min(chars.len());
            let end = if window_end == chars.len() {
                window_end
            } else {
                self.find_cut(&chars, start, window_end)
            };

            let chunk: String = chars[start..end].iter().collect();
            let chunk = chunk.trim();
            if !chunk.is_empty() {
                chunks.push(chunk.to_string());
            }

            if end == chars.len() {
                break;
            }
            // Step back by the overlap, but always advance.
            let next = end.saturating_sub(self.chunk_overlap);
            start = if next > start { next } else { end };
        }

        chunks
    }

    /// Find the best cut position in `chars[start..limit]`, preferring
    /// the strongest separator whose last occurrence lands in the second
    /// half of the window. Falls back to a hard cut at `limit`.
    fn find_cut(&self, chars: &[char], start: usize, limit: usize) -> usize {
        let window: String = chars[start..limit].iter().collect();
        let min_cut = (limit - start) / 2;

        for sep in SEPARATORS {
            if sep.is_empty() {
                break;
            }
            if let Some(byte_pos) = window.rfind(sep) {
                let char_pos = window[..byte_pos].chars().count() + sep.chars().count();
                if char_pos >= min_cut {
                    return start + char_pos;
                }
            }
        }
        limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn chunker(size: usize, overlap: usize) -> Chunker {
        Chunker::new(&ChunkingConfig {
            chunk_size: size,
            chunk_overlap: overlap,
        })
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = chunker(100, 20).split("Hello, world!");
        assert_eq!(chunks, vec!["Hello, world!"]);
    }

    #[test]
    fn test_empty_and_whitespace_yield_nothing() {
        assert!(chunker(100, 20).split("").is_empty());
        assert!(chunker(100, 20).split("   \n\n  ").is_empty());
    }

    #[test]
    fn test_prefers_paragraph_boundary() {
        let text = format!("{}\n\n{}", "a".repeat(60), "b".repeat(60));
        let chunks = chunker(80, 10).split(&text);
        assert_eq!(chunks[0], "a".repeat(60));
    }

    #[test]
    fn test_prefers_sentence_boundary_over_word() {
        let text = "First sentence here. Second sentence follows with more words after it.";
        let chunks = chunker(40, 5).split(text);
        assert_eq!(chunks[0], "First sentence here.");
    }

    #[test]
    fn test_every_chunk_respects_size_limit() {
        let text = "word ".repeat(500);
        let chunker = chunker(100, 20);
        for chunk in chunker.split(&text) {
            assert!(chunk.chars().count() <= 100);
        }
    }

    #[test]
    fn test_overlap_carries_shared_text() {
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa";
        let chunks = chunker(30, 10).split(text);
        assert!(chunks.len() > 1);
        // The tail of each chunk reappears at the head of the next.
        for pair in chunks.windows(2) {
            let tail: String = pair[0].chars().rev().take(5).collect::<String>();
            let tail: String = tail.chars().rev().collect();
            assert!(
                pair[1].contains(tail.trim()),
                "no overlap between {:?} and {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_unbroken_text_hard_splits() {
        let text = "x".repeat(250);
        let chunks = chunker(100, 0).split(&text);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 100);
    }

    #[test]
    fn test_multibyte_input_does_not_panic() {
        let text = "日本語のテキスト。".repeat(40);
        let chunks = chunker(50, 10).split(&text);
        assert!(!chunks.is_empty());
    }

    #[test]
    fn test_deterministic() {
        let text = "Some repeated content. ".repeat(30);
        let c = chunker(100, 20);
        assert_eq!(c.split(&text), c.split(&text));
    }
}
