//! Token-bounded semantic chunking.
//!
//! The downstream embedder has a hard per-input token budget, so chunks
//! are measured in tokens rather than characters. Splitting prefers
//! paragraph and sentence boundaries and packs greedily up to the budget,
//! seeding each following chunk with the tail of the previous one for
//! continuity.

use tiktoken_rs::CoreBPE;
use tracing::debug;

use crate::document::{Chunk, DocumentMeta};
use crate::error::{AppError, AppResult};

/// Immutable-after-load tokenizer plus chunking parameters.
///
/// Loading the BPE model is the expensive step; the service pool
/// constructs exactly one per process and shares it across workers.
pub struct TokenChunker {
    bpe: CoreBPE,
    max_tokens: usize,
    overlap_tokens: usize,
}

impl TokenChunker {
    pub fn load(max_tokens: usize, overlap_tokens: usize) -> AppResult<Self> {
        if max_tokens == 0 {
            return Err(AppError::InvalidInput(
                "max_chunk_tokens must be positive".to_string(),
            ));
        }
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to load tokenizer: {}", e)))?;
        // Overlap must leave room for at least one new token per chunk.
        let overlap_tokens = overlap_tokens.min(max_tokens.saturating_sub(1));
        Ok(Self {
            bpe,
            max_tokens,
            overlap_tokens,
        })
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Token count of a text under the loaded model.
    pub fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }

    /// Chunk cleaned text into token-bounded slices carrying the document
    /// metadata. Empty or whitespace-only input yields an empty vec.
    pub fn chunk(&self, text: &str, meta: &DocumentMeta) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return vec![];
        }

        let segments = self.split_segments(text);
        if segments.is_empty() {
            return vec![];
        }

        let mut chunks: Vec<Chunk> = Vec::new();
        // (text, token_count) of segments in the chunk being built.
        let mut current: Vec<(String, usize)> = Vec::new();
        let mut current_tokens = 0usize;

        for (seg_text, seg_tokens) in segments {
            if current_tokens + seg_tokens > self.max_tokens && !current.is_empty() {
                self.emit_chunk(&mut chunks, &current, meta);

                // Seed the next chunk with trailing segments of this one,
                // bounded by the overlap budget and by room for the
                // incoming segment.
                let budget = self
                    .overlap_tokens
                    .min(self.max_tokens.saturating_sub(seg_tokens));
                let mut seed: Vec<(String, usize)> = Vec::new();
                let mut seed_tokens = 0usize;
                for seg in current.iter().rev() {
                    if seed_tokens + seg.1 > budget {
                        break;
                    }
                    seed_tokens += seg.1;
                    seed.push(seg.clone());
                }
                seed.reverse();
                current = seed;
                current_tokens = seed_tokens;
            }
            current_tokens += seg_tokens;
            current.push((seg_text, seg_tokens));
        }

        if !current.is_empty() {
            self.emit_chunk(&mut chunks, &current, meta);
        }

        debug!(
            url = %meta.url,
            chunks = chunks.len(),
            "chunked document"
        );
        chunks
    }

    fn emit_chunk(&self, chunks: &mut Vec<Chunk>, segments: &[(String, usize)], meta: &DocumentMeta) {
        let text = segments
            .iter()
            .map(|(t, _)| t.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let token_count = self.count_tokens(&text);
        chunks.push(Chunk {
            text,
            chunk_index: chunks.len(),
            token_count,
            meta: meta.clone(),
        });
    }

    /// Split text into sentence-ish segments, each within the token
    /// budget. Pathologically long sentences are hard-split by words.
    fn split_segments(&self, text: &str) -> Vec<(String, usize)> {
        let mut segments = Vec::new();
        for paragraph in text.split("\n\n") {
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }
            for sentence in split_sentences(paragraph) {
                let tokens = self.count_tokens(&sentence);
                if tokens <= self.max_tokens {
                    segments.push((sentence, tokens));
                } else {
                    self.split_by_words(&sentence, &mut segments);
                }
            }
        }
        segments
    }

    fn split_by_words(&self, sentence: &str, out: &mut Vec<(String, usize)>) {
        let mut piece: Vec<String> = Vec::new();
        let mut piece_tokens = 0usize;
        for word in sentence.split_whitespace() {
            // A lone word above the budget has no valid split point at a
            // word boundary; halve it by characters until it fits.
            let mut word_owned = word.to_string();
            let mut word_tokens = self.count_tokens(&word_owned);
            while word_tokens > self.max_tokens {
                let keep = word_owned
                    .char_indices()
                    .map(|(i, _)| i)
                    .nth(word_owned.chars().count() / 2)
                    .unwrap_or(0);
                if keep == 0 {
                    break;
                }
                word_owned.truncate(keep);
                word_tokens = self.count_tokens(&word_owned);
            }

            if piece_tokens + word_tokens > self.max_tokens && !piece.is_empty() {
                let text = piece.join(" ");
                let tokens = self.count_tokens(&text);
                out.push((text, tokens));
                piece.clear();
                piece_tokens = 0;
            }
            piece_tokens += word_tokens;
            piece.push(word_owned);
        }
        if !piece.is_empty() {
            let text = piece.join(" ");
            let tokens = self.count_tokens(&text);
            out.push((text, tokens));
        }
    }
}

/// Split a paragraph into sentences on `.`, `!`, `?` followed by
/// whitespace. No attempt at abbreviation handling; sentence boundaries
/// only guide packing, correctness does not depend on them.
fn split_sentences(paragraph: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let bytes = paragraph.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        let b = bytes[i];
        if (b == b'.' || b == b'!' || b == b'?')
            && bytes.get(i + 1).is_some_and(|next| next.is_ascii_whitespace())
        {
            let sentence = paragraph[start..=i].trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            start = i + 1;
        }
        i += 1;
    }
    let tail = paragraph[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

/// Normalize scraped markdown before chunking: collapse runs of spaces
/// and tabs, collapse blank-line runs to a single paragraph break, and
/// drop control characters other than `\n` and `\t`.
pub fn clean_markdown(raw: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    for line in raw.lines() {
        let filtered: String = line
            .chars()
            .filter(|c| !c.is_control() || *c == '\t')
            .collect();
        let collapsed = filtered.split_whitespace().collect::<Vec<_>>().join(" ");
        lines.push(collapsed);
    }

    let mut out: Vec<&str> = Vec::new();
    let mut blank_run = 0usize;
    for line in &lines {
        if line.is_empty() {
            blank_run += 1;
            if blank_run == 1 && !out.is_empty() {
                out.push("");
            }
        } else {
            blank_run = 0;
            out.push(line);
        }
    }
    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }
    out.join("\n")
}
