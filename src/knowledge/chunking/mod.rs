#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::debug;

use crate::knowledge::extractor::ExtractedDocument;

/// A contiguous span of document text ready for embedding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChunk {
    /// The chunk text, a literal slice of the page
    pub content: String,
    /// URI of the document the chunk was cut from
    pub source_uri: String,
    /// Display name of the document
    pub document_name: String,
    /// 1-based page number
    pub page_number: u32,
    /// Character offset of the chunk start within the whole document
    pub char_offset: u64,
    /// Index of this chunk within the document
    pub chunk_index: usize,
    /// Estimated token count
    pub token_count: usize,
}

/// Configuration for content chunking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Target chunk size in tokens
    pub target_chunk_size: usize,
    /// Maximum chunk size in tokens before forced splitting
    pub max_chunk_size: usize,
    /// Minimum chunk size in tokens (smaller chunks will be merged)
    pub min_chunk_size: usize,
    /// Overlap size in tokens between adjacent chunks on the same page
    pub overlap_size: usize,
    /// Whether to break at sentence boundaries when possible
    pub sentence_boundary_splitting: bool,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            target_chunk_size: 300,
            max_chunk_size: 500,
            min_chunk_size: 50,
            overlap_size: 40,
            sentence_boundary_splitting: true,
        }
    }
}

/// Span of a page under construction, in byte offsets of the page text
#[derive(Debug, Clone)]
struct Span {
    range: Range<usize>,
    token_count: usize,
}

/// Chunk an extracted document into embedding-ready pieces
#[inline]
pub fn chunk_document(document: &ExtractedDocument, config: &ChunkingConfig) -> Vec<DocumentChunk> {
    let mut chunks = Vec::new();
    let mut page_start_chars: u64 = 0;

    for page in &document.pages {
        let spans = chunk_page(&page.text, config);

        for span in spans {
            let char_offset =
                page_start_chars + page.text[..span.range.start].chars().count() as u64;
            let content = page.text[span.range.clone()].to_string();
            chunks.push(DocumentChunk {
                token_count: estimate_token_count(&content),
                content,
                source_uri: document.source_uri.clone(),
                document_name: document.name.clone(),
                page_number: page.number,
                char_offset,
                chunk_index: chunks.len(),
            });
        }

        // Pages are joined with a single newline
        page_start_chars += page.text.chars().count() as u64 + 1;
    }

    debug!(
        "Chunked document '{}' into {} chunks (avg {} tokens)",
        document.name,
        chunks.len(),
        chunks.iter().map(|c| c.token_count).sum::<usize>() / chunks.len().max(1)
    );

    chunks
}

/// Split a single page into spans, then merge small spans and add overlap
fn chunk_page(text: &str, config: &ChunkingConfig) -> Vec<Span> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let whole = trim_range(text, 0..text.len());
    let whole_tokens = estimate_token_count(&text[whole.clone()]);

    let spans = if whole_tokens <= config.target_chunk_size {
        vec![Span {
            range: whole,
            token_count: whole_tokens,
        }]
    } else {
        group_units(split_units(text, config), config.target_chunk_size)
    };

    let merged = merge_small_spans(text, spans, config);

    if config.overlap_size > 0 {
        add_overlap(text, merged, config.overlap_size)
    } else {
        merged
    }
}

/// Break page text into units no larger than the max chunk size where possible:
/// paragraphs first, then sentences, then words
fn split_units(text: &str, config: &ChunkingConfig) -> Vec<Span> {
    let mut units = Vec::new();

    for paragraph in paragraph_ranges(text) {
        let paragraph_tokens = estimate_token_count(&text[paragraph.clone()]);
        if paragraph_tokens <= config.max_chunk_size {
            units.push(Span {
                range: paragraph,
                token_count: paragraph_tokens,
            });
            continue;
        }

        let pieces = if config.sentence_boundary_splitting {
            sentence_ranges(text, paragraph)
        } else {
            word_ranges(text, paragraph)
        };

        for piece in pieces {
            let piece_tokens = estimate_token_count(&text[piece.clone()]);
            if piece_tokens > config.target_chunk_size {
                // Sentence too long on its own; fall back to words
                units.extend(word_ranges(text, piece).into_iter().map(|range| Span {
                    token_count: estimate_token_count(&text[range.clone()]),
                    range,
                }));
            } else {
                units.push(Span {
                    range: piece,
                    token_count: piece_tokens,
                });
            }
        }
    }

    units
}

/// Greedily group consecutive units up to the target size
fn group_units(units: Vec<Span>, target_chunk_size: usize) -> Vec<Span> {
    let mut spans: Vec<Span> = Vec::new();
    let mut current: Option<Span> = None;

    for unit in units {
        current = match current.take() {
            Some(span) if span.token_count + unit.token_count > target_chunk_size => {
                spans.push(span);
                Some(unit)
            }
            Some(span) => Some(Span {
                range: span.range.start..unit.range.end,
                token_count: span.token_count + unit.token_count,
            }),
            None => Some(unit),
        };
    }

    if let Some(span) = current {
        spans.push(span);
    }

    spans
}

/// Merge chunks smaller than the minimum size into their predecessor, as long
/// as the result stays within the maximum size
fn merge_small_spans(text: &str, spans: Vec<Span>, config: &ChunkingConfig) -> Vec<Span> {
    let mut processed: Vec<Span> = Vec::with_capacity(spans.len());

    for span in spans {
        if span.token_count < config.min_chunk_size {
            if let Some(previous) = processed.last_mut() {
                if previous.token_count + span.token_count <= config.max_chunk_size {
                    let range = previous.range.start..span.range.end;
                    previous.token_count = estimate_token_count(&text[range.clone()]);
                    previous.range = range;
                    continue;
                }
            }
        }
        processed.push(span);
    }

    processed
}

/// Extend each chunk backwards so it starts with the tail of its predecessor
fn add_overlap(text: &str, spans: Vec<Span>, overlap_tokens: usize) -> Vec<Span> {
    let word_count = (overlap_tokens as f64 * 0.75) as usize; // Rough word-to-token ratio
    if word_count == 0 {
        return spans;
    }

    let mut result: Vec<Span> = Vec::with_capacity(spans.len());
    for (i, span) in spans.iter().enumerate() {
        if i == 0 {
            result.push(span.clone());
            continue;
        }

        let previous = &spans[i - 1];
        let previous_words = word_ranges(text, previous.range.clone());

        // Skip overlap when it would swallow the whole previous chunk
        if previous_words.len() <= word_count {
            result.push(span.clone());
            continue;
        }

        let overlap_start = previous_words[previous_words.len() - word_count].start;
        let range = overlap_start..span.range.end;
        result.push(Span {
            token_count: estimate_token_count(&text[range.clone()]),
            range,
        });
    }

    result
}

/// Byte ranges of blank-line separated paragraphs, trimmed
fn paragraph_ranges(text: &str) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut paragraph_start: Option<usize> = None;
    let mut paragraph_end = 0;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        if line.trim().is_empty() {
            if let Some(start) = paragraph_start.take() {
                ranges.push(trim_range(text, start..paragraph_end));
            }
        } else {
            if paragraph_start.is_none() {
                paragraph_start = Some(offset);
            }
            paragraph_end = offset + line.len();
        }
        offset += line.len();
    }

    if let Some(start) = paragraph_start {
        ranges.push(trim_range(text, start..paragraph_end));
    }

    ranges.retain(|range| !range.is_empty());
    ranges
}

/// Byte ranges of sentences within `range`, split after `.`, `!` or `?`
/// followed by whitespace
fn sentence_ranges(text: &str, range: Range<usize>) -> Vec<Range<usize>> {
    let slice = &text[range.clone()];
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut chars = slice.char_indices().peekable();

    while let Some((index, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars.peek().is_none_or(|(_, next)| next.is_whitespace());
            if at_boundary {
                let end = index + c.len_utf8();
                ranges.push(trim_range(text, range.start + start..range.start + end));
                start = end;
            }
        }
    }

    if start < slice.len() {
        ranges.push(trim_range(text, range.start + start..range.end));
    }

    ranges.retain(|range| !range.is_empty());
    ranges
}

/// Byte ranges of whitespace-separated words within `range`
fn word_ranges(text: &str, range: Range<usize>) -> Vec<Range<usize>> {
    let slice = &text[range.clone()];
    let mut ranges = Vec::new();
    let mut word_start: Option<usize> = None;

    for (index, c) in slice.char_indices() {
        if c.is_whitespace() {
            if let Some(start) = word_start.take() {
                ranges.push(range.start + start..range.start + index);
            }
        } else if word_start.is_none() {
            word_start = Some(index);
        }
    }

    if let Some(start) = word_start {
        ranges.push(range.start + start..range.end);
    }

    ranges
}

/// Shrink a byte range so it does not start or end with whitespace
fn trim_range(text: &str, range: Range<usize>) -> Range<usize> {
    let slice = &text[range.clone()];
    let leading = slice.len() - slice.trim_start().len();
    let trailing = slice.len() - slice.trim_end().len();
    if leading == slice.len() {
        return range.start..range.start;
    }
    range.start + leading..range.end - trailing
}

/// Estimate token count using a simple heuristic
/// This is a rough approximation - actual tokenization would be more accurate
#[inline]
pub fn estimate_token_count(text: &str) -> usize {
    // Rough heuristic: 1 token ≈ 0.75 words for English text
    // Add extra tokens for punctuation and special characters
    let word_count = text.split_whitespace().count();
    let punct_count = text.chars().filter(|c| c.is_ascii_punctuation()).count();

    (punct_count as f64).mul_add(0.1, word_count as f64 / 0.75) as usize
}
