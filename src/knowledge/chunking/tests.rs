use super::estimate_token_count as estimate_token_count_impl;
use super::*;
use crate::knowledge::extractor::PageText;

fn document(pages: &[&str]) -> ExtractedDocument {
    ExtractedDocument {
        source_uri: "https://example.com/paper.pdf".to_string(),
        name: "paper.pdf".to_string(),
        pages: pages
            .iter()
            .enumerate()
            .map(|(i, text)| PageText {
                number: i as u32 + 1,
                text: (*text).to_string(),
            })
            .collect(),
    }
}

fn no_overlap() -> ChunkingConfig {
    ChunkingConfig {
        overlap_size: 0,
        ..ChunkingConfig::default()
    }
}

fn joined_chars(document: &ExtractedDocument) -> Vec<char> {
    document
        .pages
        .iter()
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
        .chars()
        .collect()
}

#[test]
fn estimate_token_count() {
    assert_eq!(estimate_token_count_impl("hello world"), 2);
    assert_eq!(estimate_token_count_impl("This is a test."), 5);
    assert_eq!(estimate_token_count_impl(""), 0);
}

#[test]
fn small_page_is_single_chunk() {
    let doc = document(&["Place branding shapes how tourists perceive a destination."]);
    let chunks = chunk_document(&doc, &ChunkingConfig::default());

    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].page_number, 1);
    assert_eq!(chunks[0].char_offset, 0);
    assert_eq!(chunks[0].chunk_index, 0);
    assert_eq!(
        chunks[0].content,
        "Place branding shapes how tourists perceive a destination."
    );
}

#[test]
fn one_chunk_per_small_page() {
    let pages: Vec<String> = (1..=10)
        .map(|i| format!("Section {i} discusses the research methodology in detail."))
        .collect();
    let page_refs: Vec<&str> = pages.iter().map(String::as_str).collect();
    let doc = document(&page_refs);

    let chunks = chunk_document(&doc, &ChunkingConfig::default());

    assert_eq!(chunks.len(), 10);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, i);
        assert_eq!(chunk.page_number, i as u32 + 1);
    }
}

#[test]
fn large_page_is_split_within_bounds() {
    let text = "Destination image is formed by many repeated impressions. ".repeat(200);
    let doc = document(&[&text]);
    let config = no_overlap();

    let chunks = chunk_document(&doc, &config);

    assert!(chunks.len() > 1);
    for chunk in &chunks {
        assert!(
            chunk.token_count <= config.max_chunk_size,
            "chunk of {} tokens exceeds max",
            chunk.token_count
        );
        assert!(!chunk.content.starts_with(char::is_whitespace));
        assert!(!chunk.content.ends_with(char::is_whitespace));
    }
}

#[test]
fn offsets_point_at_chunk_text() {
    let long = "Tourists compare destinations by brand. ".repeat(120);
    let doc = document(&["Abstract\n\nA short first page.", &long, "", "Closing remarks."]);

    let chunks = chunk_document(&doc, &ChunkingConfig::default());
    let full = joined_chars(&doc);

    for chunk in &chunks {
        let start = chunk.char_offset as usize;
        let slice: String = full[start..start + chunk.content.chars().count()]
            .iter()
            .collect();
        assert_eq!(slice, chunk.content);
    }

    // Empty pages produce no chunks but still advance offsets
    assert!(chunks.iter().all(|c| c.page_number != 3));
    let last = chunks.last().expect("should have chunks");
    assert_eq!(last.page_number, 4);
    assert_eq!(last.content, "Closing remarks.");
}

#[test]
fn offsets_are_unique_and_increasing() {
    let text = "Residents and visitors experience the city brand differently. ".repeat(150);
    let doc = document(&[&text, &text]);

    let chunks = chunk_document(&doc, &ChunkingConfig::default());

    for pair in chunks.windows(2) {
        assert!(pair[0].char_offset < pair[1].char_offset);
    }
}

#[test]
fn overlap_repeats_previous_tail() {
    let text = (0..600)
        .map(|i| format!("word{i}"))
        .collect::<Vec<_>>()
        .join(" ");
    let doc = document(&[&text]);
    let config = ChunkingConfig {
        overlap_size: 20,
        ..ChunkingConfig::default()
    };

    let chunks = chunk_document(&doc, &config);
    assert!(chunks.len() > 1);

    let first_words: Vec<&str> = chunks[0].content.split_whitespace().collect();
    let second_words: Vec<&str> = chunks[1].content.split_whitespace().collect();
    let overlap_words = 15;
    assert_eq!(
        &first_words[first_words.len() - overlap_words..],
        &second_words[..overlap_words]
    );
}

#[test]
fn overlap_stays_within_page() {
    let doc = document(&["First page text here.", "Second page text here."]);
    let config = ChunkingConfig {
        overlap_size: 4,
        min_chunk_size: 1,
        ..ChunkingConfig::default()
    };

    let chunks = chunk_document(&doc, &config);

    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[1].content, "Second page text here.");
}

#[test]
fn small_trailing_chunks_are_merged() {
    let big = "Branding strategy requires consistent messaging across channels. ".repeat(40);
    let text = format!("{big}\n\nTiny tail.");
    let doc = document(&[&text]);
    let config = ChunkingConfig {
        target_chunk_size: 100,
        max_chunk_size: 200,
        min_chunk_size: 20,
        overlap_size: 0,
        sentence_boundary_splitting: true,
    };

    let chunks = chunk_document(&doc, &config);

    assert!(chunks.iter().all(|c| c.content != "Tiny tail."));
    assert!(
        chunks
            .last()
            .expect("should have chunks")
            .content
            .ends_with("Tiny tail.")
    );
}

#[test]
fn short_final_span_joins_full_predecessor() {
    let full = "Destination image mediates the effect of place branding on loyalty. ".repeat(12);
    let text = format!("{full}\n\nShort close.");
    let split = full.trim_end().len();
    let tail = text.len() - "Short close.".len();
    let spans = vec![
        Span {
            range: 0..split,
            token_count: estimate_token_count_impl(&text[..split]),
        },
        Span {
            range: tail..text.len(),
            token_count: estimate_token_count_impl(&text[tail..]),
        },
    ];
    let config = ChunkingConfig {
        target_chunk_size: 100,
        max_chunk_size: 200,
        min_chunk_size: 20,
        overlap_size: 0,
        sentence_boundary_splitting: true,
    };
    assert!(spans[0].token_count >= config.min_chunk_size);

    let merged = merge_small_spans(&text, spans.clone(), &config);
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].range, 0..text.len());

    let tight = ChunkingConfig {
        max_chunk_size: spans[0].token_count,
        ..config
    };
    assert_eq!(merge_small_spans(&text, spans, &tight).len(), 2);
}

#[test]
fn chunking_is_deterministic() {
    let text = "The survey collected responses from 400 visitors. ".repeat(80);
    let doc = document(&[&text]);
    let config = ChunkingConfig::default();

    assert_eq!(chunk_document(&doc, &config), chunk_document(&doc, &config));
}

#[test]
fn whitespace_only_document_has_no_chunks() {
    let doc = document(&["   \n\n  ", ""]);
    assert!(chunk_document(&doc, &ChunkingConfig::default()).is_empty());
}
