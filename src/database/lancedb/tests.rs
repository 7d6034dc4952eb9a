use super::*;

fn chunk(source: &str, offset: u64) -> DocumentChunk {
    DocumentChunk {
        content: "This is test content for the chunk".to_string(),
        source_uri: source.to_string(),
        document_name: "paper.pdf".to_string(),
        page_number: 3,
        char_offset: offset,
        chunk_index: 7,
        token_count: 25,
    }
}

#[test]
fn record_key_is_deterministic() {
    let a = record_key("https://example.com/paper.pdf", 120);
    let b = record_key("https://example.com/paper.pdf", 120);
    assert_eq!(a, b);
    assert_eq!(a.len(), 64);
    assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

    assert_ne!(a, record_key("https://example.com/paper.pdf", 121));
    assert_ne!(a, record_key("https://example.com/other.pdf", 120));
}

#[test]
fn record_from_chunk() {
    let record = EmbeddingRecord::from_chunk(
        "Place Branding in Tourist",
        &chunk("https://example.com/paper.pdf", 42),
        vec![0.1, 0.2, 0.3],
    );

    assert_eq!(record.id, record_key("https://example.com/paper.pdf", 42));
    assert_eq!(record.collection, "Place Branding in Tourist");
    assert_eq!(record.vector.len(), 3);
    assert_eq!(record.metadata.page_number, 3);
    assert_eq!(record.metadata.chunk_index, 7);
    assert_eq!(record.metadata.token_count, 25);
    assert!(!record.metadata.created_at.is_empty());
}

#[test]
fn table_name_normalization() {
    let name = table_name_for("Place Branding in Tourist");
    assert!(name.starts_with("place_branding_in_tourist_"));
    assert_eq!(name.len(), "place_branding_in_tourist_".len() + 8);
    assert_eq!(name, table_name_for("Place Branding in Tourist"));

    assert!(table_name_for("  papers-2024 ").starts_with("papers_2024_"));
    assert!(table_name_for("ümlaut").starts_with("_mlaut_"));
}

#[test]
fn similar_collection_names_get_distinct_tables() {
    assert_ne!(table_name_for("Place Branding"), table_name_for("place_branding"));
    assert_ne!(table_name_for("A B"), table_name_for("a_b"));
    assert_ne!(table_name_for("papers"), table_name_for("papers "));
}

#[test]
fn search_mode_parsing_and_display() {
    assert_eq!("hybrid".parse::<SearchMode>(), Ok(SearchMode::Hybrid));
    assert_eq!("Dense".parse::<SearchMode>(), Ok(SearchMode::Dense));
    assert_eq!("keyword".parse::<SearchMode>(), Ok(SearchMode::Keyword));
    assert!("fuzzy".parse::<SearchMode>().is_err());

    for mode in [SearchMode::Dense, SearchMode::Keyword, SearchMode::Hybrid] {
        assert_eq!(mode.to_string().parse::<SearchMode>(), Ok(mode));
    }
    assert_eq!(SearchMode::default(), SearchMode::Hybrid);
}

#[test]
fn chunk_metadata_serialization() {
    let record = EmbeddingRecord::from_chunk("c", &chunk("a.pdf", 0), vec![1.0]);

    let json = serde_json::to_string(&record.metadata).expect("should serialize");
    let parsed: ChunkMetadata = serde_json::from_str(&json).expect("should deserialize");
    assert_eq!(parsed, record.metadata);
}
