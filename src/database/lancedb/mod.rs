// LanceDB vector database module
// Stores chunk embeddings per collection and answers dense, keyword and hybrid searches

#[cfg(test)]
mod tests;

pub mod hybrid;
pub mod vector_store;

pub use vector_store::{CollectionInfo, SearchSettings, VectorStore};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::knowledge::chunking::DocumentChunk;

const TABLE_SUFFIX_LEN: usize = 8;

/// Embedding record stored in LanceDB
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Idempotency key, see [`record_key`]
    pub id: String,
    /// Collection this record belongs to
    pub collection: String,
    pub vector: Vec<f32>,
    /// Metadata about the chunk this embedding represents
    pub metadata: ChunkMetadata,
}

impl EmbeddingRecord {
    /// Build the record for an embedded chunk
    #[inline]
    pub fn from_chunk(collection: &str, chunk: &DocumentChunk, vector: Vec<f32>) -> Self {
        Self {
            id: record_key(&chunk.source_uri, chunk.char_offset),
            collection: collection.to_string(),
            vector,
            metadata: ChunkMetadata {
                source_uri: chunk.source_uri.clone(),
                document_name: chunk.document_name.clone(),
                page_number: chunk.page_number,
                char_offset: chunk.char_offset,
                chunk_index: chunk.chunk_index as u32,
                content: chunk.content.clone(),
                token_count: chunk.token_count as u32,
                created_at: chrono::Utc::now().to_rfc3339(),
            },
        }
    }
}

/// Metadata for a chunk stored alongside its embedding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub source_uri: String,
    pub document_name: String,
    /// 1-based page number
    pub page_number: u32,
    /// Character offset of the chunk within its document
    pub char_offset: u64,
    pub chunk_index: u32,
    /// The actual text content of the chunk
    pub content: String,
    pub token_count: u32,
    /// Timestamp when this embedding was created
    pub created_at: String,
}

/// How a query is matched against stored chunks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Dense,
    Keyword,
    #[default]
    Hybrid,
}

impl fmt::Display for SearchMode {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::Dense => "dense",
            Self::Keyword => "keyword",
            Self::Hybrid => "hybrid",
        };
        f.write_str(name)
    }
}

impl FromStr for SearchMode {
    type Err = String;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dense" | "vector" => Ok(Self::Dense),
            "keyword" | "text" => Ok(Self::Keyword),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!(
                "unknown search mode '{other}' (expected dense, keyword or hybrid)"
            )),
        }
    }
}

/// A ranked chunk returned by a search
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub metadata: ChunkMetadata,
    /// Final ranking score in 0..=1
    pub score: f32,
    /// Cosine similarity mapped to 0..=1
    pub dense_score: f32,
    /// BM25 score normalised to 0..=1; zero in dense mode
    pub keyword_score: f32,
}

/// Deterministic idempotency key of a chunk: hex SHA-256 of `source#offset`
#[inline]
pub fn record_key(source_uri: &str, char_offset: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_uri.as_bytes());
    hasher.update(b"#");
    hasher.update(char_offset.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Table name for a collection: the name lowercased with everything outside
/// `[a-z0-9]` replaced by `_`, suffixed with a short SHA-256 of the raw name so
/// that names differing only in case or punctuation get separate tables
#[inline]
pub fn table_name_for(collection: &str) -> String {
    let slug: String = collection
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let digest = hex::encode(Sha256::digest(collection.as_bytes()));
    format!("{slug}_{}", &digest[..TABLE_SUFFIX_LEN])
}
