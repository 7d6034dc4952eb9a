// Knowledge base module
// Fetches sources, extracts page text, chunks and embeds it into the vector store

#[cfg(test)]
mod tests;

pub mod chunking;
pub mod extractor;
pub mod fetch;

use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt, stream};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::database::lancedb::{
    CollectionInfo, EmbeddingRecord, SearchMode, SearchResult, VectorStore,
};
use crate::model::Embedder;
use crate::{RagError, Result};

use self::chunking::{ChunkingConfig, DocumentChunk, chunk_document};
use self::extractor::extract_document;
use self::fetch::{FetchConfig, SourceFetcher};

/// Embedding requests in flight at once during a load
const EMBEDDING_CONCURRENCY: usize = 4;

/// How a load writes into the collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Overwrite records that already exist instead of skipping them
    pub upsert: bool,
    /// Drop the collection before writing
    pub recreate: bool,
}

/// Summary of a completed load
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub documents: usize,
    pub pages: usize,
    /// Chunks produced by chunking, before writing
    pub chunks: usize,
    /// Chunks written to the store by this load
    pub chunks_indexed: usize,
    /// Sources that produced no text
    pub empty_sources: Vec<String>,
}

/// A set of documents indexed into one vector store collection
pub struct KnowledgeBase {
    sources: Vec<String>,
    chunking: ChunkingConfig,
    fetcher: SourceFetcher,
    embedder: Arc<dyn Embedder>,
    store: Arc<VectorStore>,
    search_mode: SearchMode,
    num_documents: usize,
    batch_size: usize,
    show_progress: bool,
}

impl KnowledgeBase {
    #[inline]
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<VectorStore>) -> Self {
        Self {
            sources: Vec::new(),
            chunking: ChunkingConfig::default(),
            fetcher: SourceFetcher::default(),
            embedder,
            store,
            search_mode: SearchMode::default(),
            num_documents: 5,
            batch_size: 64,
            show_progress: false,
        }
    }

    /// Knowledge base for the configured collection and sources
    #[inline]
    pub fn from_config(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        store: Arc<VectorStore>,
    ) -> Self {
        let fetcher = SourceFetcher::new(FetchConfig {
            timeout_seconds: config.knowledge.fetch_timeout_secs,
            max_retries: config.knowledge.fetch_retries,
            ..FetchConfig::default()
        });

        Self::new(embedder, store)
            .with_sources(config.knowledge.sources.clone())
            .with_chunking(config.chunking.clone())
            .with_fetcher(fetcher)
            .with_search_mode(config.knowledge.search_mode)
            .with_num_documents(config.knowledge.num_documents)
            .with_batch_size(config.model.batch_size as usize)
    }

    #[inline]
    #[must_use]
    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.sources = sources;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_chunking(mut self, chunking: ChunkingConfig) -> Self {
        self.chunking = chunking;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_fetcher(mut self, fetcher: SourceFetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_search_mode(mut self, search_mode: SearchMode) -> Self {
        self.search_mode = search_mode;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_num_documents(mut self, num_documents: usize) -> Self {
        self.num_documents = num_documents;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Show a progress bar on an attended terminal while loading
    #[inline]
    #[must_use]
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    #[inline]
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    #[inline]
    pub fn collection(&self) -> &str {
        self.store.collection()
    }

    #[inline]
    pub fn search_mode(&self) -> SearchMode {
        self.search_mode
    }

    #[inline]
    pub fn num_documents(&self) -> usize {
        self.num_documents
    }

    #[inline]
    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    #[inline]
    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Fetch, chunk, embed and write every source.
    ///
    /// All sources are embedded before anything is written, so a failing
    /// source or embedding call leaves the collection untouched.
    #[inline]
    pub async fn load(&self, options: LoadOptions) -> Result<LoadReport> {
        info!(
            "Loading {} sources into collection '{}'",
            self.sources.len(),
            self.collection()
        );

        let mut report = LoadReport::default();
        let mut chunks: Vec<DocumentChunk> = Vec::new();

        for source in &self.sources {
            let fetched = self.fetcher.fetch(source).await?;
            let document =
                extract_document(&fetched.uri, &fetched.bytes, fetched.content_type.as_deref())?;

            report.documents += 1;
            report.pages += document.pages.len();

            if document.is_empty() {
                warn!("No extractable text in {}, nothing to index", source);
                report.empty_sources.push(source.clone());
                continue;
            }

            let document_chunks = chunk_document(&document, &self.chunking);
            debug!("Chunked {} into {} chunks", source, document_chunks.len());
            chunks.extend(document_chunks);
        }

        report.chunks = chunks.len();
        let records = self.embed_chunks(&chunks).await?;

        if options.recreate {
            info!("Recreating collection '{}'", self.collection());
            self.store.drop_collection().await?;
        }

        if records.is_empty() {
            info!("No chunks to index for collection '{}'", self.collection());
            return Ok(report);
        }

        report.chunks_indexed = if options.upsert {
            self.store.upsert(records).await?
        } else {
            self.store.insert_missing(records).await?
        };

        info!(
            "Indexed {} of {} chunks from {} documents into '{}'",
            report.chunks_indexed,
            report.chunks,
            report.documents,
            self.collection()
        );

        Ok(report)
    }

    async fn embed_chunks(&self, chunks: &[DocumentChunk]) -> Result<Vec<EmbeddingRecord>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let bar = self.progress_bar(chunks.len());
        let batches: Vec<Vec<String>> = chunks
            .chunks(self.batch_size)
            .map(|batch| batch.iter().map(|c| c.content.clone()).collect())
            .collect();

        let vectors: Vec<Vec<Vec<f32>>> = stream::iter(batches)
            .map(|texts| {
                let embedder = Arc::clone(&self.embedder);
                let bar = bar.clone();
                async move {
                    let vectors = embedder.embed(&texts).await?;
                    if vectors.len() != texts.len() {
                        return Err(RagError::Embedding(format!(
                            "Requested {} embeddings but received {}",
                            texts.len(),
                            vectors.len()
                        )));
                    }
                    bar.inc(texts.len() as u64);
                    Ok::<_, RagError>(vectors)
                }
            })
            .buffered(EMBEDDING_CONCURRENCY)
            .try_collect()
            .await?;
        bar.finish_and_clear();

        let dimension = self.store.dimension();
        chunks
            .iter()
            .zip(vectors.into_iter().flatten())
            .map(|(chunk, vector)| {
                if vector.len() == dimension {
                    Ok(EmbeddingRecord::from_chunk(self.collection(), chunk, vector))
                } else {
                    Err(RagError::ConfigMismatch(format!(
                        "Embedding model {} returned {}-dimensional vectors, expected {dimension}",
                        self.embedder.model_id(),
                        vector.len()
                    )))
                }
            })
            .collect()
    }

    fn progress_bar(&self, total: usize) -> ProgressBar {
        if !self.show_progress || !console::user_attended_stderr() {
            return ProgressBar::hidden();
        }

        let style = ProgressStyle::with_template("{spinner} [{pos}/{len}] Embedding chunks {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        let bar = ProgressBar::new(total as u64).with_style(style);
        bar.enable_steady_tick(Duration::from_millis(120));
        bar
    }

    /// Search the collection with the configured mode and top-k, unless overridden
    #[inline]
    pub async fn search(
        &self,
        query: &str,
        mode: Option<SearchMode>,
        k: Option<usize>,
    ) -> Result<Vec<SearchResult>> {
        let mode = mode.unwrap_or(self.search_mode);
        let k = k.unwrap_or(self.num_documents);
        if k == 0 {
            return Ok(Vec::new());
        }

        let embedding = if mode == SearchMode::Keyword {
            Vec::new()
        } else {
            self.embed_query(query).await?
        };

        self.store.search_text(query, &embedding, mode, k).await
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embedder.embed(&[query.to_string()]).await?;
        match vectors.pop() {
            Some(vector) if vectors.is_empty() => Ok(vector),
            _ => Err(RagError::Embedding(
                "Expected exactly one embedding for the query".to_string(),
            )),
        }
    }

    #[inline]
    pub async fn status(&self) -> Result<CollectionInfo> {
        self.store.collection_info().await
    }
}
