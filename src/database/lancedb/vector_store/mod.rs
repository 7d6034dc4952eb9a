
use arrow::array::{
    Array, FixedSizeListArray, Float32Array, RecordBatchIterator, StringArray, UInt32Array,
    UInt64Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use futures::TryStreamExt;
use serde::Serialize;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{Connection, DistanceType, Table};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::hybrid::{self, Bm25Index, Candidate};
use super::{ChunkMetadata, EmbeddingRecord, SearchMode, SearchResult, table_name_for};
use crate::config::{Config, KnowledgeConfig};
use crate::{RagError, Result};

/// Ranking parameters shared by every search on a store
#[derive(Debug, Clone, PartialEq)]
pub struct SearchSettings {
    pub dense_weight: f32,
    pub keyword_weight: f32,
    /// Each method contributes `k * candidate_multiplier` hybrid candidates
    pub candidate_multiplier: usize,
    pub timeout: Duration,
}

impl Default for SearchSettings {
    #[inline]
    fn default() -> Self {
        Self {
            dense_weight: 0.7,
            keyword_weight: 0.3,
            candidate_multiplier: 4,
            timeout: Duration::from_secs(10),
        }
    }
}

impl From<&KnowledgeConfig> for SearchSettings {
    #[inline]
    fn from(config: &KnowledgeConfig) -> Self {
        Self {
            dense_weight: config.dense_weight,
            keyword_weight: config.keyword_weight,
            candidate_multiplier: config.candidate_multiplier.max(1),
            timeout: Duration::from_secs(config.search_timeout_secs),
        }
    }
}

/// Summary of a collection for status output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionInfo {
    pub collection: String,
    pub table_name: String,
    pub exists: bool,
    pub rows: usize,
    /// Vector width of the existing table
    pub dimension: Option<usize>,
}

/// A row read back from the table
#[derive(Debug, Clone)]
struct StoredRow {
    id: String,
    metadata: ChunkMetadata,
    vector: Option<Vec<f32>>,
    distance: Option<f32>,
}

/// Vector database store using LanceDB, one table per collection
pub struct VectorStore {
    connection: Connection,
    collection: String,
    table_name: String,
    dimension: usize,
    settings: SearchSettings,
    write_lock: Mutex<()>,
}

impl VectorStore {
    /// Connect to the LanceDB directory at `path`. The collection's table is created on first write.
    #[inline]
    pub async fn open(
        path: &Path,
        collection: &str,
        dimension: usize,
        settings: SearchSettings,
    ) -> Result<Self> {
        debug!("Initializing LanceDB at path: {:?}", path);

        std::fs::create_dir_all(path).map_err(|e| {
            RagError::StoreUnavailable(format!(
                "Failed to create vector database directory {}: {e}",
                path.display()
            ))
        })?;

        let uri = path.to_string_lossy().to_string();
        let connection = lancedb::connect(&uri).execute().await.map_err(|e| {
            RagError::StoreUnavailable(format!("Failed to connect to LanceDB at {uri}: {e}"))
        })?;

        let store = Self {
            connection,
            collection: collection.to_string(),
            table_name: table_name_for(collection),
            dimension,
            settings,
            write_lock: Mutex::new(()),
        };

        if let Some(existing) = store.existing_dimension().await? {
            if existing != dimension {
                return Err(RagError::ConfigMismatch(format!(
                    "Collection '{}' stores {existing}-dimensional vectors but the embedder produces {dimension}",
                    store.collection
                )));
            }
        }

        info!(
            "Vector store ready for collection '{}' (table '{}')",
            store.collection, store.table_name
        );
        Ok(store)
    }

    /// Open the store described by the configuration
    #[inline]
    pub async fn from_config(config: &Config) -> Result<Self> {
        Self::open(
            &config.vector_database_path(),
            &config.knowledge.collection,
            config.model.embedding_dimension as usize,
            SearchSettings::from(&config.knowledge),
        )
        .await
    }

    #[inline]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    #[inline]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    fn collection_filter(&self) -> String {
        format!("collection = '{}'", self.collection.replace('\'', "''"))
    }

    async fn table_exists(&self) -> Result<bool> {
        let table_names = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| RagError::StoreUnavailable(format!("Failed to list tables: {e}")))?;
        Ok(table_names.contains(&self.table_name))
    }

    /// Open the collection's table, or `None` when it has never been written
    async fn open_table(&self) -> Result<Option<Table>> {
        if !self.table_exists().await? {
            return Ok(None);
        }

        let table = self
            .connection
            .open_table(&self.table_name)
            .execute()
            .await
            .map_err(|e| RagError::StoreUnavailable(format!("Failed to open table: {e}")))?;
        Ok(Some(table))
    }

    async fn existing_dimension(&self) -> Result<Option<usize>> {
        match self.open_table().await? {
            Some(table) => Ok(Some(Self::table_dimension(&table).await?)),
            None => Ok(None),
        }
    }

    /// Detect vector dimension from the table schema
    async fn table_dimension(table: &Table) -> Result<usize> {
        let schema = table
            .schema()
            .await
            .map_err(|e| RagError::StoreUnavailable(format!("Failed to get table schema: {e}")))?;

        for field in schema.fields() {
            if field.name() == "vector" {
                if let DataType::FixedSizeList(_, size) = field.data_type() {
                    return Ok(*size as usize);
                }
            }
        }

        Err(RagError::StoreUnavailable(
            "Could not find vector column or determine dimension".to_string(),
        ))
    }

    /// Create schema with the specified vector dimension
    fn create_schema(vector_dim: usize) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("collection", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, false)),
                    vector_dim as i32,
                ),
                false,
            ),
            Field::new("source_uri", DataType::Utf8, false),
            Field::new("document_name", DataType::Utf8, false),
            Field::new("page_number", DataType::UInt32, false),
            Field::new("char_offset", DataType::UInt64, false),
            Field::new("chunk_index", DataType::UInt32, false),
            Field::new("content", DataType::Utf8, false),
            Field::new("token_count", DataType::UInt32, false),
            Field::new("created_at", DataType::Utf8, false),
        ]))
    }

    /// Create a RecordBatch from embedding records
    fn create_record_batch(&self, records: &[EmbeddingRecord]) -> Result<RecordBatch> {
        let len = records.len();
        let vector_dim = self.dimension;

        let mut flat_values = Vec::with_capacity(len * vector_dim);
        for record in records {
            flat_values.extend_from_slice(&record.vector);
        }

        let values_array = Float32Array::from(flat_values);
        let field = Arc::new(Field::new("item", DataType::Float32, false));
        let vector_array =
            FixedSizeListArray::try_new(field, vector_dim as i32, Arc::new(values_array), None)
                .map_err(|e| {
                    RagError::StoreUnavailable(format!("Failed to create vector array: {e}"))
                })?;

        let arrays: Vec<Arc<dyn Array>> = vec![
            Arc::new(StringArray::from_iter_values(records.iter().map(|r| &r.id))),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| &r.collection),
            )),
            Arc::new(vector_array),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| &r.metadata.source_uri),
            )),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| &r.metadata.document_name),
            )),
            Arc::new(UInt32Array::from_iter_values(
                records.iter().map(|r| r.metadata.page_number),
            )),
            Arc::new(UInt64Array::from_iter_values(
                records.iter().map(|r| r.metadata.char_offset),
            )),
            Arc::new(UInt32Array::from_iter_values(
                records.iter().map(|r| r.metadata.chunk_index),
            )),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| &r.metadata.content),
            )),
            Arc::new(UInt32Array::from_iter_values(
                records.iter().map(|r| r.metadata.token_count),
            )),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| &r.metadata.created_at),
            )),
        ];

        RecordBatch::try_new(Self::create_schema(vector_dim), arrays).map_err(|e| {
            RagError::StoreUnavailable(format!("Failed to create record batch: {e}"))
        })
    }

    /// Insert or overwrite records keyed on their id
    #[inline]
    pub async fn upsert(&self, records: Vec<EmbeddingRecord>) -> Result<usize> {
        self.write(records, true).await
    }

    /// Insert only records whose id is not stored yet; returns how many were added
    #[inline]
    pub async fn insert_missing(&self, records: Vec<EmbeddingRecord>) -> Result<usize> {
        self.write(records, false).await
    }

    async fn write(&self, records: Vec<EmbeddingRecord>, overwrite: bool) -> Result<usize> {
        if records.is_empty() {
            debug!("No embeddings to store");
            return Ok(0);
        }

        let records = self.prepare_records(records)?;
        let _guard = self.write_lock.lock().await;

        let table = match self.open_table().await? {
            Some(table) => {
                let existing = Self::table_dimension(&table).await?;
                if existing != self.dimension {
                    return Err(RagError::ConfigMismatch(format!(
                        "Collection '{}' stores {existing}-dimensional vectors, got {}",
                        self.collection, self.dimension
                    )));
                }
                table
            }
            None => {
                info!(
                    "Creating table '{}' with {} dimensions",
                    self.table_name, self.dimension
                );
                self.connection
                    .create_empty_table(&self.table_name, Self::create_schema(self.dimension))
                    .execute()
                    .await
                    .map_err(|e| {
                        RagError::StoreUnavailable(format!("Failed to create table: {e}"))
                    })?
            }
        };

        let before = table
            .count_rows(None)
            .await
            .map_err(|e| RagError::StoreUnavailable(format!("Failed to count rows: {e}")))?;

        let record_batch = self.create_record_batch(&records)?;
        let schema = record_batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(record_batch)), schema);

        let mut merge = table.merge_insert(&["id"]);
        if overwrite {
            merge.when_matched_update_all(None);
        }
        merge.when_not_matched_insert_all();
        merge
            .execute(Box::new(reader))
            .await
            .map_err(|e| RagError::StoreUnavailable(format!("Failed to write embeddings: {e}")))?;

        let after = table
            .count_rows(None)
            .await
            .map_err(|e| RagError::StoreUnavailable(format!("Failed to count rows: {e}")))?;

        let written = if overwrite {
            records.len()
        } else {
            after.saturating_sub(before)
        };

        info!(
            "Stored {} embeddings in '{}' ({} rows total)",
            written, self.table_name, after
        );
        Ok(written)
    }

    /// Check dimensions and collection, and drop duplicate ids keeping the last
    fn prepare_records(&self, records: Vec<EmbeddingRecord>) -> Result<Vec<EmbeddingRecord>> {
        if let Some(wrong) = records.iter().find(|r| r.vector.len() != self.dimension) {
            return Err(RagError::ConfigMismatch(format!(
                "Record {} has {} dimensions, store expects {}",
                wrong.id,
                wrong.vector.len(),
                self.dimension
            )));
        }

        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut unique: Vec<EmbeddingRecord> = Vec::with_capacity(records.len());
        for mut record in records {
            record.collection.clone_from(&self.collection);
            match positions.get(&record.id) {
                Some(&index) => unique[index] = record,
                None => {
                    positions.insert(record.id.clone(), unique.len());
                    unique.push(record);
                }
            }
        }

        Ok(unique)
    }

    /// Search with an embedding only; keyword scoring sees an empty query
    #[inline]
    pub async fn search(
        &self,
        query_embedding: &[f32],
        mode: SearchMode,
        k: usize,
    ) -> Result<Vec<SearchResult>> {
        self.search_text("", query_embedding, mode, k).await
    }

    /// Search the collection, returning at most `k` results best-first
    #[inline]
    pub async fn search_text(
        &self,
        query_text: &str,
        query_embedding: &[f32],
        mode: SearchMode,
        k: usize,
    ) -> Result<Vec<SearchResult>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        debug!(
            "Searching '{}' in {} mode for top {}",
            self.collection, mode, k
        );

        tokio::time::timeout(
            self.settings.timeout,
            self.search_inner(query_text, query_embedding, mode, k),
        )
        .await
        .map_err(|_| {
            RagError::StoreUnavailable(format!(
                "Search timed out after {:?}",
                self.settings.timeout
            ))
        })?
    }

    async fn search_inner(
        &self,
        query_text: &str,
        query_embedding: &[f32],
        mode: SearchMode,
        k: usize,
    ) -> Result<Vec<SearchResult>> {
        let Some(table) = self.open_table().await? else {
            warn!(
                "Collection '{}' has no table yet; load the knowledge base before searching",
                self.collection
            );
            return Ok(Vec::new());
        };

        if mode != SearchMode::Keyword {
            let table_dim = Self::table_dimension(&table).await?;
            if query_embedding.len() != table_dim {
                return Err(RagError::ConfigMismatch(format!(
                    "Query embedding has {} dimensions, collection '{}' stores {table_dim}",
                    query_embedding.len(),
                    self.collection
                )));
            }
        }

        let results = match mode {
            SearchMode::Dense => {
                let rows = self.dense_rows(&table, query_embedding, k).await?;
                let results = rows
                    .into_iter()
                    .map(|row| {
                        let dense =
                            hybrid::dense_score_from_distance(row.distance.unwrap_or(2.0));
                        SearchResult {
                            metadata: row.metadata,
                            score: dense,
                            dense_score: dense,
                            keyword_score: 0.0,
                        }
                    })
                    .collect();
                hybrid::rank(results, k)
            }
            SearchMode::Keyword => {
                let rows = self.scan_rows(&table).await?;
                let index = Bm25Index::new(rows.iter().map(|r| r.metadata.content.as_str()));
                let scores = hybrid::max_normalize(&index.score(query_text));
                let results = rows
                    .into_iter()
                    .zip(scores)
                    .filter(|(_, score)| *score > 0.0)
                    .map(|(row, score)| SearchResult {
                        metadata: row.metadata,
                        score,
                        dense_score: 0.0,
                        keyword_score: score,
                    })
                    .collect();
                hybrid::rank(results, k)
            }
            SearchMode::Hybrid => {
                let limit = k.saturating_mul(self.settings.candidate_multiplier);
                self.hybrid_search(&table, query_text, query_embedding, k, limit)
                    .await?
            }
        };

        debug!("Search returned {} results", results.len());
        Ok(results)
    }

    async fn hybrid_search(
        &self,
        table: &Table,
        query_text: &str,
        query_embedding: &[f32],
        k: usize,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        let dense_rows = self.dense_rows(table, query_embedding, limit).await?;
        let rows = self.scan_rows(table).await?;

        let index = Bm25Index::new(rows.iter().map(|r| r.metadata.content.as_str()));
        let keyword_scores = index.score(query_text);

        let mut keyword_order: Vec<usize> = (0..rows.len())
            .filter(|&i| keyword_scores[i] > 0.0)
            .collect();
        keyword_order.sort_by(|&a, &b| keyword_scores[b].total_cmp(&keyword_scores[a]));
        keyword_order.truncate(limit);

        let row_index: HashMap<&str, usize> = rows
            .iter()
            .enumerate()
            .map(|(i, row)| (row.id.as_str(), i))
            .collect();

        let mut seen: HashSet<String> = HashSet::new();
        let mut candidates = Vec::new();

        for row in dense_rows {
            if !seen.insert(row.id.clone()) {
                continue;
            }
            let keyword_score = row_index
                .get(row.id.as_str())
                .map_or(0.0, |&i| keyword_scores[i]);
            candidates.push(Candidate {
                dense_score: hybrid::dense_score_from_distance(row.distance.unwrap_or(2.0)),
                keyword_score,
                metadata: row.metadata,
            });
        }

        for i in keyword_order {
            let row = &rows[i];
            if !seen.insert(row.id.clone()) {
                continue;
            }
            let dense_score = row.vector.as_deref().map_or(0.0, |vector| {
                hybrid::dense_score_from_vectors(query_embedding, vector)
            });
            candidates.push(Candidate {
                metadata: row.metadata.clone(),
                dense_score,
                keyword_score: keyword_scores[i],
            });
        }

        debug!("Fusing {} hybrid candidates", candidates.len());
        Ok(hybrid::fuse(
            candidates,
            self.settings.dense_weight,
            self.settings.keyword_weight,
            k,
        ))
    }

    /// Nearest rows by cosine distance
    async fn dense_rows(
        &self,
        table: &Table,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<StoredRow>> {
        let results = table
            .vector_search(query_embedding)
            .map_err(|e| {
                RagError::StoreUnavailable(format!("Failed to create vector search: {e}"))
            })?
            .column("vector")
            .distance_type(DistanceType::Cosine)
            .limit(limit)
            .only_if(self.collection_filter())
            .execute()
            .await
            .map_err(|e| RagError::StoreUnavailable(format!("Failed to execute search: {e}")))?;

        self.collect_rows(results).await
    }

    /// Every row of this collection, with vectors
    async fn scan_rows(&self, table: &Table) -> Result<Vec<StoredRow>> {
        let total = table
            .count_rows(Some(self.collection_filter()))
            .await
            .map_err(|e| RagError::StoreUnavailable(format!("Failed to count rows: {e}")))?;
        if total == 0 {
            return Ok(Vec::new());
        }

        let results = table
            .query()
            .only_if(self.collection_filter())
            .limit(total)
            .execute()
            .await
            .map_err(|e| RagError::StoreUnavailable(format!("Failed to scan table: {e}")))?;

        self.collect_rows(results).await
    }

    /// Parse results from a LanceDB stream, skipping rows of other collections
    async fn collect_rows(
        &self,
        mut results: lancedb::arrow::SendableRecordBatchStream,
    ) -> Result<Vec<StoredRow>> {
        let mut rows = Vec::new();

        while let Some(batch) = results
            .try_next()
            .await
            .map_err(|e| RagError::StoreUnavailable(format!("Failed to read result stream: {e}")))?
        {
            rows.extend(
                parse_batch(&batch)?
                    .into_iter()
                    .filter(|(collection, _)| *collection == self.collection)
                    .map(|(_, row)| row),
            );
        }

        debug!("Parsed {} rows from stream", rows.len());
        Ok(rows)
    }

    /// Number of records in this collection
    #[inline]
    pub async fn count(&self) -> Result<usize> {
        match self.open_table().await? {
            Some(table) => table
                .count_rows(Some(self.collection_filter()))
                .await
                .map_err(|e| RagError::StoreUnavailable(format!("Failed to count rows: {e}"))),
            None => Ok(0),
        }
    }

    /// Drop the collection's table if it exists
    #[inline]
    pub async fn drop_collection(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        if self.table_exists().await? {
            info!("Dropping table '{}'", self.table_name);
            self.connection
                .drop_table(&self.table_name)
                .await
                .map_err(|e| RagError::StoreUnavailable(format!("Failed to drop table: {e}")))?;
        }

        Ok(())
    }

    #[inline]
    pub async fn collection_info(&self) -> Result<CollectionInfo> {
        let (exists, dimension) = match self.open_table().await? {
            Some(table) => (true, Some(Self::table_dimension(&table).await?)),
            None => (false, None),
        };

        Ok(CollectionInfo {
            collection: self.collection.clone(),
            table_name: self.table_name.clone(),
            exists,
            rows: self.count().await?,
            dimension,
        })
    }
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .ok_or_else(|| RagError::StoreUnavailable(format!("Missing {name} column")))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| RagError::StoreUnavailable(format!("Invalid {name} column type")))
}

fn u32_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a UInt32Array> {
    batch
        .column_by_name(name)
        .ok_or_else(|| RagError::StoreUnavailable(format!("Missing {name} column")))?
        .as_any()
        .downcast_ref::<UInt32Array>()
        .ok_or_else(|| RagError::StoreUnavailable(format!("Invalid {name} column type")))
}

/// Parse a record batch into `(collection, row)` pairs
fn parse_batch(batch: &RecordBatch) -> Result<Vec<(String, StoredRow)>> {
    let ids = string_column(batch, "id")?;
    let collections = string_column(batch, "collection")?;
    let source_uris = string_column(batch, "source_uri")?;
    let document_names = string_column(batch, "document_name")?;
    let page_numbers = u32_column(batch, "page_number")?;
    let char_offsets = batch
        .column_by_name("char_offset")
        .ok_or_else(|| RagError::StoreUnavailable("Missing char_offset column".to_string()))?
        .as_any()
        .downcast_ref::<UInt64Array>()
        .ok_or_else(|| RagError::StoreUnavailable("Invalid char_offset column type".to_string()))?;
    let chunk_indices = u32_column(batch, "chunk_index")?;
    let contents = string_column(batch, "content")?;
    let token_counts = u32_column(batch, "token_count")?;
    let created_ats = string_column(batch, "created_at")?;

    // Only present in vector search results
    let distances = batch
        .column_by_name("_distance")
        .and_then(|col| col.as_any().downcast_ref::<Float32Array>());
    let vectors = batch
        .column_by_name("vector")
        .and_then(|col| col.as_any().downcast_ref::<FixedSizeListArray>());

    let mut rows = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let metadata = ChunkMetadata {
            source_uri: source_uris.value(row).to_string(),
            document_name: document_names.value(row).to_string(),
            page_number: page_numbers.value(row),
            char_offset: char_offsets.value(row),
            chunk_index: chunk_indices.value(row),
            content: contents.value(row).to_string(),
            token_count: token_counts.value(row),
            created_at: created_ats.value(row).to_string(),
        };

        let distance = distances.and_then(|d| (!d.is_null(row)).then(|| d.value(row)));
        let vector = vectors.and_then(|v| {
            v.value(row)
                .as_any()
                .downcast_ref::<Float32Array>()
                .map(|values| values.values().to_vec())
        });

        rows.push((
            collections.value(row).to_string(),
            StoredRow {
                id: ids.value(row).to_string(),
                metadata,
                vector,
                distance,
            },
        ));
    }

    Ok(rows)
}
