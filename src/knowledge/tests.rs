use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tempfile::TempDir;

use super::*;
use crate::database::lancedb::SearchSettings;
use crate::database::lancedb::hybrid::tokenize;

const DIM: usize = 8;

/// Bag-of-words hashing embedder; identical texts get identical vectors
struct HashEmbedder {
    dimension: usize,
    calls: AtomicUsize,
}

impl HashEmbedder {
    fn new(dimension: usize) -> Self {
        Self {
            dimension,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_id(&self) -> &str {
        "hash"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = vec![0.01; self.dimension];
                for token in tokenize(text) {
                    let bucket = token.bytes().map(usize::from).sum::<usize>() % self.dimension;
                    vector[bucket] += 1.0;
                }
                vector
            })
            .collect())
    }
}

struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    fn model_id(&self) -> &str {
        "failing"
    }

    fn dimension(&self) -> usize {
        DIM
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(RagError::Embedding("model unavailable".to_string()))
    }
}

const TOPICS: [&str; 10] = [
    "Introduction to place branding and destination image.",
    "Literature review of tourist loyalty research.",
    "The methodology uses a structured survey of tourists.",
    "Sampling covered visitors at three heritage sites.",
    "Measurement model reliability and validity checks.",
    "Structural model results and path coefficients.",
    "Importance performance map analysis of the constructs.",
    "Discussion of destination management implications.",
    "Limitations of the cross sectional design.",
    "Conclusion and directions for future research.",
];

fn write_document(dir: &Path, name: &str, pages: &[&str]) -> String {
    let path = dir.join(name);
    std::fs::write(&path, pages.join("\u{c}")).expect("should write document");
    path.to_string_lossy().to_string()
}

async fn knowledge_base(
    temp_dir: &TempDir,
    embedder: Arc<dyn Embedder>,
    sources: Vec<String>,
) -> KnowledgeBase {
    let store = VectorStore::open(
        &temp_dir.path().join("vectors"),
        "Place Branding in Tourist",
        DIM,
        SearchSettings::default(),
    )
    .await
    .expect("should open vector store");

    KnowledgeBase::new(embedder, Arc::new(store))
        .with_sources(sources)
        .with_batch_size(3)
}

#[tokio::test]
async fn load_indexes_every_page() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let source = write_document(temp_dir.path(), "paper.txt", &TOPICS);
    let embedder = Arc::new(HashEmbedder::new(DIM));
    let kb = knowledge_base(&temp_dir, Arc::clone(&embedder) as Arc<dyn Embedder>, vec![source]).await;

    let report = kb
        .load(LoadOptions {
            upsert: true,
            recreate: false,
        })
        .await
        .expect("should load");

    assert_eq!(report.documents, 1);
    assert_eq!(report.pages, 10);
    assert_eq!(report.chunks, 10);
    assert_eq!(report.chunks_indexed, 10);
    assert!(report.empty_sources.is_empty());
    assert_eq!(kb.store().count().await.expect("should count"), 10);
    // ten chunks in batches of three
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn reloading_does_not_duplicate() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let source = write_document(temp_dir.path(), "paper.txt", &TOPICS);
    let kb = knowledge_base(&temp_dir, Arc::new(HashEmbedder::new(DIM)), vec![source]).await;

    let upsert = LoadOptions {
        upsert: true,
        recreate: false,
    };
    kb.load(upsert).await.expect("should load");
    let again = kb.load(upsert).await.expect("should load again");
    assert_eq!(again.chunks_indexed, 10);
    assert_eq!(kb.store().count().await.expect("should count"), 10);

    let skip = kb
        .load(LoadOptions::default())
        .await
        .expect("should load without upsert");
    assert_eq!(skip.chunks_indexed, 0);
    assert_eq!(kb.store().count().await.expect("should count"), 10);
}

#[tokio::test]
async fn recreate_replaces_collection() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let first = write_document(temp_dir.path(), "first.txt", &TOPICS);
    let second = write_document(temp_dir.path(), "second.txt", &TOPICS[..3]);

    let kb = knowledge_base(&temp_dir, Arc::new(HashEmbedder::new(DIM)), vec![first]).await;
    kb.load(LoadOptions::default()).await.expect("should load");

    let kb = KnowledgeBase::new(Arc::new(HashEmbedder::new(DIM)), Arc::clone(kb.store()))
        .with_sources(vec![second]);
    let report = kb
        .load(LoadOptions {
            upsert: false,
            recreate: true,
        })
        .await
        .expect("should reload");

    assert_eq!(report.chunks_indexed, 3);
    assert_eq!(kb.store().count().await.expect("should count"), 3);
}

#[tokio::test]
async fn embedding_failure_writes_nothing() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let source = write_document(temp_dir.path(), "paper.txt", &TOPICS);
    let kb = knowledge_base(&temp_dir, Arc::new(FailingEmbedder), vec![source]).await;

    let result = kb.load(LoadOptions::default()).await;

    assert!(matches!(result, Err(RagError::Embedding(_))));
    assert_eq!(kb.store().count().await.expect("should count"), 0);
}

#[tokio::test]
async fn wrong_embedding_dimension_is_config_mismatch() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let source = write_document(temp_dir.path(), "paper.txt", &TOPICS);
    let kb = knowledge_base(&temp_dir, Arc::new(HashEmbedder::new(DIM * 2)), vec![source]).await;

    let result = kb.load(LoadOptions::default()).await;

    assert!(matches!(result, Err(RagError::ConfigMismatch(_))));
    assert_eq!(kb.store().count().await.expect("should count"), 0);
}

#[tokio::test]
async fn failing_source_aborts_before_writing() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let good = write_document(temp_dir.path(), "paper.txt", &TOPICS);
    let missing = temp_dir.path().join("missing.pdf").to_string_lossy().to_string();
    let kb = knowledge_base(&temp_dir, Arc::new(HashEmbedder::new(DIM)), vec![good, missing]).await;

    let result = kb.load(LoadOptions::default()).await;

    assert!(matches!(result, Err(RagError::Fetch(_))));
    assert_eq!(kb.store().count().await.expect("should count"), 0);
}

#[tokio::test]
async fn document_without_text_yields_no_chunks() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let blank = write_document(temp_dir.path(), "blank.txt", &["  ", "\n\n"]);
    let kb = knowledge_base(&temp_dir, Arc::new(HashEmbedder::new(DIM)), vec![blank.clone()]).await;

    let report = kb.load(LoadOptions::default()).await.expect("should load");

    assert_eq!(report.documents, 1);
    assert_eq!(report.chunks, 0);
    assert_eq!(report.chunks_indexed, 0);
    assert_eq!(report.empty_sources, vec![blank]);
}

#[tokio::test]
async fn search_finds_relevant_page() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let source = write_document(temp_dir.path(), "paper.txt", &TOPICS);
    let kb = knowledge_base(&temp_dir, Arc::new(HashEmbedder::new(DIM)), vec![source])
        .await
        .with_num_documents(3);
    kb.load(LoadOptions::default()).await.expect("should load");

    let keyword = kb
        .search("methodology survey", Some(SearchMode::Keyword), None)
        .await
        .expect("should search");
    assert_eq!(keyword[0].metadata.page_number, 3);

    let hybrid = kb
        .search(TOPICS[6], None, Some(2))
        .await
        .expect("should search");
    assert_eq!(hybrid.len(), 2);
    assert_eq!(hybrid[0].metadata.page_number, 7);
    assert_eq!(hybrid[0].metadata.content, TOPICS[6]);
}

#[tokio::test]
async fn search_before_load_is_empty() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let kb = knowledge_base(&temp_dir, Arc::new(HashEmbedder::new(DIM)), Vec::new()).await;

    let results = kb.search("anything", None, None).await.expect("should search");
    assert!(results.is_empty());

    let info = kb.status().await.expect("should get status");
    assert!(!info.exists);
}
