//! End-to-end ingest/retrieve tests over synthetic documents.
//!
//! The fixture "document format" is one `R G B` line per page; the
//! rasterizer renders each line as a solid-color page and the embedder
//! maps colors and color words onto unit vectors, so relevance is fully
//! predictable.

use std::sync::atomic::{AtomicUsize, Ordering};

use colpage::{
    CancelToken,
    DocumentId,
    DocumentRegistry,
    Embedder,
    IndexConfig,
    Ingestor,
    PageImage,
    PatchStore,
    Rasterizer,
    RetrievalEngine,
    error::{Error, Result},
    ingest::IngestOptions,
};

const DIM: usize = 8;
const PATCHES_PER_PAGE: usize = 4;

/// Renders one solid 4x4 page per `R G B` line.
struct LineRasterizer;

impl Rasterizer for LineRasterizer {
    fn rasterize(
        &self,
        document: &[u8],
        _dpi: u32,
    ) -> Result<Vec<(u32, PageImage)>> {
        let text = std::str::from_utf8(document).map_err(|_| {
            Error::InvalidDocument("document is not UTF-8".into())
        })?;

        let mut pages = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let channels: Vec<u8> = line
                .split_whitespace()
                .map(|part| part.parse())
                .collect::<std::result::Result<_, _>>()
                .map_err(|_| {
                    Error::InvalidDocument(format!(
                        "malformed page line: {line:?}"
                    ))
                })?;
            let &[r, g, b] = channels.as_slice() else {
                return Err(Error::InvalidDocument(format!(
                    "expected three channels, got {}",
                    channels.len()
                )));
            };
            pages.push((i as u32 + 1, PageImage::solid(4, 4, [r, g, b])));
        }

        if pages.is_empty() {
            return Err(Error::InvalidDocument("document has no pages".into()));
        }
        Ok(pages)
    }
}

/// Embeds pages by their dominant color and queries by color words.
struct ColorEmbedder {
    fail_on_page_call: Option<usize>,
    page_calls: AtomicUsize,
}

impl ColorEmbedder {
    fn new() -> Self {
        Self {
            fail_on_page_call: None,
            page_calls: AtomicUsize::new(0),
        }
    }

    fn failing_on(call: usize) -> Self {
        Self {
            fail_on_page_call: Some(call),
            page_calls: AtomicUsize::new(0),
        }
    }
}

fn color_vector(rgb: [u8; 3]) -> Vec<f32> {
    let mut v = vec![0.0f32; DIM];
    let norm = rgb
        .iter()
        .map(|&c| (c as f32 / 255.0).powi(2))
        .sum::<f32>()
        .sqrt()
        .max(1e-6);
    for (slot, &channel) in v.iter_mut().zip(rgb.iter()) {
        *slot = channel as f32 / 255.0 / norm;
    }
    v
}

impl Embedder for ColorEmbedder {
    fn dimension(&self) -> usize {
        DIM
    }

    fn embed_pages(&self, pages: &[PageImage]) -> Result<Vec<Vec<Vec<f32>>>> {
        let call = self.page_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_page_call == Some(call) {
            return Err(Error::EmbeddingUnavailable("model crashed".into()));
        }

        Ok(pages
            .iter()
            .map(|page| {
                let rgb = [page.pixels[0], page.pixels[1], page.pixels[2]];
                vec![color_vector(rgb); PATCHES_PER_PAGE]
            })
            .collect())
    }

    fn embed_query(&self, query: &str) -> Result<Vec<Vec<f32>>> {
        let vectors: Vec<Vec<f32>> = query
            .split_whitespace()
            .filter_map(|word| match word {
                "red" => Some(color_vector([255, 0, 0])),
                "green" => Some(color_vector([0, 255, 0])),
                "blue" => Some(color_vector([0, 0, 255])),
                _ => None,
            })
            .collect();
        Ok(vectors)
    }
}

fn test_store() -> (tempfile::TempDir, PatchStore) {
    let tmp = tempfile::tempdir().unwrap();
    let config = IndexConfig {
        dim: DIM,
        max_patches_per_page: 64,
        candidate_k: 100,
    };
    let store =
        PatchStore::open(&tmp.path().join("patches.redb"), config).unwrap();
    (tmp, store)
}

/// Three pages: red, blue, red.
const BLUE_SANDWICH: &[u8] = b"255 0 0\n0 0 255\n255 0 0\n";

#[test]
fn blue_page_ranks_first_for_blue_query() {
    let (_tmp, store) = test_store();
    let embedder = ColorEmbedder::new();
    let ingestor = Ingestor::new(&store, &embedder, &LineRasterizer);

    let report = ingestor
        .ingest(BLUE_SANDWICH, &IngestOptions::default(), &CancelToken::new())
        .unwrap();
    assert_eq!(report.pages_indexed, 3);
    assert_eq!(report.patches_stored, 3 * PATCHES_PER_PAGE);

    let engine = RetrievalEngine::new(&store, &embedder);
    let ranked = engine
        .retrieve("blue", 10, None, &CancelToken::new())
        .unwrap();

    assert_eq!(ranked[0].page_number, 2);
    assert!((ranked[0].score - 1.0).abs() < 1e-5);
    for other in &ranked[1..] {
        assert!(
            ranked[0].score > other.score,
            "page 2 must strictly outrank page {}",
            other.page_number
        );
    }
}

#[test]
fn round_trip_returns_matching_page_with_positive_score() {
    let (_tmp, store) = test_store();
    let embedder = ColorEmbedder::new();
    let ingestor = Ingestor::new(&store, &embedder, &LineRasterizer);

    let report = ingestor
        .ingest(BLUE_SANDWICH, &IngestOptions::default(), &CancelToken::new())
        .unwrap();

    let engine = RetrievalEngine::new(&store, &embedder);
    let ranked = engine
        .retrieve("red", 10, None, &CancelToken::new())
        .unwrap();

    assert!(!ranked.is_empty());
    assert_eq!(ranked[0].doc_id, report.doc_id.as_str());
    assert!(ranked[0].score > 0.0);
    // Both red pages outrank the blue one; ties order by page number.
    assert_eq!(ranked[0].page_number, 1);
    assert_eq!(ranked[1].page_number, 3);
}

#[test]
fn multi_aspect_query_prefers_the_covering_document() {
    let (_tmp, store) = test_store();
    let embedder = ColorEmbedder::new();
    let ingestor = Ingestor::new(&store, &embedder, &LineRasterizer);

    // One document per color plus a two-page document covering both.
    let options = |name: &str| IngestOptions {
        doc_id: Some(DocumentId::new(name).unwrap()),
        ..Default::default()
    };
    ingestor
        .ingest(b"255 0 0\n", &options("only-red"), &CancelToken::new())
        .unwrap();
    ingestor
        .ingest(b"0 0 255\n", &options("only-blue"), &CancelToken::new())
        .unwrap();

    let engine = RetrievalEngine::new(&store, &embedder);
    let ranked = engine
        .retrieve("red blue", 10, None, &CancelToken::new())
        .unwrap();

    // Each single-color page matches exactly one query aspect; both score
    // 1.0 and neither collapses onto the other's key.
    assert_eq!(ranked.len(), 2);
    assert!((ranked[0].score - 1.0).abs() < 1e-5);
    assert!((ranked[1].score - 1.0).abs() < 1e-5);
    assert_ne!(ranked[0].doc_id, ranked[1].doc_id);
}

#[test]
fn failed_ingest_leaves_no_patches_behind() {
    let (_tmp, store) = test_store();
    // First page embeds, second page fails.
    let embedder = ColorEmbedder::failing_on(1);
    let ingestor = Ingestor::new(&store, &embedder, &LineRasterizer);

    let doc_id = DocumentId::from_content(BLUE_SANDWICH);
    let result = ingestor.ingest(
        BLUE_SANDWICH,
        &IngestOptions::default(),
        &CancelToken::new(),
    );

    assert!(matches!(result, Err(Error::EmbeddingUnavailable(_))));
    assert_eq!(store.count_patches(doc_id.as_str()).unwrap(), 0);
}

#[test]
fn unparseable_document_is_invalid_and_stores_nothing() {
    let (_tmp, store) = test_store();
    let embedder = ColorEmbedder::new();
    let ingestor = Ingestor::new(&store, &embedder, &LineRasterizer);

    let result = ingestor.ingest(
        b"not a color line",
        &IngestOptions::default(),
        &CancelToken::new(),
    );

    assert!(matches!(result, Err(Error::InvalidDocument(_))));
    assert_eq!(store.stats().unwrap().patches, 0);
}

#[test]
fn retrieval_is_deterministic() {
    let (_tmp, store) = test_store();
    let embedder = ColorEmbedder::new();
    let ingestor = Ingestor::new(&store, &embedder, &LineRasterizer);
    ingestor
        .ingest(BLUE_SANDWICH, &IngestOptions::default(), &CancelToken::new())
        .unwrap();

    let engine = RetrievalEngine::new(&store, &embedder);
    let first = engine
        .retrieve("red blue", 10, None, &CancelToken::new())
        .unwrap();
    let second = engine
        .retrieve("red blue", 10, None, &CancelToken::new())
        .unwrap();

    assert_eq!(first, second);
}

#[test]
fn query_with_no_known_words_returns_empty() {
    let (_tmp, store) = test_store();
    let embedder = ColorEmbedder::new();
    let ingestor = Ingestor::new(&store, &embedder, &LineRasterizer);
    ingestor
        .ingest(BLUE_SANDWICH, &IngestOptions::default(), &CancelToken::new())
        .unwrap();

    let engine = RetrievalEngine::new(&store, &embedder);
    let ranked = engine
        .retrieve("quarterly revenue", 10, None, &CancelToken::new())
        .unwrap();
    assert!(ranked.is_empty());
}

#[test]
fn delete_is_idempotent_through_the_full_flow() {
    let (tmp, store) = test_store();
    let embedder = ColorEmbedder::new();
    let ingestor = Ingestor::new(&store, &embedder, &LineRasterizer);
    let registry = DocumentRegistry::open(
        &tmp.path().join("registry.redb"),
        &tmp.path().join("documents"),
    )
    .unwrap();

    let report = ingestor
        .ingest(BLUE_SANDWICH, &IngestOptions::default(), &CancelToken::new())
        .unwrap();
    registry
        .register("sandwich", "sandwich.txt", BLUE_SANDWICH, 3)
        .unwrap();

    // Delete by resolving the name, as the CLI does.
    let info = registry.resolve("sandwich").unwrap();
    assert_eq!(info.doc_id, report.doc_id);
    let deleted = store.delete_document(info.doc_id.as_str()).unwrap();
    assert_eq!(deleted, 3 * PATCHES_PER_PAGE);
    registry.remove("sandwich").unwrap();

    // A second delete of the same id removes nothing and does not error.
    assert_eq!(store.delete_document(info.doc_id.as_str()).unwrap(), 0);

    let engine = RetrievalEngine::new(&store, &embedder);
    let ranked = engine
        .retrieve("blue", 10, None, &CancelToken::new())
        .unwrap();
    assert!(ranked.is_empty());
}

#[test]
fn document_filter_scopes_retrieval() {
    let (_tmp, store) = test_store();
    let embedder = ColorEmbedder::new();
    let ingestor = Ingestor::new(&store, &embedder, &LineRasterizer);

    let red_doc = ingestor
        .ingest(b"255 0 0\n", &IngestOptions::default(), &CancelToken::new())
        .unwrap();
    ingestor
        .ingest(b"255 0 0\n0 0 255\n", &IngestOptions::default(), &CancelToken::new())
        .unwrap();

    let engine = RetrievalEngine::new(&store, &embedder);
    let ranked = engine
        .retrieve(
            "red",
            10,
            Some(red_doc.doc_id.as_str()),
            &CancelToken::new(),
        )
        .unwrap();

    assert!(!ranked.is_empty());
    assert!(ranked.iter().all(|r| r.doc_id == red_doc.doc_id.as_str()));
}
