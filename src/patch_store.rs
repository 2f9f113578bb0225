use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    path::Path,
};

use redb::{
    Database,
    MultimapTableDefinition,
    ReadableDatabase,
    ReadableMultimapTable,
    ReadableTable,
    ReadableTableMetadata,
    TableDefinition,
};
use tracing::{debug, warn};

use crate::{
    config::IndexConfig,
    doc_id::DocumentId,
    error::{Error, Result},
};

/// Patch rows keyed by a monotonically increasing internal id. The id
/// doubles as the insertion-order tie breaker during search.
const PATCHES: TableDefinition<u64, &[u8]> = TableDefinition::new("patches");

/// Secondary index: document id -> internal patch ids, for filtered search
/// and whole-document deletes.
const DOC_PATCHES: MultimapTableDefinition<&str, u64> =
    MultimapTableDefinition::new("doc_patches");

const STORE_META: TableDefinition<&str, u64> = TableDefinition::new("store_meta");

const NEXT_PATCH_ID: &str = "next_patch_id";
const DIMENSION: &str = "dimension";

/// Fixed-size prefix of a patch row: doc-id length (u16), page number
/// (u32), patch index (u32).
const ROW_HEADER_SIZE: usize = 2 + 4 + 4;

/// Persistent store of per-patch embedding rows with exact inner-product
/// top-K search.
///
/// Row format (little-endian):
/// - 2 bytes: document id length L (u16)
/// - L bytes: document id (UTF-8)
/// - 4 bytes: page number (u32, 1-based)
/// - 4 bytes: patch index (u32, 0-based)
/// - D * 4 bytes: f32 vector
///
/// A page's rows are written in one transaction, so readers observe a page
/// fully inserted or not at all.
pub struct PatchStore {
    db: Database,
    config: IndexConfig,
}

/// Outcome of a page insert. `truncated` is nonzero when the page exceeded
/// the per-page patch cap and excess patches were dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertReceipt {
    pub stored: usize,
    pub truncated: usize,
}

/// One nearest-neighbor match. The internal patch identity is deliberately
/// not exposed; hits are page-level evidence for aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchHit {
    pub doc_id: String,
    pub page_number: u32,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub patches: u64,
    pub documents: u64,
}

impl PatchStore {
    /// Open or create a patch store at the given path.
    ///
    /// Provisioning is idempotent: tables are created when missing and the
    /// vector dimension is recorded on first open. Re-opening with a
    /// different configured dimension is a permanent error.
    pub fn open(path: &Path, config: IndexConfig) -> Result<Self> {
        config.validate()?;

        let db = Database::create(path).map_err(|e| {
            Error::StoreUnavailable(format!(
                "cannot open patch store at {}: {e}",
                path.display()
            ))
        })?;

        let store = Self { db, config };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Idempotently provision tables and the recorded dimension.
    ///
    /// Safe to call repeatedly and from concurrent handles; a second call
    /// against an existing schema is a no-op.
    pub fn ensure_schema(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            txn.open_table(PATCHES)?;
            txn.open_multimap_table(DOC_PATCHES)?;
            let mut meta = txn.open_table(STORE_META)?;

            let recorded = meta.get(DIMENSION)?.map(|g| g.value());
            match recorded {
                None => {
                    meta.insert(DIMENSION, self.config.dim as u64)?;
                }
                Some(dim) if dim == self.config.dim as u64 => {}
                Some(dim) => {
                    return Err(Error::InvalidArgument(format!(
                        "store was created with dimension {dim}, configured {}",
                        self.config.dim
                    )));
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Write one page's patch vectors as a single atomic batch.
    ///
    /// Every vector must have the configured dimension; a mismatch fails
    /// with `InvalidArgument` and stores nothing. Vectors beyond the
    /// per-page cap are dropped (first-by-index kept) and reported in the
    /// receipt.
    pub fn insert_page(
        &self,
        doc_id: &DocumentId,
        page_number: u32,
        vectors: &[Vec<f32>],
    ) -> Result<InsertReceipt> {
        if page_number == 0 {
            return Err(Error::InvalidArgument(
                "page numbers are 1-based".into(),
            ));
        }
        if vectors.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "page {page_number} of {doc_id} produced no patch vectors"
            )));
        }
        for (index, vector) in vectors.iter().enumerate() {
            if vector.len() != self.config.dim {
                return Err(Error::InvalidArgument(format!(
                    "patch {index} has dimension {}, expected {}",
                    vector.len(),
                    self.config.dim
                )));
            }
        }

        let cap = self.config.max_patches_per_page;
        let truncated = vectors.len().saturating_sub(cap);
        if truncated > 0 {
            warn!(
                doc = %doc_id,
                page = page_number,
                patches = vectors.len(),
                cap,
                "truncating page to patch cap"
            );
        }
        let kept = &vectors[..vectors.len().min(cap)];

        let txn = self.db.begin_write()?;
        {
            let mut meta = txn.open_table(STORE_META)?;
            let base = meta.get(NEXT_PATCH_ID)?.map(|g| g.value()).unwrap_or(0);

            let mut patches = txn.open_table(PATCHES)?;
            let mut doc_index = txn.open_multimap_table(DOC_PATCHES)?;

            for (index, vector) in kept.iter().enumerate() {
                let patch_id = base + index as u64;
                let row = encode_row(
                    doc_id.as_str(),
                    page_number,
                    index as u32,
                    vector,
                );
                patches.insert(patch_id, row.as_slice())?;
                doc_index.insert(doc_id.as_str(), patch_id)?;
            }

            meta.insert(NEXT_PATCH_ID, base + kept.len() as u64)?;
        }
        txn.commit()?;

        debug!(doc = %doc_id, page = page_number, stored = kept.len(), "inserted page");
        Ok(InsertReceipt {
            stored: kept.len(),
            truncated,
        })
    }

    /// Exact inner-product top-K over stored patches.
    ///
    /// Ties are broken by insertion order (earlier patch wins), so results
    /// are deterministic for identical inputs.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        doc_filter: Option<&str>,
    ) -> Result<Vec<PatchHit>> {
        if query.len() != self.config.dim {
            return Err(Error::InvalidArgument(format!(
                "query vector has dimension {}, expected {}",
                query.len(),
                self.config.dim
            )));
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let txn = self.db.begin_read()?;
        let patches = txn.open_table(PATCHES)?;

        let mut heap: BinaryHeap<Reverse<Candidate>> =
            BinaryHeap::with_capacity(top_k + 1);

        let mut consider = |patch_id: u64, row: &[u8]| -> Result<()> {
            let (doc_id, page_number, _, vector_bytes) = decode_row(row)?;
            let score = dot_bytes(query, vector_bytes);
            if !score.is_finite() {
                return Ok(());
            }

            let beats_worst = heap
                .peek()
                .is_none_or(|Reverse(worst)| worse_than(worst, score, patch_id));
            if heap.len() < top_k {
                heap.push(Reverse(Candidate {
                    score,
                    patch_id,
                    doc_id: doc_id.to_string(),
                    page_number,
                }));
            } else if beats_worst {
                heap.push(Reverse(Candidate {
                    score,
                    patch_id,
                    doc_id: doc_id.to_string(),
                    page_number,
                }));
                heap.pop();
            }
            Ok(())
        };

        match doc_filter {
            Some(doc_id) => {
                let doc_index = txn.open_multimap_table(DOC_PATCHES)?;
                for patch_id in doc_index.get(doc_id)? {
                    let patch_id = patch_id?.value();
                    if let Some(row) = patches.get(patch_id)? {
                        consider(patch_id, row.value())?;
                    }
                }
            }
            None => {
                for entry in patches.iter()? {
                    let (key, row) = entry?;
                    consider(key.value(), row.value())?;
                }
            }
        }

        let mut candidates: Vec<Candidate> =
            heap.into_iter().map(|Reverse(c)| c).collect();
        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.patch_id.cmp(&b.patch_id))
        });

        Ok(candidates
            .into_iter()
            .map(|c| PatchHit {
                doc_id: c.doc_id,
                page_number: c.page_number,
                score: c.score,
            })
            .collect())
    }

    /// Remove every patch belonging to a document.
    ///
    /// Returns the number of patches removed; deleting a document with no
    /// patches returns 0 and is not an error.
    pub fn delete_document(&self, doc_id: &str) -> Result<usize> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut doc_index = txn.open_multimap_table(DOC_PATCHES)?;
            let mut patches = txn.open_table(PATCHES)?;

            let mut ids = Vec::new();
            for patch_id in doc_index.remove_all(doc_id)? {
                ids.push(patch_id?.value());
            }

            let mut removed = 0usize;
            for patch_id in ids {
                if patches.remove(patch_id)?.is_some() {
                    removed += 1;
                }
            }
            removed
        };
        txn.commit()?;

        debug!(doc = doc_id, removed, "deleted document patches");
        Ok(removed)
    }

    /// Number of patches stored for a document.
    pub fn count_patches(&self, doc_id: &str) -> Result<usize> {
        let txn = self.db.begin_read()?;
        let doc_index = txn.open_multimap_table(DOC_PATCHES)?;
        let mut count = 0usize;
        for entry in doc_index.get(doc_id)? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let txn = self.db.begin_read()?;
        let patches = txn.open_table(PATCHES)?;
        let doc_index = txn.open_multimap_table(DOC_PATCHES)?;

        let mut documents = 0u64;
        for entry in doc_index.iter()? {
            let (_key, _values) = entry?;
            documents += 1;
        }

        Ok(StoreStats {
            patches: patches.len()?,
            documents,
        })
    }
}

impl std::fmt::Debug for PatchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct Candidate {
    score: f32,
    patch_id: u64,
    doc_id: String,
    page_number: u32,
}

/// Ordering for the top-K heap: lower score is "less"; on equal scores the
/// later insertion is "less", so earlier patches survive eviction.
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then(other.patch_id.cmp(&self.patch_id))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

fn worse_than(worst: &Candidate, score: f32, patch_id: u64) -> bool {
    match worst.score.total_cmp(&score) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => patch_id < worst.patch_id,
    }
}

fn encode_row(
    doc_id: &str,
    page_number: u32,
    patch_index: u32,
    vector: &[f32],
) -> Vec<u8> {
    let mut row = Vec::with_capacity(
        ROW_HEADER_SIZE + doc_id.len() + vector.len() * 4,
    );
    row.extend_from_slice(&(doc_id.len() as u16).to_le_bytes());
    row.extend_from_slice(doc_id.as_bytes());
    row.extend_from_slice(&page_number.to_le_bytes());
    row.extend_from_slice(&patch_index.to_le_bytes());
    row.extend_from_slice(bytemuck::cast_slice(vector));
    row
}

/// Split a row into (doc id, page number, patch index, raw vector bytes).
///
/// The vector stays as bytes so scans can score without allocating; use
/// [`decode_vector`] when the floats themselves are needed.
fn decode_row(row: &[u8]) -> Result<(&str, u32, u32, &[u8])> {
    let corrupt = || Error::StoreUnavailable("corrupt patch row".into());

    let doc_len =
        u16::from_le_bytes(row.get(0..2).ok_or_else(corrupt)?.try_into().unwrap())
            as usize;
    let doc_end = 2 + doc_len;
    let doc_id = std::str::from_utf8(row.get(2..doc_end).ok_or_else(corrupt)?)
        .map_err(|_| corrupt())?;

    let page_number = u32::from_le_bytes(
        row.get(doc_end..doc_end + 4)
            .ok_or_else(corrupt)?
            .try_into()
            .unwrap(),
    );
    let patch_index = u32::from_le_bytes(
        row.get(doc_end + 4..doc_end + 8)
            .ok_or_else(corrupt)?
            .try_into()
            .unwrap(),
    );

    let vector_bytes = row.get(doc_end + 8..).ok_or_else(corrupt)?;
    if vector_bytes.len() % 4 != 0 {
        return Err(corrupt());
    }

    Ok((doc_id, page_number, patch_index, vector_bytes))
}

#[cfg(test)]
fn decode_vector(vector_bytes: &[u8]) -> Vec<f32> {
    vector_bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
        .collect()
}

/// Inner product of a query against an unaligned little-endian f32 buffer.
fn dot_bytes(query: &[f32], vector_bytes: &[u8]) -> f32 {
    query
        .iter()
        .zip(vector_bytes.chunks_exact(4))
        .map(|(q, chunk)| q * f32::from_le_bytes(chunk.try_into().unwrap()))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> IndexConfig {
        IndexConfig {
            dim: 4,
            max_patches_per_page: 8,
            candidate_k: 100,
        }
    }

    fn test_store(config: IndexConfig) -> (tempfile::TempDir, PatchStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store =
            PatchStore::open(&tmp.path().join("patches.redb"), config).unwrap();
        (tmp, store)
    }

    fn doc(name: &str) -> DocumentId {
        DocumentId::new(name).unwrap()
    }

    fn unit(axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; 4];
        v[axis] = 1.0;
        v
    }

    #[test]
    fn row_round_trip() {
        let row = encode_row("doc-a", 3, 7, &[1.0, -2.5, 0.0, 4.25]);
        let (doc_id, page, index, vector_bytes) = decode_row(&row).unwrap();
        assert_eq!(doc_id, "doc-a");
        assert_eq!(page, 3);
        assert_eq!(index, 7);
        assert_eq!(decode_vector(vector_bytes), vec![1.0, -2.5, 0.0, 4.25]);
    }

    #[test]
    fn decode_rejects_truncated_rows() {
        let row = encode_row("doc", 1, 0, &[1.0]);
        assert!(decode_row(&row[..row.len() - 2]).is_err());
        assert!(decode_row(&[0xff]).is_err());
    }

    #[test]
    fn insert_and_search() {
        let (_tmp, store) = test_store(small_config());

        store
            .insert_page(&doc("a"), 1, &[unit(0), unit(1)])
            .unwrap();

        let hits = store.search(&unit(0), 10, None).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].doc_id, "a");
        assert_eq!(hits[0].page_number, 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn insert_receipt_counts() {
        let (_tmp, store) = test_store(small_config());

        let receipt = store
            .insert_page(&doc("a"), 1, &[unit(0), unit(1), unit(2)])
            .unwrap();
        assert_eq!(receipt.stored, 3);
        assert_eq!(receipt.truncated, 0);
        assert_eq!(store.count_patches("a").unwrap(), 3);
    }

    #[test]
    fn cap_truncates_and_keeps_first_by_index() {
        let config = IndexConfig {
            max_patches_per_page: 2,
            ..small_config()
        };
        let (_tmp, store) = test_store(config);

        let receipt = store
            .insert_page(&doc("a"), 1, &[unit(0), unit(1), unit(2), unit(3)])
            .unwrap();
        assert_eq!(receipt.stored, 2);
        assert_eq!(receipt.truncated, 2);
        assert_eq!(store.count_patches("a").unwrap(), 2);

        // The dropped patches must not be findable.
        let hits = store.search(&unit(2), 10, None).unwrap();
        assert!(hits.iter().all(|h| h.score < 0.5));
        let hits = store.search(&unit(0), 10, None).unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cap_boundary_exact_fit_is_untouched() {
        let config = IndexConfig {
            max_patches_per_page: 2,
            ..small_config()
        };
        let (_tmp, store) = test_store(config);

        let receipt =
            store.insert_page(&doc("a"), 1, &[unit(0), unit(1)]).unwrap();
        assert_eq!(receipt.stored, 2);
        assert_eq!(receipt.truncated, 0);
    }

    #[test]
    fn cap_of_one_keeps_global_token() {
        let config = IndexConfig {
            max_patches_per_page: 1,
            ..small_config()
        };
        let (_tmp, store) = test_store(config);

        let receipt =
            store.insert_page(&doc("a"), 1, &[unit(3), unit(0)]).unwrap();
        assert_eq!(receipt, InsertReceipt {
            stored: 1,
            truncated: 1
        });

        let hits = store.search(&unit(3), 1, None).unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn dimension_mismatch_stores_nothing() {
        let (_tmp, store) = test_store(small_config());

        let result =
            store.insert_page(&doc("a"), 1, &[unit(0), vec![1.0, 2.0]]);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert_eq!(store.count_patches("a").unwrap(), 0);
    }

    #[test]
    fn zero_page_number_rejected() {
        let (_tmp, store) = test_store(small_config());
        assert!(store.insert_page(&doc("a"), 0, &[unit(0)]).is_err());
    }

    #[test]
    fn empty_page_rejected() {
        let (_tmp, store) = test_store(small_config());
        assert!(store.insert_page(&doc("a"), 1, &[]).is_err());
    }

    #[test]
    fn query_dimension_guard() {
        let (_tmp, store) = test_store(small_config());
        assert!(matches!(
            store.search(&[1.0, 0.0], 5, None),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn zero_top_k_returns_empty() {
        let (_tmp, store) = test_store(small_config());
        store.insert_page(&doc("a"), 1, &[unit(0)]).unwrap();
        assert!(store.search(&unit(0), 0, None).unwrap().is_empty());
    }

    #[test]
    fn doc_filter_restricts_results() {
        let (_tmp, store) = test_store(small_config());
        store.insert_page(&doc("a"), 1, &[unit(0)]).unwrap();
        store.insert_page(&doc("b"), 1, &[unit(0)]).unwrap();

        let hits = store.search(&unit(0), 10, Some("a")).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "a");
    }

    #[test]
    fn filter_on_unknown_doc_is_empty() {
        let (_tmp, store) = test_store(small_config());
        store.insert_page(&doc("a"), 1, &[unit(0)]).unwrap();
        assert!(store.search(&unit(0), 10, Some("ghost")).unwrap().is_empty());
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let (_tmp, store) = test_store(small_config());
        // Identical vectors on different pages: identical scores.
        store.insert_page(&doc("b"), 7, &[unit(0)]).unwrap();
        store.insert_page(&doc("a"), 3, &[unit(0)]).unwrap();

        let hits = store.search(&unit(0), 1, None).unwrap();
        assert_eq!(hits.len(), 1);
        // First inserted wins the tie.
        assert_eq!(hits[0].doc_id, "b");
        assert_eq!(hits[0].page_number, 7);

        let again = store.search(&unit(0), 1, None).unwrap();
        assert_eq!(hits, again);
    }

    #[test]
    fn top_k_limits_results() {
        let (_tmp, store) = test_store(small_config());
        for page in 1..=5 {
            store.insert_page(&doc("a"), page, &[unit(0)]).unwrap();
        }
        assert_eq!(store.search(&unit(0), 3, None).unwrap().len(), 3);
    }

    #[test]
    fn delete_document_removes_all_patches() {
        let (_tmp, store) = test_store(small_config());
        store.insert_page(&doc("a"), 1, &[unit(0), unit(1)]).unwrap();
        store.insert_page(&doc("a"), 2, &[unit(2)]).unwrap();
        store.insert_page(&doc("b"), 1, &[unit(3)]).unwrap();

        assert_eq!(store.delete_document("a").unwrap(), 3);
        assert_eq!(store.count_patches("a").unwrap(), 0);
        assert!(store.search(&unit(0), 10, Some("a")).unwrap().is_empty());
        // Unrelated document untouched.
        assert_eq!(store.count_patches("b").unwrap(), 1);
    }

    #[test]
    fn delete_missing_document_returns_zero() {
        let (_tmp, store) = test_store(small_config());
        assert_eq!(store.delete_document("nonexistent").unwrap(), 0);
    }

    #[test]
    fn ensure_schema_is_idempotent() {
        let (_tmp, store) = test_store(small_config());
        store.ensure_schema().unwrap();
        store.ensure_schema().unwrap();
        store.insert_page(&doc("a"), 1, &[unit(0)]).unwrap();
        assert_eq!(store.count_patches("a").unwrap(), 1);
    }

    #[test]
    fn reopen_preserves_data() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("patches.redb");

        {
            let store = PatchStore::open(&path, small_config()).unwrap();
            store.insert_page(&doc("a"), 1, &[unit(0)]).unwrap();
        }

        let store = PatchStore::open(&path, small_config()).unwrap();
        assert_eq!(store.count_patches("a").unwrap(), 1);
    }

    #[test]
    fn reopen_with_different_dimension_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("patches.redb");

        {
            PatchStore::open(&path, small_config()).unwrap();
        }

        let other = IndexConfig {
            dim: 8,
            ..small_config()
        };
        assert!(matches!(
            PatchStore::open(&path, other),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn stats_count_patches_and_documents() {
        let (_tmp, store) = test_store(small_config());
        store.insert_page(&doc("a"), 1, &[unit(0), unit(1)]).unwrap();
        store.insert_page(&doc("b"), 1, &[unit(2)]).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.patches, 3);
        assert_eq!(stats.documents, 2);
    }
}
