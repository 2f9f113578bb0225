use tracing::{debug, error, info, warn};

use crate::{
    cancel::CancelToken,
    config::DEFAULT_DPI,
    doc_id::DocumentId,
    embedder::Embedder,
    error::{Error, Result},
    patch_store::PatchStore,
    raster::{PageImage, Rasterizer},
};

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Explicit document id, used verbatim. When absent the id is the
    /// content hash of the document bytes. Supplying an id lets callers
    /// alias or version documents; colliding two different files under one
    /// id is then their accepted risk.
    pub doc_id: Option<DocumentId>,
    pub dpi: u32,
    /// Ingest at most this many pages, front of the document first.
    pub max_pages: Option<usize>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            doc_id: None,
            dpi: DEFAULT_DPI,
            max_pages: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub doc_id: DocumentId,
    pub pages_indexed: usize,
    pub patches_stored: usize,
    /// Patches dropped by the per-page cap, summed over pages.
    pub patches_truncated: usize,
}

/// Turns raw document bytes into stored patch rows, all pages or none.
///
/// Pages are rasterized up front, then embedded and inserted strictly one
/// at a time: only a single page's raster and vectors are resident at
/// once, and a failure can only ever leave whole-page sets behind for the
/// compensating delete to remove.
///
/// Re-ingesting identical bytes does not deduplicate: the store accepts
/// duplicate patches under the same id. Callers wanting replace semantics
/// must delete the document first.
pub struct Ingestor<'a> {
    store: &'a PatchStore,
    embedder: &'a dyn Embedder,
    rasterizer: &'a dyn Rasterizer,
}

impl<'a> Ingestor<'a> {
    pub fn new(
        store: &'a PatchStore,
        embedder: &'a dyn Embedder,
        rasterizer: &'a dyn Rasterizer,
    ) -> Self {
        Self {
            store,
            embedder,
            rasterizer,
        }
    }

    /// Ingest one document. On any per-page failure (including
    /// cancellation) every patch already written for the document is
    /// deleted again and the original error is returned.
    pub fn ingest(
        &self,
        document: &[u8],
        options: &IngestOptions,
        cancel: &CancelToken,
    ) -> Result<IngestReport> {
        let doc_id = match &options.doc_id {
            Some(id) => id.clone(),
            None => DocumentId::from_content(document),
        };
        info!(doc = %doc_id, dpi = options.dpi, "starting ingestion");

        // Rasterization happens before any store write, so its failures
        // need no compensation.
        let mut pages = self.rasterizer.rasterize(document, options.dpi)?;
        if let Some(max) = options.max_pages {
            pages.truncate(max);
        }

        match self.store_pages(&doc_id, &pages, cancel) {
            Ok((patches_stored, patches_truncated)) => {
                info!(
                    doc = %doc_id,
                    pages = pages.len(),
                    patches = patches_stored,
                    "ingestion complete"
                );
                Ok(IngestReport {
                    doc_id,
                    pages_indexed: pages.len(),
                    patches_stored,
                    patches_truncated,
                })
            }
            Err(err) => {
                warn!(doc = %doc_id, error = %err, "ingestion failed, rolling back");
                self.rollback(&doc_id);
                Err(err)
            }
        }
    }

    fn store_pages(
        &self,
        doc_id: &DocumentId,
        pages: &[(u32, PageImage)],
        cancel: &CancelToken,
    ) -> Result<(usize, usize)> {
        let mut stored = 0usize;
        let mut truncated = 0usize;

        for (page_number, image) in pages {
            cancel.check()?;

            let mut embedded =
                self.embedder.embed_pages(std::slice::from_ref(image))?;
            let vectors = match embedded.pop() {
                Some(v) if embedded.is_empty() => v,
                _ => {
                    return Err(Error::EmbeddingUnavailable(
                        "embedder did not return exactly one page for a \
                         single-page batch"
                            .into(),
                    ));
                }
            };

            let receipt =
                self.store.insert_page(doc_id, *page_number, &vectors)?;
            stored += receipt.stored;
            truncated += receipt.truncated;
            debug!(doc = %doc_id, page = page_number, stored = receipt.stored, "page stored");
        }

        Ok((stored, truncated))
    }

    /// Best-effort compensation. Not crash-proof: a failure here can leave
    /// orphaned patches behind, which a later delete of the same id clears.
    fn rollback(&self, doc_id: &DocumentId) {
        match self.store.delete_document(doc_id.as_str()) {
            Ok(removed) => {
                info!(doc = %doc_id, removed, "rollback complete");
            }
            Err(e) => {
                error!(
                    doc = %doc_id,
                    error = %e,
                    "rollback failed, orphaned patches may remain"
                );
            }
        }
    }
}
