use rayon::prelude::*;

use tracing::{debug, info};

use crate::{
    cancel::CancelToken,
    embedder::Embedder,
    error::{Error, Result},
    patch_store::{PatchHit, PatchStore},
    scoring::{RankedPage, aggregate_max_sim},
};

/// Late-interaction retrieval: one store probe per query vector, then
/// client-side MaxSim aggregation.
///
/// Aggregating here rather than in the index keeps the ranking rule fully
/// specified and auditable; any backend with single-vector top-K search
/// suffices.
pub struct RetrievalEngine<'a> {
    store: &'a PatchStore,
    embedder: &'a dyn Embedder,
    candidate_k: usize,
}

impl<'a> RetrievalEngine<'a> {
    pub fn new(store: &'a PatchStore, embedder: &'a dyn Embedder) -> Self {
        let candidate_k = store.config().candidate_k;
        Self {
            store,
            embedder,
            candidate_k,
        }
    }

    /// Override the per-probe candidate width. The effective width is
    /// never below `top_k`; fetching too few candidates starves the
    /// aggregation and collapses distinct pages onto identical scores.
    pub fn with_candidate_k(mut self, candidate_k: usize) -> Self {
        self.candidate_k = candidate_k;
        self
    }

    /// Rank pages for a query.
    ///
    /// Probes run concurrently and all must finish before aggregation; a
    /// store failure on any probe aborts the whole call rather than
    /// silently dropping that query vector's contribution. An empty result
    /// is a valid "no relevant pages" outcome, distinct from failure.
    pub fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        doc_filter: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<Vec<RankedPage>> {
        if query.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "query must not be empty".into(),
            ));
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }
        cancel.check()?;

        let query_vectors = self.embedder.embed_query(query)?;
        if query_vectors.is_empty() {
            return Ok(Vec::new());
        }
        debug!(vectors = query_vectors.len(), "query embedded");

        let candidate_k = self.candidate_k.max(top_k);

        let probe_hits: Vec<Vec<PatchHit>> = query_vectors
            .par_iter()
            .map(|vector| {
                cancel.check()?;
                self.store.search(vector, candidate_k, doc_filter)
            })
            .collect::<Result<_>>()?;

        let mut ranked = aggregate_max_sim(&probe_hits);
        ranked.truncate(top_k);

        info!(query, results = ranked.len(), "retrieval complete");
        Ok(ranked)
    }
}
