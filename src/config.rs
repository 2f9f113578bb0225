use crate::error::{Error, Result};

/// Patch vector dimension produced by ColPali-family models.
pub const EMBEDDING_DIM: usize = 128;

/// Hard cap on patches stored per page; inserts beyond it are truncated.
pub const MAX_PATCHES_PER_PAGE: usize = 1030;

/// Nearest neighbors fetched per query-patch probe before aggregation.
///
/// Sized well above the final result count: too few candidates starves the
/// MaxSim sum and collapses distinct pages onto identical scores.
pub const DEFAULT_CANDIDATE_K: usize = 100;

/// Default rasterization resolution for ingestion.
pub const DEFAULT_DPI: u32 = 150;

/// Default number of ranked pages returned by a search.
pub const DEFAULT_TOP_K: usize = 10;

/// Tunable parameters shared by the patch store and the retrieval engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexConfig {
    /// Vector dimension every stored and queried patch must have.
    pub dim: usize,
    /// Maximum patches kept per page (first-by-index wins).
    pub max_patches_per_page: usize,
    /// Candidate width for per-patch probes during retrieval.
    pub candidate_k: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dim: EMBEDDING_DIM,
            max_patches_per_page: MAX_PATCHES_PER_PAGE,
            candidate_k: DEFAULT_CANDIDATE_K,
        }
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(Error::InvalidArgument(
                "embedding dimension must be positive".into(),
            ));
        }
        if self.max_patches_per_page == 0 {
            return Err(Error::InvalidArgument(
                "max patches per page must be positive".into(),
            ));
        }
        if self.candidate_k == 0 {
            return Err(Error::InvalidArgument(
                "candidate width must be positive".into(),
            ));
        }
        Ok(())
    }
}
