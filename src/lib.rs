//! colpage - late-interaction visual page search for PDF documents.
//!
//! colpage indexes each document page as a *set* of patch embeddings
//! produced by a ColPali-family vision model, and ranks pages for a query
//! with the MaxSim late-interaction rule: for every query vector, the best
//! matching patch on a page counts, and a page's score is the sum of those
//! maxima. Patches are stored as individual rows in an embedded
//! [redb](https://github.com/cberner/redb) database and aggregation runs
//! client-side, so the ranking rule is fully specified and testable
//! independent of any index backend.
//!
//! # Quick start
//!
//! ```no_run
//! use colpage::{
//!     CancelToken, DataDir, HttpEmbedder, IndexConfig, Ingestor,
//!     PatchStore, RetrievalEngine,
//! };
//! use colpage::ingest::IngestOptions;
//! use colpage::raster::PdftoppmRasterizer;
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let config = IndexConfig::default();
//! let store = PatchStore::open(&data_dir.patches_db(), config).unwrap();
//! let embedder = HttpEmbedder::new(
//!     HttpEmbedder::resolve_url(None),
//!     config.dim,
//! )
//! .unwrap();
//!
//! let rasterizer = PdftoppmRasterizer::default();
//! let ingestor = Ingestor::new(&store, &embedder, &rasterizer);
//! let bytes = std::fs::read("report.pdf").unwrap();
//! let report = ingestor
//!     .ingest(&bytes, &IngestOptions::default(), &CancelToken::new())
//!     .unwrap();
//! println!("indexed {} pages", report.pages_indexed);
//!
//! let engine = RetrievalEngine::new(&store, &embedder);
//! let ranked = engine
//!     .retrieve("quarterly revenue table", 5, None, &CancelToken::new())
//!     .unwrap();
//! for page in &ranked {
//!     println!("{} p{} (score: {:.3})", page.doc_id, page.page_number, page.score);
//! }
//! ```

pub mod cancel;
pub mod cli;
pub mod config;
pub mod data_dir;
pub mod doc_id;
pub mod embedder;
pub mod error;
pub mod ingest;
pub mod mcp;
pub mod patch_store;
pub mod raster;
pub mod registry;
pub mod retrieval;
pub mod scoring;

pub use cancel::CancelToken;
pub use config::IndexConfig;
pub use data_dir::DataDir;
pub use doc_id::DocumentId;
pub use embedder::{Embedder, HttpEmbedder};
pub use error::{Error, Result};
pub use ingest::{IngestReport, Ingestor};
pub use patch_store::{PatchHit, PatchStore};
pub use raster::{PageImage, Rasterizer};
pub use registry::{DocumentInfo, DocumentRegistry};
pub use retrieval::RetrievalEngine;
pub use scoring::RankedPage;
