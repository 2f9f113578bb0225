use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    raster::PageImage,
};

pub const DEFAULT_EMBED_URL: &str = "http://127.0.0.1:8012";
pub const EMBED_URL_ENV: &str = "COLPAGE_EMBED_URL";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_RETRIES: usize = 3;

/// Produces patch-level embeddings for page images and queries.
///
/// Implementations wrap a ColPali-family vision model: each page maps to an
/// ordered sequence of patch vectors (index 0 is the global token), each
/// query to an ordered sequence of token vectors. All vectors share one
/// fixed dimension. A model that cannot be reached fails with
/// [`Error::EmbeddingUnavailable`].
pub trait Embedder: Send + Sync {
    /// The vector dimension this embedder produces.
    fn dimension(&self) -> usize;

    /// Embed page images, one patch-vector sequence per page, in order.
    fn embed_pages(&self, pages: &[PageImage]) -> Result<Vec<Vec<Vec<f32>>>>;

    /// Embed a query string into its token vectors.
    fn embed_query(&self, query: &str) -> Result<Vec<Vec<f32>>>;
}

/// Blocking client for a ColPali embedding server.
///
/// The server exposes `POST /embed/pages` (base64-encoded RGB rasters in,
/// per-page patch matrices out) and `POST /embed/query`. Transient
/// failures are retried with linear backoff before surfacing as
/// [`Error::EmbeddingUnavailable`].
pub struct HttpEmbedder {
    client: reqwest::blocking::Client,
    base_url: String,
    dimension: usize,
}

impl HttpEmbedder {
    /// Resolve the server URL from, in order of priority:
    /// 1. An explicit URL (from --embed-url)
    /// 2. The COLPAGE_EMBED_URL environment variable
    /// 3. The default local endpoint
    pub fn resolve_url(explicit: Option<&str>) -> String {
        if let Some(url) = explicit {
            return url.to_string();
        }
        std::env::var(EMBED_URL_ENV)
            .unwrap_or_else(|_| DEFAULT_EMBED_URL.to_string())
    }

    pub fn new(base_url: String, dimension: usize) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| {
                Error::Config(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            dimension,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn post<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp> {
        let url = format!("{}{path}", self.base_url);

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let outcome = self.client.post(&url).json(body).send();

            match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json().map_err(|e| {
                            Error::EmbeddingUnavailable(format!(
                                "malformed response from {url}: {e}"
                            ))
                        });
                    }
                    let retryable = status.is_server_error()
                        || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
                    if !retryable || attempt > MAX_RETRIES {
                        return Err(Error::EmbeddingUnavailable(format!(
                            "{url} returned {status}"
                        )));
                    }
                    warn!(%url, %status, attempt, "embedding server busy, retrying");
                }
                Err(e) => {
                    if attempt > MAX_RETRIES {
                        return Err(Error::EmbeddingUnavailable(format!(
                            "cannot reach {url}: {e}"
                        )));
                    }
                    warn!(%url, error = %e, attempt, "embedding request failed, retrying");
                }
            }

            std::thread::sleep(Duration::from_millis(250 * attempt as u64));
        }
    }
}

impl Embedder for HttpEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_pages(&self, pages: &[PageImage]) -> Result<Vec<Vec<Vec<f32>>>> {
        if pages.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbedPagesRequest {
            pages: pages
                .iter()
                .map(|page| PagePayload {
                    width: page.width,
                    height: page.height,
                    rgb_base64: BASE64.encode(&page.pixels),
                })
                .collect(),
        };

        let response: EmbedPagesResponse =
            self.post("/embed/pages", &request)?;

        if response.embeddings.len() != pages.len() {
            return Err(Error::EmbeddingUnavailable(format!(
                "server embedded {} pages, expected {}",
                response.embeddings.len(),
                pages.len()
            )));
        }

        debug!(pages = pages.len(), "embedded pages");
        Ok(response.embeddings)
    }

    fn embed_query(&self, query: &str) -> Result<Vec<Vec<f32>>> {
        if query.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "query must not be empty".into(),
            ));
        }

        let request = EmbedQueryRequest { query };
        let response: EmbedQueryResponse = self.post("/embed/query", &request)?;

        debug!(vectors = response.embeddings.len(), "embedded query");
        Ok(response.embeddings)
    }
}

impl std::fmt::Debug for HttpEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEmbedder")
            .field("base_url", &self.base_url)
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct EmbedPagesRequest {
    pages: Vec<PagePayload>,
}

#[derive(Serialize)]
struct PagePayload {
    width: u32,
    height: u32,
    rgb_base64: String,
}

#[derive(Deserialize)]
struct EmbedPagesResponse {
    embeddings: Vec<Vec<Vec<f32>>>,
}

#[derive(Serialize)]
struct EmbedQueryRequest<'a> {
    query: &'a str,
}

#[derive(Deserialize)]
struct EmbedQueryResponse {
    embeddings: Vec<Vec<f32>>,
}
