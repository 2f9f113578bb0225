use std::sync::Arc;

use rmcp::{
    ServerHandler,
    ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{
        CallToolResult,
        Content,
        Implementation,
        ServerCapabilities,
        ServerInfo,
    },
    tool,
    tool_handler,
    tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    cancel::CancelToken,
    config::{DEFAULT_TOP_K, IndexConfig},
    data_dir::DataDir,
    embedder::HttpEmbedder,
    error::{self, Error},
    patch_store::PatchStore,
    registry::DocumentRegistry,
    retrieval::RetrievalEngine,
};

struct ColpageState {
    store: PatchStore,
    registry: DocumentRegistry,
    embedder: HttpEmbedder,
}

#[derive(Clone)]
pub struct ColpageMcpServer {
    state: Arc<ColpageState>,
    tool_router: ToolRouter<Self>,
}

impl ColpageMcpServer {
    fn new(state: ColpageState) -> Self {
        Self {
            state: Arc::new(state),
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_router(router = tool_router)]
impl ColpageMcpServer {
    /// Rank document pages against a natural-language query.
    #[tool(
        name = "colpage_retrieve",
        description = "Search indexed document pages by query. Returns pages ranked by late-interaction relevance score."
    )]
    pub async fn colpage_retrieve(
        &self,
        params: Parameters<RetrieveParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let state = self.state.clone();

        // The embedder client and the store probes are blocking; keep them
        // off the async runtime's worker threads.
        let (query, results) = tokio::task::spawn_blocking(move || {
            let doc_filter = params
                .document
                .as_deref()
                .map(|reference| {
                    state.registry.resolve(reference).map(|info| info.doc_id)
                })
                .transpose()?;

            let engine =
                RetrievalEngine::new(&state.store, &state.embedder);
            let ranked = engine.retrieve(
                &params.query,
                params.limit.unwrap_or(DEFAULT_TOP_K),
                doc_filter.as_ref().map(|id| id.as_str()),
                &CancelToken::new(),
            )?;

            let min_score = params.min_score.unwrap_or(0.0);
            let names: std::collections::HashMap<String, String> = state
                .registry
                .list()?
                .into_iter()
                .map(|info| (info.doc_id.as_str().to_string(), info.name))
                .collect();

            let results: Vec<RetrievedPageItem> = ranked
                .into_iter()
                .filter(|r| r.score >= min_score)
                .map(|r| RetrievedPageItem {
                    name: names.get(&r.doc_id).cloned(),
                    doc_id: r.doc_id,
                    page_number: r.page_number,
                    score: r.score,
                })
                .collect();

            error::Result::Ok((params.query, results))
        })
        .await
        .map_err(|e| {
            rmcp::ErrorData::internal_error(format!("task panicked: {e}"), None)
        })?
        .map_err(|e| mcp_error("retrieval failed", e))?;

        let summary = format_retrieve_summary(&results, &query);
        let structured = serde_json::to_value(RetrieveResponse {
            query,
            result_count: results.len(),
            results,
        })
        .map_err(|e| mcp_error("failed to serialize results", e))?;

        let mut result = CallToolResult::success(vec![Content::text(summary)]);
        result.structured_content = Some(structured);
        Ok(result)
    }

    /// List every indexed document with id, name, and page count.
    #[tool(
        name = "colpage_list_documents",
        description = "List indexed documents with their content ids and page counts."
    )]
    pub async fn colpage_list_documents(
        &self,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let state = self.state.clone();

        let documents = tokio::task::spawn_blocking(move || {
            state.registry.list()
        })
        .await
        .map_err(|e| {
            rmcp::ErrorData::internal_error(format!("task panicked: {e}"), None)
        })?
        .map_err(|e| mcp_error("listing failed", e))?;

        let items: Vec<DocumentItem> = documents
            .into_iter()
            .map(|d| DocumentItem {
                doc_id: d.doc_id.as_str().to_string(),
                name: d.name,
                page_count: d.page_count,
            })
            .collect();

        let summary = if items.is_empty() {
            "No documents indexed".to_string()
        } else {
            let mut lines = vec![format!("{} document(s):", items.len())];
            for item in &items {
                lines.push(format!(
                    "{} ({} pages) #{}",
                    item.name, item.page_count, item.doc_id
                ));
            }
            lines.join("\n")
        };

        let structured = serde_json::to_value(DocumentsResponse {
            document_count: items.len(),
            documents: items,
        })
        .map_err(|e| mcp_error("failed to serialize documents", e))?;

        let mut result = CallToolResult::success(vec![Content::text(summary)]);
        result.structured_content = Some(structured);
        Ok(result)
    }

    /// Delete a document (by name or id) and every patch it owns.
    #[tool(
        name = "colpage_delete_document",
        description = "Delete an indexed document and all of its stored patches. Accepts a document name or content id."
    )]
    pub async fn colpage_delete_document(
        &self,
        params: Parameters<DeleteParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let state = self.state.clone();

        let (doc_id, patches_deleted) =
            tokio::task::spawn_blocking(move || {
                let info = state.registry.resolve(&params.reference)?;
                let deleted =
                    state.store.delete_document(info.doc_id.as_str())?;
                state.registry.remove(&info.name)?;
                error::Result::Ok((info.doc_id, deleted))
            })
            .await
            .map_err(|e| {
                rmcp::ErrorData::internal_error(
                    format!("task panicked: {e}"),
                    None,
                )
            })?
            .map_err(|e| mcp_error("delete failed", e))?;

        let structured = json!({
            "docId": doc_id.as_str(),
            "patchesDeleted": patches_deleted,
        });

        let mut result = CallToolResult::success(vec![Content::text(format!(
            "Deleted #{} ({patches_deleted} patches)",
            doc_id.short()
        ))]);
        result.structured_content = Some(structured);
        Ok(result)
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for ColpageMcpServer {
    fn get_info(&self) -> ServerInfo {
        let mut server_info =
            Implementation::new("colpage", env!("CARGO_PKG_VERSION"));
        server_info.title = Some("colpage MCP".to_string());
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build())
            .with_server_info(server_info)
            .with_instructions(
                "Use colpage_retrieve to find document pages relevant to a question. Filter with the document parameter when the target document is known.",
            )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveParams {
    /// Natural-language search query.
    pub query: String,
    /// Maximum number of ranked pages (default: 10).
    pub limit: Option<usize>,
    /// Restrict the search to one document, by name or content id.
    pub document: Option<String>,
    /// Minimum score threshold.
    pub min_score: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeleteParams {
    /// Document name or content id.
    pub reference: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveResponse {
    query: String,
    result_count: usize,
    results: Vec<RetrievedPageItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RetrievedPageItem {
    doc_id: String,
    name: Option<String>,
    page_number: u32,
    score: f32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentsResponse {
    document_count: usize,
    documents: Vec<DocumentItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentItem {
    doc_id: String,
    name: String,
    page_count: u32,
}

fn format_retrieve_summary(
    results: &[RetrievedPageItem],
    query: &str,
) -> String {
    if results.is_empty() {
        return format!("No pages found for \"{query}\"");
    }

    let mut lines = Vec::with_capacity(results.len() + 1);
    let suffix = if results.len() == 1 { "" } else { "s" };
    lines.push(format!(
        "Found {} page{} for \"{query}\":",
        results.len(),
        suffix
    ));

    for item in results {
        let name = item.name.as_deref().unwrap_or(&item.doc_id);
        lines.push(format!(
            "{name} p{} {:.3}",
            item.page_number, item.score
        ));
    }

    lines.join("\n")
}

fn mcp_error(message: &str, error: impl std::fmt::Display) -> rmcp::ErrorData {
    rmcp::ErrorData::internal_error(
        message.to_string(),
        Some(json!({ "error": error.to_string() })),
    )
}

pub fn run_mcp(
    data_dir: &DataDir,
    config: IndexConfig,
    embed_url: &str,
) -> error::Result<()> {
    let store = PatchStore::open(&data_dir.patches_db(), config)?;
    let registry = DocumentRegistry::open(
        &data_dir.registry_db(),
        &data_dir.documents_dir()?,
    )?;
    let embedder = HttpEmbedder::new(embed_url.to_string(), config.dim)?;

    let state = ColpageState {
        store,
        registry,
        embedder,
    };

    let server = ColpageMcpServer::new(state);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| {
            Error::Config(format!("failed to start tokio runtime: {e}"))
        })?;

    runtime.block_on(async move {
        let transport = rmcp::transport::stdio();
        let running = server.serve(transport).await.map_err(|e| {
            Error::Config(format!("MCP server initialization failed: {e}"))
        })?;
        running.waiting().await.map_err(|e| {
            Error::Config(format!("MCP server error: {e}"))
        })?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc_id::DocumentId;

    fn test_state(tmp: &tempfile::TempDir) -> ColpageState {
        let config = IndexConfig {
            dim: 4,
            max_patches_per_page: 8,
            candidate_k: 100,
        };
        let store =
            PatchStore::open(&tmp.path().join("patches.redb"), config).unwrap();
        let registry = DocumentRegistry::open(
            &tmp.path().join("registry.redb"),
            &tmp.path().join("documents"),
        )
        .unwrap();
        let embedder =
            HttpEmbedder::new("http://127.0.0.1:1".into(), config.dim).unwrap();
        ColpageState {
            store,
            registry,
            embedder,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn list_documents_returns_structured_results() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(&tmp);
        state
            .registry
            .register("report", "report.pdf", b"pdf bytes", 3)
            .unwrap();

        let server = ColpageMcpServer::new(state);
        let result = server.colpage_list_documents().await.unwrap();

        let structured = result.structured_content.expect("structured");
        let documents = structured
            .get("documents")
            .and_then(|v| v.as_array())
            .expect("documents array");

        assert_eq!(documents.len(), 1);
        assert_eq!(
            documents[0].get("name").and_then(|v| v.as_str()),
            Some("report")
        );
        assert_eq!(
            documents[0].get("pageCount").and_then(|v| v.as_u64()),
            Some(3)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_document_removes_patches_and_record() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(&tmp);
        state
            .registry
            .register("report", "report.pdf", b"pdf bytes", 1)
            .unwrap();
        let doc_id = DocumentId::from_content(b"pdf bytes");
        state
            .store
            .insert_page(&doc_id, 1, &[vec![1.0, 0.0, 0.0, 0.0]])
            .unwrap();

        let server = ColpageMcpServer::new(state);
        let result = server
            .colpage_delete_document(Parameters(DeleteParams {
                reference: "report".to_string(),
            }))
            .await
            .unwrap();

        let structured = result.structured_content.expect("structured");
        assert_eq!(
            structured.get("patchesDeleted").and_then(|v| v.as_u64()),
            Some(1)
        );
        assert_eq!(
            server.state.store.count_patches(doc_id.as_str()).unwrap(),
            0
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_unknown_document_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let server = ColpageMcpServer::new(test_state(&tmp));

        let result = server
            .colpage_delete_document(Parameters(DeleteParams {
                reference: "ghost".to_string(),
            }))
            .await;

        assert!(result.is_err());
    }
}
