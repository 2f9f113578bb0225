use clap::Parser;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use colpage::{
    CancelToken,
    DataDir,
    DocumentId,
    DocumentRegistry,
    HttpEmbedder,
    IndexConfig,
    Ingestor,
    PatchStore,
    RetrievalEngine,
    cli::{Cli, Command, DeleteArgs, IngestArgs, ListArgs, SearchArgs, StatusArgs},
    error::{self, Error},
    ingest::IngestOptions,
    raster::PdftoppmRasterizer,
};

fn init_tracing(verbose: u8) {
    let filter = if let Ok(env) = std::env::var("COLPAGE_LOG") {
        EnvFilter::new(env)
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config = IndexConfig::default();
    let embed_url = HttpEmbedder::resolve_url(cli.embed_url.as_deref());

    match cli.command {
        Command::Ingest(args) => {
            cmd_ingest(&data_dir, config, &embed_url, &args)?;
        }
        Command::Search(args) => {
            cmd_search(&data_dir, config, &embed_url, &args)?;
        }
        Command::Delete(args) => {
            cmd_delete(&data_dir, config, &args)?;
        }
        Command::List(args) => {
            cmd_list(&data_dir, &args)?;
        }
        Command::Status(args) => {
            cmd_status(&data_dir, config, &embed_url, &args)?;
        }
        Command::Mcp => {
            colpage::mcp::run_mcp(&data_dir, config, &embed_url)?;
        }
        Command::Completions(_) => unreachable!("handled above"),
    }

    Ok(())
}

fn open_registry(data_dir: &DataDir) -> error::Result<DocumentRegistry> {
    DocumentRegistry::open(&data_dir.registry_db(), &data_dir.documents_dir()?)
}

fn cmd_ingest(
    data_dir: &DataDir,
    config: IndexConfig,
    embed_url: &str,
    args: &IngestArgs,
) -> error::Result<()> {
    if !args.path.is_file() {
        return Err(Error::NotFound {
            kind: "file",
            name: args.path.display().to_string(),
        });
    }

    let file_name = args
        .path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .ok_or_else(|| {
            Error::InvalidArgument(format!(
                "cannot derive a file name from {}",
                args.path.display()
            ))
        })?;
    let name = match &args.name {
        Some(name) => name.clone(),
        None => args
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| file_name.clone()),
    };

    let registry = open_registry(data_dir)?;
    if registry.get_by_name(&name).is_ok() {
        return Err(Error::InvalidArgument(format!(
            "document '{name}' already exists; delete it first to re-ingest"
        )));
    }

    let bytes = std::fs::read(&args.path)?;
    let store = PatchStore::open(&data_dir.patches_db(), config)?;
    let embedder = HttpEmbedder::new(embed_url.to_string(), config.dim)?;
    let rasterizer = PdftoppmRasterizer::default();
    let ingestor = Ingestor::new(&store, &embedder, &rasterizer);

    let options = IngestOptions {
        doc_id: args
            .doc_id
            .as_deref()
            .map(DocumentId::new)
            .transpose()?,
        dpi: args.dpi,
        max_pages: args.max_pages,
    };

    let report = ingestor.ingest(&bytes, &options, &CancelToken::new())?;

    // Registration failing after a successful ingest would strand the
    // patches, so compensate the same way the pipeline does.
    if let Err(e) =
        registry.register(&name, &file_name, &bytes, report.pages_indexed as u32)
    {
        store.delete_document(report.doc_id.as_str())?;
        return Err(e);
    }

    if args.json {
        println!(
            "{}",
            json!({
                "doc_id": report.doc_id.as_str(),
                "name": name,
                "pages_indexed": report.pages_indexed,
                "patches_stored": report.patches_stored,
                "patches_truncated": report.patches_truncated,
            })
        );
    } else {
        println!(
            "Ingested '{name}' #{}: {} page(s), {} patch(es)",
            report.doc_id.short(),
            report.pages_indexed,
            report.patches_stored
        );
        if report.patches_truncated > 0 {
            eprintln!(
                "Warning: {} patch(es) dropped by the per-page cap",
                report.patches_truncated
            );
        }
    }
    Ok(())
}

fn cmd_search(
    data_dir: &DataDir,
    config: IndexConfig,
    embed_url: &str,
    args: &SearchArgs,
) -> error::Result<()> {
    let registry = open_registry(data_dir)?;
    let store = PatchStore::open(&data_dir.patches_db(), config)?;
    let embedder = HttpEmbedder::new(embed_url.to_string(), config.dim)?;

    let mut engine = RetrievalEngine::new(&store, &embedder);
    if let Some(candidates) = args.candidates {
        engine = engine.with_candidate_k(candidates);
    }

    // A document filter may be a name or an id; the store only knows ids.
    let doc_filter = args
        .document
        .as_deref()
        .map(|reference| registry.resolve(reference).map(|info| info.doc_id))
        .transpose()?;

    let ranked = engine.retrieve(
        &args.query,
        args.count,
        doc_filter.as_ref().map(|id| id.as_str()),
        &CancelToken::new(),
    )?;
    let ranked: Vec<_> = ranked
        .into_iter()
        .filter(|r| r.score >= args.min_score)
        .collect();

    // Resolve ids to names once for display.
    let names: std::collections::HashMap<String, String> = registry
        .list()?
        .into_iter()
        .map(|info| (info.doc_id.as_str().to_string(), info.name))
        .collect();

    if args.json {
        let results: Vec<_> = ranked
            .iter()
            .enumerate()
            .map(|(i, r)| {
                json!({
                    "rank": i + 1,
                    "doc_id": r.doc_id,
                    "name": names.get(&r.doc_id),
                    "page_number": r.page_number,
                    "score": r.score,
                })
            })
            .collect();
        println!(
            "{}",
            json!({
                "query": args.query,
                "result_count": ranked.len(),
                "results": results,
            })
        );
    } else if ranked.is_empty() {
        println!("No matching pages.");
    } else {
        for (i, r) in ranked.iter().enumerate() {
            let name = names
                .get(&r.doc_id)
                .map(String::as_str)
                .unwrap_or(&r.doc_id);
            println!(
                "{:>3}. [{:.3}] {name} p{} #{}",
                i + 1,
                r.score,
                r.page_number,
                &r.doc_id[..r.doc_id.len().min(12)]
            );
        }
        println!("\n{} result(s)", ranked.len());
    }
    Ok(())
}

fn cmd_delete(
    data_dir: &DataDir,
    config: IndexConfig,
    args: &DeleteArgs,
) -> error::Result<()> {
    let registry = open_registry(data_dir)?;
    let store = PatchStore::open(&data_dir.patches_db(), config)?;

    let (doc_id, patches_deleted) = match registry.resolve(&args.reference) {
        Ok(info) => {
            let deleted = store.delete_document(info.doc_id.as_str())?;
            registry.remove(&info.name)?;
            (info.doc_id, deleted)
        }
        Err(Error::NotFound { .. }) => {
            // Unregistered ids can still own patches (e.g. after an
            // interrupted rollback); allow cleaning those up directly.
            let deleted = store.delete_document(&args.reference)?;
            if deleted == 0 {
                return Err(Error::NotFound {
                    kind: "document",
                    name: args.reference.clone(),
                });
            }
            (DocumentId::new(&args.reference)?, deleted)
        }
        Err(e) => return Err(e),
    };

    if args.json {
        println!(
            "{}",
            json!({
                "doc_id": doc_id.as_str(),
                "patches_deleted": patches_deleted,
            })
        );
    } else {
        println!(
            "Deleted #{}: {patches_deleted} patch(es)",
            doc_id.short()
        );
    }
    Ok(())
}

fn cmd_list(data_dir: &DataDir, args: &ListArgs) -> error::Result<()> {
    let registry = open_registry(data_dir)?;
    let documents = registry.list()?;

    if args.json {
        let entries: Vec<_> = documents
            .iter()
            .map(|d| {
                json!({
                    "doc_id": d.doc_id.as_str(),
                    "name": d.name,
                    "page_count": d.page_count,
                })
            })
            .collect();
        println!("{}", json!(entries));
    } else if documents.is_empty() {
        println!("No documents indexed.");
    } else {
        for d in &documents {
            println!("{}\t{} page(s)\t#{}", d.name, d.page_count, d.doc_id.short());
        }
    }
    Ok(())
}

fn cmd_status(
    data_dir: &DataDir,
    config: IndexConfig,
    embed_url: &str,
    args: &StatusArgs,
) -> error::Result<()> {
    let registry = open_registry(data_dir)?;
    let store = PatchStore::open(&data_dir.patches_db(), config)?;
    let stats = store.stats()?;
    let documents = registry.list()?;

    if args.json {
        println!(
            "{}",
            json!({
                "data_dir": data_dir.root().display().to_string(),
                "embed_url": embed_url,
                "dimension": config.dim,
                "documents": documents.len(),
                "patches": stats.patches,
            })
        );
    } else {
        println!("Data directory: {}", data_dir.root().display());
        println!("Embedding server: {embed_url}");
        println!("Vector dimension: {}", config.dim);
        println!("Documents: {}", documents.len());
        for d in &documents {
            println!("  {}: {} page(s)", d.name, d.page_count);
        }
        println!("Patches: {}", stats.patches);
    }
    Ok(())
}
