use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use crate::config::{DEFAULT_DPI, DEFAULT_TOP_K};

#[derive(Debug, Parser)]
#[command(
    name = "colpage",
    about = "Late-interaction visual page search for your PDF documents"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Override the embedding server URL
    #[arg(long, global = true)]
    pub embed_url: Option<String>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ingest a PDF document into the patch index
    Ingest(IngestArgs),
    /// Search indexed pages by natural-language query
    Search(SearchArgs),
    /// Delete a document and all its patches
    Delete(DeleteArgs),
    /// List indexed documents
    List(ListArgs),
    /// Show system status and statistics
    Status(StatusArgs),
    /// Start MCP server for AI agent integration
    Mcp,
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Ingest --

#[derive(Debug, Parser)]
pub struct IngestArgs {
    /// Path to the PDF file
    pub path: PathBuf,

    /// Document name (defaults to the file name without extension)
    #[arg(long)]
    pub name: Option<String>,

    /// Explicit document id instead of the content hash
    #[arg(long)]
    pub doc_id: Option<String>,

    /// Rasterization resolution
    #[arg(long, default_value_t = DEFAULT_DPI)]
    pub dpi: u32,

    /// Ingest at most this many pages
    #[arg(long)]
    pub max_pages: Option<usize>,

    /// Output the ingest report as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Number of ranked pages to return
    #[arg(short = 'n', long, default_value_t = DEFAULT_TOP_K)]
    pub count: usize,

    /// Search only within this document (name or id)
    #[arg(short = 'd', long)]
    pub document: Option<String>,

    /// Minimum score threshold
    #[arg(long, default_value = "0.0")]
    pub min_score: f32,

    /// Override the per-probe candidate width
    #[arg(long)]
    pub candidates: Option<usize>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Delete --

#[derive(Debug, Parser)]
pub struct DeleteArgs {
    /// Document reference: name or content id
    pub reference: String,

    /// Output the result as JSON
    #[arg(long)]
    pub json: bool,
}

// -- List --

#[derive(Debug, Parser)]
pub struct ListArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "colpage",
            &mut std::io::stdout(),
        );
    }
}
