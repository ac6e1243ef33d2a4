//! CLI command definitions and parsing
use crate::retrieval::SearchMode;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "ragpipe",
    version,
    about = "Configurable retrieval pipeline with caching, circuit breaking and reranking",
    long_about = "ragpipe turns a query into a ranked list of passages from a JSON-lines corpus. \
                  Searches run in semantic, keyword or hybrid mode, results are optionally \
                  reranked, and answers are cached in memory or in SQLite."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/ragpipe/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Passage corpus, one JSON object per line
    #[arg(long, global = true, value_name = "FILE")]
    pub corpus: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Search the corpus
    Search {
        /// Search query text
        query: String,

        /// Maximum number of results to return
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Search mode
        #[arg(short, long, value_parser = parse_mode)]
        mode: Option<SearchMode>,

        /// Drop semantic results below this score
        #[arg(short, long)]
        threshold: Option<f32>,

        /// Keep search order
        #[arg(long)]
        no_rerank: bool,

        /// Neither read nor write the cache
        #[arg(long)]
        no_cache: bool,

        /// Cache TTL in seconds for this query
        #[arg(long)]
        ttl: Option<u64>,

        /// Show results in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Pre-populate the cache from a file of queries (one per line)
    Warm {
        queries: PathBuf,

        /// Search mode used for every query
        #[arg(short, long, value_parser = parse_mode)]
        mode: Option<SearchMode>,
    },

    /// Probe the cache store and report component health
    Health {
        #[arg(long)]
        json: bool,
    },

    /// Show cache, reranking, search and error metrics
    Metrics {
        #[arg(long)]
        json: bool,
    },

    /// Delete cached results
    ClearCache {
        /// Glob pattern (defaults to every search result entry)
        pattern: Option<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show {
        /// Show only a specific section
        #[arg(short, long)]
        section: Option<String>,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Initialize default configuration
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },

    /// Print the configuration file path
    Path,
}

fn parse_mode(value: &str) -> Result<SearchMode, String> {
    value.parse().map_err(|_| {
        format!(
            "invalid search mode '{}', expected semantic, keyword or hybrid",
            value
        )
    })
}

impl Cli {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
