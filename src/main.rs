use anyhow::{bail, Context, Result};
use ragpipe::cli::{Cli, Commands, ConfigAction};
use ragpipe::config::{Config, ConfigManager, ConfigSource};
use ragpipe::engine::{RetrievalEngine, SearchResponse};
use ragpipe::error::RetrievalError;
use ragpipe::monitor::HealthStatus;
use ragpipe::providers::{EmbeddingProvider, HashingEmbedder, MemoryCorpus};
use ragpipe::retrieval::{RetrievalOptions, SearchMode};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Search {
            query,
            top_k,
            mode,
            threshold,
            no_rerank,
            no_cache,
            ttl,
            json,
        } => {
            let options = RetrievalOptions {
                top_k,
                similarity_threshold: threshold,
                search_mode: mode,
                enable_rerank: no_rerank.then_some(false),
                enable_cache: no_cache.then_some(false),
                cache_ttl_override: ttl,
            };
            let engine = build_engine(cli.config, cli.corpus.as_deref()).await?;
            let result = cmd_search(&engine, &query, options, json).await;
            engine.shutdown().await;
            result?;
        }
        Commands::Warm { queries, mode } => {
            let engine = build_engine(cli.config, cli.corpus.as_deref()).await?;
            let result = cmd_warm(&engine, &queries, mode).await;
            engine.shutdown().await;
            result?;
        }
        Commands::Health { json } => {
            let engine = build_engine(cli.config, cli.corpus.as_deref()).await?;
            let result = cmd_health(&engine, json).await;
            engine.shutdown().await;
            result?;
        }
        Commands::Metrics { json } => {
            let engine = build_engine(cli.config, cli.corpus.as_deref()).await?;
            let result = cmd_metrics(&engine, json).await;
            engine.shutdown().await;
            result?;
        }
        Commands::ClearCache { pattern } => {
            let engine = build_engine(cli.config, cli.corpus.as_deref()).await?;
            let result = engine.clear_cache(pattern.as_deref()).await;
            engine.shutdown().await;
            println!("✓ Removed {} cache entries", result?);
        }
        Commands::Config { action } => {
            cmd_config(cli.config, action)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "ragpipe=debug" } else { "ragpipe=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn config_path(config_path: Option<PathBuf>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(path),
        None => Ok(Config::default_path()?),
    }
}

fn load_config(config_path_arg: Option<PathBuf>) -> Result<Config> {
    let path = config_path(config_path_arg)?;

    if !path.exists() {
        tracing::warn!(
            "Config file not found, using defaults. Run 'ragpipe config init' to create one."
        );
        let mut config = Config::default();
        config.apply_env_overrides();
        return Ok(config);
    }

    let loaded = ConfigManager::new(path).load();
    if loaded.source != ConfigSource::File {
        if let Some(e) = &loaded.error {
            eprintln!("⚠ Warning: {} (continuing with defaults)", e);
        }
    }
    Ok(loaded.config)
}

async fn build_engine(config_path: Option<PathBuf>, corpus: Option<&Path>) -> Result<RetrievalEngine> {
    let config = load_config(config_path)?;
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashingEmbedder::default());

    let corpus = match corpus {
        Some(path) => MemoryCorpus::from_jsonl(path, Arc::clone(&embedder))
            .with_context(|| format!("Failed to load corpus {}", path.display()))?,
        None => {
            tracing::debug!("No corpus given, searching an empty corpus");
            MemoryCorpus::new(Vec::new(), Arc::clone(&embedder))?
        }
    };
    let corpus = Arc::new(corpus);

    let engine = RetrievalEngine::builder(config, embedder, corpus.clone(), corpus)
        .build()
        .await
        .context("Failed to start retrieval engine")?;
    Ok(engine)
}

async fn cmd_search(
    engine: &RetrievalEngine,
    query: &str,
    options: RetrievalOptions,
    json: bool,
) -> Result<()> {
    let response = engine.search(query, options).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print_response(&response);
    }
    Ok(())
}

fn print_response(response: &SearchResponse) {
    println!(
        "{} results ({} search{}{}, {:.1}ms)",
        response.results.len(),
        response.mode_used,
        if response.cache_hit { ", cached" } else { "" },
        if response.reranked { ", reranked" } else { "" },
        response.elapsed_ms
    );

    for (rank, result) in response.results.iter().enumerate() {
        println!(
            "\n{:>2}. [{:.3}] {} ({})",
            rank + 1,
            result.score,
            result.id,
            result.document_id
        );
        println!("    {}", result.preview(160));
    }

    if !response.degradations.is_empty() {
        println!();
        for degradation in &response.degradations {
            println!(
                "⚠ {}: {} ({})",
                degradation.category,
                degradation.message,
                degradation.action.describe()
            );
        }
    }
}

async fn cmd_warm(engine: &RetrievalEngine, path: &Path, mode: Option<SearchMode>) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read queries from {}", path.display()))?;

    let queries: Vec<(String, RetrievalOptions)> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            let options = RetrievalOptions {
                search_mode: mode,
                ..RetrievalOptions::default()
            };
            (line.to_string(), options)
        })
        .collect();

    let warmed = engine.warm_up_cache(&queries).await;
    println!("✓ Warmed {} of {} queries", warmed, queries.len());
    Ok(())
}

async fn cmd_health(engine: &RetrievalEngine, json: bool) -> Result<()> {
    let report = engine.health_check().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("ragpipe health: {}", report.status.as_str());
    println!("================");
    for (name, component) in &report.components {
        println!("  {:<16} {:<10} {}", name, component.status.as_str(), component.message);
    }
    if let Some(latency) = report.cache.latency_ms {
        println!("\nCache round trip: {:.1}ms", latency);
    }

    if report.status == HealthStatus::Unhealthy {
        bail!("pipeline is unhealthy");
    }
    Ok(())
}

async fn cmd_metrics(engine: &RetrievalEngine, json: bool) -> Result<()> {
    let metrics = engine.metrics().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
        return Ok(());
    }

    let cache = &metrics.cache;
    println!("Cache");
    println!("=====");
    println!(
        "  Entries: {}  Memory: {} bytes ({:.1}%)",
        cache.entry_count, cache.memory_used_bytes, cache.memory_usage_percent
    );
    println!(
        "  Hit rate: {:.1}%  Errors: {}  Avg response: {:.2}ms",
        cache.hit_rate * 100.0,
        cache.errors,
        cache.avg_response_time_ms
    );
    println!("  Performance score: {:.0}/100", cache.performance_score);
    for recommendation in &cache.recommendations {
        println!("  - {}", recommendation);
    }
    println!("  Circuit breaker: {}", metrics.circuit_breaker.state.as_str());

    println!("\nReranking");
    println!("=========");
    println!(
        "  Model: {}  Requests: {}  Success rate: {:.1}%",
        metrics.rerank.model.as_deref().unwrap_or("none"),
        metrics.rerank.total_requests,
        metrics.rerank.success_rate * 100.0
    );

    println!("\nErrors");
    println!("======");
    println!(
        "  Total: {}  Rate: {:.1}%",
        metrics.errors.total_errors,
        metrics.errors.error_rate * 100.0
    );
    Ok(())
}

fn cmd_config(config_path_arg: Option<PathBuf>, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show { section } => {
            let config = load_config(config_path_arg)?;
            let value = toml::Value::try_from(&config).context("Failed to serialize config")?;

            let value = match section {
                Some(section) => match value.get(&section) {
                    Some(section_value) => section_value.clone(),
                    None => bail!("Unknown config section: {}", section),
                },
                None => value,
            };
            println!("{}", toml::to_string_pretty(&value)?);
        }
        ConfigAction::Validate { file } => {
            let path = match file {
                Some(path) => path,
                None => config_path(config_path_arg)?,
            };
            match Config::load(&path) {
                Ok(config) => {
                    println!("✓ Configuration is valid");
                    println!("  Schema version: {}", config.meta.schema_version);
                }
                Err(RetrievalError::ConfigValidation { errors }) => {
                    println!("✗ Configuration has {} error(s):", errors.len());
                    for error in &errors {
                        println!("  - {}", error);
                    }
                    bail!("invalid configuration: {}", path.display());
                }
                Err(e) => return Err(e).context(format!("Failed to load {}", path.display())),
            }
        }
        ConfigAction::Init { force } => {
            let path = config_path(config_path_arg)?;

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            Config::default().save(&path)?;
            println!("✓ Configuration initialized at: {}", path.display());
        }
        ConfigAction::Path => {
            println!("{}", config_path(config_path_arg)?.display());
        }
    }

    Ok(())
}
