//! Shelfgate administrative CLI
//!
//! Thin commands over the access layer: cache statistics and maintenance,
//! identifier map queries and raw cached GETs.
//!
//! ```text
//! shelfgate [--config FILE] [--db-path PATH] <command>
//!   stats    [--json] [--prometheus]
//!   clear    [--namespace NS | --upstream abs|audible]
//!   cleanup
//!   map      lookup <SOURCE_ID> | reverse <TARGET_ID> | record <SOURCE_ID> <TARGET_ID>
//!   get      <abs|audible> <PATH> [--namespace NS --key KEY --ttl SECS]
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use shelfgate::config::CredentialSettings;
use shelfgate::{AccessLayer, AccessReport, Confidence, RequestOptions, Settings, Upstream};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Shelfgate - Resilient access layer for Audiobookshelf and Audible
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML settings file
    #[arg(long, env = "SHELFGATE_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite cache database (overrides the settings file)
    #[arg(long, env = "SHELFGATE_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Audiobookshelf server URL (overrides the settings file)
    #[arg(long, env = "ABS_URL")]
    abs_url: Option<String>,

    /// Audiobookshelf API token (overrides the settings file)
    #[arg(long, env = "ABS_TOKEN", hide_env_values = true)]
    abs_token: Option<String>,

    /// Disable response caching
    #[arg(long, env = "SHELFGATE_NO_CACHE")]
    no_cache: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show cache, mapping and limiter statistics
    Stats {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Print request metrics in Prometheus text format
        #[arg(long, conflicts_with = "json")]
        prometheus: bool,
    },

    /// Clear cached responses
    Clear {
        /// Only this namespace
        #[arg(long, conflicts_with = "upstream")]
        namespace: Option<String>,

        /// Only the namespaces owned by this upstream
        #[arg(long)]
        upstream: Option<Upstream>,
    },

    /// Purge expired cache entries
    Cleanup,

    /// Query or edit the identifier map
    Map {
        #[command(subcommand)]
        action: MapAction,
    },

    /// Cached GET through the resilient client, printing the body
    Get {
        /// Upstream to call
        upstream: Upstream,

        /// Request path relative to the upstream base URL
        path: String,

        /// Cache namespace (caching requires --key as well)
        #[arg(long, requires = "key")]
        namespace: Option<String>,

        /// Cache key
        #[arg(long, requires = "namespace")]
        key: Option<String>,

        /// Cache TTL in seconds
        #[arg(long)]
        ttl: Option<f64>,
    },
}

#[derive(Subcommand, Debug)]
enum MapAction {
    /// Target id recorded for a source id
    Lookup { source_id: String },

    /// Most recent source id mapped to a target id
    Reverse { target_id: String },

    /// Record a mapping (an empty target records "no match")
    Record {
        source_id: String,
        target_id: String,

        #[arg(long, default_value = "exact")]
        confidence: Confidence,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let settings = load_settings(&args)?;
    let layer = AccessLayer::open(settings)
        .await
        .context("Failed to open access layer")?;

    let result = run(&layer, args.command).await;
    if let Err(e) = &result {
        error!("Command failed: {:#}", e);
    }

    layer.shutdown().await?;
    result
}

fn load_settings(args: &Args) -> anyhow::Result<Settings> {
    let mut settings = match &args.config {
        Some(path) => Settings::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => Settings::default(),
    };

    if let Some(db_path) = &args.db_path {
        settings.cache.db_path = db_path.clone();
    }
    if let Some(url) = &args.abs_url {
        settings.abs.base_url = url.clone();
    }
    if let Some(token) = &args.abs_token {
        settings.abs.credentials = CredentialSettings::Bearer {
            token: token.clone(),
        };
    }
    if args.no_cache {
        settings.cache.enabled = false;
    }

    Ok(settings)
}

async fn run(layer: &AccessLayer, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Stats { json, prometheus } => {
            if prometheus {
                print!("{}", layer.metrics().encode_text()?);
                return Ok(());
            }

            let report = layer.report().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }

        Command::Clear {
            namespace,
            upstream,
        } => match (namespace, upstream) {
            (Some(namespace), _) => {
                let removed = layer.clear_namespace(&namespace).await?;
                println!("Cleared {} entries from {}", removed, namespace);
            }
            (None, Some(upstream)) => {
                let cleared = layer.clear_upstream(upstream).await?;
                for (namespace, removed) in &cleared {
                    println!("{:<20} {}", namespace, removed);
                }
                println!("Cleared {} entries for {}", cleared.values().sum::<u64>(), upstream);
            }
            (None, None) => {
                let removed = layer.clear_all().await?;
                println!("Cleared {} entries", removed);
            }
        },

        Command::Cleanup => {
            let removed = layer.cleanup_expired().await?;
            println!("Removed {} expired entries", removed);
        }

        Command::Map { action } => run_map(layer, action).await?,

        Command::Get {
            upstream,
            path,
            namespace,
            key,
            ttl,
        } => {
            let mut options = RequestOptions::get(path);
            if let (Some(namespace), Some(key)) = (namespace, key) {
                options = options.cached(namespace, key);
            }
            if let Some(ttl) = ttl {
                let ttl = Duration::try_from_secs_f64(ttl).context("Invalid --ttl")?;
                options = options.ttl(ttl);
            }

            let response = layer.client(upstream).request(options).await?;
            info!(
                status = response.status,
                origin = response.origin.as_str(),
                attempts = response.attempts,
                "Request complete"
            );
            println!("{}", response.text());
        }
    }

    Ok(())
}

async fn run_map(layer: &AccessLayer, action: MapAction) -> anyhow::Result<()> {
    let identifiers = layer.identifiers();

    match action {
        MapAction::Lookup { source_id } => match identifiers.get(&source_id).await? {
            Some(mapping) if mapping.is_matched() => println!(
                "{} -> {} ({}, {})",
                mapping.source_id,
                mapping.target_id,
                mapping.confidence.as_str(),
                mapping.matched_at.to_rfc3339()
            ),
            Some(mapping) => println!("{} -> no match ({})", mapping.source_id, mapping.matched_at.to_rfc3339()),
            None => println!("{} is not mapped", source_id),
        },
        MapAction::Reverse { target_id } => match identifiers.reverse_lookup(&target_id).await? {
            Some(source_id) => println!("{} <- {}", target_id, source_id),
            None => println!("{} is not mapped", target_id),
        },
        MapAction::Record {
            source_id,
            target_id,
            confidence,
        } => {
            let mapping = identifiers.record(&source_id, &target_id, confidence).await?;
            println!(
                "Recorded {} -> {} ({})",
                mapping.source_id,
                mapping.target_id,
                mapping.confidence.as_str()
            );
        }
    }

    Ok(())
}

fn print_report(report: &AccessReport) {
    let cache = &report.cache;
    let state = match (cache.enabled, cache.degraded) {
        (false, _) => "disabled",
        (true, true) => "memory-only",
        (true, false) => "enabled",
    };

    println!("Cache ({})", state);
    println!("  entries:        {} ({} expired)", cache.total_entries, cache.expired_entries);
    println!("  memory:         {}/{} ({} evicted)", cache.memory_entries, cache.memory_capacity, cache.memory_evictions);
    println!("  store size:     {} bytes", cache.store_size_bytes);
    println!(
        "  hit ratio:      {:.1}% ({} hits, {} misses)",
        cache.counters.hit_ratio * 100.0,
        cache.counters.memory_hits + cache.counters.persisted_hits,
        cache.counters.misses
    );
    for (namespace, count) in &cache.per_namespace_counts {
        println!("    {:<18} {}", namespace, count);
    }

    println!("Identifier map");
    println!("  mappings:       {}", report.mappings.total_mappings);
    println!("  matched:        {}", report.mappings.matched_count);

    println!("Rate limiters");
    for limiter in &report.limiters {
        println!(
            "  {:<8} delay {}ms (base {}ms, max {}ms), {} requests, {} failures",
            limiter.upstream.as_str(),
            limiter.current_delay_ms,
            limiter.base_delay_ms,
            limiter.max_delay_ms,
            limiter.total_requests,
            limiter.total_failures
        );
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = ["hyper=warn", "reqwest=warn", "sqlx=warn"]
        .iter()
        .filter_map(|directive| directive.parse().ok())
        .fold(
            EnvFilter::from_default_env().add_directive(level.into()),
            |filter, directive| filter.add_directive(directive),
        );

    // stdout carries command output
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
