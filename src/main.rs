//! imgtier command line
//!
//! Operates a two-tier image cache directory: fetch through it, warm it,
//! inspect it, or run it as a long-lived process exposing health and
//! Prometheus endpoints.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          imgtier serve                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   MemInfo    │───▶│  ImageCache  │───▶│   /metrics   │       │
//! │  │   watcher    │    │              │    │   /healthz   │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use imgtier::adapters::{HttpFetcher, HttpFetcherConfig, MemInfoWatcher};
use imgtier::cache::{
    budget_for, CacheConfig, FetchPriority, ImageCache, MemoryProbe, SystemMemoryProbe,
};
use imgtier::metrics::CacheExporter;

// =============================================================================
// CLI Arguments
// =============================================================================

/// imgtier - two-tier image cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "IMGTIER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Cache directory (overrides the configuration file)
    #[arg(long, env = "IMGTIER_CACHE_DIR", global = true)]
    cache_dir: Option<PathBuf>,

    /// Size tier budgets from the device's physical memory
    #[arg(long, env = "IMGTIER_ADAPTIVE", global = true)]
    adaptive: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "IMGTIER_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "IMGTIER_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch a locator through the cache
    Get {
        locator: String,
        /// low, normal, high or immediate
        #[arg(long, default_value = "normal")]
        priority: FetchPriority,
        /// Write the payload here instead of printing a summary
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Warm the cache for a list of locators and wait for completion
    Prefetch { locators: Vec<String> },
    /// Remove a locator from both tiers
    Invalidate { locator: String },
    /// Print cache statistics
    Stats {
        /// Emit JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove disk entries idle past the configured age
    Sweep,
    /// Empty both tiers
    Clear,
    /// Run until interrupted, serving health and metrics endpoints
    Serve {
        /// Metrics server bind address
        #[arg(long, env = "IMGTIER_METRICS_ADDR", default_value = "127.0.0.1:9464")]
        metrics_addr: String,

        /// Health server bind address
        #[arg(long, env = "IMGTIER_HEALTH_ADDR", default_value = "127.0.0.1:9465")]
        health_addr: String,

        /// Poll /proc/meminfo and treat low memory as a pressure signal
        #[arg(long, env = "IMGTIER_WATCH_MEMORY")]
        watch_memory: bool,

        /// Interval between expired-entry sweeps in seconds
        #[arg(long, env = "IMGTIER_SWEEP_INTERVAL_SECONDS", default_value = "3600")]
        sweep_interval_seconds: u64,
    },
}

/// Configuration file layout: cache settings plus the HTTP fetcher
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    #[serde(flatten)]
    cache: CacheConfig,
    http: HttpFetcherConfig,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let (config, http) = load_config(&args).await?;
    let fetcher = HttpFetcher::new(&http)?;
    let cache = Arc::new(
        ImageCache::open(config, Arc::new(fetcher))
            .await
            .context("failed to open image cache")?,
    );

    match args.command {
        Command::Get {
            locator,
            priority,
            output,
        } => {
            let result = cache.lookup(&locator, priority).await?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, &result.payload)
                        .await
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    info!(path = %path.display(), size = result.payload.len(), "Payload written");
                }
                None => println!(
                    "{} bytes from {} in {:?}",
                    result.payload.len(),
                    result.source,
                    result.latency
                ),
            }
        }
        Command::Prefetch { locators } => {
            let batch = cache.prefetch(&locators);
            let scheduled = batch.scheduled();
            batch.settled().await;
            println!("prefetched {} of {} locators", scheduled, locators.len());
        }
        Command::Invalidate { locator } => {
            let removed = cache.invalidate(&locator).await?;
            println!("{}", if removed { "removed" } else { "not cached" });
        }
        Command::Stats { json } => {
            let stats = cache.stats();
            if json {
                let report = serde_json::json!({
                    "stats": stats,
                    "metrics": cache.metrics(),
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("memory: {} entries, {} bytes (budget {})", stats.memory_entry_count, stats.memory_bytes, stats.memory_budget);
                println!("disk:   {} entries, {} bytes (budget {})", stats.disk_entries, stats.disk_bytes, stats.disk_budget);
                println!("under pressure: {}", stats.is_under_pressure);
            }
        }
        Command::Sweep => {
            let result = cache.sweep_expired().await;
            println!("swept {} entries, freed {} bytes", result.files_deleted, result.bytes_freed);
        }
        Command::Clear => {
            let result = cache.clear_all().await;
            println!(
                "cleared {} memory and {} disk entries",
                result.memory_entries, result.disk_entries
            );
        }
        Command::Serve {
            metrics_addr,
            health_addr,
            watch_memory,
            sweep_interval_seconds,
        } => {
            serve(cache, metrics_addr, health_addr, watch_memory, sweep_interval_seconds).await?;
        }
    }

    Ok(())
}

async fn load_config(args: &Args) -> anyhow::Result<(CacheConfig, HttpFetcherConfig)> {
    let mut file_config = match &args.config {
        Some(path) => {
            let contents = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_yaml::from_str::<FileConfig>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        }
        None => FileConfig::default(),
    };

    if args.adaptive {
        let budget = budget_for(SystemMemoryProbe.total_memory_bytes());
        info!(?budget, "Using adaptive tier budget");
        file_config.cache.apply_budget(budget);
    }
    if let Some(dir) = &args.cache_dir {
        file_config.cache.disk.root = dir.clone();
    }

    file_config.cache.validate()?;
    Ok((file_config.cache, file_config.http))
}

async fn serve(
    cache: Arc<ImageCache>,
    metrics_addr: String,
    health_addr: String,
    watch_memory: bool,
    sweep_interval_seconds: u64,
) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let exporter = Arc::new(CacheExporter::new()?);

    let watch_memory = watch_memory || cache.config().pressure.watch_system_memory;
    let _pressure_subscription = if watch_memory {
        if cfg!(target_os = "linux") {
            let watcher = MemInfoWatcher::from_config(&cache.config().pressure);
            info!("Watching system memory for pressure");
            Some(cache.subscribe_pressure(watcher.into_stream()))
        } else {
            warn!("System memory watching is only supported on Linux");
            None
        }
    } else {
        None
    };

    // Periodic expiry sweep
    let sweeper = {
        let cache = Arc::clone(&cache);
        let token = shutdown.clone();
        let interval = Duration::from_secs(sweep_interval_seconds.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        cache.sweep_expired().await;
                    }
                }
            }
        })
    };

    let health = {
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(&health_addr, token).await {
                error!("Health server error: {}", e);
            }
        })
    };

    let metrics = {
        let token = shutdown.clone();
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&metrics_addr, cache, exporter, token).await {
                error!("Metrics server error: {}", e);
            }
        })
    };

    info!("imgtier serving; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    info!("Shutting down");
    shutdown.cancel();
    let _ = tokio::join!(sweeper, health, metrics);
    info!("Shutdown complete");
    Ok(())
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
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn", "rustls=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

type HttpResponse = hyper::Response<http_body_util::Full<hyper::body::Bytes>>;

fn text_response(status: hyper::StatusCode, body: &'static str) -> HttpResponse {
    let mut response = hyper::Response::new(http_body_util::Full::new(hyper::body::Bytes::from(body)));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, shutdown: CancellationToken) -> anyhow::Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn health_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<HttpResponse, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/healthz" | "/livez" | "/readyz" => text_response(StatusCode::OK, "ok"),
            _ => text_response(StatusCode::NOT_FOUND, "not found"),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid health server address {}", addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind health server to {}", addr))?;

    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted.context("health server accept error")?,
        };

        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(health_handler))
                .await
            {
                error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: &str,
    cache: Arc<ImageCache>,
    exporter: Arc<CacheExporter>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn metrics_response(
        req: &Request<hyper::body::Incoming>,
        cache: &ImageCache,
        exporter: &CacheExporter,
    ) -> HttpResponse {
        match req.uri().path() {
            "/metrics" => {
                exporter.refresh(&cache.stats(), &cache.metrics());
                match exporter.encode() {
                    Ok((content_type, body)) => {
                        let mut response =
                            hyper::Response::new(http_body_util::Full::new(hyper::body::Bytes::from(body)));
                        if let Ok(value) = content_type.parse() {
                            response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
                        }
                        response
                    }
                    Err(e) => {
                        error!("Failed to encode metrics: {}", e);
                        text_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
                    }
                }
            }
            "/stats" => match serde_json::to_vec(&cache.stats()) {
                Ok(body) => {
                    let mut response =
                        hyper::Response::new(http_body_util::Full::new(hyper::body::Bytes::from(body)));
                    response.headers_mut().insert(
                        hyper::header::CONTENT_TYPE,
                        hyper::header::HeaderValue::from_static("application/json"),
                    );
                    response
                }
                Err(_) => text_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed"),
            },
            _ => text_response(StatusCode::NOT_FOUND, "not found"),
        }
    }

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics server address {}", addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics server to {}", addr))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted.context("metrics server accept error")?,
        };

        let io = TokioIo::new(stream);
        let cache = Arc::clone(&cache);
        let exporter = Arc::clone(&exporter);
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let response = metrics_response(&req, &cache, &exporter);
                async move { Ok::<_, std::convert::Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
