use anyhow::{bail, Context};
use bytes::Bytes;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use cache_storage::config::CacheStorageConfig;
use cache_storage::{
    BatchOperation, BlobHandle, CacheDependencies, CacheStorageCache, FetchRequest, QueryParams,
    Response, StaticQuotaManager,
};

/// Inspect and edit a cache storage directory
#[derive(Parser, Debug)]
#[command(name = "cache-storage")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Origin owning the cache
    #[arg(long, default_value = "https://localhost")]
    origin: String,

    /// Cache name; stored under <cache_dir>/<cache name>
    #[arg(short = 'n', long, default_value = "default")]
    cache_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug)]
struct MatchOptions {
    /// Compare URLs without their query string
    #[arg(long)]
    ignore_search: bool,

    /// Match regardless of request method
    #[arg(long)]
    ignore_method: bool,

    /// Skip Vary header comparison
    #[arg(long)]
    ignore_vary: bool,
}

impl MatchOptions {
    fn params(&self) -> QueryParams {
        QueryParams {
            ignore_search: self.ignore_search,
            ignore_method: self.ignore_method,
            ignore_vary: self.ignore_vary,
            cache_name: None,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a response for a URL
    Put {
        url: String,
        /// Response body
        #[arg(long, conflicts_with = "body_file")]
        body: Option<String>,
        /// Read the response body from a file
        #[arg(long)]
        body_file: Option<PathBuf>,
        /// Response header as "name: value"; repeatable
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
        #[arg(long, default_value_t = 200)]
        status: u16,
    },
    /// Print the first response matching a URL
    Match {
        url: String,
        #[command(flatten)]
        options: MatchOptions,
    },
    /// List stored request URLs
    Keys {
        url: Option<String>,
        #[command(flatten)]
        options: MatchOptions,
    },
    /// Remove entries matching a URL
    Delete {
        url: String,
        #[command(flatten)]
        options: MatchOptions,
    },
    /// Print the cache size in bytes
    Size,
}

fn parse_header(raw: &str) -> anyhow::Result<(String, String)> {
    match raw.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => bail!("invalid header '{}', expected 'name: value'", raw),
    }
}

fn open_cache(args: &Args, config: &CacheStorageConfig) -> CacheStorageCache {
    let quota = Arc::new(StaticQuotaManager::new(config.quota_bytes));
    let deps = CacheDependencies::from_config(config, quota);
    if config.memory_only {
        tracing::warn!("memory_only is set; nothing will persist after exit");
        return CacheStorageCache::create_memory_cache(&args.origin, &args.cache_name, deps);
    }
    let path = PathBuf::from(&config.cache_dir).join(&args.cache_name);
    CacheStorageCache::create_persistent_cache(&args.origin, &args.cache_name, path, deps, 0)
}

async fn run(args: Args, config: CacheStorageConfig) -> anyhow::Result<()> {
    let cache = open_cache(&args, &config);
    let mut stdout = std::io::stdout();

    match &args.command {
        Command::Put {
            url,
            body,
            body_file,
            headers,
            status,
        } => {
            let body = match (body, body_file) {
                (Some(text), _) => Some(Bytes::from(text.clone())),
                (None, Some(path)) => Some(Bytes::from(
                    tokio::fs::read(path)
                        .await
                        .with_context(|| format!("Failed to read {}", path.display()))?,
                )),
                (None, None) => None,
            };
            let mut response = Response::ok(body.map(BlobHandle::from_bytes));
            response.status = *status;
            response.url_list = vec![url.clone()];
            for raw in headers {
                response.headers.push(parse_header(raw)?);
            }

            cache
                .batch_operation(vec![BatchOperation::Put {
                    request: FetchRequest::get(url.clone()),
                    response,
                }])
                .await?;
            tracing::info!(url = %url, "Stored response");
        }
        Command::Match { url, options } => {
            let matched = cache
                .match_request(FetchRequest::get(url.clone()), options.params())
                .await?;
            let response = matched.response;
            writeln!(stdout, "{} {}", response.status, response.status_text)?;
            for (name, value) in &response.headers {
                writeln!(stdout, "{}: {}", name, value)?;
            }
            writeln!(stdout)?;
            if let Some(body) = response.body {
                stdout.write_all(&body.read_all().await?)?;
            }
        }
        Command::Keys { url, options } => {
            let requests = cache
                .keys(url.clone().map(FetchRequest::get), options.params())
                .await?;
            for request in requests {
                writeln!(stdout, "{} {}", request.method, request.url)?;
            }
        }
        Command::Delete { url, options } => {
            cache
                .batch_operation(vec![BatchOperation::Delete {
                    request: FetchRequest::get(url.clone()),
                    params: options.params(),
                }])
                .await?;
            tracing::info!(url = %url, "Deleted entries");
        }
        Command::Size => {
            writeln!(stdout, "{}", cache.get_size_then_close().await?)?;
            return Ok(());
        }
    }

    cache.close().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => CacheStorageConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?,
        None => CacheStorageConfig::default(),
    };
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    // Initialize logging subsystem
    cache_storage::logging::init_subscriber(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging subsystem: {}", e))?;

    tracing::debug!(
        cache_dir = %config.cache_dir,
        memory_only = config.memory_only,
        cache_name = %args.cache_name,
        "Configuration loaded"
    );

    run(args, config).await
}
