use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// Default ceiling below which a merge is performed synchronously inside
/// the completion call. 8 MiB keeps the inline path to a handful of
/// chunk reads.
pub const DEFAULT_SYNC_MERGE_THRESHOLD: u64 = 8 * 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Bearer tokens accepted by the static verifier.
    pub api_tokens: Vec<String>,
    /// Combined chunk size under which the merge happens inline.
    pub sync_merge_threshold: u64,
    /// When set, completion calls return per-chunk download URLs and the
    /// server never merges; the caller concatenates locally.
    pub defer_merge: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked upload / async merge relay")]
pub struct Args {
    /// Host to bind to (overrides CHUNK_RELAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CHUNK_RELAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where chunks and artifacts are stored (overrides CHUNK_RELAY_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides CHUNK_RELAY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Comma-separated bearer tokens (overrides CHUNK_RELAY_API_TOKENS)
    #[arg(long)]
    pub api_tokens: Option<String>,

    /// Synchronous merge threshold in bytes (overrides CHUNK_RELAY_SYNC_MERGE_THRESHOLD)
    #[arg(long)]
    pub sync_merge_threshold: Option<u64>,

    /// Defer merging to the caller (overrides CHUNK_RELAY_DEFER_MERGE)
    #[arg(long)]
    pub defer_merge: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("CHUNK_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("CHUNK_RELAY_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing CHUNK_RELAY_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading CHUNK_RELAY_PORT"),
        };
        let env_storage =
            env::var("CHUNK_RELAY_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("CHUNK_RELAY_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/chunk_relay.db".into());
        let env_tokens = env::var("CHUNK_RELAY_API_TOKENS").unwrap_or_default();
        let env_threshold = match env::var("CHUNK_RELAY_SYNC_MERGE_THRESHOLD") {
            Ok(value) => Some(value.parse::<u64>().with_context(|| {
                format!("parsing CHUNK_RELAY_SYNC_MERGE_THRESHOLD value `{}`", value)
            })?),
            Err(_) => None,
        };
        let env_defer = env::var("CHUNK_RELAY_DEFER_MERGE")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        // --- Merge ---
        let tokens_raw = args.api_tokens.unwrap_or(env_tokens);
        let api_tokens = tokens_raw
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            api_tokens,
            sync_merge_threshold: args
                .sync_merge_threshold
                .or(env_threshold)
                .unwrap_or(DEFAULT_SYNC_MERGE_THRESHOLD),
            defer_merge: args.defer_merge || env_defer,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
