use crate::{models::image::DEFAULT_CHUNK_SIZE, services::ingestion::DEFAULT_MAX_OBJECT_BYTES};
use anyhow::{Context, Result, ensure};
use clap::Parser;
use std::{env, str::FromStr};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub max_connections: u32,
    pub chunk_size: usize,
    pub max_object_bytes: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked property image store")]
pub struct Args {
    /// Host to bind to (overrides IMAGE_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides IMAGE_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides IMAGE_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Maximum pooled database connections (overrides IMAGE_STORE_MAX_CONNECTIONS)
    #[arg(long)]
    pub max_connections: Option<u32>,

    /// Chunk size in bytes for new uploads (overrides IMAGE_STORE_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Largest admitted upload in bytes (overrides IMAGE_STORE_MAX_OBJECT_BYTES)
    #[arg(long)]
    pub max_object_bytes: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        Self::from_args(Args::parse())
    }

    /// Merge already-parsed CLI args over the environment. CLI wins.
    pub fn from_args(args: Args) -> Result<(Self, bool)> {
        // --- Environment fallback ---
        let env_host = env::var("IMAGE_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("IMAGE_STORE_PORT", 3000u16)?;
        let env_db = env::var("IMAGE_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/image_store.db".into());
        let env_connections = env_or("IMAGE_STORE_MAX_CONNECTIONS", 5u32)?;
        let env_chunk_size = env_or("IMAGE_STORE_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?;
        let env_max_object = env_or("IMAGE_STORE_MAX_OBJECT_BYTES", DEFAULT_MAX_OBJECT_BYTES)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            max_connections: args.max_connections.unwrap_or(env_connections),
            chunk_size: args.chunk_size.unwrap_or(env_chunk_size),
            max_object_bytes: args.max_object_bytes.unwrap_or(env_max_object),
        };

        ensure!(cfg.chunk_size > 0, "chunk size must be positive");
        ensure!(cfg.max_connections > 0, "max connections must be positive");

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read and parse `name`, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
