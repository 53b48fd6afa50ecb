use crate::pipeline::PipelineConfig;
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub chunk_threshold: usize,
    pub target_chunk_size: usize,
    pub max_concurrency: usize,
    pub generation_timeout_secs: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Chunked ZIP archive generation service")]
pub struct Args {
    /// Host to bind to (overrides GALLERY_ZIP_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides GALLERY_ZIP_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides GALLERY_ZIP_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides GALLERY_ZIP_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Manifests with at least this many files are chunked (overrides GALLERY_ZIP_CHUNK_THRESHOLD)
    #[arg(long)]
    pub chunk_threshold: Option<usize>,

    /// Desired files per chunk worker (overrides GALLERY_ZIP_TARGET_CHUNK_SIZE)
    #[arg(long)]
    pub target_chunk_size: Option<usize>,

    /// Chunk workers running at once (overrides GALLERY_ZIP_MAX_CONCURRENCY)
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// Seconds before a generating run counts as abandoned
    /// (overrides GALLERY_ZIP_GENERATION_TIMEOUT_SECS)
    #[arg(long)]
    pub generation_timeout_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::resolve(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Flags win over `lookup` (the environment), which wins over defaults.
    fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = PipelineConfig::default();
        let cfg = Self {
            host: args
                .host
                .or_else(|| lookup("GALLERY_ZIP_HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: from_arg_or_env(args.port, &lookup, "GALLERY_ZIP_PORT", 3000)?,
            storage_dir: args
                .storage_dir
                .or_else(|| lookup("GALLERY_ZIP_STORAGE_DIR"))
                .unwrap_or_else(|| "./data/objects".into()),
            database_url: args
                .database_url
                .or_else(|| lookup("GALLERY_ZIP_DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/gallery_zip.db".into()),
            chunk_threshold: from_arg_or_env(
                args.chunk_threshold,
                &lookup,
                "GALLERY_ZIP_CHUNK_THRESHOLD",
                defaults.chunk_threshold,
            )?,
            target_chunk_size: from_arg_or_env(
                args.target_chunk_size,
                &lookup,
                "GALLERY_ZIP_TARGET_CHUNK_SIZE",
                defaults.target_chunk_size,
            )?,
            max_concurrency: from_arg_or_env(
                args.max_concurrency,
                &lookup,
                "GALLERY_ZIP_MAX_CONCURRENCY",
                defaults.max_concurrency,
            )?,
            generation_timeout_secs: from_arg_or_env(
                args.generation_timeout_secs,
                &lookup,
                "GALLERY_ZIP_GENERATION_TIMEOUT_SECS",
                defaults.generation_timeout.as_secs(),
            )?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("chunk_threshold", self.chunk_threshold as u64),
            ("target_chunk_size", self.target_chunk_size as u64),
            ("max_concurrency", self.max_concurrency as u64),
            ("generation_timeout_secs", self.generation_timeout_secs),
        ] {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            chunk_threshold: self.chunk_threshold,
            target_chunk_size: self.target_chunk_size,
            max_concurrency: self.max_concurrency,
            generation_timeout: Duration::from_secs(self.generation_timeout_secs),
        }
    }
}

fn from_arg_or_env<T>(
    arg: Option<T>,
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(value) = arg {
        return Ok(value);
    }
    match lookup(name) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("parsing {name} value `{raw}`")),
        None => Ok(default),
    }
}
