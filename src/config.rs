use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{env, fmt::Display, str::FromStr, time::Duration};

const MIB: u64 = 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * MIB;
pub const DEFAULT_RETENTION_HOURS: u64 = 12;

/// Which object storage backend to serve uploads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageBackend {
    /// Sharded files beneath `storage_dir`.
    Local,
    /// In-process maps; contents are lost on exit.
    Memory,
}

/// What the process should do once configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Serve,
    Migrate,
    ReapStale,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub storage_backend: StorageBackend,
    pub storage_dir: String,
    pub public_url: Option<String>,
    /// Declared sizes at or above this many bytes use multipart uploads.
    pub chunk_size: u64,
    /// Largest request body accepted by the upload endpoint.
    pub max_body_size: u64,
    pub retention_hours: u64,
    /// Period of the in-server reaper; `None` disables it.
    pub reap_interval_secs: Option<u64>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "File upload metadata and lifecycle service")]
pub struct Args {
    /// Host to bind to (overrides FILE_UPLOADS_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILE_UPLOADS_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides FILE_UPLOADS_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Storage backend (overrides FILE_UPLOADS_STORAGE_BACKEND)
    #[arg(long, value_enum)]
    pub storage_backend: Option<StorageBackend>,

    /// Directory where objects are stored (overrides FILE_UPLOADS_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Public base URL objects are served under (overrides FILE_UPLOADS_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Multipart threshold in bytes (overrides FILE_UPLOADS_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Maximum upload request body in bytes (overrides FILE_UPLOADS_MAX_BODY_SIZE)
    #[arg(long)]
    pub max_body_size: Option<u64>,

    /// Hours an unfinalized upload is kept (overrides FILE_UPLOADS_RETENTION_HOURS)
    #[arg(long = "hours", short = 'H')]
    pub retention_hours: Option<u64>,

    /// Run the stale upload reaper every N seconds while serving
    /// (overrides FILE_UPLOADS_REAP_INTERVAL)
    #[arg(long = "reap-interval")]
    pub reap_interval_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Reclaim stale uploads once and exit
    #[arg(long, conflicts_with = "migrate")]
    pub reap_stale: bool,
}

/// Read `name` through `lookup` and parse it; `Ok(None)` when unset.
fn parse_var<T>(
    lookup: &impl Fn(&str) -> Result<String, env::VarError>,
    name: &str,
) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn string_var(
    lookup: &impl Fn(&str) -> Result<String, env::VarError>,
    name: &str,
) -> Result<Option<String>> {
    match lookup(name) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, Mode)> {
        Self::resolve(Args::parse(), |name| env::var(name))
    }

    /// Merge parsed args over values from `lookup`, then defaults.
    pub fn resolve(
        args: Args,
        lookup: impl Fn(&str) -> Result<String, env::VarError>,
    ) -> Result<(Self, Mode)> {
        // --- Environment fallback ---
        let env_host = string_var(&lookup, "FILE_UPLOADS_HOST")?.unwrap_or_else(|| "0.0.0.0".into());
        let env_port = parse_var::<u16>(&lookup, "FILE_UPLOADS_PORT")?.unwrap_or(3000);
        let env_db = string_var(&lookup, "FILE_UPLOADS_DATABASE_URL")?
            .unwrap_or_else(|| "sqlite://./data/meta/file_uploads.db".into());
        let env_backend = match string_var(&lookup, "FILE_UPLOADS_STORAGE_BACKEND")? {
            Some(value) => <StorageBackend as ValueEnum>::from_str(value.trim(), true)
                .map_err(|err| anyhow::anyhow!(err))
                .with_context(|| {
                    format!("parsing FILE_UPLOADS_STORAGE_BACKEND value `{}`", value)
                })?,
            None => StorageBackend::Local,
        };
        let env_storage = string_var(&lookup, "FILE_UPLOADS_STORAGE_DIR")?
            .unwrap_or_else(|| "./data/objects".into());
        let env_public_url = string_var(&lookup, "FILE_UPLOADS_PUBLIC_URL")?;
        let env_chunk = parse_var::<u64>(&lookup, "FILE_UPLOADS_CHUNK_SIZE")?;
        let env_body = parse_var::<u64>(&lookup, "FILE_UPLOADS_MAX_BODY_SIZE")?;
        let env_hours = parse_var::<u64>(&lookup, "FILE_UPLOADS_RETENTION_HOURS")?;
        let env_interval = parse_var::<u64>(&lookup, "FILE_UPLOADS_REAP_INTERVAL")?;

        // --- Merge ---
        let chunk_size = args
            .chunk_size
            .or(env_chunk)
            .unwrap_or(DEFAULT_CHUNK_SIZE);
        if chunk_size == 0 {
            bail!("chunk size must be greater than zero");
        }
        let max_body_size = args
            .max_body_size
            .or(env_body)
            .unwrap_or(chunk_size.saturating_add(MIB));

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            storage_backend: args.storage_backend.unwrap_or(env_backend),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            public_url: args.public_url.or(env_public_url),
            chunk_size,
            max_body_size,
            retention_hours: args
                .retention_hours
                .or(env_hours)
                .unwrap_or(DEFAULT_RETENTION_HOURS),
            reap_interval_secs: args
                .reap_interval_secs
                .or(env_interval)
                .filter(|secs| *secs > 0),
        };

        let mode = if args.migrate {
            Mode::Migrate
        } else if args.reap_stale {
            Mode::ReapStale
        } else {
            Mode::Serve
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3600))
    }
}
