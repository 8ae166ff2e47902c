use crate::{
    models::session::ValidationPolicy,
    services::{
        session_engine::EngineSettings,
        staging::parse_mode,
        validator::{DEFAULT_MAX_FILE_SIZE, UploadValidator, parse_mime_overrides},
        virus_scan::{ClamdTransport, default_socket},
    },
};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr};

const ENV_PREFIX: &str = "ATTACHMENTS_";

/// Where permanent attachment bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Local,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(StorageBackend::Local),
            "memory" => Ok(StorageBackend::Memory),
            other => bail!("unknown storage backend `{}` (expected local or memory)", other),
        }
    }
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
    /// Staging directory; the system temp dir when unset.
    pub temp_dir: Option<PathBuf>,
    pub temp_dir_mode: Option<u32>,
    /// `None` disables the size limit.
    pub max_file_size: Option<u64>,
    pub allowed_extensions: String,
    pub allowed_file_types: String,
    pub mime_overrides: String,
    pub expand_archives: bool,
    pub clamd_enabled: bool,
    pub clamd_socket: Option<PathBuf>,
    pub clamd_host: Option<String>,
    pub clamd_port: u16,
    pub clamd_timeout_secs: u64,
    pub quarantine_dir: Option<PathBuf>,
    pub always_download: bool,
    pub use_sendfile: bool,
    pub property_schema: Option<PathBuf>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Upload sessions and permanent attachments")]
pub struct Args {
    /// Host to bind to (overrides ATTACHMENTS_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides ATTACHMENTS_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides ATTACHMENTS_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Permanent storage backend, `local` or `memory` (overrides ATTACHMENTS_STORAGE_BACKEND)
    #[arg(long)]
    pub storage_backend: Option<String>,

    /// Root directory of the local storage backend (overrides ATTACHMENTS_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Staging directory for uploads (overrides ATTACHMENTS_TEMP_DIR)
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,

    /// Octal permission bits for a newly created staging directory, e.g. 1777
    /// (overrides ATTACHMENTS_TEMP_DIR_MODE)
    #[arg(long)]
    pub temp_dir_mode: Option<String>,

    /// Maximum file size in bytes, 0 disables the check (overrides ATTACHMENTS_MAX_FILE_SIZE)
    #[arg(long)]
    pub max_file_size: Option<u64>,

    /// Whitespace separated extensions (overrides ATTACHMENTS_ALLOWED_FILE_EXTENSIONS)
    #[arg(long)]
    pub allowed_extensions: Option<String>,

    /// Newline separated file-type descriptions (overrides ATTACHMENTS_ALLOWED_FILE_TYPES)
    #[arg(long)]
    pub allowed_file_types: Option<String>,

    /// `.ext=mime,mime;.ext2=mime` (overrides ATTACHMENTS_MIME_OVERRIDES)
    #[arg(long)]
    pub mime_overrides: Option<String>,

    /// Expand zip uploads by default (overrides ATTACHMENTS_EXPAND_ARCHIVES)
    #[arg(long)]
    pub expand_archives: Option<bool>,

    /// Scan uploads with clamd (overrides ATTACHMENTS_CLAMD)
    #[arg(long)]
    pub clamd: Option<bool>,

    /// clamd unix socket (overrides ATTACHMENTS_CLAMD_SOCKET)
    #[arg(long)]
    pub clamd_socket: Option<PathBuf>,

    /// clamd TCP host; takes precedence over the socket (overrides ATTACHMENTS_CLAMD_HOST)
    #[arg(long)]
    pub clamd_host: Option<String>,

    /// clamd TCP port (overrides ATTACHMENTS_CLAMD_PORT)
    #[arg(long)]
    pub clamd_port: Option<u16>,

    /// clamd scan timeout in seconds (overrides ATTACHMENTS_CLAMD_TIMEOUT)
    #[arg(long)]
    pub clamd_timeout: Option<u64>,

    /// Move infected files here instead of deleting them (overrides ATTACHMENTS_QUARANTINE_PATH)
    #[arg(long)]
    pub quarantine_path: Option<PathBuf>,

    /// Always send Content-Disposition on downloads (overrides ATTACHMENTS_ALWAYS_DOWNLOAD)
    #[arg(long)]
    pub always_download: Option<bool>,

    /// Serve local files through X-Sendfile (overrides ATTACHMENTS_USE_SENDFILE)
    #[arg(long)]
    pub use_sendfile: Option<bool>,

    /// JSON file with property definitions (overrides ATTACHMENTS_PROPERTY_SCHEMA)
    #[arg(long)]
    pub property_schema: Option<PathBuf>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read and parse `ATTACHMENTS_<key>`; missing variables are `None`.
fn env_parse<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let name = format!("{}{}", ENV_PREFIX, key);
    match env(&name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("parsing {} value `{}`: {}", name, value, e)),
        None => Ok(None),
    }
}

fn env_bool(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
    let name = format!("{}{}", ENV_PREFIX, key);
    match env(&name) {
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" | "" => Ok(Some(false)),
            _ => bail!("parsing {} value `{}`: expected a boolean", name, value),
        },
        None => Ok(None),
    }
}

fn env_string(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    env(&format!("{}{}", ENV_PREFIX, key))
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        Self::resolve(Args::parse(), |key| env::var(key).ok())
    }

    /// Merge CLI arguments over `env` over defaults.
    pub fn resolve(args: Args, env: impl Fn(&str) -> Option<String>) -> Result<(Self, bool)> {
        let storage_backend = match args.storage_backend.or_else(|| env_string(&env, "STORAGE_BACKEND")) {
            Some(raw) => raw.parse()?,
            None => StorageBackend::Local,
        };
        let temp_dir_mode = match args.temp_dir_mode.or_else(|| env_string(&env, "TEMP_DIR_MODE")) {
            Some(raw) => Some(
                parse_mode(&raw).with_context(|| format!("invalid octal directory mode `{}`", raw))?,
            ),
            None => None,
        };
        let max_file_size = match args.max_file_size {
            Some(size) => size,
            None => env_parse(&env, "MAX_FILE_SIZE")?.unwrap_or(DEFAULT_MAX_FILE_SIZE),
        };

        let cfg = Self {
            host: args
                .host
                .or_else(|| env_string(&env, "HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: match args.port {
                Some(port) => port,
                None => env_parse(&env, "PORT")?.unwrap_or(3000),
            },
            database_url: args
                .database_url
                .or_else(|| env_string(&env, "DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/attachments.db".into()),
            storage_backend,
            storage_dir: args
                .storage_dir
                .or_else(|| env_string(&env, "STORAGE_DIR"))
                .unwrap_or_else(|| "./data/attachments".into()),
            temp_dir: args.temp_dir.or_else(|| env_string(&env, "TEMP_DIR").map(PathBuf::from)),
            temp_dir_mode,
            max_file_size: (max_file_size > 0).then_some(max_file_size),
            allowed_extensions: args
                .allowed_extensions
                .or_else(|| env_string(&env, "ALLOWED_FILE_EXTENSIONS"))
                .unwrap_or_default(),
            allowed_file_types: args
                .allowed_file_types
                .or_else(|| env_string(&env, "ALLOWED_FILE_TYPES"))
                .unwrap_or_default(),
            mime_overrides: args
                .mime_overrides
                .or_else(|| env_string(&env, "MIME_OVERRIDES"))
                .unwrap_or_default(),
            expand_archives: match args.expand_archives {
                Some(flag) => flag,
                None => env_bool(&env, "EXPAND_ARCHIVES")?.unwrap_or(false),
            },
            clamd_enabled: match args.clamd {
                Some(flag) => flag,
                None => env_bool(&env, "CLAMD")?.unwrap_or(false),
            },
            clamd_socket: args
                .clamd_socket
                .or_else(|| env_string(&env, "CLAMD_SOCKET").map(PathBuf::from)),
            clamd_host: args.clamd_host.or_else(|| env_string(&env, "CLAMD_HOST")),
            clamd_port: match args.clamd_port {
                Some(port) => port,
                None => env_parse(&env, "CLAMD_PORT")?.unwrap_or(3310),
            },
            clamd_timeout_secs: match args.clamd_timeout {
                Some(secs) => secs,
                None => env_parse(&env, "CLAMD_TIMEOUT")?.unwrap_or(30),
            },
            quarantine_dir: args
                .quarantine_path
                .or_else(|| env_string(&env, "QUARANTINE_PATH").map(PathBuf::from)),
            always_download: match args.always_download {
                Some(flag) => flag,
                None => env_bool(&env, "ALWAYS_DOWNLOAD")?.unwrap_or(false),
            },
            use_sendfile: match args.use_sendfile {
                Some(flag) => flag,
                None => env_bool(&env, "USE_SENDFILE")?.unwrap_or(false),
            },
            property_schema: args
                .property_schema
                .or_else(|| env_string(&env, "PROPERTY_SCHEMA").map(PathBuf::from)),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validator(&self) -> UploadValidator {
        UploadValidator::new(self.max_file_size, parse_mime_overrides(&self.mime_overrides))
    }

    pub fn default_policy(&self) -> ValidationPolicy {
        ValidationPolicy::from_lists(
            &self.allowed_extensions,
            &self.allowed_file_types,
            self.expand_archives,
        )
    }

    /// `None` when scanning is disabled. TCP wins when a host is configured.
    pub fn clamd_transport(&self) -> Option<ClamdTransport> {
        if !self.clamd_enabled {
            return None;
        }
        Some(match &self.clamd_host {
            Some(host) => ClamdTransport::Tcp {
                host: host.clone(),
                port: self.clamd_port,
            },
            None => ClamdTransport::Socket(self.clamd_socket.clone().unwrap_or_else(default_socket)),
        })
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            default_policy: self.default_policy(),
            quarantine_dir: self.quarantine_dir.clone(),
            always_download: self.always_download,
            use_sendfile: self.use_sendfile,
        }
    }

    /// Request body cap: the file size limit plus 1 MiB for multipart framing
    /// and form fields.
    pub fn body_limit(&self) -> usize {
        const SLACK: u64 = 1024 * 1024;
        let limit = self.max_file_size.unwrap_or(1024 * 1024 * 1024) + SLACK;
        usize::try_from(limit).unwrap_or(usize::MAX)
    }
}
