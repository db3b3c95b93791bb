use clap::{Parser, ValueEnum};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

pub const BASE_URL_ENV: &str = "SNIP_BASE_URL";
pub const STORAGE_BACKEND_ENV: &str = "SNIP_STORAGE_BACKEND";
pub const MYSQL_DSN_ENV: &str = "SNIP_MYSQL_DSN";
pub const FILE_STORAGE_PATH_ENV: &str = "SNIP_FILE_STORAGE_PATH";
pub const WORKERS_ENV: &str = "SNIP_WORKERS";
pub const QUEUE_SIZE_ENV: &str = "SNIP_QUEUE_SIZE";
pub const DELETE_BATCH_SIZE_ENV: &str = "SNIP_DELETE_BATCH_SIZE";
pub const LOG_JSON_ENV: &str = "SNIP_LOG_JSON";

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_FILE_STORAGE_PATH: &str = "./storage.txt";
pub const DEFAULT_WORKERS: &str = "4";
pub const DEFAULT_QUEUE_SIZE: &str = "100";
pub const DEFAULT_DELETE_BATCH_SIZE: &str = "10";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageBackendArg {
    #[value(name = "in-memory")]
    InMemory,
    #[value(name = "mysql")]
    Mysql,
}

impl Display for StorageBackendArg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackendArg::InMemory => write!(f, "in-memory"),
            StorageBackendArg::Mysql => write!(f, "mysql"),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "snipd")]
pub struct CLI {
    #[arg(long, env = BASE_URL_ENV, default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    #[arg(
        long,
        env = STORAGE_BACKEND_ENV,
        value_enum,
        default_value_t = StorageBackendArg::InMemory
    )]
    pub storage: StorageBackendArg,

    #[arg(long, env = MYSQL_DSN_ENV, required_if_eq("storage", "mysql"))]
    pub mysql_dsn: Option<String>,

    /// Snapshot file used by the in-memory backend.
    #[arg(long, env = FILE_STORAGE_PATH_ENV, default_value = DEFAULT_FILE_STORAGE_PATH)]
    pub file_storage_path: PathBuf,

    #[arg(long, env = WORKERS_ENV, default_value = DEFAULT_WORKERS)]
    pub workers: usize,

    #[arg(long, env = QUEUE_SIZE_ENV, default_value = DEFAULT_QUEUE_SIZE)]
    pub queue_size: usize,

    #[arg(long, env = DELETE_BATCH_SIZE_ENV, default_value = DEFAULT_DELETE_BATCH_SIZE)]
    pub delete_batch_size: usize,

    /// Emit logs as JSON lines.
    #[arg(long, env = LOG_JSON_ENV)]
    pub log_json: bool,
}
