use std::{sync::Arc, time::Duration};

use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

use crate::{
    pool::PoolOptions,
    postgres_storage::PostgresStore,
    sqlite_storage::SqliteStore,
    storage::{Database, MemoryStore, StoreError},
};

#[derive(Parser, Debug)]
#[command(name = "bankstore", about = "Bankstore - atomic fund transfers between accounts")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "bankstore.toml")]
    pub config: String,

    /// Storage backend (overrides config file)
    #[arg(short, long, value_enum)]
    pub backend: Option<Backend>,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Print results as JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Open a new account
    CreateAccount {
        owner: String,
        #[arg(long, default_value_t = 0)]
        balance: i64,
        #[arg(long, default_value = "USD")]
        currency: String,
    },
    /// Show one account
    Account { id: i64 },
    /// List the ledger entries of one account
    Entries { account_id: i64 },
    /// Move funds between two accounts
    Transfer {
        from: i64,
        to: i64,
        amount: i64,
        /// Label attached to every log line of this transfer
        #[arg(long)]
        label: Option<String>,
        /// Give up after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Run many transfers concurrently between two accounts
    Stress {
        from: i64,
        to: i64,
        #[arg(long, default_value_t = 1)]
        amount: i64,
        #[arg(long, default_value_t = 10)]
        workers: usize,
        #[arg(long, default_value_t = 10)]
        per_worker: usize,
        /// Alternate the direction of every other worker
        #[arg(long)]
        alternate: bool,
    },
}

#[derive(ValueEnum, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Memory,
    Sqlite,
    Postgres,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_database")]
    pub database: DatabaseConfig,

    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_backend")]
    pub backend: Backend,

    /// SQLite database file.
    #[serde(default = "default_sqlite_path")]
    pub path: String,

    /// PostgreSQL connection string.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_max_idle")]
    pub max_idle: usize,

    /// Upper bound on connections open at once.
    #[serde(default = "default_max_open")]
    pub max_open: usize,

    #[serde(default = "default_pool_timeout_ms")]
    pub pool_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_database() -> DatabaseConfig {
    DatabaseConfig {
        backend: default_backend(),
        path: default_sqlite_path(),
        url: None,
        lock_timeout_ms: default_lock_timeout_ms(),
        max_idle: default_max_idle(),
        max_open: default_max_open(),
        pool_timeout_ms: default_pool_timeout_ms(),
    }
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        json: false,
    }
}

fn default_backend() -> Backend {
    Backend::Memory
}

fn default_sqlite_path() -> String {
    "bankstore.db".to_string()
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

fn default_max_idle() -> usize {
    8
}

fn default_max_open() -> usize {
    16
}

fn default_pool_timeout_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: default_database(),
            logging: default_logging(),
        }
    }
}

impl Config {
    pub fn load(cli: &CliArgs) -> Self {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse config file: {}", e);
                Config::default()
            }),
            Err(_) => Config::default(),
        };

        // CLI overrides
        if let Some(backend) = cli.backend {
            config.database.backend = backend;
        }
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }

        config
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.database.lock_timeout_ms)
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_idle: self.database.max_idle.min(self.database.max_open),
            max_open: self.database.max_open,
            checkout_timeout: Duration::from_millis(self.database.pool_timeout_ms),
        }
    }

    /// Opens the configured backend.
    pub fn open_database(&self) -> Result<Arc<dyn Database>, StoreError> {
        let db = &self.database;
        let lock_timeout = self.lock_timeout();
        let opened: Arc<dyn Database> = match db.backend {
            Backend::Memory => Arc::new(MemoryStore::with_lock_timeout(lock_timeout)),
            Backend::Sqlite => Arc::new(SqliteStore::with_options(&db.path, lock_timeout, self.pool_options())?),
            Backend::Postgres => {
                let url = db.url.as_deref().ok_or_else(|| {
                    StoreError::Connection("database.url is required for the postgres backend".to_string())
                })?;
                Arc::new(PostgresStore::with_options(url, lock_timeout, self.pool_options())?)
            }
        };
        tracing::info!(backend = opened.name(), "Database opened");
        Ok(opened)
    }
}
