use std::{fmt, path::PathBuf};

use anyhow::{bail, Context};
use argon2::Params;
use sqlx::postgres::PgConnectOptions;

#[derive(Clone)]
pub struct PostgresConfig {
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    /// `DATABASE_URL` wins; otherwise the discrete `DB_*` settings are used.
    pub fn connect_options(&self) -> anyhow::Result<PgConnectOptions> {
        if let Some(url) = &self.database_url {
            return url.parse::<PgConnectOptions>().context("parse DATABASE_URL");
        }
        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database))
    }
}

impl fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("database_url", &self.database_url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum BackendConfig {
    File { path: PathBuf },
    Postgres(PostgresConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashingConfig {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
            parallelism: Params::DEFAULT_P_COST,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub hashing: HashingConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend = match var("CREDENTIAL_BACKEND")
            .map(|v| v.trim().to_lowercase())
            .as_deref()
        {
            None | Some("file") => BackendConfig::File {
                path: var("USERS_FILE")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("data/users.txt")),
            },
            Some("postgres") | Some("pg") | Some("relational") => {
                BackendConfig::Postgres(PostgresConfig {
                    database_url: var("DATABASE_URL"),
                    host: var("DB_HOST").unwrap_or_else(|| "127.0.0.1".into()),
                    port: parse_or(&var, "DB_PORT", 5432)?,
                    user: var("DB_USER").unwrap_or_else(|| "postgres".into()),
                    password: lookup("DB_PASS").unwrap_or_default(),
                    database: var("DB_NAME").unwrap_or_else(|| "easyexpense".into()),
                    max_connections: parse_or(&var, "DATABASE_MAX_CONNECTIONS", 10)?,
                })
            }
            Some(other) => bail!("unknown CREDENTIAL_BACKEND `{other}` (expected `file` or `postgres`)"),
        };

        let defaults = HashingConfig::default();
        let hashing = HashingConfig {
            memory_kib: parse_or(&var, "PASSWORD_HASH_MEMORY_KIB", defaults.memory_kib)?,
            iterations: parse_or(&var, "PASSWORD_HASH_ITERATIONS", defaults.iterations)?,
            parallelism: parse_or(&var, "PASSWORD_HASH_PARALLELISM", defaults.parallelism)?,
        };

        Ok(Self { backend, hashing })
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value for {key}: `{raw}`")),
        None => Ok(default),
    }
}
