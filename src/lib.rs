//! Identity and credential store for EasyExpense.
//!
//! A [`CredentialService`] registers and authenticates users against either a
//! Postgres `users` table or a shared newline-delimited JSON file. Both
//! backends give the same guarantees: case-insensitive unique emails,
//! monotonically assigned ids and argon2 password hashes.

pub mod config;
pub mod credentials;
pub mod telemetry;

pub use config::{AppConfig, BackendConfig, HashingConfig, PostgresConfig};
pub use credentials::{
    dto::{PublicUser, RegisteredUser},
    error::{CredentialError, CredentialResult, StoreError},
    file_repo::FileCredentialStore,
    password::CredentialHasher,
    pg_repo::PgCredentialStore,
    repo_types::{NewUser, UserRecord},
    services::CredentialService,
    CredentialBackend,
};
