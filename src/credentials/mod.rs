use async_trait::async_trait;

pub mod codec;
pub mod dto;
pub mod error;
pub mod file_repo;
pub mod password;
pub mod pg_repo;
pub mod repo_types;
pub mod services;

use error::StoreError;
use repo_types::{NewUser, UserRecord};

/// Persistence seam shared by the relational and the file backend.
///
/// Implementations must guarantee case-insensitive email uniqueness and
/// strictly increasing, never reused ids, even under concurrent `register`.
#[async_trait]
pub trait CredentialBackend: Send + Sync {
    /// Short name used in logs.
    fn kind(&self) -> &'static str;

    /// Persist a user and return the id the backend assigned.
    async fn register(&self, new_user: NewUser) -> Result<i64, StoreError>;

    async fn lookup_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError>;
}
