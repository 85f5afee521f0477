use anyhow::Context;
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{debug, instrument, warn};

use crate::{
    config::PostgresConfig,
    credentials::{
        error::StoreError,
        repo_types::{email_key, NewUser, UserRecord},
        CredentialBackend,
    },
};

/// Credentials in the `users` table. Uniqueness is enforced by the unique
/// index on `email_key`, never by a pre-check. The key is folded here rather
/// than with SQL `lower()`, whose result depends on the database locale.
#[derive(Clone)]
pub struct PgCredentialStore {
    db: PgPool,
}

impl PgCredentialStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn connect(config: &PostgresConfig) -> anyhow::Result<Self> {
        let db = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(config.connect_options()?)
            .await
            .context("connect to database")?;
        Ok(Self { db })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.db).await?;
        Ok(())
    }
}

#[async_trait]
impl CredentialBackend for PgCredentialStore {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    #[instrument(skip(self, new_user), fields(email = %new_user.email))]
    async fn register(&self, new_user: NewUser) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO users (name, email, email_key, password_hash)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&new_user.name)
        .bind(&new_user.email)
        .bind(email_key(&new_user.email))
        .bind(&new_user.password_hash)
        .fetch_one(&self.db)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                warn!("email already registered");
                StoreError::DuplicateEmail
            }
            other => StoreError::Database(other),
        })?;
        debug!(user_id = id, "user row inserted");
        Ok(id)
    }

    async fn lookup_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        let user = sqlx::query_as::<_, UserRecord>(
            r#"
            SELECT id, name, email, password_hash
            FROM users
            WHERE email_key = $1
            "#,
        )
        .bind(email_key(email))
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }
}
