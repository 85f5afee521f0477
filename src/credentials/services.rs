use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, instrument, warn};

use crate::{
    config::{AppConfig, BackendConfig},
    credentials::{
        dto::{PublicUser, RegisteredUser},
        error::{CredentialError, CredentialResult, StoreError},
        file_repo::FileCredentialStore,
        password::CredentialHasher,
        pg_repo::PgCredentialStore,
        repo_types::NewUser,
        CredentialBackend,
    },
};

/// Backend-agnostic registration and authentication.
///
/// Validation, hashing and the error contract live here once; the backend
/// only persists and looks up.
#[derive(Clone)]
pub struct CredentialService {
    backend: Arc<dyn CredentialBackend>,
    hasher: CredentialHasher,
}

impl CredentialService {
    pub fn new(backend: Arc<dyn CredentialBackend>, hasher: CredentialHasher) -> Self {
        Self { backend, hasher }
    }

    /// Open the configured backend, running migrations or creating the
    /// users file directory as needed.
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let hasher = CredentialHasher::new(&config.hashing)?;
        let backend: Arc<dyn CredentialBackend> = match &config.backend {
            BackendConfig::File { path } => {
                let store = FileCredentialStore::new(path);
                store
                    .prepare()
                    .await
                    .with_context(|| format!("prepare users file {}", path.display()))?;
                Arc::new(store)
            }
            BackendConfig::Postgres(pg) => {
                let store = PgCredentialStore::connect(pg).await?;
                store.migrate().await.context("run migrations")?;
                Arc::new(store)
            }
        };
        Ok(Self::new(backend, hasher))
    }

    pub fn backend_kind(&self) -> &'static str {
        self.backend.kind()
    }

    #[instrument(skip(self, password), fields(backend = self.backend.kind()))]
    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> CredentialResult<RegisteredUser> {
        let name = name.trim();
        let email = email.trim();

        if name.is_empty() {
            warn!("register without name");
            return Err(CredentialError::validation("Name is required"));
        }
        if email.is_empty() {
            warn!("register without email");
            return Err(CredentialError::validation("Email is required"));
        }
        if password.is_empty() {
            warn!("register without password");
            return Err(CredentialError::validation("Password is required"));
        }

        let password = password.to_owned();
        let password_hash = self
            .with_hasher(move |hasher| hasher.hash(&password))
            .await?
            .map_err(|e| {
                error!(error = %e, "hash_password failed");
                CredentialError::from(StoreError::Hashing(e.to_string()))
            })?;

        let id = self
            .backend
            .register(NewUser {
                name: name.to_owned(),
                email: email.to_owned(),
                password_hash,
            })
            .await
            .map_err(|err| {
                match &err {
                    StoreError::DuplicateEmail => warn!(email = %email, "email already registered"),
                    other => error!(error = %other, "register failed"),
                }
                CredentialError::from(err)
            })?;

        info!(user_id = id, email = %email, "user registered");
        Ok(RegisteredUser { id })
    }

    #[instrument(skip(self, password), fields(backend = self.backend.kind()))]
    pub async fn authenticate(&self, email: &str, password: &str) -> CredentialResult<PublicUser> {
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            warn!("login with empty email or password");
            return Err(CredentialError::InvalidCredentials);
        }

        let user = match self.backend.lookup_by_email(email).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                warn!(email = %email, "login unknown email");
                let password = password.to_owned();
                if let Err(e) = self
                    .with_hasher(move |hasher| hasher.verify_dummy(&password))
                    .await
                {
                    error!(error = %e, "dummy verification worker failed");
                }
                return Err(CredentialError::InvalidCredentials);
            }
            Err(err) => {
                error!(error = %err, "lookup_by_email failed");
                return Err(err.into());
            }
        };

        let password = password.to_owned();
        let hash = user.password_hash.clone();
        let verified = self
            .with_hasher(move |hasher| hasher.verify(&password, &hash))
            .await?;

        match verified {
            Ok(true) => {
                info!(user_id = user.id, email = %user.email, "user logged in");
                Ok(PublicUser::from(user))
            }
            Ok(false) => {
                warn!(email = %email, user_id = user.id, "login invalid password");
                Err(CredentialError::InvalidCredentials)
            }
            Err(e) => {
                error!(error = %e, user_id = user.id, "stored password hash unreadable");
                Err(CredentialError::InvalidCredentials)
            }
        }
    }

    /// Hashing is CPU-bound; keep it off the async workers. A failed worker
    /// is reported as the store being unavailable.
    async fn with_hasher<T, F>(&self, f: F) -> CredentialResult<T>
    where
        F: FnOnce(&CredentialHasher) -> T + Send + 'static,
        T: Send + 'static,
    {
        let hasher = self.hasher.clone();
        tokio::task::spawn_blocking(move || f(&hasher))
            .await
            .map_err(|e| {
                error!(error = %e, "hasher worker failed");
                CredentialError::from(StoreError::Worker(e))
            })
    }
}
