use std::sync::Arc;

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::rngs::OsRng;
use tracing::error;

use crate::config::HashingConfig;

const DUMMY_PASSWORD: &str = "easyexpense-timing-equaliser";

/// Argon2id hasher producing self-describing PHC strings
/// (`$argon2id$v=19$m=..,t=..,p=..$salt$hash`).
///
/// Rows written by the PHP signup page hold bcrypt MCF strings (`$2y$..`);
/// those still verify, but new hashes are always argon2id.
#[derive(Clone)]
pub struct CredentialHasher {
    argon2: Argon2<'static>,
    dummy_hash: Arc<str>,
}

impl CredentialHasher {
    pub fn new(config: &HashingConfig) -> anyhow::Result<Self> {
        let params = Params::new(
            config.memory_kib,
            config.iterations,
            config.parallelism,
            None,
        )
        .map_err(|e| anyhow::anyhow!("invalid argon2 parameters: {e}"))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let dummy_hash = hash_with(&argon2, DUMMY_PASSWORD)?;
        Ok(Self {
            argon2,
            dummy_hash: dummy_hash.into(),
        })
    }

    pub fn hash(&self, plain: &str) -> anyhow::Result<String> {
        hash_with(&self.argon2, plain)
    }

    /// Verification reads the parameters and salt from `hash` itself.
    pub fn verify(&self, plain: &str, hash: &str) -> anyhow::Result<bool> {
        if is_bcrypt(hash) {
            return bcrypt::verify(plain, hash).map_err(|e| {
                error!(error = %e, "bcrypt verify error");
                anyhow::anyhow!(e.to_string())
            });
        }
        let parsed = PasswordHash::new(hash).map_err(|e| {
            error!(error = %e, "argon2 parse hash error");
            anyhow::anyhow!(e.to_string())
        })?;
        Ok(self
            .argon2
            .verify_password(plain.as_bytes(), &parsed)
            .is_ok())
    }

    /// Burn one verification against a fixed hash so an unknown email costs
    /// the same as a wrong password.
    pub fn verify_dummy(&self, plain: &str) {
        let _ = self.verify(plain, &self.dummy_hash);
    }
}

fn hash_with(argon2: &Argon2<'_>, plain: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = argon2
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| {
            error!(error = %e, "argon2 hash_password error");
            anyhow::anyhow!(e.to_string())
        })?
        .to_string();
    Ok(hash)
}

// $2a$, $2b$, $2x$, $2y$
fn is_bcrypt(hash: &str) -> bool {
    hash.starts_with("$2")
}

#[cfg(test)]
pub(crate) fn test_hasher() -> CredentialHasher {
    CredentialHasher::new(&HashingConfig {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    })
    .expect("cheap argon2 params")
}
