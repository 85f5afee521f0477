use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Stored user record, identical for both backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct UserRecord {
    pub id: i64,               // assigned by the backend, never reused
    pub name: String,          // display name
    pub email: String,         // natural key, compared case-insensitively
    pub password_hash: String, // argon2 PHC string, or bcrypt for legacy rows
}

/// A user about to be persisted; the backend assigns the id.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password_hash: String,
}

impl NewUser {
    pub(crate) fn with_id(self, id: i64) -> UserRecord {
        UserRecord {
            id,
            name: self.name,
            email: self.email,
            password_hash: self.password_hash,
        }
    }
}

/// Uniqueness key for an email: full Unicode lowercase.
///
/// Both backends compare through this, so folding never depends on a
/// database locale.
pub(crate) fn email_key(email: &str) -> String {
    email.to_lowercase()
}

pub(crate) fn emails_match(a: &str, b: &str) -> bool {
    email_key(a) == email_key(b)
}
