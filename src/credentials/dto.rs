use serde::Serialize;

use crate::credentials::repo_types::UserRecord;

/// Returned after a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegisteredUser {
    pub id: i64,
}

/// Public part of the user returned after authentication. Never carries the hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublicUser {
    pub id: i64,
    pub name: String,
    pub email: String,
}

impl From<UserRecord> for PublicUser {
    fn from(user: UserRecord) -> Self {
        Self {
            id: user.id,
            name: user.name,
            email: user.email,
        }
    }
}
