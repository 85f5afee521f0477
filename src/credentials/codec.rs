//! Line codec for the users file: one JSON object per line.
//!
//! `{"id":1,"name":"Ada","email":"ada@example.com","password_hash":"$argon2id$..."}`

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::credentials::repo_types::UserRecord;

/// Why a stored line could not be turned into a [`UserRecord`].
#[derive(Debug, Error)]
pub enum MalformedRecord {
    #[error("not a JSON object: {0}")]
    Syntax(#[from] serde_json::Error),

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("id is not a positive integer")]
    InvalidId,

    /// Trailing fragment left by an interrupted write.
    #[error("line is not newline-terminated")]
    Unterminated,
}

#[derive(Deserialize)]
struct RawRecord {
    id: Option<Value>,
    name: Option<String>,
    email: Option<String>,
    password_hash: Option<String>,
}

/// A decoded line together with its 1-based position in the file.
#[derive(Debug)]
pub struct DecodedLine {
    pub line_no: usize,
    pub record: Result<UserRecord, MalformedRecord>,
}

/// Encode a user as a single line of JSON, without the trailing newline.
pub fn encode(user: &UserRecord) -> Result<String, serde_json::Error> {
    serde_json::to_string(user)
}

/// Decode one line. Never panics; anything unusable is `MalformedRecord`.
pub fn decode(line: &str) -> Result<UserRecord, MalformedRecord> {
    let raw: RawRecord = serde_json::from_str(line.trim())?;

    let id = raw
        .id
        .as_ref()
        .ok_or(MalformedRecord::MissingField("id"))
        .and_then(parse_id)?;
    let email = non_empty(raw.email).ok_or(MalformedRecord::MissingField("email"))?;
    let password_hash =
        non_empty(raw.password_hash).ok_or(MalformedRecord::MissingField("password_hash"))?;

    Ok(UserRecord {
        id,
        name: raw.name.unwrap_or_default(),
        email,
        password_hash,
    })
}

/// Split file contents into decoded lines, skipping blank ones.
///
/// A final line without `\n` is reported as [`MalformedRecord::Unterminated`]
/// unless `include_unterminated` is set, in which case it is decoded like any
/// other line.
pub fn decode_store(contents: &str, include_unterminated: bool) -> Vec<DecodedLine> {
    contents
        .split_inclusive('\n')
        .enumerate()
        .filter_map(|(idx, raw)| {
            let terminated = raw.ends_with('\n');
            let line = raw.trim_end_matches(|c: char| c == '\n' || c == '\r');
            if line.trim().is_empty() {
                return None;
            }
            let record = if terminated || include_unterminated {
                decode(line)
            } else {
                Err(MalformedRecord::Unterminated)
            };
            Some(DecodedLine {
                line_no: idx + 1,
                record,
            })
        })
        .collect()
}

fn parse_id(value: &Value) -> Result<i64, MalformedRecord> {
    let id = match value {
        Value::Number(n) => n.as_i64(),
        // older writers stored numeric strings
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    id.filter(|id| *id > 0).ok_or(MalformedRecord::InvalidId)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
