//! Opaque position cursors for keyset pagination.
//!
//! A cursor is the URL-safe base64 of a small JSON document naming the
//! sort key of the last row a caller has seen. Queries resume strictly
//! after that key, so rows inserted or updated between page fetches never
//! shift the window the way an offset would.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::DatabaseError;

/// Position in `cities` ordered by `last_refreshed_at DESC, name ASC`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshedPosition {
    #[serde(rename = "t")]
    pub last_refreshed_at: String,
    #[serde(rename = "n")]
    pub name: String,
}

/// Position in a job's `task_results` ordered by `city_name ASC`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPosition {
    #[serde(rename = "n")]
    pub city_name: String,
}

pub fn encode<T: Serialize>(position: &T) -> Result<String, DatabaseError> {
    let json = serde_json::to_vec(position).map_err(|_| DatabaseError::InvalidCursor)?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

pub fn decode<T: DeserializeOwned>(cursor: &str) -> Result<T, DatabaseError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor.trim())
        .map_err(|_| DatabaseError::InvalidCursor)?;
    serde_json::from_slice(&bytes).map_err(|_| DatabaseError::InvalidCursor)
}
