//! Opaque pagination cursors.
//!
//! A cursor is the sort mode plus the (value, set id) of the last item
//! returned, serialized as JSON and base64url encoded. It only resumes the
//! sort mode it was issued for.

use crate::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortMode {
    DateAsc,
    #[default]
    DateDesc,
    E1rmDesc,
    VolumeDesc,
}

impl SortMode {
    pub const ALL: [SortMode; 4] = [
        SortMode::DateAsc,
        SortMode::DateDesc,
        SortMode::E1rmDesc,
        SortMode::VolumeDesc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SortMode::DateAsc => "date_asc",
            SortMode::DateDesc => "date_desc",
            SortMode::E1rmDesc => "e1rm_desc",
            SortMode::VolumeDesc => "volume_desc",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| Error::invalid(format!("unknown sort mode: {}", s)))
    }

    /// Whether the store can order on this mode natively
    pub fn is_native(&self) -> bool {
        matches!(self, SortMode::DateAsc | SortMode::DateDesc)
    }
}

impl fmt::Display for SortMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QueryCursor {
    pub sort: SortMode,
    pub last_value: f64,
    /// Tie-breaker between items sharing `last_value`
    pub last_id: String,
}

impl QueryCursor {
    pub fn new(sort: SortMode, last_value: f64, last_id: impl Into<String>) -> Self {
        Self {
            sort,
            last_value,
            last_id: last_id.into(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(token: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|e| Error::invalid(format!("malformed cursor: {}", e)))?;
        serde_json::from_slice(&bytes).map_err(|e| Error::invalid(format!("malformed cursor: {}", e)))
    }

    /// Decode and check the cursor belongs to `sort`
    pub fn decode_for(token: &str, sort: SortMode) -> Result<Self> {
        let cursor = Self::decode(token)?;
        if cursor.sort != sort {
            return Err(Error::invalid(format!(
                "cursor was issued for sort {} but the request sorts by {}",
                cursor.sort, sort
            )));
        }
        Ok(cursor)
    }
}
