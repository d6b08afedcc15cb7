// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cursor pagination shared by the list builders.
//!
//! A cursor is URL-safe base64 of a JSON document holding the original query
//! plus the key of the last item returned, so a page can be resumed without
//! the caller repeating its filters.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CoreError, Result};

/// Page size when none is requested.
pub const DEFAULT_LIMIT: usize = 100;

/// Largest page size accepted.
pub const MAX_LIMIT: usize = 1000;

/// One page of results.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// Items of this page.
    pub items: Vec<T>,
    /// Cursor for the next page; `None` on the last page.
    pub cursor: Option<String>,
}

impl<T> Page<T> {
    /// Whether another page follows.
    pub fn has_more(&self) -> bool {
        self.cursor.is_some()
    }
}

/// Clamp a requested limit into `1..=MAX_LIMIT`.
pub fn clamp_limit(limit: usize) -> usize {
    match limit {
        0 => DEFAULT_LIMIT,
        n => n.min(MAX_LIMIT),
    }
}

/// Encode a cursor document.
pub fn encode_cursor<T: Serialize>(cursor: &T) -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(cursor)?))
}

/// Decode a cursor document.
pub fn decode_cursor<T: DeserializeOwned>(cursor: &str) -> Result<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor.trim())
        .map_err(|e| CoreError::validation("cursor", format!("malformed cursor: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| CoreError::validation("cursor", format!("malformed cursor: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Position {
        after: String,
        limit: usize,
    }

    #[test]
    fn test_cursor_is_url_safe() {
        let cursor = encode_cursor(&Position {
            after: "a/b+c?".to_string(),
            limit: 10,
        })
        .unwrap();
        assert!(
            cursor
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );

        let decoded: Position = decode_cursor(&cursor).unwrap();
        assert_eq!(decoded.after, "a/b+c?");
    }

    #[test]
    fn test_malformed_cursor_is_validation_error() {
        let err = decode_cursor::<Position>("!!!").unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let not_json = URL_SAFE_NO_PAD.encode(b"nope");
        assert!(decode_cursor::<Position>(&not_json).is_err());
    }

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(0), DEFAULT_LIMIT);
        assert_eq!(clamp_limit(5), 5);
        assert_eq!(clamp_limit(MAX_LIMIT + 1), MAX_LIMIT);
    }
}
