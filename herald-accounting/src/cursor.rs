//! Opaque accounting feed cursors.
//!
//! A cursor pins a byte position inside one append-only file by
//! `(path, inode, offset, mtime)`. The encoded form is base64-url JSON so it
//! can travel through query strings and the offsets table unchanged. Clients
//! treat it as opaque; only the tailer interprets it.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use crate::error::{AcctError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub path: String,
    pub inode: u64,
    pub offset: u64,
    /// Mtime (epoch seconds) of the file when the cursor was taken. Used to
    /// order candidate successor files, not for invalidation.
    pub mtime: i64,
}

impl Cursor {
    #[must_use]
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Decode an encoded cursor.
    ///
    /// # Errors
    /// [`AcctError::InvalidCursor`] when the token is not base64-url JSON of
    /// the expected shape.
    pub fn decode(token: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|e| AcctError::InvalidCursor(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| AcctError::InvalidCursor(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_roundtrip() {
        let cursor = Cursor {
            path: "/var/log/pmta/acct-20260101.csv".to_string(),
            inode: 123_456,
            offset: 789,
            mtime: 1_772_000_000,
        };
        let encoded = cursor.encode();
        assert!(!encoded.contains('='));
        assert_eq!(Cursor::decode(&encoded).unwrap(), cursor);
    }

    #[test]
    fn test_invalid_cursor() {
        assert!(matches!(
            Cursor::decode("!!not base64!!"),
            Err(AcctError::InvalidCursor(_))
        ));
        assert!(matches!(
            Cursor::decode(&URL_SAFE_NO_PAD.encode(b"[1,2]")),
            Err(AcctError::InvalidCursor(_))
        ));
    }
}
