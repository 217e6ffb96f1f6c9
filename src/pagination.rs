use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, AppResult};

/// Opaque list cursor: the sort value of the last row plus its id as the
/// deterministic tie-break.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub sort_value: Value,
    pub id: i64,
}

impl Cursor {
    pub fn new(sort_value: Value, id: i64) -> Self {
        Self { sort_value, id }
    }

    pub fn encode(&self) -> String {
        let payload = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(payload)
    }

    pub fn decode(raw: &str) -> AppResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|_| AppError::BadRequest("Malformed cursor".into()))?;
        serde_json::from_slice(&bytes).map_err(|_| AppError::BadRequest("Malformed cursor".into()))
    }
}

/// Clamp a caller-supplied page size into a sane window.
pub fn page_limit(requested: Option<i64>) -> i64 {
    requested.unwrap_or(50).clamp(1, 200)
}

#[cfg(test)]
mod tests {
    use super::{page_limit, Cursor};
    use serde_json::json;

    #[test]
    fn cursor_round_trips() {
        let cursor = Cursor::new(json!("2024-03-01T00:00:00Z"), 42);
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn cursor_round_trips_numeric_sort_values() {
        let cursor = Cursor::new(json!(17), 3);
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded.id, 3);
        assert_eq!(decoded.sort_value, json!(17));
    }

    #[test]
    fn malformed_cursor_is_rejected() {
        assert!(Cursor::decode("not base64 at all!").is_err());
        assert!(Cursor::decode("aGVsbG8").is_err());
    }

    #[test]
    fn limits_are_clamped() {
        assert_eq!(page_limit(None), 50);
        assert_eq!(page_limit(Some(0)), 1);
        assert_eq!(page_limit(Some(10_000)), 200);
    }
}
