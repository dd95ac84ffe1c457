// Opaque keyset cursors
//
// A cursor captures the sort spec it was issued for plus the (value, id) of
// the last row returned. Reusing a cursor with a different sort is rejected
// rather than silently returning a mis-positioned page.

use super::{QueryError, QueryResult};
use crate::db::records_db::SortKey;
use crate::models::SortSpec;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CursorPayload {
    sort: SortSpec,
    key: SortKey,
}

pub fn encode_cursor(sort: &SortSpec, key: &SortKey) -> String {
    let payload = CursorPayload {
        sort: *sort,
        key: key.clone(),
    };
    // Serializing plain strings and enums cannot fail
    let json = serde_json::to_vec(&payload).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

pub fn decode_cursor(cursor: &str, sort: &SortSpec) -> QueryResult<SortKey> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|e| QueryError::InvalidCursor(format!("not base64: {}", e)))?;
    let payload: CursorPayload = serde_json::from_slice(&bytes)
        .map_err(|e| QueryError::InvalidCursor(format!("malformed payload: {}", e)))?;

    if payload.sort != *sort {
        return Err(QueryError::InvalidCursor(format!(
            "cursor was issued for sort {} {:?}, request uses {} {:?}",
            payload.sort.field, payload.sort.direction, sort.field, sort.direction
        )));
    }

    Ok(payload.key)
}
