//! Purpose: Shared page metadata JSON serializers for the CLI.
//! Exports: `page_info_json` and `header_json`.
//! Role: Keep page metadata envelope shape consistent across `pages` and `inspect`.
//! Invariants: Stable key names/order for page info payloads.

use filebuffer::api::{Error, PageHeader, PageInfo, format_millis};
use serde_json::{Map, Value, json};

pub(crate) fn header_json(header: &PageHeader) -> Value {
    json!({
        "page_index": header.page_index,
        "write_limit": header.write_limit,
    })
}

pub(crate) fn page_info_json(info: &PageInfo) -> Result<Value, Error> {
    let mut map = Map::new();
    map.insert("timestamp".to_string(), json!(info.timestamp));
    map.insert("time".to_string(), json!(format_millis(info.timestamp)?));
    map.insert("path".to_string(), json!(info.path.display().to_string()));
    map.insert("capacity".to_string(), json!(info.capacity));
    map.insert("page_index".to_string(), json!(info.page_index));
    map.insert("write_limit".to_string(), json!(info.write_limit));
    Ok(Value::Object(map))
}
