use chrono::{Local, NaiveDate, Utc};
use sha2::{Digest, Sha256};

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn today_iso() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

/// Timestamp token used when an order id has to be synthesized
/// (`ORDER_<token>` / `ERROR_<token>`).
pub fn order_token() -> String {
    Utc::now().format("%Y%m%d%H%M%S%3f").to_string()
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Object keys arrive URL-encoded, with spaces folded into `+`.
pub fn decode_object_key(key: &str) -> String {
    let unplussed = key.replace('+', " ");
    match urlencoding::decode(&unplussed) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => unplussed,
    }
}

pub fn file_name_from_key(key: &str) -> String {
    key.rsplit('/').next().unwrap_or(key).to_string()
}

pub fn normalize_date(value: &str) -> Option<String> {
    let raw = value.trim();
    if raw.is_empty() {
        return None;
    }

    let formats = [
        "%Y-%m-%d",
        "%Y/%m/%d",
        "%Y.%m.%d",
        "%d.%m.%Y",
        "%d/%m/%Y",
        "%Y年%m月%d日",
    ];
    for fmt in formats.iter() {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    None
}
