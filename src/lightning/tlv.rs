use std::fmt;

use serde::{Deserialize, Serialize};

/// Boostagram payload (podcasting 2.0 convention), hex-encoded JSON.
pub const BOOSTAGRAM_TLV_TYPE: u64 = 7629169;
/// Whatsat text message, hex-encoded UTF-8.
pub const WHATSAT_TLV_TYPE: u64 = 34349334;
/// Receiving app id, hex-encoded ASCII decimal.
pub const CUSTOM_KEY_TLV_TYPE: u64 = 696969;

/// A custom TLV record carried with a keysend payment. The value is the
/// hex-encoded raw payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlvRecord {
    #[serde(rename = "type")]
    pub tlv_type: u64,
    pub value: String,
}

/// JSON field that podcast apps populate with either a string or a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrNumber {
    String(String),
    Number(i64),
}

impl fmt::Display for StringOrNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StringOrNumber::String(s) => f.write_str(s),
            StringOrNumber::Number(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Boostagram {
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub podcast: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode: Option<StringOrNumber>,
    #[serde(rename = "feedID", default, skip_serializing_if = "Option::is_none")]
    pub feed_id: Option<StringOrNumber>,
    #[serde(rename = "itemID", default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<StringOrNumber>,
    #[serde(rename = "ts", default)]
    pub timestamp: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<StringOrNumber>,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub value_msat_total: i64,
}

/// Raw boostagram JSON blob, if a parseable boostagram record is present.
pub fn boostagram_from_records(records: &[TlvRecord]) -> Option<serde_json::Value> {
    for record in records {
        if record.tlv_type != BOOSTAGRAM_TLV_TYPE {
            continue;
        }
        let Ok(bytes) = hex::decode(&record.value) else {
            return None;
        };
        return serde_json::from_slice(&bytes).ok();
    }
    None
}

/// Human-readable description carried in the records. A boostagram message
/// wins outright; a whatsat text is kept but the scan continues so that a
/// later boostagram still takes precedence.
pub fn description_from_records(records: &[TlvRecord]) -> String {
    let mut description = String::new();

    for record in records {
        match record.tlv_type {
            BOOSTAGRAM_TLV_TYPE => {
                let Ok(bytes) = hex::decode(&record.value) else {
                    continue;
                };
                let Ok(boostagram) = serde_json::from_slice::<Boostagram>(&bytes) else {
                    continue;
                };
                return boostagram.message;
            }
            WHATSAT_TLV_TYPE => {
                if let Ok(bytes) = hex::decode(&record.value) {
                    description = String::from_utf8_lossy(&bytes).into_owned();
                }
            }
            _ => {}
        }
    }

    description
}

/// Receiving app id from the custom-key record, if present and well-formed.
/// The caller is responsible for checking the app actually exists.
pub fn app_id_from_records(records: &[TlvRecord]) -> Option<u64> {
    for record in records {
        if record.tlv_type != CUSTOM_KEY_TLV_TYPE {
            continue;
        }
        let Ok(bytes) = hex::decode(&record.value) else {
            tracing::warn!(value = %record.value, "custom key TLV record is not valid hex");
            continue;
        };
        let Ok(decimal) = String::from_utf8(bytes) else {
            continue;
        };
        match decimal.parse::<u64>() {
            Ok(app_id) => return Some(app_id),
            Err(_) => {
                tracing::warn!(value = %decimal, "custom key TLV record is not a decimal app id");
                continue;
            }
        }
    }
    None
}
