//! The `util` helpers available to mapping templates.

use base64::prelude::BASE64_STANDARD;
use base64::Engine as _;
use chrono::SecondsFormat;
use chrono::Utc;
use serde_json_bytes::Value;
use tower::BoxError;
use uuid::Uuid;

/// Helper functions exposed to templates as `util` (and its alias `utils`).
#[derive(Clone, Copy, Debug, Default)]
pub struct TemplateUtil;

impl TemplateUtil {
    /// Serializes `value` as compact JSON.
    pub fn to_json(&self, value: &Value) -> Result<String, BoxError> {
        Ok(serde_json::to_string(value)?)
    }

    /// Parses JSON text.
    pub fn parse_json(&self, text: &str) -> Result<Value, BoxError> {
        Ok(serde_json::from_str(text)?)
    }

    /// A random v4 UUID.
    pub fn auto_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    pub fn url_encode(&self, text: &str) -> String {
        urlencoding::encode(text).into_owned()
    }

    pub fn url_decode(&self, text: &str) -> Result<String, BoxError> {
        Ok(urlencoding::decode(text)?.into_owned())
    }

    pub fn base64_encode(&self, text: &str) -> String {
        BASE64_STANDARD.encode(text.as_bytes())
    }

    pub fn base64_decode(&self, text: &str) -> Result<String, BoxError> {
        Ok(String::from_utf8(BASE64_STANDARD.decode(text.as_bytes())?)?)
    }

    /// Escapes `text` so it can sit inside a quoted JSON/JavaScript string.
    pub fn escape_javascript(&self, text: &str) -> String {
        let quoted = serde_json::to_string(text).unwrap_or_default();
        quoted
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
            .unwrap_or_default()
            .replace('\'', "\\'")
    }

    pub fn is_null(&self, value: &Value) -> bool {
        value.is_null()
    }

    pub fn is_null_or_empty(&self, value: &Value) -> bool {
        match value {
            Value::Null => true,
            Value::String(text) => text.as_str().is_empty(),
            Value::Array(values) => values.is_empty(),
            Value::Object(object) => object.is_empty(),
            _ => false,
        }
    }

    pub fn now_epoch_seconds(&self) -> i64 {
        Utc::now().timestamp()
    }

    pub fn now_epoch_milliseconds(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    /// The current time as an ISO 8601 UTC timestamp.
    pub fn now_iso8601(&self) -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}
