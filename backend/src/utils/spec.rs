//! Schema-loose JSON documents (`spec_json`, `access_info_json`, event
//! payloads) parsed on demand behind typed accessors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A JSON object with typed accessors.
///
/// Values written by older clients are tolerated: integers may arrive as
/// strings, timestamps as RFC3339 text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecDoc(Map<String, Value>);

impl SpecDoc {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build from any JSON value; non-objects yield an empty document.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::new(),
        }
    }

    /// Parse from raw text; malformed input yields an empty document.
    pub fn parse(raw: &str) -> Self {
        serde_json::from_str::<Value>(raw)
            .map(Self::from_value)
            .unwrap_or_default()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            Value::Number(n) => n.as_i64().map(|v| v != 0),
            _ => None,
        }
    }

    pub fn get_time(&self, key: &str) -> Option<DateTime<Utc>> {
        let raw = self.get_str(key)?.trim();
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn set_time(&mut self, key: &str, at: DateTime<Utc>) -> &mut Self {
        self.set(key, at.to_rfc3339())
    }

    pub fn remove(&mut self, key: &str) {
        self.0.remove(key);
    }

    /// Overlay `other` on top of this document; keys in `other` win.
    pub fn merge(&mut self, other: &SpecDoc) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Target instance of a non-create order item.
    pub fn vps_id(&self) -> Option<i64> {
        self.get_i64("vps_id").filter(|id| *id > 0)
    }

    /// Billing months carried by an item, never below one.
    pub fn duration_months(&self) -> i32 {
        self.get_i64("duration_months")
            .map(|m| m.max(1) as i32)
            .unwrap_or(1)
    }

    /// Current billing period as recorded on the instance spec.
    ///
    /// Start keys are tried in order `current_period_start`, `period_start`,
    /// `last_renew_at`, `purchase_at`; end keys `current_period_end`,
    /// `period_end`.
    pub fn current_period(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let start = ["current_period_start", "period_start", "last_renew_at", "purchase_at"]
            .iter()
            .find_map(|k| self.get_time(k));
        let end = ["current_period_end", "period_end"]
            .iter()
            .find_map(|k| self.get_time(k));
        (start, end)
    }

    pub fn set_current_period(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) {
        self.set_time("current_period_start", start);
        self.set_time("current_period_end", end);
    }
}

impl From<Value> for SpecDoc {
    fn from(value: Value) -> Self {
        SpecDoc::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_numeric_strings_are_accepted() {
        let doc = SpecDoc::from_value(json!({"vps_id": "42", "duration_months": 3}));
        assert_eq!(doc.vps_id(), Some(42));
        assert_eq!(doc.duration_months(), 3);
    }

    #[test]
    fn test_duration_defaults_to_one_month() {
        let doc = SpecDoc::from_value(json!({"duration_months": 0}));
        assert_eq!(doc.duration_months(), 1);
        assert_eq!(SpecDoc::new().duration_months(), 1);
    }

    #[test]
    fn test_current_period_falls_back_to_legacy_keys() {
        let doc = SpecDoc::from_value(json!({
            "last_renew_at": "2024-01-01T00:00:00Z",
            "period_end": "2024-02-01T00:00:00Z"
        }));
        let (start, end) = doc.current_period();
        assert_eq!(start, Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        assert_eq!(end, Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()));
    }

    #[test]
    fn test_merge_overwrites_existing_keys() {
        let mut base = SpecDoc::from_value(json!({"cpu": 1, "keep": true}));
        base.merge(&SpecDoc::from_value(json!({"cpu": 4})));
        assert_eq!(base.get_i64("cpu"), Some(4));
        assert_eq!(base.get_bool("keep"), Some(true));
    }

    #[test]
    fn test_parse_garbage_is_empty() {
        assert!(SpecDoc::parse("not json").is_empty());
        assert!(SpecDoc::parse("[1,2]").is_empty());
    }
}
