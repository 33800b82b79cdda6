//! RPC trace envelopes: header masking, payload sanitization, body format
//! detection and the `http_trace=<base64-json>` error suffix.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const MASK: &str = "***";
const TRACE_MARKER: &str = "http_trace=";

/// Header names whose values never reach the log.
pub fn is_sensitive_header(name: &str) -> bool {
    let n = name.trim().to_ascii_lowercase();
    matches!(n.as_str(), "apikey" | "api_key" | "authorization" | "token")
        || n.starts_with("secret")
        || n.starts_with("access_key")
}

/// Payload keys whose values never reach the log.
pub fn is_sensitive_key(key: &str) -> bool {
    is_sensitive_header(key) || key.to_ascii_lowercase().contains("secret")
}

pub fn mask_headers<'a, I>(headers: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a str, String)>,
{
    headers
        .into_iter()
        .map(|(k, v)| {
            let value = if is_sensitive_header(k) { MASK.to_string() } else { v };
            (k.to_string(), value)
        })
        .collect()
}

/// Recursively replace sensitive values in maps and lists.
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let out = if is_sensitive_key(k) {
                        Value::String(MASK.to_string())
                    } else {
                        sanitize(v)
                    };
                    (k.clone(), out)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}

/// Mask secrets in an urlencoded form body.
pub fn sanitize_form(body: &str) -> String {
    if body.is_empty() {
        return String::new();
    }
    body.split('&')
        .map(|pair| match pair.split_once('=') {
            Some((k, _)) if is_sensitive_key(k) => format!("{}={}", k, MASK),
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Classify a response body as `empty`, `json`, `html` or `text`.
///
/// Returns the parsed value when the body is JSON.
pub fn detect_body_format(content_type: &str, body: &[u8]) -> (&'static str, Option<Value>) {
    let trimmed = trim_ascii(body);
    if trimmed.is_empty() {
        return ("empty", None);
    }
    let ct = content_type.to_ascii_lowercase();
    let looks_json = matches!(trimmed[0], b'{' | b'[');
    if ct.contains("application/json") || ct.contains("+json") || looks_json {
        if let Ok(parsed) = serde_json::from_slice::<Value>(trimmed) {
            return ("json", Some(parsed));
        }
    }
    if ct.contains("text/html") || ct.contains("application/xhtml") || looks_html(trimmed) {
        return ("html", None);
    }
    ("text", None)
}

fn looks_html(body: &[u8]) -> bool {
    let sample = String::from_utf8_lossy(&body[..body.len().min(64)]).to_ascii_lowercase();
    ["<!doctype", "<html", "<head", "<body"]
        .iter()
        .any(|p| sample.starts_with(p))
}

fn trim_ascii(body: &[u8]) -> &[u8] {
    let start = body.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(body.len());
    let end = body.iter().rposition(|b| !b.is_ascii_whitespace()).map(|i| i + 1).unwrap_or(start);
    &body[start..end]
}

// ============================================
// HTTP TRACE ENVELOPE
// ============================================

/// One HTTP exchange as recorded in the log sink.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpTrace {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub request: Value,
    #[serde(default)]
    pub response: Value,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

impl HttpTrace {
    /// Build the envelope for a finished (or failed) HTTP exchange.
    #[allow(clippy::too_many_arguments)]
    pub fn capture(
        action: &str,
        method: &str,
        url: &str,
        request_headers: BTreeMap<String, String>,
        request_body: &str,
        response: Option<(u16, BTreeMap<String, String>, &[u8], &str)>,
        duration_ms: i64,
        error: Option<&str>,
    ) -> Self {
        let request = json!({
            "method": method,
            "url": url,
            "headers": request_headers,
            "body": sanitize_form(request_body),
        });
        let response = match response {
            Some((status, headers, body, content_type)) => {
                let (format, body_json) = detect_body_format(content_type, body);
                let mut out = json!({
                    "status": status,
                    "headers": headers,
                    "body": String::from_utf8_lossy(body),
                    "format": format,
                    "duration_ms": duration_ms,
                });
                if let (Some(parsed), Value::Object(map)) = (body_json, &mut out) {
                    map.insert("body_json".to_string(), sanitize(&parsed));
                }
                out
            }
            None => json!({
                "status": 0,
                "headers": {},
                "body": "",
                "format": "none",
                "duration_ms": duration_ms,
            }),
        };
        Self {
            action: action.to_string(),
            request,
            response,
            success: error.is_none(),
            message: error.unwrap_or("ok").to_string(),
        }
    }
}

/// Append the encoded trace to an error message.
pub fn attach_trace(message: &str, trace: &HttpTrace) -> String {
    let raw = serde_json::to_vec(trace).unwrap_or_default();
    format!("{} {}{}", message, TRACE_MARKER, BASE64.encode(raw))
}

/// Decode a trace carried in an error message, if any.
///
/// The payload after the marker may be base64 or plain JSON.
pub fn extract_trace(message: &str) -> Option<HttpTrace> {
    let idx = message.rfind(TRACE_MARKER)?;
    let raw = message[idx + TRACE_MARKER.len()..].trim();
    if raw.is_empty() {
        return None;
    }
    let decoded = BASE64
        .decode(raw)
        .ok()
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| raw.as_bytes().to_vec());
    serde_json::from_slice(&decoded).ok()
}

pub fn has_trace(message: &str) -> bool {
    message.contains(TRACE_MARKER)
}

/// The message with any trace suffix removed.
pub fn strip_trace(message: &str) -> String {
    match message.rfind(TRACE_MARKER) {
        Some(idx) => message[..idx].trim_end().to_string(),
        None => message.to_string(),
    }
}

/// Pull a business message out of an error text carrying remote JSON
/// (`msg`, `message`, `error`, `other.msg`).
pub fn extract_business_message(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(msg) = message_from_json(trimmed) {
        return Some(msg);
    }
    if let Some(idx) = trimmed.find('{') {
        if let Some(msg) = message_from_json(&trimmed[idx..]) {
            return Some(msg);
        }
    }
    let re = Regex::new(r#"msg":"([^"]+)""#).ok()?;
    re.captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|m| !m.is_empty())
}

fn message_from_json(raw: &str) -> Option<String> {
    let obj: Map<String, Value> = serde_json::from_str(raw).ok()?;
    let text = |v: &Value| match v {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Null => None,
        other => Some(other.to_string()),
    };
    for key in ["msg", "message", "error"] {
        if let Some(msg) = obj.get(key).and_then(text) {
            return Some(msg);
        }
    }
    obj.get("other")
        .and_then(|o| o.get("msg"))
        .and_then(text)
}

/// Error text shown to callers: business JSON is reduced to its message
/// unless a trace is attached, which must stay intact for the log sink.
pub fn map_business_error(message: &str) -> String {
    if has_trace(message) {
        return message.to_string();
    }
    match extract_business_message(message) {
        Some(msg) if msg != message => msg,
        _ => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_masking_hides_key_everywhere() {
        let masked = mask_headers(vec![
            ("apikey", "X-SECRET-123".to_string()),
            ("Authorization", "Bearer abc".to_string()),
            ("secret-token", "s".to_string()),
            ("Access_Key_Id", "id".to_string()),
            ("Content-Type", "application/json".to_string()),
        ]);
        assert_eq!(masked["apikey"], MASK);
        assert_eq!(masked["Authorization"], MASK);
        assert_eq!(masked["secret-token"], MASK);
        assert_eq!(masked["Access_Key_Id"], MASK);
        assert_eq!(masked["Content-Type"], "application/json");

        let trace = HttpTrace::capture("POST /hostinfo", "POST", "http://u/hostinfo", masked, "host_id=1", None, 3, Some("boom"));
        let text = serde_json::to_string(&trace).unwrap();
        assert!(!text.contains("X-SECRET-123"));
    }

    #[test]
    fn test_sanitize_nested_payloads() {
        let value = json!({
            "host_id": 1,
            "api_key": "k",
            "nested": [{"client_secret": "s", "name": "ok"}],
            "Token": "t"
        });
        let clean = sanitize(&value);
        assert_eq!(clean["api_key"], MASK);
        assert_eq!(clean["nested"][0]["client_secret"], MASK);
        assert_eq!(clean["nested"][0]["name"], "ok");
        assert_eq!(clean["Token"], MASK);
        assert_eq!(clean["host_id"], 1);
    }

    #[test]
    fn test_sanitize_form() {
        assert_eq!(sanitize_form("host_id=1&apikey=zzz"), "host_id=1&apikey=***");
        assert_eq!(sanitize_form(""), "");
    }

    #[test]
    fn test_body_format_detection() {
        assert_eq!(detect_body_format("", b"  \n").0, "empty");
        assert_eq!(detect_body_format("text/plain", b" {\"a\":1}").0, "json");
        assert_eq!(detect_body_format("application/problem+json", b"{\"a\":1}").0, "json");
        assert_eq!(detect_body_format("", b"{not json").0, "text");
        assert_eq!(detect_body_format("", b"<!DOCTYPE html><html>").0, "html");
        assert_eq!(detect_body_format("text/html; charset=utf-8", b"oops").0, "html");
        assert_eq!(detect_body_format("", b"plain words").0, "text");
    }

    #[test]
    fn test_trace_survives_error_message() {
        let trace = HttpTrace {
            action: "POST /renew".into(),
            request: json!({"method": "POST"}),
            response: json!({"status": 500}),
            success: false,
            message: "automation error: expired".into(),
        };
        let message = attach_trace("automation error: expired", &trace);
        assert!(has_trace(&message));
        assert_eq!(extract_trace(&message), Some(trace));
        assert_eq!(strip_trace(&message), "automation error: expired");
        assert_eq!(extract_trace("no trace here"), None);
    }

    #[test]
    fn test_business_message_extraction() {
        assert_eq!(extract_business_message(r#"{"msg":"quota exceeded"}"#).as_deref(), Some("quota exceeded"));
        assert_eq!(
            extract_business_message(r#"rpc error: {"other":{"msg":"line offline"}}"#).as_deref(),
            Some("line offline")
        );
        assert_eq!(extract_business_message(r#"garbage msg":"cut off"#).as_deref(), Some("cut off"));
        assert_eq!(extract_business_message("plain"), None);
        assert_eq!(map_business_error(r#"{"error":"denied"}"#), "denied");
        let traced = format!(r#"{{"msg":"x"}} {}e30="#, TRACE_MARKER);
        assert_eq!(map_business_error(&traced), traced);
    }
}
