//! # Utilities Module
//!
//! This module contains helper functions and utilities used
//! across the broker service.

pub mod spec;

pub use spec::SpecDoc;

use chrono::{DateTime, Duration, Months, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;

/// Format an amount in cents as a human-readable money string.
///
/// ## Examples
///
/// ```rust,ignore
/// assert_eq!(format_cents(123456, "CNY"), "1,234.56 CNY");
/// assert_eq!(format_cents(-3000, "CNY"), "-30.00 CNY");
/// ```
pub fn format_cents(amount: i64, currency: &str) -> String {
    let negative = amount < 0;
    let abs = amount.unsigned_abs();
    let whole = (abs / 100).to_string();
    let frac = abs % 100;

    let mut grouped = String::new();
    for (i, c) in whole.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    let grouped: String = grouped.chars().rev().collect();

    format!(
        "{}{}.{:02} {}",
        if negative { "-" } else { "" },
        grouped,
        frac,
        currency
    )
}

/// Build an order number: `<prefix><user_id>-<unix_seconds>`.
///
/// Prefixes in use: `ORD-`, `REN-`, `EMR-`, `UPG-`, `REF-`, `DEL-`.
pub fn order_number(prefix: &str, user_id: i64, at: DateTime<Utc>) -> String {
    format!("{}{}-{}", prefix, user_id, at.timestamp())
}

/// Sentinel trade number stored when a payment arrives without one.
pub fn pending_trade_no(order_id: i64, at: DateTime<Utc>) -> String {
    format!(
        "pending-{}-{}",
        order_id,
        at.timestamp_nanos_opt().unwrap_or_else(|| at.timestamp_micros() * 1000)
    )
}

/// Trade number of a wallet-balance payment: `BAL-<order>-<unix_seconds>`.
pub fn balance_trade_no(order_id: i64, at: DateTime<Utc>) -> String {
    format!("BAL-{}-{}", order_id, at.timestamp())
}

/// Remote host name for a new instance: `ecs-<user>-<nanos>`.
pub fn host_name_for(user_id: i64, at: DateTime<Utc>) -> String {
    format!(
        "ecs-{}-{}",
        user_id,
        at.timestamp_nanos_opt().unwrap_or_else(|| at.timestamp_micros() * 1000)
    )
}

/// Random alphanumeric password of `len` characters.
pub fn random_password(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Parse a stringified remote host id. Zero means "no host".
pub fn parse_host_id(raw: &str) -> i64 {
    raw.trim().parse::<i64>().ok().filter(|id| *id > 0).unwrap_or(0)
}

/// Advance `at` by calendar billing months, clamping to the last day of
/// short months (Jan 31 + 1 month lands on Feb 28/29).
pub fn add_months(at: DateTime<Utc>, months: i32) -> DateTime<Utc> {
    let months = months.max(1);
    at.checked_add_months(Months::new(months.unsigned_abs()))
        .unwrap_or_else(|| at + Duration::days(30 * i64::from(months)))
}

/// Truncate a string to a maximum length.
///
/// Useful for logging long remote messages.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_cents() {
        assert_eq!(format_cents(100, "CNY"), "1.00 CNY");
        assert_eq!(format_cents(0, "CNY"), "0.00 CNY");
        assert_eq!(format_cents(123456, "CNY"), "1,234.56 CNY");
        assert_eq!(format_cents(-3000, "USD"), "-30.00 USD");
    }

    #[test]
    fn test_order_number_prefix() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        assert_eq!(order_number("EMR-", 7, at), format!("EMR-7-{}", at.timestamp()));
    }

    #[test]
    fn test_pending_trade_no_is_prefixed() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        assert!(pending_trade_no(12, at).starts_with("pending-12-"));
    }

    #[test]
    fn test_add_months_follows_calendar() {
        let jan31 = Utc.with_ymd_and_hms(2024, 1, 31, 8, 0, 0).unwrap();
        assert_eq!(add_months(jan31, 1), Utc.with_ymd_and_hms(2024, 2, 29, 8, 0, 0).unwrap());

        let jan15 = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        assert_eq!(add_months(jan15, 12), Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap());
        assert_eq!(add_months(jan15, 3), Utc.with_ymd_and_hms(2024, 4, 15, 0, 0, 0).unwrap());

        // Zero or negative durations still bill one month.
        assert_eq!(add_months(jan15, 0), Utc.with_ymd_and_hms(2024, 2, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_host_id() {
        assert_eq!(parse_host_id(" 981 "), 981);
        assert_eq!(parse_host_id(""), 0);
        assert_eq!(parse_host_id("-3"), 0);
        assert_eq!(parse_host_id("abc"), 0);
    }

    #[test]
    fn test_random_password_length() {
        let pw = random_password(16);
        assert_eq!(pw.len(), 16);
        assert!(pw.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("abcdefghij", 10), "abcdefghij");
        assert_eq!(truncate_string("abcdefghijklmnop", 10), "abcdefg...");
    }
}
