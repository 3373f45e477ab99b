//! Small shared helpers: wall-clock timestamps, ISO formatting,
//! email validation, constant-time comparison, ticket codes.

use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as fractional epoch seconds.
///
/// Stored as DOUBLE PRECISION in Postgres and as sorted-set scores in the
/// hot KV store, so `f64` is the canonical in-process representation.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs_f64()
}

/// Format epoch seconds as an ISO-8601 / RFC-3339 UTC timestamp.
pub fn to_iso(ts: f64) -> String {
    let secs = ts.floor() as i64;
    let nanos = ((ts - ts.floor()) * 1e9) as u32;
    chrono::DateTime::from_timestamp(secs, nanos)
        .unwrap_or_default()
        .to_rfc3339()
}

/// Permissive email check: `local@domain.tld`, no whitespace, single `@`.
///
/// Mirrors the classic `^[^@\s]+@[^@\s]+\.[^@\s]+$` pattern without
/// pulling in a regex engine.
pub fn is_valid_email(email: &str) -> bool {
    let email = email.trim();
    if email.is_empty() || email.chars().any(char::is_whitespace) {
        return false;
    }
    let mut parts = email.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    if local.is_empty() || domain.is_empty() {
        return false;
    }
    // domain needs a dot with something on both sides
    match domain.rsplit_once('.') {
        Some((head, tld)) => !head.is_empty() && !tld.is_empty(),
        None => false,
    }
}

/// Constant-time string equality for credentials.
///
/// Compares every byte regardless of where the first mismatch occurs;
/// length differences still fold into the accumulator.
pub fn ct_equal(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= (x ^ y) as usize;
    }
    diff == 0
}

/// Generate a ticket code: `TCK-` + 10 uppercase hex chars.
pub fn new_ticket_code() -> String {
    let mut bytes = [0u8; 5];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("TCK-{}", hex::encode_upper(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_emails() {
        assert!(is_valid_email("a@x.com"));
        assert!(is_valid_email("first.last@sub.example.org"));
        assert!(is_valid_email("  padded@x.com  "));
    }

    #[test]
    fn test_invalid_emails() {
        assert!(!is_valid_email(""));
        assert!(!is_valid_email("no-at-sign.com"));
        assert!(!is_valid_email("two@@x.com"));
        assert!(!is_valid_email("a@nodot"));
        assert!(!is_valid_email("a@x."));
        assert!(!is_valid_email("a@.com"));
        assert!(!is_valid_email("spaces in@x.com"));
        assert!(!is_valid_email("@x.com"));
        assert!(!is_valid_email("a@"));
    }

    #[test]
    fn test_ct_equal() {
        assert!(ct_equal("secret", "secret"));
        assert!(!ct_equal("secret", "secreT"));
        assert!(!ct_equal("secret", "secret2"));
        assert!(!ct_equal("", "x"));
        assert!(ct_equal("", ""));
    }

    #[test]
    fn test_ticket_code_shape() {
        let code = new_ticket_code();
        assert!(code.starts_with("TCK-"));
        assert_eq!(code.len(), 4 + 10);
        assert!(code[4..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(code[4..].to_uppercase(), code[4..]);
    }

    #[test]
    fn test_to_iso_epoch() {
        assert!(to_iso(0.0).starts_with("1970-01-01T00:00:00"));
        // fractional seconds survive
        assert!(to_iso(1.5).starts_with("1970-01-01T00:00:01.5"));
    }
}
