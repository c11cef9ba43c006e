//! Expiry computation for cached objects.

use crate::http::date::parse_rfc1123;
use crate::http::Reply;

/// Protocol-specific TTL knobs, snapshotted from config at use time.
#[derive(Debug, Clone, Copy)]
pub struct TtlRules {
    pub default_ttl: i64,
    pub max_ttl: i64,
    pub negative_ttl: i64,
    pub ftp_dir_ttl: i64,
    pub ftp_file_ttl: i64,
}

impl Default for TtlRules {
    fn default() -> Self {
        TtlRules {
            default_ttl: 3600,
            max_ttl: 7 * 24 * 3600,
            negative_ttl: 300,
            ftp_dir_ttl: 24 * 3600,
            ftp_file_ttl: 7 * 24 * 3600,
        }
    }
}

/// Relative TTL for an HTTP response: origin max-age wins, then Expires
/// against the origin Date (or our clock), then the configured default.
/// The result is clamped to [0, max_ttl].
pub fn http_ttl(reply: &Reply, now: i64, rules: &TtlRules) -> i64 {
    let ttl = if let Some(max_age) = reply.headers.cache_control_max_age() {
        max_age
    } else if let Some(expires) = reply.headers.get("Expires").and_then(parse_rfc1123) {
        let origin_now = reply
            .headers
            .get("Date")
            .and_then(parse_rfc1123)
            .unwrap_or(now);
        expires - origin_now
    } else {
        rules.default_ttl
    };
    ttl.clamp(0, rules.max_ttl)
}

/// FTP objects age by kind, not by origin metadata.
pub fn ftp_ttl(is_dir: bool, rules: &TtlRules) -> i64 {
    if is_dir {
        rules.ftp_dir_ttl
    } else {
        rules.ftp_file_ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::date::mkrfc1123;

    fn reply_with(headers: &[(&str, &str)]) -> Reply {
        let mut r = Reply::new(200, "OK");
        for (n, v) in headers {
            r.headers.put(n, v);
        }
        r
    }

    #[test]
    fn test_max_age_wins() {
        let r = reply_with(&[
            ("Cache-Control", "max-age=60"),
            ("Expires", &mkrfc1123(1_000_000)),
        ]);
        assert_eq!(http_ttl(&r, 900_000, &TtlRules::default()), 60);
    }

    #[test]
    fn test_expires_relative_to_origin_date() {
        let date = 1_000_000;
        let r = reply_with(&[
            ("Date", &mkrfc1123(date)),
            ("Expires", &mkrfc1123(date + 120)),
        ]);
        // our clock disagrees with origin's; the origin pair decides
        assert_eq!(http_ttl(&r, date + 1000, &TtlRules::default()), 120);
    }

    #[test]
    fn test_stale_expires_clamps_to_zero() {
        let r = reply_with(&[("Expires", &mkrfc1123(500))]);
        assert_eq!(http_ttl(&r, 1_000, &TtlRules::default()), 0);
    }

    #[test]
    fn test_default_and_max_clamp() {
        let rules = TtlRules {
            default_ttl: 900,
            max_ttl: 600,
            ..TtlRules::default()
        };
        let r = reply_with(&[]);
        assert_eq!(http_ttl(&r, 0, &rules), 600);
    }

    #[test]
    fn test_ftp_kinds() {
        let rules = TtlRules::default();
        assert_eq!(ftp_ttl(true, &rules), rules.ftp_dir_ttl);
        assert_eq!(ftp_ttl(false, &rules), rules.ftp_file_ttl);
    }
}
