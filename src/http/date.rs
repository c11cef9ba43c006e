//! HTTP date handling: RFC 1123 output, tolerant input (RFC 1123, RFC 850
//! and asctime forms), always in UTC.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Format an epoch timestamp as an RFC 1123 date, e.g.
/// `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn mkrfc1123(t: i64) -> String {
    let dt: DateTime<Utc> = Utc
        .timestamp_opt(t, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().expect("epoch is valid"));
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn month_index(s: &str) -> Option<u32> {
    if s.len() < 3 {
        return None;
    }
    let probe = &s[..3];
    MONTHS
        .iter()
        .position(|m| m.eq_ignore_ascii_case(probe))
        .map(|i| i as u32 + 1)
}

fn parse_time(s: &str) -> Option<(u32, u32, u32)> {
    let mut it = s.split(':');
    let h: u32 = it.next()?.parse().ok()?;
    let m: u32 = it.next()?.parse().ok()?;
    let sec: u32 = it.next().unwrap_or("0").parse().ok()?;
    if h > 23 || m > 59 || sec > 59 {
        return None;
    }
    Some((h, m, sec))
}

/// Parse any of the three date forms HTTP/1.1 tells servers to accept.
/// Returns seconds since the epoch, or None for anything unparseable or not
/// in GMT.
pub fn parse_rfc1123(s: &str) -> Option<i64> {
    let mut day: Option<&str> = None;
    let mut month: Option<&str> = None;
    let mut year: Option<&str> = None;
    let mut timestr: Option<&str> = None;
    let mut zone: Option<&str> = None;
    let mut wday: Option<&str> = None;

    for tok in s.split([',', ' ', '\t']).filter(|t| !t.is_empty()) {
        if tok.as_bytes()[0].is_ascii_digit() {
            if day.is_none() {
                // RFC 850 packs day-month-year into one token
                if let Some((d, rest)) = tok.split_once('-') {
                    let (m, y) = rest.split_once('-')?;
                    day = Some(d);
                    month = Some(m);
                    year = Some(y);
                } else {
                    day = Some(tok);
                }
            } else if tok.contains(':') {
                timestr = Some(tok);
            } else if year.is_none() {
                year = Some(tok);
            } else {
                return None;
            }
        } else if wday.is_none() {
            wday = Some(tok);
        } else if month.is_none() {
            month = Some(tok);
        } else if zone.is_none() {
            zone = Some(tok);
        } else {
            return None;
        }
    }

    if let Some(z) = zone {
        if z != "GMT" {
            return None;
        }
    }

    let day: u32 = day?.parse().ok()?;
    let month = month_index(month?)?;
    let year_str = year?;
    let mut year: i32 = year_str.parse().ok()?;
    if year_str.len() != 4 {
        if year < 70 {
            year += 2000;
        } else if year < 1000 {
            year += 1900;
        }
    }
    let (h, m, sec) = parse_time(timestr?)?;

    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    let dt = date.and_hms_opt(h, m, sec)?;
    Some(Utc.from_utc_datetime(&dt).timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_dates() {
        assert_eq!(mkrfc1123(784111777), "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(
            parse_rfc1123("Sun, 06 Nov 1994 08:49:37 GMT"),
            Some(784111777)
        );
    }

    #[test]
    fn test_rfc850_and_asctime_forms() {
        assert_eq!(
            parse_rfc1123("Sunday, 06-Nov-94 08:49:37 GMT"),
            Some(784111777)
        );
        assert_eq!(parse_rfc1123("Sun Nov 6 08:49:37 1994"), Some(784111777));
    }

    #[test]
    fn test_round_trip() {
        for &t in &[0i64, 1, 1234567890, 784111777, 2145916799] {
            let s = mkrfc1123(t);
            assert_eq!(parse_rfc1123(&s), Some(t), "round-trip of {s}");
        }
    }

    #[test]
    fn test_rejects_non_gmt_and_garbage() {
        assert_eq!(parse_rfc1123("Sun, 06 Nov 1994 08:49:37 PST"), None);
        assert_eq!(parse_rfc1123("not a date"), None);
        assert_eq!(parse_rfc1123(""), None);
        assert_eq!(parse_rfc1123("Sun, 32 Nov 1994 08:49:37 GMT"), None);
        assert_eq!(parse_rfc1123("Sun, 06 Nov 1994 25:49:37 GMT"), None);
    }
}
