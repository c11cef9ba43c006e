//! Duration type with human-readable parsing support.
//!
//! Plain numbers are milliseconds; `us`/`ms`/`s`/`m`/`h`/`d` suffixes are
//! explicit, with decimal support (`"0.1ms"`).

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Duration stored in microseconds.
///
/// # Examples
/// ```toml
/// connect_timeout = 3000    # 3 seconds, interpreted as ms
/// read_timeout = "15s"      # human-readable
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Duration(pub u64);

impl Duration {
    /// Creates a new Duration from milliseconds.
    pub const fn from_millis(ms: u64) -> Self {
        Duration(ms * 1000)
    }

    /// Creates a new Duration from seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Duration(secs * 1_000_000)
    }

    /// Creates a new Duration from minutes.
    pub const fn from_mins(mins: u64) -> Self {
        Duration(mins * 60 * 1_000_000)
    }

    /// Returns the duration in milliseconds (truncated).
    pub const fn as_millis(&self) -> u64 {
        self.0 / 1000
    }

    /// Returns the duration in seconds (truncated).
    pub const fn as_secs(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// Converts to std::time::Duration.
    pub const fn as_std(&self) -> std::time::Duration {
        std::time::Duration::from_micros(self.0)
    }
}

impl From<u64> for Duration {
    /// Creates Duration from milliseconds (for backward compatibility).
    fn from(ms: u64) -> Self {
        Duration(ms * 1000)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(d: Duration) -> Self {
        std::time::Duration::from_micros(d.0)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_millis())
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl de::Visitor<'_> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(
                    "a duration like '5s', '100ms', '1h', '30m' or a number in milliseconds",
                )
            }

            fn visit_u64<E>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration(v * 1000))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Duration, E>
            where
                E: de::Error,
            {
                if v < 0 {
                    return Err(E::custom("duration cannot be negative"));
                }
                Ok(Duration(v as u64 * 1000))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Duration, E>
            where
                E: de::Error,
            {
                if v < 0.0 {
                    return Err(E::custom("duration cannot be negative"));
                }
                Ok(Duration((v * 1000.0) as u64))
            }

            fn visit_str<E>(self, s: &str) -> Result<Duration, E>
            where
                E: de::Error,
            {
                parse_duration(s).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

impl Serialize for Duration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Serialize as milliseconds for backward compatibility
        serializer.serialize_u64(self.0 / 1000)
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if let Ok(ms) = s.parse::<u64>() {
        return Ok(Duration(ms * 1000));
    }
    if let Ok(ms) = s.parse::<f64>() {
        if ms < 0.0 {
            return Err("duration cannot be negative".to_string());
        }
        return Ok(Duration((ms * 1000.0) as u64));
    }

    let s_lower = s.to_lowercase();

    let (num_str, multiplier) = if s_lower.ends_with("us") {
        (&s[..s.len() - 2], 1u64)
    } else if s_lower.ends_with("ms") {
        (&s[..s.len() - 2], 1000u64)
    } else if s_lower.ends_with('s') {
        (&s[..s.len() - 1], 1_000_000u64)
    } else if s_lower.ends_with('m') {
        (&s[..s.len() - 1], 60 * 1_000_000u64)
    } else if s_lower.ends_with('h') {
        (&s[..s.len() - 1], 60 * 60 * 1_000_000u64)
    } else if s_lower.ends_with('d') {
        (&s[..s.len() - 1], 24 * 60 * 60 * 1_000_000u64)
    } else {
        return Err(format!(
            "invalid duration format: '{s}'. Expected a number or a string with suffix (us, ms, s, m, h, d)"
        ));
    };

    let num_str = num_str.trim();

    if let Ok(num) = num_str.parse::<u64>() {
        return Ok(Duration(num * multiplier));
    }

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("invalid number in duration: '{num_str}'"))?;
    if num < 0.0 {
        return Err("duration cannot be negative".to_string());
    }

    Ok(Duration((num * multiplier as f64) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_is_milliseconds() {
        assert_eq!(parse_duration("5000").unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_suffixes() {
        assert_eq!(parse_duration("100us").unwrap(), Duration(100));
        assert_eq!(parse_duration("5ms").unwrap(), Duration::from_millis(5));
        assert_eq!(parse_duration("0.1ms").unwrap(), Duration(100));
        assert_eq!(parse_duration("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_mins(5));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_mins(60));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("-5s").is_err());
        assert!(parse_duration("5w").is_err());
    }

    #[test]
    fn test_toml_number_and_string() {
        #[derive(Deserialize)]
        struct Conf {
            t: Duration,
        }
        let c: Conf = toml::from_str("t = 3000").unwrap();
        assert_eq!(c.t, Duration::from_secs(3));
        let c: Conf = toml::from_str("t = \"3s\"").unwrap();
        assert_eq!(c.t, Duration::from_secs(3));
    }
}
