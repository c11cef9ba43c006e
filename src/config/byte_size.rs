//! ByteSize type with human-readable parsing support.
//!
//! Supports parsing from:
//! - Numbers (interpreted as bytes): `1048576`
//! - Strings with suffixes: `"1KB"`, `"1K"`, `"1MB"`, `"1M"`, `"1GB"`, `"1G"`

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Byte size with human-readable parsing support.
///
/// Plain numbers are bytes; `B`/`K`/`KB`/`M`/`MB`/`G`/`GB` suffixes use
/// binary prefixes (1 KB = 1024 bytes).
///
/// # Examples
/// ```toml
/// cache_mem = 268435456    # 256 MB
/// cache_mem = "256MB"      # same thing
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ByteSize(pub u64);

impl ByteSize {
    /// Creates a new ByteSize from bytes.
    pub const fn from_bytes(bytes: u64) -> Self {
        ByteSize(bytes)
    }

    /// Creates a new ByteSize from kilobytes.
    pub const fn from_kb(kb: u64) -> Self {
        ByteSize(kb * 1024)
    }

    /// Creates a new ByteSize from megabytes.
    pub const fn from_mb(mb: u64) -> Self {
        ByteSize(mb * 1024 * 1024)
    }

    /// Creates a new ByteSize from gigabytes.
    pub const fn from_gb(gb: u64) -> Self {
        ByteSize(gb * 1024 * 1024 * 1024)
    }

    /// Returns the size in bytes.
    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    /// Returns the size in bytes as usize.
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }

    /// Returns the size in megabytes (truncated).
    pub const fn as_mb(&self) -> u64 {
        self.0 / (1024 * 1024)
    }

    /// Parse the human-readable form, e.g. for directive values that are
    /// not deserialized through serde.
    pub fn parse_str(s: &str) -> Result<ByteSize, String> {
        parse_byte_size(s)
    }
}

impl From<u64> for ByteSize {
    fn from(bytes: u64) -> Self {
        ByteSize(bytes)
    }
}

impl From<ByteSize> for u64 {
    fn from(b: ByteSize) -> Self {
        b.0
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ByteSizeVisitor;

        impl de::Visitor<'_> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a byte size like '5MB', '1G', '512K' or a number in bytes")
            }

            fn visit_u64<E>(self, v: u64) -> Result<ByteSize, E> {
                Ok(ByteSize(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<ByteSize, E>
            where
                E: de::Error,
            {
                if v < 0 {
                    return Err(E::custom("byte size cannot be negative"));
                }
                Ok(ByteSize(v as u64))
            }

            fn visit_str<E>(self, s: &str) -> Result<ByteSize, E>
            where
                E: de::Error,
            {
                parse_byte_size(s).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

impl Serialize for ByteSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Serialize as number for backward compatibility
        serializer.serialize_u64(self.0)
    }
}

/// Case-insensitive suffix parsing; longer suffixes win.
fn parse_byte_size(s: &str) -> Result<ByteSize, String> {
    let s = s.trim();

    if let Ok(bytes) = s.parse::<u64>() {
        return Ok(ByteSize(bytes));
    }

    let s_lower = s.to_lowercase();

    let (num_str, multiplier) = if s_lower.ends_with("gb") {
        (&s[..s.len() - 2], 1024u64 * 1024 * 1024)
    } else if s_lower.ends_with('g') {
        (&s[..s.len() - 1], 1024u64 * 1024 * 1024)
    } else if s_lower.ends_with("mb") {
        (&s[..s.len() - 2], 1024u64 * 1024)
    } else if s_lower.ends_with('m') {
        (&s[..s.len() - 1], 1024u64 * 1024)
    } else if s_lower.ends_with("kb") {
        (&s[..s.len() - 2], 1024u64)
    } else if s_lower.ends_with('k') {
        (&s[..s.len() - 1], 1024u64)
    } else if s_lower.ends_with('b') {
        (&s[..s.len() - 1], 1u64)
    } else {
        return Err(format!(
            "invalid byte size format: '{s}'. Expected a number or a string with suffix (B, K, KB, M, MB, G, GB)"
        ));
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid number in byte size: '{num_str}'"))?;

    Ok(ByteSize(num * multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_and_suffixed() {
        assert_eq!(parse_byte_size("1024").unwrap(), ByteSize(1024));
        assert_eq!(parse_byte_size("1024B").unwrap(), ByteSize(1024));
        assert_eq!(parse_byte_size("1K").unwrap(), ByteSize(1024));
        assert_eq!(parse_byte_size("1kb").unwrap(), ByteSize(1024));
        assert_eq!(parse_byte_size("4 MB").unwrap(), ByteSize(4 * 1024 * 1024));
        assert_eq!(parse_byte_size("1G").unwrap(), ByteSize(1073741824));
        assert_eq!(parse_byte_size("  1MB  ").unwrap(), ByteSize(1048576));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_byte_size("").is_err());
        assert!(parse_byte_size("abc").is_err());
        assert!(parse_byte_size("5x").is_err());
        assert!(parse_byte_size("-5MB").is_err());
        assert!(parse_byte_size("5TB").is_err());
    }

    #[test]
    fn test_toml_number_and_string() {
        #[derive(Deserialize)]
        struct Conf {
            size: ByteSize,
        }
        let c: Conf = toml::from_str("size = 1048576").unwrap();
        assert_eq!(c.size, ByteSize(1048576));
        let c: Conf = toml::from_str("size = \"1MB\"").unwrap();
        assert_eq!(c.size, ByteSize(1048576));
    }
}
