//! Basic scheme: the base64 blob is the user key; concurrent requests with
//! the same blob collapse to one helper lookup.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

pub struct BasicCredentials {
    pub password: String,
}

/// Extract the base64 token from an `Authorization: Basic XXX` value.
pub fn token_from_header(value: &str) -> Option<&str> {
    let rest = value.trim_start();
    let rest = rest
        .strip_prefix("Basic ")
        .or_else(|| rest.strip_prefix("basic "))?;
    let token = rest.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Decode `base64(user:password)` into its parts.
pub fn split_token(token: &str) -> Option<(String, String)> {
    let raw = BASE64.decode(token.as_bytes()).ok()?;
    let text = String::from_utf8(raw).ok()?;
    let (user, pass) = text.split_once(':')?;
    if user.is_empty() {
        return None;
    }
    Some((user.to_string(), pass.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_and_token_decode() {
        let token = token_from_header("Basic QWxhZGRpbjpvcGVuc2VzYW1l").unwrap();
        assert_eq!(token, "QWxhZGRpbjpvcGVuc2VzYW1l");
        let (user, pass) = split_token(token).unwrap();
        assert_eq!(user, "Aladdin");
        assert_eq!(pass, "opensesame");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(token_from_header("Digest abc").is_none());
        assert!(token_from_header("Basic ").is_none());
        assert!(split_token("!!!notbase64!!!").is_none());
        // no colon separator
        assert!(split_token("dXNlcg==").is_none());
    }
}
