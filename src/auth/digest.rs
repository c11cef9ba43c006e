//! Digest scheme payload: HA1 plus the nonce set the user owns. The nonce
//! set is the single owning side; anything else holds plain copies of the
//! nonce value.

use md5::{Digest as _, Md5};
use rand::Rng;

use crate::utils::clock;

/// How long one nonce stays usable.
pub const NONCE_MAX_DURATION: i64 = 30 * 60;
/// Uses allowed per nonce before clients must be handed a fresh one.
pub const NONCE_MAX_USES: u32 = 50;

#[derive(Debug, Clone)]
pub struct Nonce {
    pub value: String,
    pub created: i64,
    pub uses: u32,
}

impl Nonce {
    pub fn generate() -> Nonce {
        let mut rng = rand::rng();
        let raw: [u8; 16] = rng.random();
        let mut hex = String::with_capacity(32);
        for b in raw {
            hex.push_str(&format!("{b:02x}"));
        }
        Nonce {
            value: hex,
            created: clock::current_time(),
            uses: 0,
        }
    }

    pub fn deadline(&self) -> i64 {
        self.created + NONCE_MAX_DURATION
    }

    pub fn stale(&self, now: i64) -> bool {
        now >= self.deadline() || self.uses >= NONCE_MAX_USES
    }
}

#[derive(Default)]
pub struct DigestCredentials {
    /// MD5(user:realm:password), kept instead of the password itself.
    pub ha1: Option<[u8; 16]>,
    pub nonces: Vec<Nonce>,
}

impl DigestCredentials {
    /// The earliest moment any of this user's nonces dies; drives the
    /// per-scheme credentials-cache TTL.
    pub fn oldest_nonce_deadline(&self) -> Option<i64> {
        self.nonces.iter().map(Nonce::deadline).min()
    }

    pub fn note_nonce(&mut self, nonce: Nonce) {
        self.nonces.push(nonce);
    }

    pub fn drop_stale_nonces(&mut self, now: i64) {
        self.nonces.retain(|n| !n.stale(now));
    }
}

/// HA1 = MD5(user ":" realm ":" password)
pub fn ha1(user: &str, realm: &str, password: &str) -> [u8; 16] {
    let mut h = Md5::new();
    h.update(user.as_bytes());
    h.update(b":");
    h.update(realm.as_bytes());
    h.update(b":");
    h.update(password.as_bytes());
    h.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ha1_is_rfc2617_example() {
        // RFC 2617 section 3.5 example credentials
        let h = ha1("Mufasa", "testrealm@host.com", "Circle Of Life");
        let hex: String = h.iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(hex, "939e7578ed9e3c518a452acee763bce9");
    }

    #[test]
    fn test_nonce_lifecycle() {
        crate::utils::clock::update_current_time();
        let mut creds = DigestCredentials::default();
        assert!(creds.oldest_nonce_deadline().is_none());

        let n = Nonce::generate();
        assert_eq!(n.value.len(), 32);
        let deadline = n.deadline();
        creds.note_nonce(n);
        assert_eq!(creds.oldest_nonce_deadline(), Some(deadline));

        // an exhausted nonce is stale regardless of age
        let mut worn = Nonce::generate();
        worn.uses = NONCE_MAX_USES;
        creds.note_nonce(worn);
        creds.drop_stale_nonces(clock::current_time());
        assert_eq!(creds.nonces.len(), 1);
    }
}
