//! Declarative TLS configuration: the `cert=/key=/options=/min-version=`
//! token language and its translation into concrete OpenSSL contexts.

pub mod certdb;
pub mod server_options;

use std::path::Path;

use iota::iota;
use log::{debug, warn};
use openssl::ssl::{
    SslContext, SslContextBuilder, SslFiletype, SslMethod, SslOptions, SslSessionCacheMode,
    SslVerifyMode,
};
use openssl::x509::{X509Crl, X509};

use crate::errors::TlsConfigError;

iota! {
    pub const TLS_FLAG_NO_DEFAULT_CA: u32 = 1 << iota;
        , TLS_FLAG_DELAYED_AUTH
        , TLS_FLAG_DONT_VERIFY_PEER
        , TLS_FLAG_DONT_VERIFY_DOMAIN
        , TLS_FLAG_NO_SESSION_REUSE
        , TLS_FLAG_VERIFY_CRL
        , TLS_FLAG_VERIFY_CRL_ALL
}

/// A certificate/private-key file pair. `cert=` without an explicit `key=`
/// uses the certificate file for both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyData {
    pub cert_file: String,
    pub private_key_file: String,
}

/// Symbolic `options=` names and the OpenSSL bits they map to. The mask is
/// carried as u64 so bare hex literals always fit, whatever the library's
/// own representation.
fn option_table() -> Vec<(&'static str, u64)> {
    vec![
        ("ALL", SslOptions::ALL.bits() as u64),
        ("NO_SSLv2", SslOptions::NO_SSLV2.bits() as u64),
        ("NO_SSLv3", SslOptions::NO_SSLV3.bits() as u64),
        ("NO_TLSv1", SslOptions::NO_TLSV1.bits() as u64),
        ("NO_TLSv1_1", SslOptions::NO_TLSV1_1.bits() as u64),
        ("NO_TLSv1_2", SslOptions::NO_TLSV1_2.bits() as u64),
        ("NO_TLSv1_3", SslOptions::NO_TLSV1_3.bits() as u64),
        ("NO_TICKET", SslOptions::NO_TICKET.bits() as u64),
        ("SINGLE_DH_USE", SslOptions::SINGLE_DH_USE.bits() as u64),
        ("SINGLE_ECDH_USE", SslOptions::SINGLE_ECDH_USE.bits() as u64),
        (
            "CIPHER_SERVER_PREFERENCE",
            SslOptions::CIPHER_SERVER_PREFERENCE.bits() as u64,
        ),
        ("NO_COMPRESSION", SslOptions::NO_COMPRESSION.bits() as u64),
        (
            "ALLOW_UNSAFE_LEGACY_RENEGOTIATION",
            SslOptions::ALLOW_UNSAFE_LEGACY_RENEGOTIATION.bits() as u64,
        ),
        ("TLS_ROLLBACK_BUG", SslOptions::TLS_ROLLBACK_BUG.bits() as u64),
    ]
}

/// Declarative TLS peer (outgoing / generic) options.
#[derive(Default)]
pub struct PeerOptions {
    pub certs: Vec<KeyData>,
    pub ca_files: Vec<String>,
    pub ca_dir: Option<String>,
    pub crl_file: Option<String>,
    pub ssl_cipher: Option<String>,
    pub ssl_options: String,
    pub parsed_options: u64,
    pub tls_min_version: Option<String>,
    min_version_applied: bool,
    pub ssl_flags: String,
    pub parsed_flags: u32,
    pub tls_default_ca: Option<bool>,
    pub ssl_domain: Option<String>,
    pub tls_npn: bool,
    pub encrypt_transport: bool,
    crls: Vec<X509Crl>,
}

impl PeerOptions {
    pub fn new() -> PeerOptions {
        PeerOptions {
            tls_npn: true,
            ..Default::default()
        }
    }

    /// Reset to "no TLS here".
    pub fn clear(&mut self) {
        *self = PeerOptions::new();
    }

    /// Parse one configuration token.
    pub fn parse(&mut self, token: &str) -> Result<(), TlsConfigError> {
        if token.is_empty() {
            // config says just "ssl" or "tls"
            self.encrypt_transport = true;
            return Ok(());
        }

        if token == "disable" {
            self.clear();
            return Ok(());
        }

        if let Some(v) = token.strip_prefix("cert=") {
            self.certs.push(KeyData {
                cert_file: v.to_string(),
                private_key_file: v.to_string(),
            });
        } else if let Some(v) = token.strip_prefix("key=") {
            let last = self
                .certs
                .last_mut()
                .ok_or(TlsConfigError::KeyWithoutCert)?;
            last.private_key_file = v.to_string();
        } else if let Some(v) = token.strip_prefix("min-version=") {
            self.tls_min_version = Some(v.to_string());
            self.min_version_applied = false;
        } else if let Some(v) = token.strip_prefix("options=") {
            self.ssl_options = v.to_string();
            self.parse_options()?;
        } else if let Some(v) = token.strip_prefix("cipher=") {
            self.ssl_cipher = Some(v.to_string());
        } else if let Some(v) = token.strip_prefix("cafile=") {
            self.ca_files.push(v.to_string());
        } else if let Some(v) = token.strip_prefix("capath=") {
            self.ca_dir = Some(v.to_string());
        } else if let Some(v) = token.strip_prefix("crlfile=") {
            self.crl_file = Some(v.to_string());
            self.load_crl_file()?;
        } else if let Some(v) = token.strip_prefix("flags=") {
            if self.parsed_flags != 0 {
                warn!("overwriting flags={} with {v}", self.ssl_flags);
            }
            self.ssl_flags = v.to_string();
            self.parsed_flags = self.parse_flags()?;
        } else if token == "default-ca=off" || token == "no-default-ca" {
            self.tls_default_ca = Some(false);
        } else if token == "default-ca=on" || token == "default-ca" {
            self.tls_default_ca = Some(true);
        } else if let Some(v) = token.strip_prefix("domain=") {
            self.ssl_domain = Some(v.to_string());
        } else if token == "no-npn" {
            self.tls_npn = false;
        } else {
            return Err(TlsConfigError::UnknownOption(token.to_string()));
        }

        self.encrypt_transport = true;
        Ok(())
    }

    /// Translate the `options=` token list into an option-bit mask. Tokens
    /// separate on `:` or `,`, each optionally prefixed with `+`, `!` or
    /// `-`; a bare hexadecimal literal is a raw bitmask.
    pub fn parse_options(&mut self) -> Result<(), TlsConfigError> {
        let mut op: u64 = 0;

        for raw in self
            .ssl_options
            .split([':', ','])
            .filter(|t| !t.is_empty())
        {
            let (remove, name) = match raw.strip_prefix(['-', '!']) {
                Some(rest) => (true, rest),
                None => (false, raw.strip_prefix('+').unwrap_or(raw)),
            };

            let mut value = option_table()
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| *v);
            if value.is_none() {
                // hex literal escape hatch for unlisted bits
                value = u64::from_str_radix(name.trim_start_matches("0x"), 16).ok();
            }
            let value =
                value.ok_or_else(|| TlsConfigError::UnknownOption(name.to_string()))?;

            if remove {
                op &= !value;
            } else {
                op |= value;
            }
        }

        // RFC 6176 compliance: SSLv2 stays prohibited
        op |= SslOptions::NO_SSLV2.bits() as u64;
        self.parsed_options = op;
        self.min_version_applied = false;
        Ok(())
    }

    /// Translate the `flags=` token list into the verification-time mask.
    pub fn parse_flags(&mut self) -> Result<u32, TlsConfigError> {
        if self.ssl_flags.is_empty() {
            return Ok(0);
        }
        static FLAG_TABLE: [(&str, u32); 7] = [
            ("NO_DEFAULT_CA", TLS_FLAG_NO_DEFAULT_CA),
            ("DELAYED_AUTH", TLS_FLAG_DELAYED_AUTH),
            ("DONT_VERIFY_PEER", TLS_FLAG_DONT_VERIFY_PEER),
            ("DONT_VERIFY_DOMAIN", TLS_FLAG_DONT_VERIFY_DOMAIN),
            ("NO_SESSION_REUSE", TLS_FLAG_NO_SESSION_REUSE),
            ("VERIFY_CRL", TLS_FLAG_VERIFY_CRL),
            ("VERIFY_CRL_ALL", TLS_FLAG_VERIFY_CRL_ALL),
        ];

        let mut fl = 0u32;
        for tok in self.ssl_flags.split([':', ',']).filter(|t| !t.is_empty()) {
            let found = FLAG_TABLE
                .iter()
                .find(|(n, _)| *n == tok)
                .map(|(_, v)| *v)
                .ok_or_else(|| TlsConfigError::UnknownFlag(tok.to_string()))?;
            if found == TLS_FLAG_NO_DEFAULT_CA {
                warn!("flags=NO_DEFAULT_CA is deprecated, use default-ca=off instead");
                self.tls_default_ca = Some(false);
            } else {
                fl |= found;
            }
        }
        Ok(fl)
    }

    /// Fold `min-version=1.N` into the option mask as NO_TLSv1.0..1.(N-1).
    /// Applied exactly once per parse; a re-parse re-requests it.
    pub fn update_tls_version_limits(&mut self) -> Result<(), TlsConfigError> {
        if self.min_version_applied {
            return Ok(());
        }
        self.min_version_applied = true;
        let Some(ref mv) = self.tls_min_version else {
            return Ok(());
        };
        let v: u8 = mv
            .strip_prefix("1.")
            .and_then(|n| n.parse().ok())
            .filter(|n| *n <= 3)
            .ok_or_else(|| TlsConfigError::BadMinVersion(mv.clone()))?;
        if v > 0 {
            self.parsed_options |= SslOptions::NO_TLSV1.bits() as u64;
        }
        if v > 1 {
            self.parsed_options |= SslOptions::NO_TLSV1_1.bits() as u64;
        }
        if v > 2 {
            self.parsed_options |= SslOptions::NO_TLSV1_2.bits() as u64;
        }
        Ok(())
    }

    fn load_crl_file(&mut self) -> Result<(), TlsConfigError> {
        let path = self.crl_file.clone().expect("crl path was just set");
        let pem = std::fs::read(&path).map_err(|error| TlsConfigError::LoadFile {
            path: path.clone(),
            error,
        })?;
        self.crls.clear();
        // a file may carry several CRLs; accept any prefix that parses
        let text = String::from_utf8_lossy(&pem);
        for block in text.split_inclusive("-----END X509 CRL-----") {
            if block.contains("-----BEGIN X509 CRL-----") {
                self.crls.push(X509Crl::from_pem(block.as_bytes())?);
            }
        }
        debug!("loaded {} CRL(s) from {path}", self.crls.len());
        Ok(())
    }

    /// Steps shared by client and server context construction.
    pub(crate) fn update_context(
        &self,
        b: &mut SslContextBuilder,
    ) -> Result<(), TlsConfigError> {
        b.set_options(SslOptions::from_bits_retain(self.parsed_options as _));

        if let Some(ref cipher) = self.ssl_cipher {
            b.set_cipher_list(cipher)?;
        }

        for keys in &self.certs {
            b.set_certificate_chain_file(&keys.cert_file)?;
            b.set_private_key_file(&keys.private_key_file, SslFiletype::PEM)?;
            b.check_private_key()?;
        }

        for ca in &self.ca_files {
            b.set_ca_file(ca)?;
        }
        if let Some(ref dir) = self.ca_dir {
            self.load_ca_dir(b, dir)?;
        }
        if self.tls_default_ca.unwrap_or(true) {
            b.set_default_verify_paths()?;
        }

        if self.parsed_flags & TLS_FLAG_NO_SESSION_REUSE != 0 {
            b.set_session_cache_mode(SslSessionCacheMode::OFF);
        }

        if self.tls_npn {
            b.set_alpn_protos(b"\x08http/1.1")?;
        }

        if self.parsed_flags & TLS_FLAG_DONT_VERIFY_PEER != 0 {
            b.set_verify(SslVerifyMode::NONE);
        } else {
            self.install_verify_callback(b);
        }

        Ok(())
    }

    /// Peer verification: library chain checks plus our CRL serial check
    /// when `VERIFY_CRL` is configured.
    fn install_verify_callback(&self, b: &mut SslContextBuilder) {
        let check_crl = self.parsed_flags & (TLS_FLAG_VERIFY_CRL | TLS_FLAG_VERIFY_CRL_ALL) != 0;
        let check_all = self.parsed_flags & TLS_FLAG_VERIFY_CRL_ALL != 0;
        let revoked: Vec<Vec<u8>> = if check_crl {
            self.crls
                .iter()
                .flat_map(|crl| crl.get_revoked().into_iter().flatten())
                .filter_map(|r| r.serial_number().to_bn().ok())
                .map(|bn| bn.to_vec())
                .collect()
        } else {
            Vec::new()
        };

        b.set_verify_callback(SslVerifyMode::PEER, move |preverified, ctx| {
            if !preverified {
                return false;
            }
            if revoked.is_empty() {
                return true;
            }
            let depth = ctx.error_depth();
            if depth > 0 && !check_all {
                return true;
            }
            let Some(cert) = ctx.current_cert() else {
                return true;
            };
            let serial = cert
                .serial_number()
                .to_bn()
                .map(|bn| bn.to_vec())
                .unwrap_or_default();
            !revoked.iter().any(|r| r == &serial)
        });
    }

    fn load_ca_dir(
        &self,
        b: &mut SslContextBuilder,
        dir: &str,
    ) -> Result<(), TlsConfigError> {
        let entries = std::fs::read_dir(dir).map_err(|error| TlsConfigError::LoadFile {
            path: dir.to_string(),
            error,
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "pem" || e == "crt").unwrap_or(false) {
                if let Ok(pem) = std::fs::read(&path) {
                    for cert in X509::stack_from_pem(&pem)? {
                        b.cert_store_mut().add_cert(cert)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Build a TLS client context from these options.
    pub fn create_client_context(&mut self) -> Result<SslContext, TlsConfigError> {
        self.update_tls_version_limits()?;
        let mut b = SslContext::builder(SslMethod::tls_client())?;
        self.update_context(&mut b)?;
        Ok(b.build())
    }
}

/// Parse a whitespace-separated run of TLS tokens (outgoing directives).
/// Unknown tokens are logged, not fatal, matching the outgoing-side rule.
pub fn parse_outgoing(tokens: &str) -> PeerOptions {
    let mut opts = PeerOptions::new();
    for tok in tokens.split_whitespace() {
        if let Err(e) = opts.parse(tok) {
            log::error!("ignoring outgoing TLS token: {e}");
        }
    }
    opts
}

pub fn file_exists(path: &str) -> bool {
    Path::new(path).exists()
}

#[cfg(test)]
mod tests;
