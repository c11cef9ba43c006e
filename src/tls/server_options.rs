//! Listening-side TLS options: static contexts, the signing CA pair for
//! on-the-fly host certificates, and the bounded generated-cert cache.

use std::sync::Arc;

use log::{debug, info};
use lru::LruCache;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::ssl::{SslContext, SslMethod};
use openssl::x509::extension::{BasicConstraints, SubjectAlternativeName};
use openssl::x509::{X509Builder, X509Name, X509NameBuilder, X509};

use crate::errors::TlsConfigError;
use crate::tls::{KeyData, PeerOptions};

const DEFAULT_DYNAMIC_CERT_MEM_CACHE: usize = 4 * 1024 * 1024;
const MAX_CONTEXT_ID: usize = 32;
const GENERATED_CERT_DAYS: u32 = 365;

pub struct SigningCa {
    pub cert: X509,
    pub pkey: PKey<Private>,
}

/// One generated host certificate with its approximate memory cost.
pub struct HostCert {
    pub cert: X509,
    pub pkey: PKey<Private>,
    pub cost: usize,
}

/// Byte-budgeted LRU of generated host certificates.
pub struct GeneratedCertCache {
    entries: LruCache<String, Arc<HostCert>>,
    bytes: usize,
    budget: usize,
}

impl GeneratedCertCache {
    pub fn new(budget: usize) -> GeneratedCertCache {
        GeneratedCertCache {
            entries: LruCache::unbounded(),
            bytes: 0,
            budget: budget.max(1),
        }
    }

    pub fn get(&mut self, host: &str) -> Option<Arc<HostCert>> {
        self.entries.get(host).cloned()
    }

    pub fn put(&mut self, host: &str, cert: Arc<HostCert>) {
        self.bytes += cert.cost;
        if let Some(old) = self.entries.put(host.to_string(), cert) {
            self.bytes -= old.cost;
        }
        while self.bytes > self.budget && self.entries.len() > 1 {
            if let Some((_, evicted)) = self.entries.pop_lru() {
                self.bytes -= evicted.cost;
            }
        }
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Server-side TLS options: everything PeerOptions does, plus client-CA
/// handling, DH parameters and dynamic certificate generation.
pub struct ServerOptions {
    pub peer: PeerOptions,
    pub client_ca_file: Option<String>,
    pub eecdh_curve: Option<String>,
    pub dh_params_file: Option<String>,
    pub dynamic_cert_mem_cache_size: usize,
    pub generate_host_certificates: bool,
    pub static_context_session_id: Option<String>,

    pub static_context: Option<SslContext>,
    pub signing_ca: Option<SigningCa>,
    pub untrusted_signing_ca: Option<SigningCa>,
    pub cert_cache: Option<GeneratedCertCache>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            peer: PeerOptions::new(),
            client_ca_file: None,
            eecdh_curve: None,
            dh_params_file: None,
            dynamic_cert_mem_cache_size: DEFAULT_DYNAMIC_CERT_MEM_CACHE,
            generate_host_certificates: true,
            static_context_session_id: None,
            static_context: None,
            signing_ca: None,
            untrusted_signing_ca: None,
            cert_cache: None,
        }
    }
}

impl ServerOptions {
    pub fn new() -> ServerOptions {
        ServerOptions::default()
    }

    /// Parse one token; server-only tokens here, everything else falls
    /// through to the generic peer parser.
    pub fn parse(&mut self, token: &str) -> Result<(), TlsConfigError> {
        if token.is_empty() {
            self.peer.encrypt_transport = true;
            return Ok(());
        }

        if let Some(v) = token.strip_prefix("clientca=") {
            self.client_ca_file = Some(v.to_string());
        } else if let Some(v) = token.strip_prefix("dh=") {
            self.eecdh_curve = None;
            self.dh_params_file = None;
            if let Some((curve, file)) = v.split_once(':') {
                self.eecdh_curve = Some(curve.to_string());
                self.dh_params_file = Some(file.to_string());
            } else if !v.is_empty() {
                self.dh_params_file = Some(v.to_string());
            }
        } else if let Some(v) = token.strip_prefix("dynamic_cert_mem_cache_size=") {
            self.dynamic_cert_mem_cache_size = crate::config::ByteSize::parse_str(v)
                .map(|b| b.as_usize())
                .unwrap_or(DEFAULT_DYNAMIC_CERT_MEM_CACHE);
        } else if token == "generate-host-certificates"
            || token == "generate-host-certificates=on"
        {
            self.generate_host_certificates = true;
        } else if token == "generate-host-certificates=off" {
            self.generate_host_certificates = false;
        } else if let Some(v) = token.strip_prefix("context=") {
            if v.len() > MAX_CONTEXT_ID {
                return Err(TlsConfigError::ContextIdTooLong);
            }
            self.static_context_session_id = Some(v.to_string());
        } else {
            return Err(match self.peer.parse(token) {
                Ok(()) => return Ok(()),
                Err(e) => e,
            });
        }
        self.peer.encrypt_transport = true;
        Ok(())
    }

    pub fn enabled(&self) -> bool {
        self.peer.encrypt_transport
    }

    /// Build the static and (when configured) signing contexts for one
    /// listening port. Exactly one of {static cert, generated cert} will be
    /// picked per accepted connection.
    pub fn init_server_contexts(&mut self, port_name: &str) -> Result<(), TlsConfigError> {
        if !self.peer.certs.is_empty() {
            self.create_static_server_context(port_name)?;
        }
        if self.generate_host_certificates {
            self.create_signing_contexts(port_name)?;
        }
        Ok(())
    }

    fn create_static_server_context(&mut self, port_name: &str) -> Result<(), TlsConfigError> {
        self.peer.update_tls_version_limits()?;
        let mut b = SslContext::builder(SslMethod::tls_server())?;
        self.peer.update_context(&mut b)?;

        if let Some(ref file) = self.client_ca_file {
            let names = X509Name::load_client_ca_file(file)?;
            b.set_client_ca_list(names);
        }

        if let Some(ref file) = self.dh_params_file {
            let pem = std::fs::read(file).map_err(|error| TlsConfigError::LoadFile {
                path: file.clone(),
                error,
            })?;
            let dh = openssl::dh::Dh::params_from_pem(&pem)?;
            b.set_tmp_dh(&dh)?;
        }
        if let Some(ref curve) = self.eecdh_curve {
            let nid = match curve.as_str() {
                "prime256v1" => Nid::X9_62_PRIME256V1,
                "secp384r1" => Nid::SECP384R1,
                "secp521r1" => Nid::SECP521R1,
                other => {
                    log::warn!("unknown eecdh curve {other:?}, using prime256v1");
                    Nid::X9_62_PRIME256V1
                }
            };
            let group = EcGroup::from_curve_name(nid)?;
            let key = EcKey::from_group(&group)?;
            b.set_tmp_ecdh(&key)?;
        }

        if let Some(ref sid) = self.static_context_session_id {
            b.set_session_id_context(sid.as_bytes())?;
        }

        self.static_context = Some(b.build());
        info!("initialized static TLS context for {port_name}");
        Ok(())
    }

    /// Load the signing CA pair from the configured cert= pair, derive the
    /// untrusted variant, and size the generated-cert cache.
    fn create_signing_contexts(&mut self, port_name: &str) -> Result<(), TlsConfigError> {
        let Some(KeyData {
            cert_file,
            private_key_file,
        }) = self.peer.certs.first().cloned()
        else {
            debug!("no signing CA configured for {port_name}, dynamic certs disabled");
            self.generate_host_certificates = false;
            return Ok(());
        };

        let cert_pem = std::fs::read(&cert_file).map_err(|error| TlsConfigError::LoadFile {
            path: cert_file.clone(),
            error,
        })?;
        let key_pem =
            std::fs::read(&private_key_file).map_err(|error| TlsConfigError::LoadFile {
                path: private_key_file.clone(),
                error,
            })?;
        let cert = X509::from_pem(&cert_pem)?;
        let pkey = PKey::private_key_from_pem(&key_pem)?;

        self.untrusted_signing_ca = Some(generate_untrusted_ca(&cert)?);
        self.signing_ca = Some(SigningCa { cert, pkey });
        self.cert_cache = Some(GeneratedCertCache::new(self.dynamic_cert_mem_cache_size));
        info!(
            "initialized dynamic cert signing for {port_name} (cache {} bytes)",
            self.dynamic_cert_mem_cache_size
        );
        Ok(())
    }

    /// Fetch or mint a certificate for `host`, via the bounded cache.
    pub fn host_certificate(&mut self, host: &str) -> Result<Arc<HostCert>, TlsConfigError> {
        let ca = self
            .signing_ca
            .as_ref()
            .expect("host_certificate requires a signing CA");
        if let Some(cache) = self.cert_cache.as_mut() {
            if let Some(found) = cache.get(host) {
                return Ok(found);
            }
        }
        let minted = Arc::new(generate_host_cert(host, ca)?);
        if let Some(cache) = self.cert_cache.as_mut() {
            cache.put(host, minted.clone());
        }
        Ok(minted)
    }
}

fn random_serial() -> Result<openssl::asn1::Asn1Integer, openssl::error::ErrorStack> {
    let mut bn = BigNum::new()?;
    bn.rand(64, MsbOption::MAYBE_ZERO, false)?;
    bn.to_asn1_integer()
}

/// The untrusted twin of a signing CA: same naming shape, mangled subject
/// and an already-expired validity window, self-signed with a throwaway key.
fn generate_untrusted_ca(trusted: &X509) -> Result<SigningCa, TlsConfigError> {
    let rsa = Rsa::generate(2048)?;
    let pkey = PKey::from_rsa(rsa)?;

    let mut name = X509NameBuilder::new()?;
    let cn = trusted
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|e| e.data().as_utf8().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "signing CA".to_string());
    name.append_entry_by_nid(Nid::COMMONNAME, &format!("{cn} Untrusted"))?;
    let name = name.build();

    let mut b = X509Builder::new()?;
    b.set_version(2)?;
    let serial = random_serial()?;
    b.set_serial_number(&serial)?;
    b.set_subject_name(&name)?;
    b.set_issuer_name(&name)?;
    b.set_pubkey(&pkey)?;
    let not_before = Asn1Time::days_from_now(0)?;
    b.set_not_before(&not_before)?;
    // expired on arrival: clients must never trust this chain
    let not_after = Asn1Time::days_from_now(0)?;
    b.set_not_after(&not_after)?;
    b.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    b.sign(&pkey, MessageDigest::sha256())?;

    Ok(SigningCa {
        cert: b.build(),
        pkey,
    })
}

/// Mint a leaf certificate for `host`, signed by the port's CA.
pub fn generate_host_cert(host: &str, ca: &SigningCa) -> Result<HostCert, TlsConfigError> {
    let rsa = Rsa::generate(2048)?;
    let pkey = PKey::from_rsa(rsa)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, host)?;
    let name = name.build();

    let mut b = X509Builder::new()?;
    b.set_version(2)?;
    let serial = random_serial()?;
    b.set_serial_number(&serial)?;
    b.set_subject_name(&name)?;
    b.set_issuer_name(ca.cert.subject_name())?;
    b.set_pubkey(&pkey)?;
    let not_before = Asn1Time::days_from_now(0)?;
    b.set_not_before(&not_before)?;
    let not_after = Asn1Time::days_from_now(GENERATED_CERT_DAYS)?;
    b.set_not_after(&not_after)?;
    let ctx = b.x509v3_context(Some(&ca.cert), None);
    let san = SubjectAlternativeName::new().dns(host).build(&ctx)?;
    b.append_extension(san)?;
    b.sign(&ca.pkey, MessageDigest::sha256())?;
    let cert = b.build();

    let cost = cert.to_der().map(|d| d.len()).unwrap_or(0)
        + pkey.private_key_to_der().map(|d| d.len()).unwrap_or(0);
    Ok(HostCert { cert, pkey, cost })
}

/// Mint a self-signed CA pair; used by tests and first-run setups.
pub fn generate_signing_ca(cn: &str) -> Result<SigningCa, TlsConfigError> {
    let rsa = Rsa::generate(2048)?;
    let pkey = PKey::from_rsa(rsa)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, cn)?;
    let name = name.build();

    let mut b = X509Builder::new()?;
    b.set_version(2)?;
    let serial = random_serial()?;
    b.set_serial_number(&serial)?;
    b.set_subject_name(&name)?;
    b.set_issuer_name(&name)?;
    b.set_pubkey(&pkey)?;
    let not_before = Asn1Time::days_from_now(0)?;
    b.set_not_before(&not_before)?;
    let not_after = Asn1Time::days_from_now(3650)?;
    b.set_not_after(&not_after)?;
    b.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    b.sign(&pkey, MessageDigest::sha256())?;

    Ok(SigningCa {
        cert: b.build(),
        pkey,
    })
}
