//! TLS option-language and context tests.

use openssl::ssl::SslOptions;

use super::server_options::{generate_host_cert, generate_signing_ca, ServerOptions};
use super::*;

#[test]
fn test_cert_without_key_defaults_key_to_cert() {
    let mut o = PeerOptions::new();
    o.parse("cert=/etc/tls/proxy.pem").unwrap();
    assert_eq!(
        o.certs,
        vec![KeyData {
            cert_file: "/etc/tls/proxy.pem".into(),
            private_key_file: "/etc/tls/proxy.pem".into(),
        }]
    );
    o.parse("key=/etc/tls/proxy.key").unwrap();
    assert_eq!(o.certs[0].private_key_file, "/etc/tls/proxy.key");
}

#[test]
fn test_key_before_cert_is_an_error() {
    let mut o = PeerOptions::new();
    assert!(matches!(
        o.parse("key=/etc/tls/key.pem"),
        Err(TlsConfigError::KeyWithoutCert)
    ));
}

#[test]
fn test_option_mask_symbolic_and_hex() {
    let mut o = PeerOptions::new();
    o.parse("options=NO_SSLv3:NO_TICKET").unwrap();
    assert!(o.parsed_options & SslOptions::NO_SSLV3.bits() as u64 != 0);
    assert!(o.parsed_options & SslOptions::NO_TICKET.bits() as u64 != 0);
    // SSLv2 prohibition is unconditional
    assert!(o.parsed_options & SslOptions::NO_SSLV2.bits() as u64 != 0);

    let mut h = PeerOptions::new();
    h.parse("options=0x10").unwrap();
    assert!(h.parsed_options & 0x10 != 0);
}

#[test]
fn test_option_add_then_remove_round_trips() {
    let mut base = PeerOptions::new();
    base.parse("options=NO_TICKET").unwrap();

    let mut toggled = PeerOptions::new();
    toggled
        .parse("options=NO_TICKET:+CIPHER_SERVER_PREFERENCE:-CIPHER_SERVER_PREFERENCE")
        .unwrap();
    assert_eq!(base.parsed_options, toggled.parsed_options);

    // '!' negates like '-'
    let mut bang = PeerOptions::new();
    bang.parse("options=NO_TICKET,CIPHER_SERVER_PREFERENCE,!CIPHER_SERVER_PREFERENCE")
        .unwrap();
    assert_eq!(base.parsed_options, bang.parsed_options);
}

#[test]
fn test_unknown_option_is_an_error() {
    let mut o = PeerOptions::new();
    assert!(matches!(
        o.parse("options=NO_SUCH_THING"),
        Err(TlsConfigError::UnknownOption(_))
    ));
    assert!(matches!(
        o.parse("frobnicate=yes"),
        Err(TlsConfigError::UnknownOption(_))
    ));
}

#[test]
fn test_min_version_sets_protocol_mask() {
    let mut o = PeerOptions::new();
    o.parse("min-version=1.2").unwrap();
    o.update_tls_version_limits().unwrap();
    assert!(o.parsed_options & SslOptions::NO_TLSV1.bits() as u64 != 0);
    assert!(o.parsed_options & SslOptions::NO_TLSV1_1.bits() as u64 != 0);
    assert!(o.parsed_options & SslOptions::NO_TLSV1_2.bits() as u64 == 0);

    // applied exactly once: a second call does not re-apply after clearing
    o.parsed_options = 0;
    o.update_tls_version_limits().unwrap();
    assert_eq!(o.parsed_options, 0);

    let mut bad = PeerOptions::new();
    bad.parse("min-version=2.0").unwrap();
    assert!(matches!(
        bad.update_tls_version_limits(),
        Err(TlsConfigError::BadMinVersion(_))
    ));
}

#[test]
fn test_flags_parse_to_mask() {
    let mut o = PeerOptions::new();
    o.parse("flags=DONT_VERIFY_PEER:NO_SESSION_REUSE").unwrap();
    assert!(o.parsed_flags & TLS_FLAG_DONT_VERIFY_PEER != 0);
    assert!(o.parsed_flags & TLS_FLAG_NO_SESSION_REUSE != 0);
    assert!(o.parsed_flags & TLS_FLAG_VERIFY_CRL == 0);

    // NO_DEFAULT_CA folds into the default-ca setting instead of the mask
    let mut d = PeerOptions::new();
    d.parse("flags=NO_DEFAULT_CA").unwrap();
    assert_eq!(d.tls_default_ca, Some(false));
    assert_eq!(d.parsed_flags & TLS_FLAG_NO_DEFAULT_CA, 0);

    let mut bad = PeerOptions::new();
    assert!(matches!(
        bad.parse("flags=NOT_A_FLAG"),
        Err(TlsConfigError::UnknownFlag(_))
    ));
}

#[test]
fn test_disable_clears_everything() {
    let mut o = PeerOptions::new();
    o.parse("cert=/x.pem").unwrap();
    o.parse("disable").unwrap();
    assert!(!o.encrypt_transport);
    assert!(o.certs.is_empty());
}

#[test]
fn test_outgoing_parser_logs_and_continues() {
    let o = parse_outgoing("cipher=HIGH bogus-token=1 min-version=1.1");
    assert_eq!(o.ssl_cipher.as_deref(), Some("HIGH"));
    assert_eq!(o.tls_min_version.as_deref(), Some("1.1"));
}

#[test]
fn test_client_context_builds_from_defaults() {
    let mut o = PeerOptions::new();
    o.parse("options=NO_SSLv3").unwrap();
    o.parse("min-version=1.2").unwrap();
    let ctx = o.create_client_context().expect("client context");
    drop(ctx);
}

#[test]
fn test_server_only_tokens() {
    let mut s = ServerOptions::new();
    s.parse("clientca=/etc/tls/clients.pem").unwrap();
    s.parse("dh=prime256v1:/etc/tls/dh.pem").unwrap();
    s.parse("dynamic_cert_mem_cache_size=8 MB").unwrap();
    s.parse("generate-host-certificates=off").unwrap();
    s.parse("context=edge-1").unwrap();
    assert_eq!(s.client_ca_file.as_deref(), Some("/etc/tls/clients.pem"));
    assert_eq!(s.eecdh_curve.as_deref(), Some("prime256v1"));
    assert_eq!(s.dh_params_file.as_deref(), Some("/etc/tls/dh.pem"));
    assert_eq!(s.dynamic_cert_mem_cache_size, 8 * 1024 * 1024);
    assert!(!s.generate_host_certificates);

    // generic tokens still reach the peer parser
    s.parse("cipher=HIGH").unwrap();
    assert_eq!(s.peer.ssl_cipher.as_deref(), Some("HIGH"));

    let long = format!("context={}", "x".repeat(64));
    assert!(matches!(
        s.parse(&long),
        Err(TlsConfigError::ContextIdTooLong)
    ));
}

#[test]
fn test_generated_host_cert_names_the_host() {
    let ca = generate_signing_ca("kestrel test CA").unwrap();
    let host = generate_host_cert("secure.example.com", &ca).unwrap();

    let cn = host
        .cert
        .subject_name()
        .entries_by_nid(openssl::nid::Nid::COMMONNAME)
        .next()
        .unwrap()
        .data()
        .as_utf8()
        .unwrap()
        .to_string();
    assert_eq!(cn, "secure.example.com");
    assert!(host.cost > 0);

    // signed by the CA, not self-signed
    let issuer_cn = host
        .cert
        .issuer_name()
        .entries_by_nid(openssl::nid::Nid::COMMONNAME)
        .next()
        .unwrap()
        .data()
        .as_utf8()
        .unwrap()
        .to_string();
    assert_eq!(issuer_cn, "kestrel test CA");
}

#[test]
fn test_cert_cache_respects_byte_budget() {
    use super::server_options::GeneratedCertCache;
    let ca = generate_signing_ca("budget CA").unwrap();

    let a = std::sync::Arc::new(generate_host_cert("a.example", &ca).unwrap());
    let budget = a.cost * 2 + a.cost / 2; // room for ~2 certs
    let mut cache = GeneratedCertCache::new(budget);

    cache.put("a.example", a.clone());
    let b = std::sync::Arc::new(generate_host_cert("b.example", &ca).unwrap());
    cache.put("b.example", b);
    assert_eq!(cache.len(), 2);

    let c = std::sync::Arc::new(generate_host_cert("c.example", &ca).unwrap());
    cache.put("c.example", c);
    // oldest entry was evicted to stay within budget
    assert!(cache.bytes() <= budget);
    assert!(cache.get("a.example").is_none());
    assert!(cache.get("c.example").is_some());
}
