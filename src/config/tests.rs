//! Configuration parsing and validation tests.

use std::io::Write;

use serial_test::serial;

use super::*;

fn write_temp(contents: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    f.flush().unwrap();
    f
}

#[test]
#[serial]
fn test_parse_minimal_config() {
    let f = write_temp(
        r#"
http_port = ["3128"]

[general]
workers = 2
max_connections = 1024
cache_mem = "64MB"
connect_timeout = "10s"
"#,
    );
    parse(f.path().to_str().unwrap()).unwrap();
    let c = get_config();
    assert_eq!(c.general.workers, 2);
    assert_eq!(c.general.max_connections, 1024);
    assert_eq!(c.general.cache_mem, ByteSize::from_mb(64));
    assert_eq!(c.general.connect_timeout, Duration::from_secs(10));
    assert_eq!(c.http_port, vec!["3128".to_string()]);
    install(Config::default());
}

#[test]
#[serial]
fn test_include_files_merge() {
    let extra = write_temp(
        r#"
[general]
visible_hostname = "edge-1"
"#,
    );
    let main = write_temp(&format!(
        r#"
http_port = ["3128"]

[include]
files = [{:?}]

[general]
workers = 1
"#,
        extra.path().to_str().unwrap()
    ));
    parse(main.path().to_str().unwrap()).unwrap();
    let c = get_config();
    assert_eq!(c.general.visible_hostname, "edge-1");
    assert_eq!(c.general.workers, 1);
    install(Config::default());
}

#[test]
fn test_validate_rejects_empty_ports() {
    let mut c = Config::default();
    assert!(c.validate().is_err());
    c.http_port.push("3128".to_string());
    c.validate().unwrap();
}

#[test]
fn test_validate_rejects_bad_backend() {
    let mut c = Config {
        http_port: vec!["3128".into()],
        ..Config::default()
    };
    c.general.event_backend = "kqueue".to_string();
    assert!(c.validate().is_err());
}

#[test]
fn test_validate_rejects_bad_port_directive() {
    let mut c = Config {
        http_port: vec!["not-a-port".into()],
        ..Config::default()
    };
    assert!(c.validate().is_err());
}

#[test]
fn test_validate_rejects_bad_parent() {
    let mut c = Config {
        http_port: vec!["3128".into()],
        ..Config::default()
    };
    c.general.parent_proxy = Some("no-port-here".to_string());
    assert!(c.validate().is_err());
    c.general.parent_proxy = Some("upstream.example:3128".to_string());
    c.validate().unwrap();
}

#[test]
fn test_listening_ports_across_kinds() {
    let c = Config {
        http_port: vec!["3128".into()],
        ftp_port: vec!["2121".into()],
        ..Config::default()
    };
    let ports = c.listening_ports().unwrap();
    assert_eq!(ports.len(), 2);
    assert_eq!(ports[0].transport, PortTransport::Http);
    assert_eq!(ports[1].transport, PortTransport::Ftp);
}

#[test]
fn test_auth_users_table() {
    let c: Config = toml::from_str(
        r#"
http_port = ["3128"]

[auth.basic_users]
alice = "sesame"
"#,
    )
    .unwrap();
    assert_eq!(c.auth.basic_users.get("alice").map(String::as_str), Some("sesame"));
}
