//! Listening-port directives: `http_port`, `https_port` and `ftp_port`
//! values parse into a `PortCfg` each.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::errors::Error;
use crate::tls::server_options::ServerOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortTransport {
    Http,
    Https,
    Ftp,
}

impl PortTransport {
    pub fn as_str(self) -> &'static str {
        match self {
            PortTransport::Http => "http",
            PortTransport::Https => "https",
            PortTransport::Ftp => "ftp",
        }
    }
}

/// TCP keepalive quadruple from `tcpkeepalive[=IDLE,INTERVAL,TIMEOUT]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpKeepAlive {
    pub enabled: bool,
    pub idle: u32,
    pub interval: u32,
    pub timeout: u32,
}

/// One configured listening port.
pub struct PortCfg {
    pub transport: PortTransport,
    pub addr: SocketAddr,
    pub name: String,
    pub intercepted: bool,
    pub tproxy: bool,
    pub accel: bool,
    pub vhost: bool,
    pub ssl_bump: bool,
    pub disable_pmtu_discovery: bool,
    pub keepalive: TcpKeepAlive,
    pub tls: Option<ServerOptions>,
}

impl PortCfg {
    /// Whether connections arrive via kernel redirection rather than by
    /// clients knowingly talking to us.
    pub fn transparent(&self) -> bool {
        self.intercepted || self.tproxy
    }
}

fn parse_bind_token(tok: &str) -> Result<SocketAddr, Error> {
    let bad = || Error::BadConfig(format!("invalid listen address {tok:?}"));

    // bare port
    if let Ok(port) = tok.parse::<u16>() {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    // addr:port, including [v6]:port
    tok.parse::<SocketAddr>().map_err(|_| bad())
}

fn parse_keepalive(val: Option<&str>) -> Result<TcpKeepAlive, Error> {
    let mut ka = TcpKeepAlive {
        enabled: true,
        idle: 0,
        interval: 0,
        timeout: 0,
    };
    let Some(val) = val else { return Ok(ka) };
    let parts: Vec<&str> = val.split(',').collect();
    if parts.len() != 3 {
        return Err(Error::BadConfig(format!(
            "tcpkeepalive expects IDLE,INTERVAL,TIMEOUT, got {val:?}"
        )));
    }
    let nums: Result<Vec<u32>, _> = parts.iter().map(|p| p.trim().parse()).collect();
    let nums =
        nums.map_err(|_| Error::BadConfig(format!("invalid tcpkeepalive value {val:?}")))?;
    ka.idle = nums[0];
    ka.interval = nums[1];
    ka.timeout = nums[2];
    Ok(ka)
}

/// Parse one port directive, e.g.
/// `"3128"`, `"192.0.2.1:3128 intercept tcpkeepalive=30,5,60"`,
/// `"443 ssl-bump cert=/etc/tls/ca.pem generate-host-certificates=on"`.
pub fn parse_port_directive(
    transport: PortTransport,
    directive: &str,
) -> Result<PortCfg, Error> {
    let mut tokens = directive.split_whitespace();
    let bind = tokens
        .next()
        .ok_or_else(|| Error::BadConfig("empty port directive".to_string()))?;
    let addr = parse_bind_token(bind)?;

    let mut cfg = PortCfg {
        transport,
        addr,
        name: format!("{}:{}", transport.as_str(), addr),
        intercepted: false,
        tproxy: false,
        accel: false,
        vhost: false,
        ssl_bump: false,
        disable_pmtu_discovery: false,
        keepalive: TcpKeepAlive::default(),
        tls: None,
    };
    let mut tls = ServerOptions::new();

    for tok in tokens {
        match tok {
            "intercept" | "transparent" => cfg.intercepted = true,
            "tproxy" => cfg.tproxy = true,
            "accel" => cfg.accel = true,
            "vhost" => cfg.vhost = true,
            "ssl-bump" => cfg.ssl_bump = true,
            "disable-pmtu-discovery" => cfg.disable_pmtu_discovery = true,
            "tcpkeepalive" => cfg.keepalive = parse_keepalive(None)?,
            _ => {
                if let Some(v) = tok.strip_prefix("tcpkeepalive=") {
                    cfg.keepalive = parse_keepalive(Some(v))?;
                } else if let Some(v) = tok.strip_prefix("name=") {
                    cfg.name = v.to_string();
                } else {
                    // everything else is a TLS token; bad ones are fatal for
                    // listening-port initialization
                    tls.parse(tok)?;
                }
            }
        }
    }

    if tls.enabled() {
        if transport == PortTransport::Http && !cfg.ssl_bump {
            return Err(Error::BadConfig(format!(
                "TLS options on plain http_port {bind} require ssl-bump"
            )));
        }
        cfg.tls = Some(tls);
    } else if transport == PortTransport::Https {
        return Err(Error::BadConfig(format!(
            "https_port {bind} needs cert= or generate-host-certificates"
        )));
    }

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_port_binds_any() {
        let p = parse_port_directive(PortTransport::Http, "3128").unwrap();
        assert_eq!(p.addr, "0.0.0.0:3128".parse().unwrap());
        assert!(!p.transparent());
        assert!(p.tls.is_none());
    }

    #[test]
    fn test_addr_port_and_flags() {
        let p = parse_port_directive(
            PortTransport::Http,
            "192.0.2.1:8080 intercept vhost disable-pmtu-discovery tcpkeepalive=30,5,60",
        )
        .unwrap();
        assert_eq!(p.addr, "192.0.2.1:8080".parse().unwrap());
        assert!(p.intercepted);
        assert!(p.vhost);
        assert!(p.disable_pmtu_discovery);
        assert_eq!(
            p.keepalive,
            TcpKeepAlive {
                enabled: true,
                idle: 30,
                interval: 5,
                timeout: 60
            }
        );
    }

    #[test]
    fn test_ipv6_bind() {
        let p = parse_port_directive(PortTransport::Ftp, "[::1]:2121 tproxy").unwrap();
        assert_eq!(p.addr, "[::1]:2121".parse().unwrap());
        assert!(p.tproxy);
        assert!(p.transparent());
    }

    #[test]
    fn test_https_requires_tls_material() {
        assert!(parse_port_directive(PortTransport::Https, "443").is_err());
        let p = parse_port_directive(
            PortTransport::Https,
            "443 cert=/etc/tls/site.pem min-version=1.2",
        )
        .unwrap();
        let tls = p.tls.expect("tls configured");
        assert_eq!(tls.peer.certs[0].cert_file, "/etc/tls/site.pem");
    }

    #[test]
    fn test_unknown_tls_token_is_fatal_for_ports() {
        assert!(parse_port_directive(PortTransport::Https, "443 cert=/x.pem blorp=1").is_err());
    }

    #[test]
    fn test_ssl_bump_gate_on_plain_http() {
        assert!(parse_port_directive(PortTransport::Http, "3128 cert=/x.pem").is_err());
        let p =
            parse_port_directive(PortTransport::Http, "3128 ssl-bump cert=/x.pem").unwrap();
        assert!(p.ssl_bump);
        assert!(p.tls.is_some());
    }

    #[test]
    fn test_bad_keepalive_rejected() {
        assert!(parse_port_directive(PortTransport::Http, "3128 tcpkeepalive=1,2").is_err());
        assert!(parse_port_directive(PortTransport::Http, "3128 tcpkeepalive=a,b,c").is_err());
    }
}
