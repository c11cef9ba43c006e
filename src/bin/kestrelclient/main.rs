//! kestrelclient: a small test client for driving the proxy, with optional
//! TLS and a synthetic-load ping mode.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use clap::{ArgAction, Parser};
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};

use kestrel::http::date::{mkrfc1123, parse_rfc1123};

#[derive(Parser, Debug)]
#[command(author, version, about = "kestrel test client", disable_help_flag = true)]
struct Args {
    /// Host to connect to (the proxy).
    #[arg(short = 'h', long, default_value = "localhost")]
    host: String,

    /// Port to connect to.
    #[arg(short = 'p', long, default_value_t = 3128)]
    port: u16,

    /// Request method.
    #[arg(short = 'm', long, default_value = "GET")]
    method: String,

    /// Extra request header, repeatable ('Name: value').
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// If-Modified-Since time (HTTP date or epoch seconds).
    #[arg(short = 'i', long)]
    ims: Option<String>,

    /// HTTP version: 1.0, 1.1, or '-' for an HTTP/0.9 simple request.
    #[arg(short = 'V', long, default_value = "1.1")]
    http_version: String,

    /// Force the cache to reload the URL.
    #[arg(short = 'r', long, default_value_t = false)]
    reload: bool,

    /// PUT request with the given file as body.
    #[arg(short = 'P', long)]
    put_file: Option<String>,

    /// Connect/IO timeout in seconds.
    #[arg(short = 'T', long, default_value_t = 15)]
    timeout: u64,

    /// Don't print the response to stdout.
    #[arg(short = 's', long, default_value_t = false)]
    silent: bool,

    /// Use TLS to the proxy.
    #[arg(long, default_value_t = false)]
    https: bool,

    /// Client certificate (PEM, key in the same file) for TLS.
    #[arg(long)]
    cert: Option<String>,

    /// CA file to trust for the proxy's certificate.
    #[arg(long)]
    trusted_ca: Option<String>,

    /// TLS cipher parameters.
    #[arg(long)]
    params: Option<String>,

    /// Allow anonymous (unauthenticated) TLS cipher suites.
    #[arg(long, default_value_t = false)]
    anonymous_tls: bool,

    /// Ping mode: repeat the request and report timings.
    #[arg(long, default_value_t = false)]
    ping: bool,

    /// Ping mode: stop after COUNT requests (0 = forever).
    #[arg(short = 'g', long, default_value_t = 1)]
    count: u64,

    /// Ping mode: interval between requests, milliseconds.
    #[arg(short = 'I', long, default_value_t = 1000)]
    interval: u64,

    /// Print help.
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,

    /// URL to request.
    url: String,
}

enum Connection {
    Plain(TcpStream),
    Tls(openssl::ssl::SslStream<TcpStream>),
}

impl Connection {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Connection::Plain(s) => s.write_all(buf),
            Connection::Tls(s) => s.write_all(buf),
        }
    }

    fn read_to_end(&mut self, out: &mut Vec<u8>) -> std::io::Result<usize> {
        match self {
            Connection::Plain(s) => s.read_to_end(out),
            Connection::Tls(s) => s.read_to_end(out),
        }
    }
}

fn connect(args: &Args) -> Result<Connection, String> {
    let addr = (args.host.as_str(), args.port)
        .to_socket_addrs()
        .map_err(|e| format!("cannot resolve {}: {e}", args.host))?
        .next()
        .ok_or_else(|| format!("no addresses for {}", args.host))?;

    let timeout = Duration::from_secs(args.timeout);
    let sock = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| format!("cannot connect to {addr}: {e}"))?;
    sock.set_read_timeout(Some(timeout)).ok();
    sock.set_write_timeout(Some(timeout)).ok();

    if !args.https {
        return Ok(Connection::Plain(sock));
    }

    let mut builder =
        SslConnector::builder(SslMethod::tls()).map_err(|e| format!("TLS setup: {e}"))?;
    if let Some(ref ca) = args.trusted_ca {
        builder
            .set_ca_file(ca)
            .map_err(|e| format!("cannot load CA {ca}: {e}"))?;
    } else {
        builder.set_verify(SslVerifyMode::NONE);
    }
    if let Some(ref cert) = args.cert {
        builder
            .set_certificate_chain_file(cert)
            .and_then(|_| {
                builder.set_private_key_file(cert, openssl::ssl::SslFiletype::PEM)
            })
            .map_err(|e| format!("cannot load client cert {cert}: {e}"))?;
    }
    if let Some(ref params) = args.params {
        builder
            .set_cipher_list(params)
            .map_err(|e| format!("bad TLS params {params:?}: {e}"))?;
    } else if args.anonymous_tls {
        builder
            .set_cipher_list("aNULL:ADH:@SECLEVEL=0")
            .map_err(|e| format!("anonymous TLS unsupported: {e}"))?;
    }

    let connector = builder.build();
    let tls = connector
        .connect(&args.host, sock)
        .map_err(|e| format!("TLS handshake with {}: {e}", args.host))?;
    Ok(Connection::Tls(tls))
}

fn build_request(args: &Args) -> Result<Vec<u8>, String> {
    if args.http_version == "-" {
        // HTTP/0.9 simple request
        return Ok(format!("GET {}\r\n", args.url).into_bytes());
    }
    let version = match args.http_version.as_str() {
        "1.0" => "HTTP/1.0",
        "1.1" => "HTTP/1.1",
        other => return Err(format!("unsupported HTTP version {other:?}")),
    };

    let method = if args.put_file.is_some() {
        "PUT"
    } else {
        args.method.as_str()
    };

    let mut req = format!("{method} {} {version}\r\n", args.url);

    let host = args
        .url
        .strip_prefix("http://")
        .or_else(|| args.url.strip_prefix("https://"))
        .map(|rest| rest.split('/').next().unwrap_or(&args.host).to_string())
        .unwrap_or_else(|| args.host.clone());
    req.push_str(&format!("Host: {host}\r\n"));
    req.push_str(&format!(
        "User-Agent: kestrelclient/{}\r\n",
        env!("CARGO_PKG_VERSION")
    ));

    if args.reload {
        req.push_str("Cache-Control: no-cache\r\nPragma: no-cache\r\n");
    }
    if let Some(ref ims) = args.ims {
        let t = ims
            .parse::<i64>()
            .ok()
            .or_else(|| parse_rfc1123(ims))
            .ok_or_else(|| format!("cannot parse IMS time {ims:?}"))?;
        req.push_str(&format!("If-Modified-Since: {}\r\n", mkrfc1123(t)));
    }
    for h in &args.headers {
        req.push_str(h);
        req.push_str("\r\n");
    }

    let body = match args.put_file {
        Some(ref path) => {
            let data =
                std::fs::read(path).map_err(|e| format!("cannot read {path}: {e}"))?;
            req.push_str(&format!("Content-Length: {}\r\n", data.len()));
            Some(data)
        }
        None => None,
    };

    req.push_str("Connection: close\r\n\r\n");
    let mut wire = req.into_bytes();
    if let Some(body) = body {
        wire.extend_from_slice(&body);
    }
    Ok(wire)
}

fn one_request(args: &Args, wire: &[u8]) -> Result<(Duration, usize, String), String> {
    let started = Instant::now();
    let mut conn = connect(args)?;
    conn.write_all(wire).map_err(|e| format!("send: {e}"))?;
    let mut response = Vec::new();
    conn.read_to_end(&mut response)
        .map_err(|e| format!("read: {e}"))?;
    let elapsed = started.elapsed();

    let status_line = response
        .split(|&b| b == b'\n')
        .next()
        .map(|l| String::from_utf8_lossy(l).trim_end().to_string())
        .unwrap_or_default();

    if !args.silent && !args.ping {
        std::io::stdout().write_all(&response).ok();
    }
    Ok((elapsed, response.len(), status_line))
}

fn main() {
    let args = Args::parse();

    let wire = match build_request(&args) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("kestrelclient: {e}");
            std::process::exit(1);
        }
    };

    if !args.ping {
        if let Err(e) = one_request(&args, &wire) {
            eprintln!("kestrelclient: {e}");
            std::process::exit(1);
        }
        std::process::exit(0);
    }

    // ping mode: repeat, collect timings, summarize
    let mut sent = 0u64;
    let mut ok = 0u64;
    let mut min = Duration::MAX;
    let mut max = Duration::ZERO;
    let mut total = Duration::ZERO;

    while args.count == 0 || sent < args.count {
        sent += 1;
        match one_request(&args, &wire) {
            Ok((rtt, size, status)) => {
                ok += 1;
                min = min.min(rtt);
                max = max.max(rtt);
                total += rtt;
                println!(
                    "{}: {} bytes in {:.3} ms ({status})",
                    sent,
                    size,
                    rtt.as_secs_f64() * 1000.0
                );
            }
            Err(e) => eprintln!("{sent}: failed: {e}"),
        }
        if args.count == 0 || sent < args.count {
            std::thread::sleep(Duration::from_millis(args.interval));
        }
    }

    if ok > 0 {
        println!(
            "{} requests, {} ok; rtt min/avg/max = {:.3}/{:.3}/{:.3} ms",
            sent,
            ok,
            min.as_secs_f64() * 1000.0,
            (total / ok as u32).as_secs_f64() * 1000.0,
            max.as_secs_f64() * 1000.0
        );
    }
    std::process::exit(if ok == sent { 0 } else { 1 });
}
