//! General and global settings.

use serde_derive::{Deserialize, Serialize};

use crate::comm::loops::BackendKind;
use crate::config::{ByteSize, Duration};
use crate::store::ttl::TtlRules;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct General {
    /// Worker processes forked by the master. 1 means "run in-process",
    /// 0 means one per CPU.
    pub workers: usize,

    /// Per-worker file-descriptor table size.
    pub max_connections: usize,

    /// Listen backlog; 0 derives it from max_connections.
    pub backlog: u32,

    /// Readiness backend: "poll" or "epoll".
    pub event_backend: String,

    /// Hard cap on a request (or FTP command) header block.
    pub max_request_header_size: ByteSize,

    /// Total memory allowed for in-memory objects.
    pub cache_mem: ByteSize,

    /// Responses growing past this switch to delete-behind streaming.
    pub max_object_size_in_memory: ByteSize,

    /// Idle-memory budget for the pool allocator.
    pub memory_pools_limit: ByteSize,

    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Idle limit for keepalive client connections.
    pub client_idle_timeout: Duration,
    pub ftp_client_idle_timeout: Duration,
    /// Whole-transaction lifetime cap.
    pub client_lifetime: Duration,

    pub default_ttl: Duration,
    pub max_ttl: Duration,
    pub negative_ttl: Duration,
    pub ftp_dir_ttl: Duration,
    pub ftp_file_ttl: Duration,

    pub positive_dns_ttl: Duration,
    pub negative_dns_ttl: Duration,

    pub authenticate_ttl: Duration,
    pub authenticate_cache_garbage_interval: Duration,

    pub hopeless_kid_revival_delay: Duration,

    /// Hostname advertised in Via and error pages.
    pub visible_hostname: String,

    /// Disk cache directories; each gets one disker process.
    pub cache_dirs: Vec<String>,

    /// Optional parent proxy ("host:port"); requests go direct otherwise.
    pub parent_proxy: Option<String>,

    /// URL substrings that must never be cached.
    pub stoplist: Vec<String>,

    /// TLS tokens applied to outgoing (server-side) connections.
    pub tls_outgoing_options: String,

    pub log_client_connections: bool,
    pub syslog_prog_name: Option<String>,
}

impl Default for General {
    fn default() -> General {
        General {
            workers: 1,
            max_connections: 4096,
            backlog: 0,
            event_backend: "poll".to_string(),
            max_request_header_size: ByteSize::from_kb(64),
            cache_mem: ByteSize::from_mb(256),
            max_object_size_in_memory: ByteSize::from_mb(4),
            memory_pools_limit: ByteSize::from_mb(5),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_mins(15),
            client_idle_timeout: Duration::from_mins(2),
            ftp_client_idle_timeout: Duration::from_mins(5),
            client_lifetime: Duration::from_mins(60),
            default_ttl: Duration::from_mins(60),
            max_ttl: Duration::from_mins(7 * 24 * 60),
            negative_ttl: Duration::from_mins(5),
            ftp_dir_ttl: Duration::from_mins(24 * 60),
            ftp_file_ttl: Duration::from_mins(7 * 24 * 60),
            positive_dns_ttl: Duration::from_mins(360),
            negative_dns_ttl: Duration::from_mins(1),
            authenticate_ttl: Duration::from_mins(60),
            authenticate_cache_garbage_interval: Duration::from_mins(60),
            hopeless_kid_revival_delay: Duration::from_mins(60),
            visible_hostname: "kestrel".to_string(),
            cache_dirs: Vec::new(),
            parent_proxy: None,
            stoplist: Vec::new(),
            tls_outgoing_options: String::new(),
            log_client_connections: false,
            syslog_prog_name: None,
        }
    }
}

impl General {
    /// Worker count with 0 meaning "one per CPU".
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    pub fn backend_kind(&self) -> Option<BackendKind> {
        match self.event_backend.as_str() {
            "poll" => Some(BackendKind::Poll),
            "epoll" => Some(BackendKind::Epoll),
            _ => None,
        }
    }

    pub fn effective_backlog(&self) -> i32 {
        if self.backlog > 0 {
            self.backlog as i32
        } else {
            self.max_connections as i32
        }
    }

    pub fn ttl_rules(&self) -> TtlRules {
        TtlRules {
            default_ttl: self.default_ttl.as_secs() as i64,
            max_ttl: self.max_ttl.as_secs() as i64,
            negative_ttl: self.negative_ttl.as_secs() as i64,
            ftp_dir_ttl: self.ftp_dir_ttl.as_secs() as i64,
            ftp_file_ttl: self.ftp_file_ttl.as_secs() as i64,
        }
    }
}
