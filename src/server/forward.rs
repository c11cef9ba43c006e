//! Forwarding-path selection. The chooser proper (ACL + peer health) is an
//! external collaborator; the core consumes its answer: direct-to-origin or
//! via the configured parent.

use crate::http::UriTarget;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardPath {
    /// Connect to the origin named by the request URI.
    Direct { host: String, port: u16 },
    /// Forward to a parent proxy with an absolute-form request.
    Parent { host: String, port: u16 },
}

impl ForwardPath {
    pub fn destination(&self) -> (&str, u16) {
        match self {
            ForwardPath::Direct { host, port } | ForwardPath::Parent { host, port } => {
                (host, *port)
            }
        }
    }

    pub fn via_parent(&self) -> bool {
        matches!(self, ForwardPath::Parent { .. })
    }
}

/// Pick the path for one request.
pub fn choose(target: &UriTarget) -> ForwardPath {
    let cfg = crate::config::get_config();
    if let Some(ref parent) = cfg.general.parent_proxy {
        if let Some((host, port)) = parent.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                return ForwardPath::Parent {
                    host: host.to_string(),
                    port,
                };
            }
        }
    }
    ForwardPath::Direct {
        host: target.host.clone(),
        port: target.port,
    }
}
