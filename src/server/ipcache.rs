//! A small positive/negative cache in front of the system resolver. The
//! resolver itself is an external collaborator; fetches that miss the cache
//! resolve once, synchronously, at fetch start.

use std::net::{IpAddr, ToSocketAddrs};

use dashmap::DashMap;
use log::debug;
use once_cell::sync::Lazy;

use crate::errors::Error;
use crate::utils::clock;

struct CachedName {
    addrs: Vec<IpAddr>,
    expires: i64,
}

static IPCACHE: Lazy<DashMap<String, CachedName>> = Lazy::new(DashMap::new);

/// Resolve `host`, consulting the cache first. Literal addresses bypass the
/// cache entirely. Negative answers are cached too.
pub fn resolve(host: &str) -> Result<Vec<IpAddr>, Error> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }
    let host_key = host.to_ascii_lowercase();
    let now = clock::current_time();

    if let Some(hit) = IPCACHE.get(&host_key) {
        if hit.expires > now {
            return if hit.addrs.is_empty() {
                Err(Error::DnsFailure(host.to_string()))
            } else {
                Ok(hit.addrs.clone())
            };
        }
    }

    let cfg = crate::config::get_config();
    let looked_up: Vec<IpAddr> = (host, 0u16)
        .to_socket_addrs()
        .map(|it| it.map(|sa| sa.ip()).collect())
        .unwrap_or_default();

    let ttl = if looked_up.is_empty() {
        cfg.general.negative_dns_ttl.as_secs() as i64
    } else {
        cfg.general.positive_dns_ttl.as_secs() as i64
    };
    debug!(
        "ipcache: {host} -> {} address(es), ttl {ttl}s",
        looked_up.len()
    );
    IPCACHE.insert(
        host_key,
        CachedName {
            addrs: looked_up.clone(),
            expires: now + ttl,
        },
    );

    if looked_up.is_empty() {
        Err(Error::DnsFailure(host.to_string()))
    } else {
        Ok(looked_up)
    }
}

/// Drop every cached name; used on reconfigure.
pub fn flush() {
    IPCACHE.clear();
}

/// Seed an answer, bypassing the resolver. Tests and static peers use this.
pub fn seed(host: &str, addrs: Vec<IpAddr>, ttl: i64) {
    IPCACHE.insert(
        host.to_ascii_lowercase(),
        CachedName {
            addrs,
            expires: clock::current_time() + ttl,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_addresses_bypass_cache() {
        let v = resolve("192.0.2.7").unwrap();
        assert_eq!(v, vec!["192.0.2.7".parse::<IpAddr>().unwrap()]);
        let v6 = resolve("::1").unwrap();
        assert_eq!(v6, vec!["::1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_seeded_answers_are_served_and_expire() {
        crate::utils::clock::update_current_time();
        seed("origin.test", vec!["192.0.2.1".parse().unwrap()], 60);
        assert_eq!(
            resolve("ORIGIN.test").unwrap(),
            vec!["192.0.2.1".parse::<IpAddr>().unwrap()]
        );

        // a negative entry fails lookups until it expires
        seed("missing.test", vec![], 60);
        assert!(matches!(
            resolve("missing.test"),
            Err(Error::DnsFailure(_))
        ));
    }
}
