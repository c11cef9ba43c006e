//! Keyed, TTL-bounded cache of authenticated-user records with lazy GC:
//! each insert arms at most one garbage-collection event.

use ahash::AHashMap;
use log::debug;

use crate::auth::UserRef;
use crate::comm::Reactor;
use crate::utils::clock;

pub struct CredentialsCache {
    name: &'static str,
    store_: AHashMap<String, UserRef>,
    gc_scheduled: bool,
}

impl CredentialsCache {
    pub fn new(name: &'static str) -> CredentialsCache {
        debug!("initializing {name} credentials cache");
        CredentialsCache {
            name,
            store_: AHashMap::new(),
            gc_scheduled: false,
        }
    }

    pub fn lookup(&self, user_key: &str) -> Option<UserRef> {
        self.store_.get(user_key).cloned()
    }

    pub fn size(&self) -> usize {
        self.store_.len()
    }

    /// Drop everything, e.g. at shutdown.
    pub fn reset(&mut self) {
        debug!("clearing {} credentials cache", self.name);
        self.store_.clear();
    }

    /// Cached usernames in a report-friendly order.
    pub fn sorted_users_list(&self) -> Vec<UserRef> {
        let mut users: Vec<UserRef> = self.store_.values().cloned().collect();
        users.sort_by(|a, b| a.borrow().username.cmp(&b.borrow().username));
        users
    }
}

/// Add a credential and make sure a GC event is pending.
pub fn insert(r: &mut Reactor, user_key: &str, user: UserRef) {
    debug!(
        "caching credentials for {} ({})",
        user_key,
        user.borrow().username
    );
    r.auth_cache.store_.insert(user_key.to_string(), user);
    schedule_cleanup(r);
}

fn schedule_cleanup(r: &mut Reactor) {
    if r.auth_cache.gc_scheduled || r.auth_cache.store_.is_empty() {
        return;
    }
    r.auth_cache.gc_scheduled = true;
    let interval = crate::config::get_config()
        .general
        .authenticate_cache_garbage_interval
        .as_secs() as f64;
    r.events
        .add("credentials cache GC", interval, Box::new(cleanup));
}

/// Evict credentials whose scheme TTL has run out. Re-arms itself while the
/// cache is non-empty.
pub fn cleanup(r: &mut Reactor) {
    let configured_ttl = crate::config::get_config().general.authenticate_ttl.as_secs() as i64;
    let now = clock::current_time();

    r.auth_cache.store_.retain(|key, user| {
        let keep = user.borrow().ttl(configured_ttl, now) > 0;
        if !keep {
            debug!("evicting credentials for {key}");
        }
        keep
    });
    r.auth_cache.gc_scheduled = false;
    schedule_cleanup(r);
}

/// Config changed: purge expired entries and drop ACL-evaluation memoization
/// that depended on the old configuration.
pub fn do_config_change_cleanup(r: &mut Reactor) {
    cleanup(r);
    for user in r.auth_cache.store_.values() {
        user.borrow_mut().match_cache.clear();
    }
}
