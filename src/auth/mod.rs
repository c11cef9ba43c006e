//! Authenticated-user records, scheme payloads, and the queue-node
//! collapsing that folds concurrent helper lookups into one.

pub mod basic;
pub mod cache;
pub mod digest;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use ahash::AHashMap;
use arc_swap::ArcSwap;
use once_cell::sync::Lazy;

use crate::comm::Reactor;
use crate::utils::clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    Unchecked,
    Pending,
    Ok,
    Failed,
}

/// Scheme-specific credential payload.
pub enum SchemePayload {
    Basic(basic::BasicCredentials),
    Digest(digest::DigestCredentials),
    Bearer { token: String },
    Negotiate,
    Ntlm,
}

impl SchemePayload {
    pub fn scheme_name(&self) -> &'static str {
        match self {
            SchemePayload::Basic(_) => "basic",
            SchemePayload::Digest(_) => "digest",
            SchemePayload::Bearer { .. } => "bearer",
            SchemePayload::Negotiate => "negotiate",
            SchemePayload::Ntlm => "ntlm",
        }
    }
}

/// A validation request parked on a credential while one helper lookup is in
/// flight. Fired FIFO when the lookup completes.
pub struct QueueNode {
    pub handler: Box<dyn FnOnce(&mut Reactor, CredentialState)>,
}

/// A per-user authenticated-session record, shared among in-flight requests
/// with the same key.
pub struct User {
    pub user_key: String,
    pub username: String,
    pub state: CredentialState,
    /// When the credentials were last confirmed by a helper.
    pub expiretime: i64,
    pub payload: SchemePayload,
    pub queue: VecDeque<QueueNode>,
    /// Memoized ACL-evaluation answers tied to the current configuration.
    pub match_cache: AHashMap<String, bool>,
}

pub type UserRef = Rc<RefCell<User>>;

impl User {
    pub fn new(user_key: &str, username: &str, payload: SchemePayload) -> UserRef {
        Rc::new(RefCell::new(User {
            user_key: user_key.to_string(),
            username: username.to_string(),
            state: CredentialState::Unchecked,
            expiretime: 0,
            payload,
            queue: VecDeque::new(),
            match_cache: AHashMap::new(),
        }))
    }

    /// Seconds this credential may stay cached, per scheme. Negative means
    /// "never cache beyond this transaction" and forces eviction.
    pub fn ttl(&self, configured_ttl: i64, now: i64) -> i64 {
        let basic_ttl = self.expiretime + configured_ttl - now;
        match &self.payload {
            SchemePayload::Basic(_) | SchemePayload::Bearer { .. } => basic_ttl,
            SchemePayload::Digest(d) => match d.oldest_nonce_deadline() {
                Some(deadline) => basic_ttl.min(deadline - now),
                None => basic_ttl,
            },
            SchemePayload::Negotiate | SchemePayload::Ntlm => -1,
        }
    }

    pub fn queue_request(&mut self, node: QueueNode) {
        self.queue.push_back(node);
    }
}

/// Verdict source for credentials the core cannot judge itself; stands in
/// for the external helper processes.
pub trait CredentialValidator: Send + Sync {
    fn check(&self, username: &str, payload: &SchemePayload) -> bool;
}

/// Checks Basic passwords against a configured user table; an empty table
/// accepts everyone (no enforcement configured).
pub struct StaticValidator {
    pub users: std::collections::HashMap<String, String>,
}

impl CredentialValidator for StaticValidator {
    fn check(&self, username: &str, payload: &SchemePayload) -> bool {
        if self.users.is_empty() {
            return true;
        }
        match payload {
            SchemePayload::Basic(b) => self
                .users
                .get(username)
                .map(|p| p == &b.password)
                .unwrap_or(false),
            _ => self.users.contains_key(username),
        }
    }
}

static VALIDATOR: Lazy<ArcSwap<ValidatorHolder>> = Lazy::new(|| {
    ArcSwap::from_pointee(ValidatorHolder(Arc::new(StaticValidator {
        users: Default::default(),
    })))
});

struct ValidatorHolder(Arc<dyn CredentialValidator>);

pub fn set_validator(v: Arc<dyn CredentialValidator>) {
    VALIDATOR.store(Arc::new(ValidatorHolder(v)));
}

pub fn validator() -> Arc<dyn CredentialValidator> {
    VALIDATOR.load().0.clone()
}

pub type AuthCallback = Box<dyn FnOnce(&mut Reactor, CredentialState)>;

/// Authenticate a Basic token. Concurrent requests with the same token
/// collapse onto the first one's helper lookup; their callbacks fire in
/// attachment order once the verdict arrives.
pub fn authenticate_basic(r: &mut Reactor, token: &str, cb: AuthCallback) {
    let configured_ttl = crate::config::get_config().general.authenticate_ttl.as_secs() as i64;
    let now = clock::current_time();

    if let Some(user) = r.auth_cache.lookup(token) {
        let state = user.borrow().state;
        match state {
            CredentialState::Ok if user.borrow().ttl(configured_ttl, now) > 0 => {
                cb(r, CredentialState::Ok);
                return;
            }
            CredentialState::Failed if user.borrow().ttl(configured_ttl, now) > 0 => {
                cb(r, CredentialState::Failed);
                return;
            }
            CredentialState::Pending => {
                user.borrow_mut().queue_request(QueueNode { handler: cb });
                return;
            }
            _ => {} // expired or unchecked: fall through to a fresh lookup
        }
    }

    let (username, password) = match basic::split_token(token) {
        Some(pair) => pair,
        None => {
            cb(r, CredentialState::Failed);
            return;
        }
    };

    let user = User::new(
        token,
        &username,
        SchemePayload::Basic(basic::BasicCredentials { password }),
    );
    user.borrow_mut().state = CredentialState::Pending;
    user.borrow_mut().queue_request(QueueNode { handler: cb });
    cache::insert(r, token, user.clone());

    // drive the helper lookup from the event queue; everyone who arrives
    // before the verdict lands in the queue above
    let key = token.to_string();
    r.events.add(
        "basic auth helper lookup",
        0.0,
        Box::new(move |r| {
            let verdict = {
                let u = user.borrow();
                if validator().check(&u.username, &u.payload) {
                    CredentialState::Ok
                } else {
                    CredentialState::Failed
                }
            };
            {
                let mut u = user.borrow_mut();
                u.state = verdict;
                u.expiretime = clock::current_time();
            }
            log::debug!("auth helper verdict for {key}: {verdict:?}");
            let handlers: Vec<QueueNode> = user.borrow_mut().queue.drain(..).collect();
            for node in handlers {
                (node.handler)(r, verdict);
            }
        }),
    );
}

#[cfg(test)]
mod tests;
