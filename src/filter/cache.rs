//! The result cache of a rule list.

use std::net::IpAddr;

use domain::base::iana::Rtype;
use moka::sync::Cache;

use super::engine::DnsMatch;
use super::rules::MatchContext;

//------------ CacheKey ------------------------------------------------------

/// Everything the outcome of a rule list lookup depends on.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CacheKey {
    client_ip: IpAddr,
    client_name: String,
    host: String,
    qtype: Rtype,
    answer_phase: bool,
}

impl CacheKey {
    /// Creates the key for a host looked up in a context.
    pub fn new(host: &str, ctx: &MatchContext) -> Self {
        CacheKey {
            client_ip: ctx.client_ip,
            client_name: ctx.client_name.into(),
            host: host.into(),
            qtype: ctx.qtype,
            answer_phase: ctx.answer_phase,
        }
    }
}

//------------ ResultCache ---------------------------------------------------

/// A bounded cache of lookup outcomes.
///
/// The absence of a match is cached, too.
#[derive(Clone, Debug)]
pub struct ResultCache {
    cache: Cache<CacheKey, Option<DnsMatch>>,
}

impl ResultCache {
    /// Creates a cache holding at most `max_entries` outcomes.
    pub fn new(max_entries: u64) -> Self {
        ResultCache {
            cache: Cache::new(max_entries),
        }
    }

    /// Returns the cached outcome for a key.
    ///
    /// The outer option is `None` if there is no entry.
    pub fn get(&self, key: &CacheKey) -> Option<Option<DnsMatch>> {
        self.cache.get(key)
    }

    /// Stores an outcome.
    pub fn insert(&self, key: CacheKey, value: Option<DnsMatch>) {
        self.cache.insert(key, value)
    }

    /// Removes all entries.
    pub fn clear(&self) {
        self.cache.invalidate_all()
    }
}

//============ Testing =======================================================
