//! Enforcing safe search.

use std::sync::Arc;

use async_trait::async_trait;
use domain::base::iana::Rtype;
use moka::sync::Cache;
use parking_lot::RwLock;
use tracing::{instrument, trace};

use super::rulelist::RuleListFilter;
use super::source::RuleSource;
use super::{FilterRequest, FilterResult};
use crate::config::FilterConfig;
use crate::dnsmsg::{MessageError, Messages};
use crate::metrics::FilterMetrics;
use crate::refresh::{RefreshError, Refresher};

//------------ SafeSearch ----------------------------------------------------

/// A filter rewriting queries for search engines to their safe variants.
///
/// The rules of the list are `$dnsrewrite` rules that either replace the
/// address of a host or point it to a different name. Only queries for
/// addresses are affected, that is, queries of type A, AAAA, and HTTPS.
///
/// Finished results are cached by host and query type for a limited time.
/// The rules of the list therefore must not depend on the client.
#[derive(Debug)]
pub struct SafeSearch {
    filter: RuleListFilter,
    cache: Cache<CacheKey, Option<FilterResult>>,

    /// Counts refreshes. Held for reading while a result is cached.
    generation: RwLock<u64>,
}

type CacheKey = (String, Rtype);

impl SafeSearch {
    /// Creates a new safe search filter.
    pub fn new(
        id: impl Into<Arc<str>>,
        source: Arc<dyn RuleSource>,
        config: &FilterConfig,
        metrics: Arc<FilterMetrics>,
    ) -> Self {
        SafeSearch {
            filter: RuleListFilter::new(id, source, config, metrics),
            cache: Cache::builder()
                .max_capacity(config.safe_search_cache_size())
                .time_to_live(config.safe_search_cache_ttl())
                .build(),
            generation: RwLock::new(0),
        }
    }

    /// Returns the identifier of the list.
    pub fn id(&self) -> &Arc<str> {
        self.filter.id()
    }

    /// Returns the number of rules.
    pub fn rules_count(&self) -> usize {
        self.filter.rules_count()
    }

    /// Filters a request.
    ///
    /// Every result is a copy owned by the caller carrying the ID of the
    /// request.
    pub fn check(
        &self,
        req: &FilterRequest,
        messages: &Messages,
    ) -> Result<Option<FilterResult>, MessageError> {
        if !(req.qtype == Rtype::A
            || req.qtype == Rtype::AAAA
            || req.qtype == Rtype::HTTPS)
        {
            return Ok(None);
        }

        let key = (String::from(req.host), req.qtype);
        if let Some(res) = self.cache.get(&key) {
            trace!(host = req.host, "safe search cache hit");
            return Ok(res.map(|mut res| {
                res.set_id(req.message.header().id());
                res
            }));
        }

        let generation = *self.generation.read();
        let res = self.lookup(req, messages)?;
        self.store(key, generation, res.clone());
        Ok(res)
    }

    /// Evaluates a request against the current rules.
    fn lookup(
        &self,
        req: &FilterRequest,
        messages: &Messages,
    ) -> Result<Option<FilterResult>, MessageError> {
        match self.filter.dns_result(
            req.client_ip,
            req.client_name,
            req.host,
            req.qtype,
            false,
        ) {
            Some(found) => Ok(Some(FilterResult::from_match(
                self.filter.id(),
                found,
                req,
                messages,
            )?)),
            None => Ok(None),
        }
    }

    /// Caches a result unless the rules were refreshed after `generation`.
    fn store(
        &self,
        key: CacheKey,
        generation: u64,
        res: Option<FilterResult>,
    ) {
        let current = self.generation.read();
        if *current == generation {
            self.cache.insert(key, res);
        } else {
            trace!(host = %key.0, "rules changed during lookup");
        }
    }

    /// Reloads the rules and drops all cached results.
    #[instrument(skip(self), fields(list = %self.filter.id()))]
    pub async fn refresh(&self, accept_stale: bool) -> Result<(), RefreshError> {
        self.filter.refresh(accept_stale).await?;
        let mut generation = self.generation.write();
        *generation = generation.wrapping_add(1);
        self.cache.invalidate_all();
        Ok(())
    }
}

#[async_trait]
impl Refresher for SafeSearch {
    async fn refresh(&self, accept_stale: bool) -> Result<(), RefreshError> {
        SafeSearch::refresh(self, accept_stale).await
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dnsmsg::messages::tests::{answer_addrs, query};
    use crate::filter::source::TextSource;
    use domain::base::Message;
    use std::net::IpAddr;

    const RULES: &str = "\
        |www.search.example^$dnsrewrite=NOERROR;CNAME;safe.search.example\n\
        |images.example^$dnsrewrite=NOERROR;A;192.0.2.10\n\
        |images.example^$dnsrewrite=NOERROR;AAAA;2001:db8::10\n";

    async fn safe_search(rules: &str) -> (SafeSearch, Arc<TextSource>) {
        let source = Arc::new(TextSource::new(rules));
        let filter = SafeSearch::new(
            "safe_search",
            source.clone(),
            &FilterConfig::default(),
            Arc::new(FilterMetrics::new()),
        );
        filter.refresh(false).await.unwrap();
        (filter, source)
    }

    fn request<'a>(
        msg: &'a Message<Vec<u8>>,
        host: &'a str,
        qtype: Rtype,
    ) -> FilterRequest<'a> {
        FilterRequest {
            message: msg,
            host,
            qtype,
            client_ip: "192.0.2.1".parse().unwrap(),
            client_name: "",
        }
    }

    fn check(
        filter: &SafeSearch,
        msg: &Message<Vec<u8>>,
        host: &str,
        qtype: Rtype,
    ) -> Option<FilterResult> {
        filter
            .check(&request(msg, host, qtype), &Messages::default())
            .unwrap()
    }

    #[tokio::test]
    async fn rewrites_addresses() {
        let (filter, _) = safe_search(RULES).await;
        let msg = query("images.example", Rtype::A);
        match check(&filter, &msg, "images.example", Rtype::A) {
            Some(FilterResult::ModifiedResponse { response, list, .. }) => {
                assert_eq!(list.as_ref(), "safe_search");
                assert_eq!(
                    answer_addrs(&response),
                    ["192.0.2.10".parse::<IpAddr>().unwrap()]
                );
            }
            other => panic!("unexpected {other:?}"),
        }

        // Other query types are left alone.
        let msg = query("images.example", Rtype::TXT);
        assert!(check(&filter, &msg, "images.example", Rtype::TXT).is_none());
    }

    #[tokio::test]
    async fn rewrites_names() {
        let (filter, _) = safe_search(RULES).await;
        let msg = query("www.search.example", Rtype::HTTPS);
        match check(&filter, &msg, "www.search.example", Rtype::HTTPS) {
            Some(FilterResult::ModifiedRequest { request, .. }) => {
                let question = request.first_question().unwrap();
                assert_eq!(
                    question.qname().to_string(),
                    "safe.search.example"
                );
                assert_eq!(question.qtype(), Rtype::HTTPS);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_hits_are_independent() {
        let (filter, _) = safe_search(RULES).await;
        let filter = Arc::new(filter);

        // Fill the cache.
        let msg = query("images.example", Rtype::AAAA);
        check(&filter, &msg, "images.example", Rtype::AAAA).unwrap();

        let tasks = (0..8u16)
            .map(|id| {
                let filter = filter.clone();
                tokio::spawn(async move {
                    let mut msg = query("images.example", Rtype::AAAA);
                    msg.header_mut().set_id(id);
                    let res =
                        check(&filter, &msg, "images.example", Rtype::AAAA);
                    match res {
                        Some(FilterResult::ModifiedResponse {
                            mut response,
                            ..
                        }) => {
                            assert_eq!(response.header().id(), id);
                            // Mutating our copy must not affect others.
                            response.header_mut().set_id(0xffff);
                            response.header_mut().set_aa(true);
                            id
                        }
                        other => panic!("unexpected {other:?}"),
                    }
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await.unwrap();
        }

        let mut msg = query("images.example", Rtype::AAAA);
        msg.header_mut().set_id(77);
        match check(&filter, &msg, "images.example", Rtype::AAAA) {
            Some(FilterResult::ModifiedResponse { response, .. }) => {
                assert_eq!(response.header().id(), 77);
                assert!(!response.header().aa());
                assert_eq!(
                    answer_addrs(&response),
                    ["2001:db8::10".parse::<IpAddr>().unwrap()]
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn refresh_clears_cache() {
        let (filter, source) = safe_search(RULES).await;
        let msg = query("video.example", Rtype::A);
        assert!(check(&filter, &msg, "video.example", Rtype::A).is_none());

        source.set("|video.example^$dnsrewrite=NOERROR;A;192.0.2.20\n");
        filter.refresh(false).await.unwrap();
        assert!(check(&filter, &msg, "video.example", Rtype::A).is_some());
    }

    #[tokio::test]
    async fn refresh_during_lookup_is_not_cached() {
        let (filter, source) = safe_search(RULES).await;
        let msg = query("video.example", Rtype::A);

        // A lookup against the old rules finishes after the refresh.
        let generation = *filter.generation.read();
        let stale = filter
            .lookup(
                &request(&msg, "video.example", Rtype::A),
                &Messages::default(),
            )
            .unwrap();
        assert!(stale.is_none());
        source.set("|video.example^$dnsrewrite=NOERROR;A;192.0.2.20\n");
        filter.refresh(false).await.unwrap();
        filter.store(("video.example".into(), Rtype::A), generation, stale);

        assert!(check(&filter, &msg, "video.example", Rtype::A).is_some());
    }
}
