//! A refreshable filter backed by a rule list.

use core::fmt;

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use domain::base::iana::Rtype;
use parking_lot::RwLock;
use tracing::{debug, instrument, trace, warn};

use super::cache::{CacheKey, ResultCache};
use super::engine::{DnsMatch, RuleEngine};
use super::rules::MatchContext;
use super::source::RuleSource;
use crate::config::FilterConfig;
use crate::metrics::FilterMetrics;
use crate::refresh::{RefreshError, Refresher};

//------------ RuleListFilter ------------------------------------------------

/// A rule list together with a cache of lookup outcomes.
///
/// The compiled rules and the cache live behind a single lock. Lookups only
/// ever take the read side. A refresh compiles the new rules without
/// holding the lock and then swaps them in while clearing the cache.
pub struct RuleListFilter {
    id: Arc<str>,
    source: Arc<dyn RuleSource>,
    snapshot: RwLock<Snapshot>,
    metrics: Arc<FilterMetrics>,
}

struct Snapshot {
    engine: Arc<RuleEngine>,
    cache: ResultCache,
}

impl RuleListFilter {
    /// Creates a new filter without any rules.
    ///
    /// The rules are loaded by the first call to
    /// [`refresh`][Self::refresh].
    pub fn new(
        id: impl Into<Arc<str>>,
        source: Arc<dyn RuleSource>,
        config: &FilterConfig,
        metrics: Arc<FilterMetrics>,
    ) -> Self {
        RuleListFilter {
            id: id.into(),
            source,
            snapshot: RwLock::new(Snapshot {
                engine: Arc::new(RuleEngine::empty()),
                cache: ResultCache::new(config.result_cache_size()),
            }),
            metrics,
        }
    }

    /// Returns the identifier of the list.
    pub fn id(&self) -> &Arc<str> {
        &self.id
    }

    /// Returns the metrics of the filter.
    pub fn metrics(&self) -> &Arc<FilterMetrics> {
        &self.metrics
    }

    /// Returns the number of rules in the current snapshot.
    pub fn rules_count(&self) -> usize {
        self.snapshot.read().engine.rules_count()
    }

    /// Matches a host against the list.
    ///
    /// The host must be lower case without a trailing dot. Set
    /// `answer_phase` when the host was taken from the answer of a
    /// response, such as a CNAME target.
    pub fn dns_result(
        &self,
        client_ip: IpAddr,
        client_name: &str,
        host: &str,
        qtype: Rtype,
        answer_phase: bool,
    ) -> Option<DnsMatch> {
        let ctx = MatchContext {
            client_ip,
            client_name,
            qtype,
            answer_phase,
        };
        let key = CacheKey::new(host, &ctx);
        let snapshot = self.snapshot.read();
        if let Some(res) = snapshot.cache.get(&key) {
            trace!(list = %self.id, host, "result cache hit");
            self.metrics.record_cache(true);
            return res;
        }
        self.metrics.record_cache(false);
        let res = snapshot.engine.match_host(host, &ctx);
        snapshot.cache.insert(key, res.clone());
        res
    }

    /// Reloads the rules from the source.
    ///
    /// If `accept_stale` is true, the source may return a cached copy of
    /// any age. On failure, the current rules and cache stay in place.
    #[instrument(skip(self), fields(list = %self.id))]
    pub async fn refresh(&self, accept_stale: bool) -> Result<(), RefreshError> {
        match self.load(accept_stale).await {
            Ok(count) => {
                self.metrics.record_refresh(Some(count));
                debug!(rules = count, "rule list refreshed");
                Ok(())
            }
            Err(err) => {
                self.metrics.record_refresh(None);
                warn!("refreshing rule list failed: {err}");
                Err(err)
            }
        }
    }

    async fn load(&self, accept_stale: bool) -> Result<usize, RefreshError> {
        let text = self
            .source
            .fetch(accept_stale)
            .await
            .map_err(|err| RefreshError::Fetch {
                list: self.id.clone(),
                err,
            })?;
        let (engine, errors) =
            tokio::task::spawn_blocking(move || RuleEngine::compile(&text))
                .await
                .map_err(|err| RefreshError::Compile {
                    list: self.id.clone(),
                    err,
                })?;
        if !errors.is_empty() {
            debug!(
                invalid = errors.len(),
                first = %errors[0],
                "skipped invalid rules"
            );
        }
        let count = engine.rules_count();
        let mut snapshot = self.snapshot.write();
        snapshot.cache.clear();
        snapshot.engine = Arc::new(engine);
        Ok(count)
    }
}

#[async_trait]
impl Refresher for RuleListFilter {
    async fn refresh(&self, accept_stale: bool) -> Result<(), RefreshError> {
        RuleListFilter::refresh(self, accept_stale).await
    }
}

impl fmt::Debug for RuleListFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleListFilter")
            .field("id", &self.id)
            .field("rules", &self.rules_count())
            .finish()
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::source::{FetchError, TextSource};

    fn filter(text: &str) -> (RuleListFilter, Arc<TextSource>) {
        let source = Arc::new(TextSource::new(text));
        let filter = RuleListFilter::new(
            "test",
            source.clone(),
            &FilterConfig::default(),
            Arc::new(FilterMetrics::new()),
        );
        (filter, source)
    }

    fn lookup(filter: &RuleListFilter, host: &str) -> Option<DnsMatch> {
        filter.dns_result(
            "192.0.2.1".parse().unwrap(),
            "",
            host,
            Rtype::A,
            false,
        )
    }

    #[tokio::test]
    async fn refresh_loads_rules() {
        let (filter, _) = filter("||ads.example^\n@@||ok.ads.example^\n");
        assert_eq!(filter.rules_count(), 0);
        assert!(lookup(&filter, "ads.example").is_none());

        filter.refresh(false).await.unwrap();
        assert_eq!(filter.rules_count(), 2);
        assert_eq!(filter.metrics().rule_count(), 2);
        assert!(filter.metrics().last_refresh_ok());
        assert!(matches!(
            lookup(&filter, "x.ads.example"),
            Some(DnsMatch::Block(_))
        ));
        assert!(matches!(
            lookup(&filter, "ok.ads.example"),
            Some(DnsMatch::Allow(_))
        ));
    }

    #[tokio::test]
    async fn cache_counts_hits() {
        let (filter, _) = filter("||ads.example^\n");
        filter.refresh(false).await.unwrap();
        lookup(&filter, "ads.example");
        lookup(&filter, "ads.example");
        lookup(&filter, "other.example");
        assert_eq!(filter.metrics().cache_misses(), 2);
        assert_eq!(filter.metrics().cache_hits(), 1);
    }

    #[tokio::test]
    async fn refresh_invalidates_cached_negative() {
        let (filter, source) = filter("||ads.example^\n");
        filter.refresh(false).await.unwrap();

        // Cache the absence of a match.
        assert!(lookup(&filter, "tracker.example").is_none());
        assert!(lookup(&filter, "tracker.example").is_none());
        assert_eq!(filter.metrics().cache_hits(), 1);

        source.set("||ads.example^\n||tracker.example^\n");
        filter.refresh(false).await.unwrap();
        assert!(matches!(
            lookup(&filter, "tracker.example"),
            Some(DnsMatch::Block(_))
        ));
    }

    struct FailingSource;

    #[async_trait]
    impl RuleSource for FailingSource {
        async fn fetch(&self, _: bool) -> Result<String, FetchError> {
            Err(FetchError::Status(503))
        }
    }

    #[tokio::test]
    async fn failed_refresh_keeps_snapshot() {
        let (filter, _) = filter("||ads.example^\n");
        filter.refresh(false).await.unwrap();
        assert!(lookup(&filter, "ads.example").is_some());

        let failing = RuleListFilter {
            source: Arc::new(FailingSource),
            ..filter
        };
        assert!(failing.refresh(false).await.is_err());
        assert!(!failing.metrics().last_refresh_ok());
        assert_eq!(failing.metrics().refresh_failures(), 1);
        assert_eq!(failing.rules_count(), 1);
        assert!(lookup(&failing, "ads.example").is_some());
        assert_eq!(failing.metrics().cache_hits(), 1);
    }
}
