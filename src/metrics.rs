//! Metrics of the filtering components.
//!
//! Each component receives its metrics at construction time wrapped in an
//! [`Arc`][std::sync::Arc] so the application can keep a handle and export
//! the values any way it likes.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize};
use std::sync::atomic::Ordering;
use std::time::Duration;

use time::OffsetDateTime;

//------------ FilterMetrics -------------------------------------------------

/// Metrics of a single refreshable filter.
#[derive(Debug, Default)]
pub struct FilterMetrics {
    rule_count: AtomicUsize,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    refresh_ok: AtomicBool,
    refresh_failures: AtomicU64,
    last_refresh: AtomicI64,
}

impl FilterMetrics {
    /// Creates a new set of metrics with all values zero.
    pub fn new() -> Self {
        Default::default()
    }

    /// The number of rules in the current rule snapshot.
    pub fn rule_count(&self) -> usize {
        self.rule_count.load(Ordering::Relaxed)
    }

    /// The number of lookups answered from the result cache.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// The number of lookups that had to consult the rules.
    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    /// Whether the last refresh succeeded.
    pub fn last_refresh_ok(&self) -> bool {
        self.refresh_ok.load(Ordering::Relaxed)
    }

    /// The number of failed refreshes.
    pub fn refresh_failures(&self) -> u64 {
        self.refresh_failures.load(Ordering::Relaxed)
    }

    /// The time of the last successful refresh.
    pub fn last_refresh(&self) -> Option<OffsetDateTime> {
        timestamp(&self.last_refresh)
    }

    pub(crate) fn record_cache(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_refresh(&self, rule_count: Option<usize>) {
        match rule_count {
            Some(count) => {
                self.rule_count.store(count, Ordering::Relaxed);
                self.refresh_ok.store(true, Ordering::Relaxed);
                set_timestamp(&self.last_refresh, OffsetDateTime::now_utc());
            }
            None => {
                self.refresh_ok.store(false, Ordering::Relaxed);
                self.refresh_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

//------------ BillStatMetrics -----------------------------------------------

/// Metrics of the billing statistics recorder.
#[derive(Debug, Default)]
pub struct BillStatMetrics {
    buffered_records: AtomicUsize,
    last_upload_duration: AtomicU64,
    upload_ok: AtomicBool,
    upload_failures: AtomicU64,
    last_upload: AtomicI64,
}

impl BillStatMetrics {
    /// Creates a new set of metrics with all values zero.
    pub fn new() -> Self {
        Default::default()
    }

    /// The number of device records waiting for upload.
    pub fn buffered_records(&self) -> usize {
        self.buffered_records.load(Ordering::Relaxed)
    }

    /// The duration of the last upload attempt.
    pub fn last_upload_duration(&self) -> Duration {
        Duration::from_micros(self.last_upload_duration.load(Ordering::Relaxed))
    }

    /// Whether the last upload succeeded.
    pub fn last_upload_ok(&self) -> bool {
        self.upload_ok.load(Ordering::Relaxed)
    }

    /// The number of failed uploads.
    pub fn upload_failures(&self) -> u64 {
        self.upload_failures.load(Ordering::Relaxed)
    }

    /// The time of the last successful upload.
    pub fn last_upload(&self) -> Option<OffsetDateTime> {
        timestamp(&self.last_upload)
    }

    pub(crate) fn set_buffered_records(&self, count: usize) {
        self.buffered_records.store(count, Ordering::Relaxed);
    }

    pub(crate) fn record_upload(&self, duration: Duration, ok: bool) {
        self.last_upload_duration.store(
            u64::try_from(duration.as_micros()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        self.upload_ok.store(ok, Ordering::Relaxed);
        if ok {
            set_timestamp(&self.last_upload, OffsetDateTime::now_utc());
        } else {
            self.upload_failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

//------------ DeviceFinderMetrics -------------------------------------------

/// How a device was identified.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FindPath {
    DedicatedIp,
    LinkedIp,
    Domain,
    Edns,
}

/// Metrics of the device finder.
#[derive(Debug, Default)]
pub struct DeviceFinderMetrics {
    dedicated_ip: AtomicU64,
    linked_ip: AtomicU64,
    domain: AtomicU64,
    edns: AtomicU64,
    found: AtomicU64,
    empty: AtomicU64,
    errors: AtomicU64,
}

impl DeviceFinderMetrics {
    /// Creates a new set of metrics with all values zero.
    pub fn new() -> Self {
        Default::default()
    }

    /// The number of devices found through a path.
    pub fn found_by(&self, path: FindPath) -> u64 {
        self.path_counter(path).load(Ordering::Relaxed)
    }

    /// The number of queries that resolved to a device.
    pub fn found(&self) -> u64 {
        self.found.load(Ordering::Relaxed)
    }

    /// The number of queries without a device.
    pub fn empty(&self) -> u64 {
        self.empty.load(Ordering::Relaxed)
    }

    /// The number of queries that failed identification.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub(crate) fn record_found(&self, path: FindPath) {
        self.path_counter(path).fetch_add(1, Ordering::Relaxed);
        self.found.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_empty(&self) {
        self.empty.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn path_counter(&self, path: FindPath) -> &AtomicU64 {
        match path {
            FindPath::DedicatedIp => &self.dedicated_ip,
            FindPath::LinkedIp => &self.linked_ip,
            FindPath::Domain => &self.domain,
            FindPath::Edns => &self.edns,
        }
    }
}

//------------ Helpers -------------------------------------------------------

/// Zero means no value.
fn timestamp(atomic: &AtomicI64) -> Option<OffsetDateTime> {
    match atomic.load(Ordering::Relaxed) {
        0 => None,
        secs => OffsetDateTime::from_unix_timestamp(secs).ok(),
    }
}

fn set_timestamp(atomic: &AtomicI64, value: OffsetDateTime) {
    atomic.store(value.unix_timestamp(), Ordering::Relaxed);
}

//============ Testing =======================================================
