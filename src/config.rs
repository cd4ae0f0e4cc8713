//! Configuration of the filtering components.
//!
//! Each component has its own configuration type. All values have sensible
//! defaults and are limited to a sane range by their `set_*` methods. The
//! types can be deserialized with serde so that they can be embedded into
//! whatever configuration file format is used by an application. Durations
//! are given in seconds there.

use core::fmt;
use core::time::Duration;

use serde::Deserialize;
use tracing::debug;

//------------ DefMinMax -----------------------------------------------------

/// The default, minimum, and maximum values for a config variable.
#[derive(Clone, Copy)]
pub struct DefMinMax<T> {
    /// The name of the variable in configuration files.
    name: &'static str,

    /// The default value.
    def: T,

    /// The minimum value.
    min: T,

    /// The maximum value.
    max: T,
}

impl<T> DefMinMax<T> {
    /// Creates a new value.
    pub const fn new(name: &'static str, def: T, min: T, max: T) -> Self {
        Self { name, def, min, max }
    }

    /// Returns the name of the variable.
    pub fn name(self) -> &'static str {
        self.name
    }

    /// Returns the default value.
    pub fn default(self) -> T {
        self.def
    }

    /// Trims the given value to fit into the minimum/maximum range.
    ///
    /// Also returns whether the value had to be trimmed.
    pub fn clamp(self, value: T) -> (T, bool)
    where
        T: Ord,
    {
        if value < self.min {
            (self.min, true)
        } else if value > self.max {
            (self.max, true)
        } else {
            (value, false)
        }
    }

    /// Trims the given value and logs if it was out of range.
    pub fn limit(self, value: T) -> T
    where
        T: Ord + fmt::Debug,
    {
        let name = self.name;
        let (value, trimmed) = self.clamp(value);
        if trimmed {
            debug!(option = name, limited = ?value, "value out of range");
        }
        value
    }
}

//------------ Limits --------------------------------------------------------

/// Maximum number of entries in a rule list's result cache.
const RESULT_CACHE_SIZE: DefMinMax<u64> = DefMinMax::new(
    "result_cache_size",
    10_000,
    1,
    10_000_000,
);

/// Maximum number of entries in the safe search cache.
const SAFE_SEARCH_CACHE_SIZE: DefMinMax<u64> = DefMinMax::new(
    "safe_search_cache_size",
    1_000,
    1,
    10_000_000,
);

/// Time-to-live of safe search cache entries.
const SAFE_SEARCH_CACHE_TTL: DefMinMax<Duration> = DefMinMax::new(
    "safe_search_cache_ttl",
    Duration::from_secs(60),
    Duration::from_secs(1),
    Duration::from_secs(86_400),
);

/// Time limit for a single refresh of a rule list.
const REFRESH_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    "refresh_timeout",
    Duration::from_secs(180),
    Duration::from_secs(1),
    Duration::from_secs(3_600),
);

/// Interval between refreshes of rule lists.
const REFRESH_INTERVAL: DefMinMax<Duration> = DefMinMax::new(
    "refresh_interval",
    Duration::from_secs(3_600),
    Duration::from_secs(60),
    Duration::from_secs(86_400),
);

/// Maximum size of a downloaded rule list.
const MAX_RULE_LIST_SIZE: DefMinMax<u64> = DefMinMax::new(
    "max_size",
    196 * 1024 * 1024,
    1024,
    1024 * 1024 * 1024,
);

/// Age after which a cached rule list is refetched.
const STALENESS: DefMinMax<Duration> = DefMinMax::new(
    "staleness",
    Duration::from_secs(3_600),
    Duration::from_secs(60),
    Duration::from_secs(7 * 86_400),
);

/// TTL of records in synthesized responses.
const RESPONSE_TTL: DefMinMax<Duration> = DefMinMax::new(
    "response_ttl",
    Duration::from_secs(10),
    Duration::ZERO,
    Duration::from_secs(86_400),
);

/// Time limit for a single billing upload.
const UPLOAD_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    "upload_timeout",
    Duration::from_secs(30),
    Duration::from_secs(1),
    Duration::from_secs(600),
);

/// Interval between billing uploads.
const UPLOAD_INTERVAL: DefMinMax<Duration> = DefMinMax::new(
    "refresh_interval",
    Duration::from_secs(600),
    Duration::from_secs(1),
    Duration::from_secs(86_400),
);

//------------ FilterConfig --------------------------------------------------

/// Configuration of rule lists and safe search.
#[derive(Clone, Debug, Deserialize)]
#[serde(from = "FilterConfigData")]
pub struct FilterConfig {
    /// Maximum number of entries in each rule list's result cache.
    result_cache_size: u64,

    /// Maximum number of entries in the safe search cache.
    safe_search_cache_size: u64,

    /// Time-to-live of safe search cache entries.
    safe_search_cache_ttl: Duration,

    /// Time limit for a single refresh.
    refresh_timeout: Duration,

    /// Interval between refreshes.
    refresh_interval: Duration,

    /// Maximum size of a downloaded rule list in bytes.
    max_size: u64,

    /// Age after which a cached rule list is refetched.
    staleness: Duration,
}

impl FilterConfig {
    /// Creates a new config with default values.
    ///
    /// The default values are documented at the relevant set_* methods.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the maximum number of entries in a result cache.
    pub fn result_cache_size(&self) -> u64 {
        self.result_cache_size
    }

    /// Sets the maximum number of entries in a result cache.
    ///
    /// The value has to be at least one, at most 10,000,000 and the default
    /// is 10,000.
    pub fn set_result_cache_size(&mut self, value: u64) {
        self.result_cache_size = RESULT_CACHE_SIZE.limit(value)
    }

    /// Returns the maximum number of entries in the safe search cache.
    pub fn safe_search_cache_size(&self) -> u64 {
        self.safe_search_cache_size
    }

    /// Sets the maximum number of entries in the safe search cache.
    ///
    /// The value has to be at least one, at most 10,000,000 and the default
    /// is 1,000.
    pub fn set_safe_search_cache_size(&mut self, value: u64) {
        self.safe_search_cache_size = SAFE_SEARCH_CACHE_SIZE.limit(value)
    }

    /// Returns the time-to-live of safe search cache entries.
    pub fn safe_search_cache_ttl(&self) -> Duration {
        self.safe_search_cache_ttl
    }

    /// Sets the time-to-live of safe search cache entries.
    ///
    /// The value has to be at least one second, at most one day and the
    /// default is one minute.
    pub fn set_safe_search_cache_ttl(&mut self, value: Duration) {
        self.safe_search_cache_ttl = SAFE_SEARCH_CACHE_TTL.limit(value)
    }

    /// Returns the time limit for a single refresh.
    pub fn refresh_timeout(&self) -> Duration {
        self.refresh_timeout
    }

    /// Sets the time limit for a single refresh.
    ///
    /// The value has to be at least one second, at most one hour and the
    /// default is three minutes.
    pub fn set_refresh_timeout(&mut self, value: Duration) {
        self.refresh_timeout = REFRESH_TIMEOUT.limit(value)
    }

    /// Returns the interval between refreshes.
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Sets the interval between refreshes.
    ///
    /// The value has to be at least one minute, at most one day and the
    /// default is one hour.
    pub fn set_refresh_interval(&mut self, value: Duration) {
        self.refresh_interval = REFRESH_INTERVAL.limit(value)
    }

    /// Returns the maximum size of a downloaded rule list in bytes.
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Sets the maximum size of a downloaded rule list in bytes.
    ///
    /// The value has to be at least 1 KiB, at most 1 GiB and the default is
    /// 196 MiB.
    pub fn set_max_size(&mut self, value: u64) {
        self.max_size = MAX_RULE_LIST_SIZE.limit(value)
    }

    /// Returns the age after which a cached rule list is refetched.
    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    /// Sets the age after which a cached rule list is refetched.
    ///
    /// The value has to be at least one minute, at most one week and the
    /// default is one hour.
    pub fn set_staleness(&mut self, value: Duration) {
        self.staleness = STALENESS.limit(value)
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            result_cache_size: RESULT_CACHE_SIZE.default(),
            safe_search_cache_size: SAFE_SEARCH_CACHE_SIZE.default(),
            safe_search_cache_ttl: SAFE_SEARCH_CACHE_TTL.default(),
            refresh_timeout: REFRESH_TIMEOUT.default(),
            refresh_interval: REFRESH_INTERVAL.default(),
            max_size: MAX_RULE_LIST_SIZE.default(),
            staleness: STALENESS.default(),
        }
    }
}

/// The serialized form of [`FilterConfig`].
#[derive(Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FilterConfigData {
    result_cache_size: Option<u64>,
    safe_search_cache_size: Option<u64>,
    safe_search_cache_ttl: Option<u64>,
    refresh_timeout: Option<u64>,
    refresh_interval: Option<u64>,
    max_size: Option<u64>,
    staleness: Option<u64>,
}

impl From<FilterConfigData> for FilterConfig {
    fn from(data: FilterConfigData) -> Self {
        let mut res = FilterConfig::new();
        if let Some(value) = data.result_cache_size {
            res.set_result_cache_size(value)
        }
        if let Some(value) = data.safe_search_cache_size {
            res.set_safe_search_cache_size(value)
        }
        if let Some(value) = data.safe_search_cache_ttl {
            res.set_safe_search_cache_ttl(Duration::from_secs(value))
        }
        if let Some(value) = data.refresh_timeout {
            res.set_refresh_timeout(Duration::from_secs(value))
        }
        if let Some(value) = data.refresh_interval {
            res.set_refresh_interval(Duration::from_secs(value))
        }
        if let Some(value) = data.max_size {
            res.set_max_size(value)
        }
        if let Some(value) = data.staleness {
            res.set_staleness(Duration::from_secs(value))
        }
        res
    }
}

//------------ MessagesConfig ------------------------------------------------

/// Configuration of synthesized responses.
#[derive(Clone, Debug, Deserialize)]
#[serde(from = "MessagesConfigData")]
pub struct MessagesConfig {
    /// TTL of records in synthesized responses.
    response_ttl: Duration,
}

impl MessagesConfig {
    /// Creates a new config with default values.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the TTL of records in synthesized responses.
    pub fn response_ttl(&self) -> Duration {
        self.response_ttl
    }

    /// Sets the TTL of records in synthesized responses.
    ///
    /// The value is at most one day and the default is ten seconds.
    /// Fractions of a second are ignored.
    pub fn set_response_ttl(&mut self, value: Duration) {
        self.response_ttl = RESPONSE_TTL.limit(value)
    }
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            response_ttl: RESPONSE_TTL.default(),
        }
    }
}

#[derive(Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct MessagesConfigData {
    response_ttl: Option<u64>,
}

impl From<MessagesConfigData> for MessagesConfig {
    fn from(data: MessagesConfigData) -> Self {
        let mut res = MessagesConfig::new();
        if let Some(value) = data.response_ttl {
            res.set_response_ttl(Duration::from_secs(value))
        }
        res
    }
}

//------------ BillStatConfig ------------------------------------------------

/// Configuration of billing statistics.
#[derive(Clone, Debug, Deserialize)]
#[serde(from = "BillStatConfigData")]
pub struct BillStatConfig {
    /// Time limit for a single upload.
    upload_timeout: Duration,

    /// Interval between uploads.
    refresh_interval: Duration,
}

impl BillStatConfig {
    /// Creates a new config with default values.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the time limit for a single upload.
    pub fn upload_timeout(&self) -> Duration {
        self.upload_timeout
    }

    /// Sets the time limit for a single upload.
    ///
    /// The value has to be at least one second, at most ten minutes and
    /// the default is 30 seconds.
    pub fn set_upload_timeout(&mut self, value: Duration) {
        self.upload_timeout = UPLOAD_TIMEOUT.limit(value)
    }

    /// Returns the interval between uploads.
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Sets the interval between uploads.
    ///
    /// The value has to be at least one second, at most one day and the
    /// default is ten minutes.
    pub fn set_refresh_interval(&mut self, value: Duration) {
        self.refresh_interval = UPLOAD_INTERVAL.limit(value)
    }
}

impl Default for BillStatConfig {
    fn default() -> Self {
        Self {
            upload_timeout: UPLOAD_TIMEOUT.default(),
            refresh_interval: UPLOAD_INTERVAL.default(),
        }
    }
}

#[derive(Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct BillStatConfigData {
    upload_timeout: Option<u64>,
    refresh_interval: Option<u64>,
}

impl From<BillStatConfigData> for BillStatConfig {
    fn from(data: BillStatConfigData) -> Self {
        let mut res = BillStatConfig::new();
        if let Some(value) = data.upload_timeout {
            res.set_upload_timeout(Duration::from_secs(value))
        }
        if let Some(value) = data.refresh_interval {
            res.set_refresh_interval(Duration::from_secs(value))
        }
        res
    }
}

//============ Testing =======================================================
