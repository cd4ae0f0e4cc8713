//! Periodic refreshing of filters and statistics.
//!
//! Components that need to do some I/O work from time to time implement
//! [`Refresher`]. A [`RefreshWorker`] calls a refresher in regular
//! intervals on a Tokio task, limits the time of each run, and reports
//! failures to an [`ErrorCollector`].

use core::fmt;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, instrument, warn, Instrument};

use crate::billstat::BillStatError;
use crate::config::{BillStatConfig, FilterConfig};
use crate::errcoll::ErrorCollector;
use crate::filter::FetchError;

//------------ Refresher -----------------------------------------------------

/// A component that is refreshed periodically.
#[async_trait]
pub trait Refresher: Send + Sync {
    /// Performs one refresh.
    ///
    /// If `accept_stale` is true, the refresher may use locally cached
    /// data of any age. Cancelling the future counts as a failed refresh.
    async fn refresh(&self, accept_stale: bool) -> Result<(), RefreshError>;
}

/// Runs one refresh limited to the given duration.
pub async fn refresh_with_timeout(
    refresher: &dyn Refresher,
    accept_stale: bool,
    duration: Duration,
) -> Result<(), RefreshError> {
    match timeout(duration, refresher.refresh(accept_stale)).await {
        Ok(res) => res,
        Err(_) => Err(RefreshError::Timeout(duration)),
    }
}

//------------ WorkerConfig --------------------------------------------------

/// Configuration of a [`RefreshWorker`].
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    interval: Duration,
    timeout: Duration,
    accept_stale_first: bool,
    refresh_on_shutdown: bool,
}

impl WorkerConfig {
    /// Creates a configuration from an interval and a per-run timeout.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        WorkerConfig {
            interval,
            timeout,
            accept_stale_first: false,
            refresh_on_shutdown: false,
        }
    }

    /// Returns the time between two runs.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns the time limit of a single run.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sets whether the first run may use stale cached data.
    pub fn set_accept_stale_first(&mut self, value: bool) {
        self.accept_stale_first = value
    }

    /// Sets whether shutting the worker down runs one last refresh.
    pub fn set_refresh_on_shutdown(&mut self, value: bool) {
        self.refresh_on_shutdown = value
    }
}

impl From<&FilterConfig> for WorkerConfig {
    fn from(config: &FilterConfig) -> Self {
        WorkerConfig::new(config.refresh_interval(), config.refresh_timeout())
    }
}

impl From<&BillStatConfig> for WorkerConfig {
    fn from(config: &BillStatConfig) -> Self {
        let mut res = WorkerConfig::new(
            config.refresh_interval(),
            config.upload_timeout(),
        );
        res.set_refresh_on_shutdown(true);
        res
    }
}

//------------ RefreshWorker -------------------------------------------------

/// A task refreshing a component in regular intervals.
///
/// The first run happens right away. The task is stopped when the worker
/// is dropped.
pub struct RefreshWorker {
    name: Arc<str>,
    refresher: Arc<dyn Refresher>,
    config: WorkerConfig,
    task: JoinHandle<()>,
}

impl RefreshWorker {
    /// Starts a worker on the current Tokio runtime.
    pub fn start(
        name: impl Into<Arc<str>>,
        refresher: Arc<dyn Refresher>,
        errcoll: Arc<dyn ErrorCollector>,
        config: WorkerConfig,
    ) -> Self {
        let name = name.into();
        let span = tracing::debug_span!("refresh_worker", worker = %name);
        let task = tokio::spawn(
            run(refresher.clone(), errcoll, config.clone()).instrument(span),
        );
        RefreshWorker {
            name,
            refresher,
            config,
            task,
        }
    }

    /// Returns the name of the worker.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops the worker.
    ///
    /// A run in progress is cancelled and has finished cleaning up when
    /// the final refresh starts. If so configured, one last refresh is
    /// performed and its outcome returned.
    #[instrument(skip(self), fields(worker = %self.name))]
    pub async fn shutdown(mut self) -> Result<(), RefreshError> {
        self.task.abort();
        if let Err(err) = (&mut self.task).await {
            if err.is_panic() {
                warn!("worker task panicked");
            }
        }
        if self.config.refresh_on_shutdown {
            debug!("final refresh");
            refresh_with_timeout(
                self.refresher.as_ref(),
                false,
                self.config.timeout,
            )
            .await
        } else {
            Ok(())
        }
    }
}

impl Drop for RefreshWorker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl fmt::Debug for RefreshWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshWorker")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

async fn run(
    refresher: Arc<dyn Refresher>,
    errcoll: Arc<dyn ErrorCollector>,
    config: WorkerConfig,
) {
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut accept_stale = config.accept_stale_first;
    loop {
        ticker.tick().await;
        match refresh_with_timeout(
            refresher.as_ref(),
            accept_stale,
            config.timeout,
        )
        .await
        {
            Ok(()) => debug!("refresh succeeded"),
            Err(err) => errcoll.collect(&err),
        }
        accept_stale = false;
    }
}

//------------ RefreshError --------------------------------------------------

/// A refresh failed.
#[derive(Debug)]
pub enum RefreshError {
    /// The rules of a list could not be fetched.
    Fetch { list: Arc<str>, err: FetchError },

    /// Compiling the rules of a list was aborted.
    Compile { list: Arc<str>, err: JoinError },

    /// Uploading billing statistics failed.
    BillStat(BillStatError),

    /// The refresh did not finish within the given time.
    Timeout(Duration),
}

impl From<BillStatError> for RefreshError {
    fn from(err: BillStatError) -> Self {
        RefreshError::BillStat(err)
    }
}

impl fmt::Display for RefreshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshError::Fetch { list, err } => {
                write!(f, "fetching list {list}: {err}")
            }
            RefreshError::Compile { list, err } => {
                write!(f, "compiling list {list}: {err}")
            }
            RefreshError::BillStat(err) => write!(f, "billing stats: {err}"),
            RefreshError::Timeout(duration) => {
                write!(f, "refresh timed out after {duration:?}")
            }
        }
    }
}

impl std::error::Error for RefreshError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RefreshError::Fetch { err, .. } => Some(err),
            RefreshError::Compile { err, .. } => Some(err),
            RefreshError::BillStat(err) => Some(err),
            RefreshError::Timeout(_) => None,
        }
    }
}

//============ Testing =======================================================
