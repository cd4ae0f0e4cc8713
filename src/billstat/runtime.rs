//! The in-memory billing statistics recorder.

use core::mem;

use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::time::{timeout, Instant};
use tracing::{debug, instrument, trace, warn};

use super::{BillStatError, BillingRecord, Recorder, Records, Uploader};
use crate::base::{Asn, Country, DeviceId, Protocol};
use crate::config::BillStatConfig;
use crate::metrics::BillStatMetrics;
use crate::refresh::{RefreshError, Refresher};

//------------ RuntimeRecorder -----------------------------------------------

/// Collects billing records in memory and uploads them on refresh.
///
/// Recording a query only takes a short lock on the table of records. A
/// refresh swaps the table for an empty one and uploads the old table
/// without holding the lock. If the upload fails or the refresh is
/// cancelled, the old records are merged back.
pub struct RuntimeRecorder {
    records: Mutex<Records>,
    uploader: Arc<dyn Uploader>,
    upload_timeout: Duration,
    metrics: Arc<BillStatMetrics>,
}

impl RuntimeRecorder {
    /// Creates a new recorder.
    pub fn new(
        uploader: Arc<dyn Uploader>,
        config: &BillStatConfig,
        metrics: Arc<BillStatMetrics>,
    ) -> Self {
        RuntimeRecorder {
            records: Default::default(),
            uploader,
            upload_timeout: config.upload_timeout(),
            metrics,
        }
    }

    /// Returns the metrics of the recorder.
    pub fn metrics(&self) -> &Arc<BillStatMetrics> {
        &self.metrics
    }

    /// Returns the number of devices with pending records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns whether there are no pending records.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Returns a copy of the record of a device.
    pub fn get(&self, id: &DeviceId) -> Option<BillingRecord> {
        self.records.lock().get(id).cloned()
    }

    /// Records a single query of a device.
    ///
    /// The query count of the device is increased by one and all other
    /// values are replaced.
    pub fn record(
        &self,
        id: DeviceId,
        country: Country,
        asn: Asn,
        time: OffsetDateTime,
        proto: Protocol,
    ) {
        let mut records = self.records.lock();
        match records.entry(id) {
            Entry::Occupied(entry) => {
                let rec = entry.into_mut();
                rec.time = time;
                rec.country = country;
                rec.asn = asn;
                rec.proto = proto;
                rec.queries += 1;
            }
            Entry::Vacant(entry) => {
                entry.insert(BillingRecord {
                    time,
                    country,
                    asn,
                    queries: 1,
                    proto,
                });
            }
        }
        self.metrics.set_buffered_records(records.len());
    }

    /// Uploads all records collected so far.
    ///
    /// On success, the records are gone. On failure, or if the returned
    /// future is dropped before it completes, they are merged back into
    /// the records collected in the meantime.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<(), BillStatError> {
        let pending = mem::take(&mut *self.records.lock());
        self.metrics.set_buffered_records(0);
        if pending.is_empty() {
            trace!("no records to upload");
            return Ok(());
        }

        let count = pending.len();
        let mut guard = Remerge {
            recorder: self,
            pending,
            armed: true,
        };
        let start = Instant::now();
        let upload = self.uploader.upload(&guard.pending);
        let res = match timeout(self.upload_timeout, upload).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(BillStatError::Upload(err)),
            Err(_) => Err(BillStatError::Timeout(self.upload_timeout)),
        };
        self.metrics.record_upload(start.elapsed(), res.is_ok());
        match res {
            Ok(()) => {
                guard.armed = false;
                debug!(records = count, "uploaded billing records");
                Ok(())
            }
            Err(err) => {
                drop(guard);
                warn!(records = count, "{err}; records kept");
                Err(err)
            }
        }
    }

    /// Merges records that failed to upload into the current records.
    ///
    /// Devices that have no current record get their old one back. For
    /// the others, the query counts are added up and the current values
    /// are kept since they are more recent.
    fn remerge(&self, prev: Records) {
        let mut records = self.records.lock();
        for (id, prev) in prev {
            match records.entry(id) {
                Entry::Occupied(entry) => {
                    entry.into_mut().queries += prev.queries
                }
                Entry::Vacant(entry) => {
                    entry.insert(prev);
                }
            }
        }
        self.metrics.set_buffered_records(records.len());
    }
}

impl Recorder for RuntimeRecorder {
    fn record(
        &self,
        id: DeviceId,
        country: Country,
        asn: Asn,
        time: OffsetDateTime,
        proto: Protocol,
    ) {
        RuntimeRecorder::record(self, id, country, asn, time, proto)
    }
}

#[async_trait]
impl Refresher for RuntimeRecorder {
    async fn refresh(&self, _accept_stale: bool) -> Result<(), RefreshError> {
        Ok(RuntimeRecorder::refresh(self).await?)
    }
}

//------------ Remerge -------------------------------------------------------

/// Puts detached records back unless disarmed.
struct Remerge<'a> {
    recorder: &'a RuntimeRecorder,
    pending: Records,
    armed: bool,
}

impl<'a> Drop for Remerge<'a> {
    fn drop(&mut self) {
        if self.armed {
            self.recorder.remerge(mem::take(&mut self.pending));
        }
    }
}

//============ Testing =======================================================
