//! Billing statistics.
//!
//! For every device that sent queries, the service keeps a
//! [`BillingRecord`] counting the queries and remembering where and how the
//! last one arrived. The records are periodically handed to an
//! [`Uploader`] and start over afterwards.
//!
//! The [`RuntimeRecorder`] makes sure that no counts are lost. If an upload
//! fails, or is cancelled, the records are merged back into the ones
//! collected in the meantime.

use core::fmt;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::base::{Asn, Country, DeviceId, Protocol};

pub use self::runtime::RuntimeRecorder;

pub mod runtime;

//------------ BillingRecord -------------------------------------------------

/// The statistics of a single device since the last upload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BillingRecord {
    /// The time of the most recent query.
    pub time: OffsetDateTime,

    /// The country the most recent query came from.
    pub country: Country,

    /// The autonomous system the most recent query came from.
    pub asn: Asn,

    /// The number of queries.
    pub queries: u64,

    /// The protocol of the most recent query.
    pub proto: Protocol,
}

/// The billing records of all devices by device ID.
pub type Records = HashMap<DeviceId, BillingRecord>;

//------------ Recorder ------------------------------------------------------

/// Records queries for billing.
pub trait Recorder: Send + Sync {
    /// Records a single query of a device.
    fn record(
        &self,
        id: DeviceId,
        country: Country,
        asn: Asn,
        time: OffsetDateTime,
        proto: Protocol,
    );
}

/// A recorder that drops everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyRecorder;

impl Recorder for EmptyRecorder {
    fn record(
        &self,
        _id: DeviceId,
        _country: Country,
        _asn: Asn,
        _time: OffsetDateTime,
        _proto: Protocol,
    ) {
    }
}

//------------ Uploader ------------------------------------------------------

/// Sends billing records to the backend.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Uploads a set of records.
    ///
    /// The records stay with the caller so they can be kept if the upload
    /// fails.
    async fn upload(&self, records: &Records) -> Result<(), UploadError>;
}

//------------ UploadError ---------------------------------------------------

/// An upload of billing records failed.
#[derive(Debug)]
pub struct UploadError(Box<dyn std::error::Error + Send + Sync>);

impl UploadError {
    /// Creates an upload error from any error or message.
    pub fn new(
        err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        UploadError(err.into())
    }
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for UploadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

//------------ BillStatError -------------------------------------------------

/// Flushing billing records failed.
///
/// In both cases the records have been kept for the next attempt.
#[derive(Debug)]
pub enum BillStatError {
    /// The uploader returned an error.
    Upload(UploadError),

    /// The upload did not finish in time.
    Timeout(Duration),
}

impl From<UploadError> for BillStatError {
    fn from(err: UploadError) -> Self {
        BillStatError::Upload(err)
    }
}

impl fmt::Display for BillStatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BillStatError::Upload(err) => write!(f, "uploading records: {err}"),
            BillStatError::Timeout(duration) => {
                write!(f, "upload timed out after {duration:?}")
            }
        }
    }
}

impl std::error::Error for BillStatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BillStatError::Upload(err) => Some(err),
            BillStatError::Timeout(_) => None,
        }
    }
}
