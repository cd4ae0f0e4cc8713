//! Basic types shared by all components.
//!
//! This module provides the identifiers of profiles and devices in
//! [`id`], the [`Protocol`] a query arrived over in [`proto`], and the
//! geographical values recorded for billing in [`geo`].

pub use self::geo::{Asn, BadCountry, Country};
pub use self::id::{
    DeviceId, HumanId, HumanIdLower, IdError, IdErrorReason, IdKind,
    ProfileId,
};
pub use self::proto::{Protocol, UnknownProtocol};

pub mod geo;
pub mod id;
pub mod proto;
