//! Synthesized DNS responses.
//!
//! Blocked queries are answered directly instead of being forwarded. How
//! they are answered depends on the profile's [`BlockingMode`]. The mode is
//! first resolved into a [`BlockedAnswer`] for the query type. This step is
//! a pure function. [`Messages`] then turns the answer into an actual
//! response message.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use domain::base::iana::{Rcode, Rtype};
use serde::Deserialize;

pub use self::messages::{MessageError, Messages, QueryInfo};

pub mod messages;

//------------ BlockingMode --------------------------------------------------

/// How blocked queries are answered.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockingMode {
    /// Respond with configured addresses.
    ///
    /// Queries for an address type with no configured addresses and
    /// queries for all other types get an empty answer.
    CustomIp {
        #[serde(default)]
        ipv4: Vec<Ipv4Addr>,
        #[serde(default)]
        ipv6: Vec<Ipv6Addr>,
    },

    /// Respond with the unspecified address for A and AAAA queries.
    #[default]
    NullIp,

    /// Respond with NXDOMAIN.
    NxDomain,

    /// Respond with REFUSED.
    Refused,
}

impl BlockingMode {
    /// Returns the answer to a blocked query of type `qtype`.
    pub fn answer_for(&self, qtype: Rtype) -> BlockedAnswer {
        match self {
            BlockingMode::CustomIp { ipv4, ipv6 } => {
                let addrs: Vec<IpAddr> = if qtype == Rtype::A {
                    ipv4.iter().copied().map(IpAddr::V4).collect()
                } else if qtype == Rtype::AAAA {
                    ipv6.iter().copied().map(IpAddr::V6).collect()
                } else {
                    Vec::new()
                };
                if addrs.is_empty() {
                    BlockedAnswer::NoData
                } else {
                    BlockedAnswer::Addresses(addrs)
                }
            }
            BlockingMode::NullIp => {
                if qtype == Rtype::A {
                    BlockedAnswer::Addresses(vec![Ipv4Addr::UNSPECIFIED.into()])
                } else if qtype == Rtype::AAAA {
                    BlockedAnswer::Addresses(vec![Ipv6Addr::UNSPECIFIED.into()])
                } else {
                    BlockedAnswer::NoData
                }
            }
            BlockingMode::NxDomain => BlockedAnswer::Rcode(Rcode::NXDOMAIN),
            BlockingMode::Refused => BlockedAnswer::Rcode(Rcode::REFUSED),
        }
    }
}

//------------ BlockedAnswer -------------------------------------------------

/// The shape of a synthesized response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BlockedAnswer {
    /// A NOERROR response with these addresses in the answer section.
    Addresses(Vec<IpAddr>),

    /// A NOERROR response with an empty answer section.
    NoData,

    /// An empty response with this response code.
    Rcode(Rcode),
}

//============ Testing =======================================================
