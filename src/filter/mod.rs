//! Filtering of queries by rule lists.
//!
//! A [`RuleListFilter`] holds a rule list compiled into a
//! [`RuleEngine`][engine::RuleEngine] together with a cache of lookup
//! outcomes. The list is loaded from a [`RuleSource`] and can be reloaded
//! at any time without interrupting lookups.
//!
//! [`SafeSearch`] is a rule list whose rules rewrite the responses for
//! search engines to their family-friendly variants.
//!
//! The outcome of filtering a query is a [`FilterResult`].

use core::fmt;

use std::net::IpAddr;
use std::sync::Arc;

use domain::base::iana::Rtype;
use domain::base::Message;

use crate::dnsmsg::{MessageError, Messages};

pub use self::engine::DnsMatch;
pub use self::rulelist::RuleListFilter;
pub use self::rules::{DnsRewrite, RuleAction};
pub use self::safesearch::SafeSearch;
#[cfg(feature = "http")]
pub use self::source::HttpRuleSource;
pub use self::source::{FetchError, RuleSource, TextSource};

pub mod cache;
pub mod engine;
pub mod rules;
pub mod rulelist;
pub mod safesearch;
pub mod source;

//------------ FilterRequest -------------------------------------------------

/// The data a query is filtered by.
#[derive(Clone, Copy)]
pub struct FilterRequest<'a> {
    /// The query message.
    pub message: &'a Message<Vec<u8>>,

    /// The queried host in lower case without a trailing dot.
    pub host: &'a str,

    /// The query type.
    pub qtype: Rtype,

    /// The address of the client.
    pub client_ip: IpAddr,

    /// The name of the client device, possibly empty.
    pub client_name: &'a str,
}

//------------ FilterResult --------------------------------------------------

/// The outcome of filtering a query.
#[derive(Clone)]
pub enum FilterResult {
    /// The query is blocked.
    Blocked {
        /// The identifier of the deciding list.
        list: Arc<str>,

        /// The text of the deciding rule.
        rule: Arc<str>,
    },

    /// The query was exempted from blocking.
    Allowed { list: Arc<str>, rule: Arc<str> },

    /// The query is answered with this response.
    ModifiedResponse {
        list: Arc<str>,
        rule: Arc<str>,
        response: Message<Vec<u8>>,
    },

    /// This query is to be resolved instead.
    ModifiedRequest {
        list: Arc<str>,
        rule: Arc<str>,
        request: Message<Vec<u8>>,
    },
}

impl FilterResult {
    /// Creates the result for a match of a list.
    ///
    /// A rewrite to a response code wins over a rewrite to another name
    /// which in turn wins over rewrites to addresses. If the addresses
    /// contain none of the query type, the response has no answers.
    pub fn from_match(
        list: &Arc<str>,
        found: DnsMatch,
        req: &FilterRequest,
        messages: &Messages,
    ) -> Result<Self, MessageError> {
        let list = list.clone();
        let rule = found.rule_text().clone();
        let rules = match found {
            DnsMatch::Block(_) => {
                return Ok(FilterResult::Blocked { list, rule })
            }
            DnsMatch::Allow(_) => {
                return Ok(FilterResult::Allowed { list, rule })
            }
            DnsMatch::Rewrite(rules) => rules,
        };

        let mut addrs = Vec::new();
        let mut cname = None;
        for item in &rules {
            match item.action() {
                RuleAction::Rewrite(DnsRewrite::Rcode(rcode)) => {
                    return Ok(FilterResult::ModifiedResponse {
                        list,
                        rule: item.text().clone(),
                        response: messages
                            .rcode_response(req.message, *rcode)?,
                    });
                }
                RuleAction::Rewrite(DnsRewrite::Cname(name)) => {
                    cname.get_or_insert((item, name));
                }
                RuleAction::Rewrite(DnsRewrite::Address(addr)) => {
                    addrs.push(*addr)
                }
                _ => {}
            }
        }
        if let Some((item, name)) = cname {
            return Ok(FilterResult::ModifiedRequest {
                list,
                rule: item.text().clone(),
                request: messages.rewrite_request(req.message, name)?,
            });
        }
        Ok(FilterResult::ModifiedResponse {
            list,
            rule,
            response: messages.address_response(req.message, &addrs)?,
        })
    }

    /// Returns the identifier of the deciding list.
    pub fn list(&self) -> &Arc<str> {
        match self {
            FilterResult::Blocked { list, .. }
            | FilterResult::Allowed { list, .. }
            | FilterResult::ModifiedResponse { list, .. }
            | FilterResult::ModifiedRequest { list, .. } => list,
        }
    }

    /// Returns the text of the deciding rule.
    pub fn rule(&self) -> &Arc<str> {
        match self {
            FilterResult::Blocked { rule, .. }
            | FilterResult::Allowed { rule, .. }
            | FilterResult::ModifiedResponse { rule, .. }
            | FilterResult::ModifiedRequest { rule, .. } => rule,
        }
    }

    /// Returns whether the query is blocked.
    pub fn is_blocked(&self) -> bool {
        matches!(self, FilterResult::Blocked { .. })
    }

    /// Sets the message ID of a contained message.
    pub(crate) fn set_id(&mut self, id: u16) {
        match self {
            FilterResult::ModifiedResponse { response: msg, .. }
            | FilterResult::ModifiedRequest { request: msg, .. } => {
                msg.header_mut().set_id(id)
            }
            _ => {}
        }
    }
}

impl fmt::Debug for FilterResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterResult::Blocked { .. } => "Blocked",
            FilterResult::Allowed { .. } => "Allowed",
            FilterResult::ModifiedResponse { .. } => "ModifiedResponse",
            FilterResult::ModifiedRequest { .. } => "ModifiedRequest",
        };
        f.debug_struct(name)
            .field("list", self.list())
            .field("rule", self.rule())
            .finish()
    }
}

//============ Testing =======================================================
