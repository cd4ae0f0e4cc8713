//! Construction of response messages.

use core::fmt;
use core::str::FromStr;

use std::net::IpAddr;

use domain::base::iana::{Class, Rcode, Rtype};
use domain::base::message_builder::{AnswerBuilder, PushError};
use domain::base::name::ParsedName;
use domain::base::question::Question;
use domain::base::{Message, MessageBuilder, Name, Ttl};
use domain::rdata::{Aaaa, A};

use super::{BlockedAnswer, BlockingMode};
use crate::config::MessagesConfig;

//------------ QueryInfo -----------------------------------------------------

/// The question of a query in a form convenient for filtering.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueryInfo {
    /// The queried name, lower-cased and without the trailing dot.
    pub host: String,

    /// The queried record type.
    pub qtype: Rtype,

    /// The queried class.
    pub qclass: Class,
}

impl QueryInfo {
    /// Extracts the question from a query.
    ///
    /// The message must contain exactly one question.
    pub fn from_message(msg: &Message<Vec<u8>>) -> Result<Self, MessageError> {
        let question = sole_question(msg)?;
        let mut host = question.qname().to_string().to_ascii_lowercase();
        if host.ends_with('.') {
            host.pop();
        }
        Ok(QueryInfo {
            host,
            qtype: question.qtype(),
            qclass: question.qclass(),
        })
    }
}

/// Returns the only question of a message.
fn sole_question(
    msg: &Message<Vec<u8>>,
) -> Result<Question<ParsedName<&[u8]>>, MessageError> {
    if msg.header_counts().qdcount() != 1 {
        return Err(MessageError::BadQuestion);
    }
    msg.first_question().ok_or(MessageError::BadQuestion)
}

//------------ Messages ------------------------------------------------------

/// Builds synthesized responses.
#[derive(Clone, Debug)]
pub struct Messages {
    ttl: Ttl,
}

impl Messages {
    /// Creates a new response builder.
    pub fn new(config: &MessagesConfig) -> Self {
        Messages {
            ttl: Ttl::from_secs(config.response_ttl().as_secs() as u32),
        }
    }

    /// Returns the TTL used for synthesized records.
    pub fn ttl(&self) -> Ttl {
        self.ttl
    }

    /// Creates the response to a blocked query.
    pub fn blocked_response(
        &self,
        req: &Message<Vec<u8>>,
        mode: &BlockingMode,
    ) -> Result<Message<Vec<u8>>, MessageError> {
        let qtype = sole_question(req)?.qtype();
        self.answer_response(req, &mode.answer_for(qtype))
    }

    /// Creates a response from an answer shape.
    pub fn answer_response(
        &self,
        req: &Message<Vec<u8>>,
        answer: &BlockedAnswer,
    ) -> Result<Message<Vec<u8>>, MessageError> {
        match answer {
            BlockedAnswer::Addresses(addrs) => {
                self.address_response(req, addrs)
            }
            BlockedAnswer::NoData => self.rcode_response(req, Rcode::NOERROR),
            BlockedAnswer::Rcode(rcode) => self.rcode_response(req, *rcode),
        }
    }

    /// Creates an empty response with the given response code.
    pub fn rcode_response(
        &self,
        req: &Message<Vec<u8>>,
        rcode: Rcode,
    ) -> Result<Message<Vec<u8>>, MessageError> {
        Ok(Self::start_response(req, rcode)?.into_message())
    }

    /// Creates a NOERROR response answering with addresses.
    ///
    /// Only the addresses matching the query type are included. If there
    /// are none, the response has an empty answer section.
    pub fn address_response(
        &self,
        req: &Message<Vec<u8>>,
        addrs: &[IpAddr],
    ) -> Result<Message<Vec<u8>>, MessageError> {
        let question = sole_question(req)?;
        let qname = question.qname();
        let mut answer = Self::start_response(req, Rcode::NOERROR)?;
        let qtype = question.qtype();
        for addr in addrs {
            match addr {
                IpAddr::V4(addr) if qtype == Rtype::A => {
                    answer.push((qname, Class::IN, self.ttl, A::new(*addr)))?
                }
                IpAddr::V6(addr) if qtype == Rtype::AAAA => answer.push((
                    qname,
                    Class::IN,
                    self.ttl,
                    Aaaa::new(*addr),
                ))?,
                _ => {}
            }
        }
        Ok(answer.into_message())
    }

    /// Creates a copy of a query asking for a different name.
    ///
    /// The new query keeps the ID, the record type, the class, and the
    /// header flags of the original. It carries no EDNS data.
    pub fn rewrite_request(
        &self,
        req: &Message<Vec<u8>>,
        host: &str,
    ) -> Result<Message<Vec<u8>>, MessageError> {
        let question = sole_question(req)?;
        let name = Name::<Vec<u8>>::from_str(host)
            .map_err(|_| MessageError::BadName(host.into()))?;
        let mut builder = MessageBuilder::new_vec();
        {
            let header = builder.header_mut();
            header.set_id(req.header().id());
            header.set_opcode(req.header().opcode());
            header.set_rd(req.header().rd());
            header.set_cd(req.header().cd());
        }
        let mut builder = builder.question();
        builder.push((name, question.qtype(), question.qclass()))?;
        Ok(builder.into_message())
    }

    /// Starts a response with the RA flag set.
    fn start_response(
        req: &Message<Vec<u8>>,
        rcode: Rcode,
    ) -> Result<AnswerBuilder<Vec<u8>>, MessageError> {
        let mut answer = MessageBuilder::new_vec().start_answer(req, rcode)?;
        answer.header_mut().set_ra(true);
        Ok(answer)
    }
}

impl Default for Messages {
    fn default() -> Self {
        Messages::new(&MessagesConfig::default())
    }
}

//------------ MessageError --------------------------------------------------

/// A response could not be created.
#[derive(Clone, Debug)]
pub enum MessageError {
    /// The query did not contain exactly one valid question.
    BadQuestion,

    /// A replacement name was not a valid domain name.
    BadName(String),

    /// The message did not fit into the buffer.
    Push(PushError),
}

impl From<PushError> for MessageError {
    fn from(err: PushError) -> Self {
        MessageError::Push(err)
    }
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageError::BadQuestion => f.write_str("bad question section"),
            MessageError::BadName(name) => write!(f, "bad domain name {name:?}"),
            MessageError::Push(err) => write!(f, "building response: {err}"),
        }
    }
}

impl std::error::Error for MessageError {}

//============ Testing =======================================================
