//! DNS transport protocols.

use core::fmt;
use core::str::FromStr;

use serde::Deserialize;

//------------ Protocol ------------------------------------------------------

/// The transport protocol a query was received over.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain DNS over UDP or TCP.
    Dns,

    /// DNSCrypt.
    DnsCrypt,

    /// DNS-over-HTTPS.
    DoH,

    /// DNS-over-QUIC.
    DoQ,

    /// DNS-over-TLS.
    DoT,
}

impl Protocol {
    /// Returns true if the protocol encrypts the traffic.
    pub fn is_encrypted(self) -> bool {
        !matches!(self, Protocol::Dns)
    }

    /// Returns true if the protocol negotiates a TLS server name.
    pub fn has_server_name(self) -> bool {
        matches!(self, Protocol::DoH | Protocol::DoQ | Protocol::DoT)
    }

    /// Returns true if an authentication-enabled device must present its
    /// credentials over this protocol.
    ///
    /// Only DNS-over-HTTPS can carry credentials, in the userinfo of the
    /// HTTP basic authentication header.
    pub fn mandates_auth(self) -> bool {
        matches!(self, Protocol::DoH)
    }

    /// Returns the short lower-case name of the protocol.
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Dns => "dns",
            Protocol::DnsCrypt => "dnscrypt",
            Protocol::DoH => "doh",
            Protocol::DoQ => "doq",
            Protocol::DoT => "dot",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dns" => Ok(Protocol::Dns),
            "dnscrypt" => Ok(Protocol::DnsCrypt),
            "doh" => Ok(Protocol::DoH),
            "doq" => Ok(Protocol::DoQ),
            "dot" => Ok(Protocol::DoT),
            _ => Err(UnknownProtocol),
        }
    }
}

//------------ UnknownProtocol -----------------------------------------------

/// A protocol name was not recognized.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UnknownProtocol;

impl fmt::Display for UnknownProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unknown protocol")
    }
}

impl std::error::Error for UnknownProtocol {}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encryption_and_auth() {
        assert!(!Protocol::Dns.is_encrypted());
        assert!(Protocol::DnsCrypt.is_encrypted());
        assert!(Protocol::DoT.is_encrypted());
        assert!(Protocol::DoH.mandates_auth());
        assert!(!Protocol::DoT.mandates_auth());
        assert!(!Protocol::DnsCrypt.has_server_name());
    }

    #[test]
    fn parse_and_display() {
        assert_eq!("DoQ".parse::<Protocol>(), Ok(Protocol::DoQ));
        assert_eq!("tcp".parse::<Protocol>(), Err(UnknownProtocol));
        assert_eq!(Protocol::DnsCrypt.to_string(), "dnscrypt");
    }

    #[test]
    fn deserialize() {
        let p: Protocol = serde_json::from_str("\"doh\"").unwrap();
        assert_eq!(p, Protocol::DoH);
        let p: Protocol = serde_json::from_str("\"dnscrypt\"").unwrap();
        assert_eq!(p, Protocol::DnsCrypt);
    }
}
