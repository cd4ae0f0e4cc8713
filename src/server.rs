//! Descriptions of the server a query arrived at and of the query's transport.
//!
//! Transport handling itself happens elsewhere. The types in this module
//! carry just the bits of transport state the filtering pipeline needs.

use std::net::{IpAddr, SocketAddr};

use crate::base::{Asn, Country, Protocol};

//------------ ServerInfo ----------------------------------------------------

/// Describes a server listening for queries.
#[derive(Clone, Debug)]
pub struct ServerInfo {
    /// The transport protocol the server speaks.
    pub protocol: Protocol,

    /// The local addresses the server is bound to.
    ///
    /// If this is not empty, queries may be identified through the local
    /// address they arrived at, i.e., the device's dedicated IP.
    pub bind_addrs: Vec<IpAddr>,

    /// Whether plain DNS queries are identified through their source
    /// address.
    pub linked_ip_enabled: bool,

    /// The domain suffixes under which device identifiers are accepted.
    ///
    /// These are stored lower-cased and without a trailing dot.
    device_domains: Vec<String>,
}

impl ServerInfo {
    /// Creates a description of a server without any identification
    /// signals enabled.
    pub fn new(protocol: Protocol) -> Self {
        ServerInfo {
            protocol,
            bind_addrs: Vec::new(),
            linked_ip_enabled: false,
            device_domains: Vec::new(),
        }
    }

    /// Sets the device-identification domains.
    pub fn set_device_domains<I, S>(&mut self, domains: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.device_domains = domains
            .into_iter()
            .map(|d| d.as_ref().trim_end_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
    }

    /// Returns the device-identification domains.
    pub fn device_domains(&self) -> &[String] {
        &self.device_domains
    }

    /// Returns true if the server has dedicated local addresses.
    pub fn has_bind_addrs(&self) -> bool {
        !self.bind_addrs.is_empty()
    }
}

//------------ RequestInfo ---------------------------------------------------

/// Transport metadata of a single query.
#[derive(Clone, Debug)]
pub struct RequestInfo {
    /// The address the query came from.
    pub client_addr: SocketAddr,

    /// The local address the query arrived at.
    pub server_addr: SocketAddr,

    /// The TLS server name presented by the client, if any.
    pub tls_server_name: Option<String>,

    /// The path of the HTTP request for DNS-over-HTTPS.
    pub url_path: Option<String>,

    /// The credential presented by the client.
    ///
    /// This is the password from HTTP basic authentication for
    /// DNS-over-HTTPS.
    pub credential: Option<Vec<u8>>,

    /// The country the client address is located in.
    pub country: Country,

    /// The autonomous system the client address belongs to.
    pub asn: Asn,
}

impl RequestInfo {
    /// Creates the metadata for a query between two addresses.
    pub fn new(client_addr: SocketAddr, server_addr: SocketAddr) -> Self {
        RequestInfo {
            client_addr,
            server_addr,
            tls_server_name: None,
            url_path: None,
            credential: None,
            country: Country::NONE,
            asn: Asn::NONE,
        }
    }
}

//============ Testing =======================================================
