//! Extraction of device identifiers from transport data.

use core::fmt;

use domain::base::opt::UnknownOptData;
use domain::base::Message;

use crate::base::{DeviceId, HumanId, IdError, ProfileId};

//------------ Constants -----------------------------------------------------

/// The EDNS option code carrying a device identifier.
///
/// This is the code dnsmasq uses for its CPE-ID option.
pub const EDNS_DEVICE_ID_OPTION: u16 = 65074;

/// The path prefix of DNS-over-HTTPS requests carrying an identifier.
const DOH_PATH_PREFIX: &str = "/dns-query";

//------------ DomainIdent ---------------------------------------------------

/// An identifier embedded in a TLS server name or an HTTP path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DomainIdent {
    /// A device identifier.
    Device(DeviceId),

    /// A profile identifier together with a human identifier.
    Human(ProfileId, HumanId),
}

impl DomainIdent {
    /// Parses an identifier from its text form.
    ///
    /// The text is either a single device identifier or a profile
    /// identifier and a human identifier separated by a dot.
    pub fn parse(s: &str) -> Result<Self, IdentError> {
        let mut labels = s.split('.');
        match (labels.next(), labels.next(), labels.next()) {
            (Some(device), None, None) => {
                Ok(DomainIdent::Device(DeviceId::new(device)?))
            }
            (Some(profile), Some(human), None) => Ok(DomainIdent::Human(
                ProfileId::new(profile)?,
                HumanId::new(human)?,
            )),
            _ => Err(IdentError::TooManyLabels(s.into())),
        }
    }

    /// Extracts the identifier from a TLS server name.
    ///
    /// Returns `Ok(None)` if the name is not below one of the device
    /// domains or is one of the device domains itself. The device domains
    /// must be lower case.
    pub fn from_server_name(
        server_name: &str,
        device_domains: &[String],
    ) -> Result<Option<Self>, IdentError> {
        let server_name = server_name.trim_end_matches('.');
        let lower = server_name.to_ascii_lowercase();
        for domain in device_domains {
            let Some(prefix) = lower.strip_suffix(domain.as_str()) else {
                continue;
            };
            let Some(prefix) = prefix.strip_suffix('.') else {
                continue;
            };
            if prefix.is_empty() {
                return Err(IdentError::TooManyLabels(server_name.into()));
            }

            // Keep the original case for the human identifier.
            return Self::parse(&server_name[..prefix.len()]).map(Some);
        }
        Ok(None)
    }

    /// Extracts the identifier from the path of a DNS-over-HTTPS request.
    ///
    /// Returns `Ok(None)` if the path carries no identifier.
    pub fn from_doh_path(path: &str) -> Result<Option<Self>, IdentError> {
        let Some(rest) = path.strip_prefix(DOH_PATH_PREFIX) else {
            return Ok(None);
        };
        let rest = match rest.strip_prefix('/') {
            Some(rest) => rest.strip_suffix('/').unwrap_or(rest),
            None if rest.is_empty() => return Ok(None),
            None => return Err(IdentError::BadPath(path.into())),
        };
        if rest.is_empty() {
            return Ok(None);
        }
        if rest.contains('/') {
            return Err(IdentError::BadPath(path.into()));
        }
        Self::parse(rest).map(Some)
    }
}

//------------ EDNS ----------------------------------------------------------

/// Returns the payload of the device identifier EDNS option.
///
/// Returns `None` if the message has no OPT record or the record doesn't
/// contain the option. Options that fail to parse are skipped.
pub fn edns_device_id(msg: &Message<Vec<u8>>) -> Option<Vec<u8>> {
    let opt = msg.opt()?;
    let res = opt
        .opt()
        .iter::<UnknownOptData<&[u8]>>()
        .filter_map(Result::ok)
        .find(|option| option.code().to_int() == EDNS_DEVICE_ID_OPTION)
        .map(|option| option.data().to_vec());
    res
}

//------------ IdentError ----------------------------------------------------

/// An identifier in a server name or a path is malformed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum IdentError {
    /// An identifier did not parse.
    Id(IdError),

    /// The identifier part has the wrong number of labels.
    TooManyLabels(String),

    /// The DNS-over-HTTPS path has the wrong shape.
    BadPath(String),
}

impl From<IdError> for IdentError {
    fn from(err: IdError) -> Self {
        IdentError::Id(err)
    }
}

impl fmt::Display for IdentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentError::Id(err) => err.fmt(f),
            IdentError::TooManyLabels(s) => {
                write!(f, "bad identifier {s:?}: wrong number of labels")
            }
            IdentError::BadPath(s) => write!(f, "bad path {s:?}"),
        }
    }
}

impl std::error::Error for IdentError {}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn domains() -> Vec<String> {
        vec!["d.example.com".into(), "dns.example.net".into()]
    }

    #[rstest]
    #[case("dev1.d.example.com", Some(DomainIdent::Device(DeviceId::new("dev1").unwrap())))]
    #[case("DEV1.D.Example.Com.", Some(DomainIdent::Device(DeviceId::new("DEV1").unwrap())))]
    #[case(
        "prof1.My-Phone.dns.example.net",
        Some(DomainIdent::Human(
            ProfileId::new("prof1").unwrap(),
            HumanId::new("My-Phone").unwrap()
        ))
    )]
    #[case("dev1.other.example", None)]
    #[case("xd.example.com", None)]
    fn server_names(#[case] name: &str, #[case] expected: Option<DomainIdent>) {
        assert_eq!(
            DomainIdent::from_server_name(name, &domains()).unwrap(),
            expected
        );
    }

    #[rstest]
    #[case("a.b.c.d.example.com")]
    #[case("dev-toolong.d.example.com")]
    #[case(".d.example.com")]
    fn bad_server_names(#[case] name: &str) {
        assert!(DomainIdent::from_server_name(name, &domains()).is_err());
    }

    #[rstest]
    #[case("/dns-query", None)]
    #[case("/dns-query/", None)]
    #[case("/other/dev1", None)]
    #[case("/dns-query/dev1", Some(DomainIdent::Device(DeviceId::new("dev1").unwrap())))]
    #[case("/dns-query/dev1/", Some(DomainIdent::Device(DeviceId::new("dev1").unwrap())))]
    fn doh_paths(#[case] path: &str, #[case] expected: Option<DomainIdent>) {
        assert_eq!(DomainIdent::from_doh_path(path).unwrap(), expected);
    }

    #[rstest]
    #[case("/dns-query/dev1/extra")]
    #[case("/dns-queryx")]
    #[case("/dns-query/bad!id")]
    fn bad_doh_paths(#[case] path: &str) {
        assert!(DomainIdent::from_doh_path(path).is_err());
    }
}
