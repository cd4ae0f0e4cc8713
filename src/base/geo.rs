//! Geographical data attached to queries.
//!
//! The lookup itself happens outside of this crate. Only the resulting
//! values travel through the pipeline and into billing records.

use core::fmt;
use core::str::FromStr;

//------------ Country -------------------------------------------------------

/// An ISO 3166-1 alpha-2 country code.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Country([u8; 2]);

impl Country {
    /// The code used when the country is unknown or not applicable.
    pub const NONE: Country = Country(*b"XX");

    /// Creates a country code from two ASCII letters.
    ///
    /// The letters are upper-cased.
    pub fn new(code: [u8; 2]) -> Result<Self, BadCountry> {
        if !code.iter().all(u8::is_ascii_alphabetic) {
            return Err(BadCountry);
        }
        Ok(Country(code.map(|c| c.to_ascii_uppercase())))
    }

    /// Returns the two-letter code.
    pub fn as_str(&self) -> &str {
        // Both bytes are ASCII letters, checked in `new`.
        core::str::from_utf8(&self.0).unwrap_or("XX")
    }
}

impl Default for Country {
    fn default() -> Self {
        Country::NONE
    }
}

impl FromStr for Country {
    type Err = BadCountry;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.as_bytes() {
            [a, b] => Country::new([*a, *b]),
            _ => Err(BadCountry),
        }
    }
}

impl fmt::Display for Country {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//------------ BadCountry ----------------------------------------------------

/// A string was not a two-letter country code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BadCountry;

impl fmt::Display for BadCountry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("bad country code")
    }
}

impl std::error::Error for BadCountry {}

//------------ Asn -----------------------------------------------------------

/// An autonomous system number.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Asn(pub u32);

impl Asn {
    /// The value used when the ASN is unknown.
    pub const NONE: Asn = Asn(0);
}

impl fmt::Display for Asn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AS{}", self.0)
    }
}

//============ Testing =======================================================
