//! Identifiers of profiles and devices.
//!
//! Device and profile identifiers are short opaque tokens assigned by the
//! backend. Human identifiers are chosen by users and are used to create
//! devices automatically when a query arrives for a name that has no device
//! yet.

use core::fmt;
use core::str::FromStr;

use std::sync::Arc;

//------------ Constants -----------------------------------------------------

/// The maximum length of a device or profile identifier in bytes.
pub const MAX_ID_LEN: usize = 8;

/// The maximum length of a human identifier in bytes.
///
/// This is the maximum length of a single DNS label, since human identifiers
/// travel inside TLS server names.
pub const MAX_HUMAN_ID_LEN: usize = 63;

//------------ id_type! ------------------------------------------------------

/// Defines an identifier newtype around a shared string.
macro_rules! id_type {
    (
        $(#[$attr:meta])*
        $name:ident, $kind:expr, $check:ident
    ) => {
        $(#[$attr])*
        #[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub struct $name(Arc<str>);

        impl $name {
            /// Creates a new identifier after checking its syntax.
            pub fn new(s: &str) -> Result<Self, IdError> {
                $check(s, $kind)?;
                Ok(Self(s.into()))
            }

            /// Creates a new identifier from raw bytes.
            ///
            /// The bytes must be valid ASCII in addition to the usual
            /// syntax rules.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdError> {
                let s = core::str::from_utf8(bytes)
                    .map_err(|_| IdError::new($kind, IdErrorReason::NotAscii))?;
                Self::new(s)
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_type! {
    /// The identifier of a single device.
    DeviceId, IdKind::Device, check_id
}

id_type! {
    /// The identifier of a profile.
    ProfileId, IdKind::Profile, check_id
}

id_type! {
    /// A human-readable identifier of a device as chosen by the user.
    ///
    /// The original casing is kept since it is shown back to the user when
    /// a device is created automatically.
    HumanId, IdKind::Human, check_human_id
}

impl HumanId {
    /// Returns the lower-cased form of this identifier.
    pub fn to_lower(&self) -> HumanIdLower {
        HumanIdLower(self.0.to_ascii_lowercase().into())
    }
}

//------------ HumanIdLower --------------------------------------------------

/// The lower-cased form of a [`HumanId`].
///
/// Devices are indexed by this form since DNS names are case-insensitive.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct HumanIdLower(Arc<str>);

impl HumanIdLower {
    /// Creates a new lower-cased human identifier.
    ///
    /// The input is checked like a [`HumanId`] and then lower-cased.
    pub fn new(s: &str) -> Result<Self, IdError> {
        HumanId::new(s).map(|id| id.to_lower())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for HumanIdLower {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HumanIdLower {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

//------------ Syntax checks -------------------------------------------------

/// Returns true if `c` may appear in any identifier.
fn is_id_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'-'
}

/// Checks the syntax of a device or profile identifier.
fn check_id(s: &str, kind: IdKind) -> Result<(), IdError> {
    check_chars(s, kind, MAX_ID_LEN)
}

/// Checks the syntax of a human identifier.
///
/// A human identifier is a valid DNS label: it must not start or end with a
/// hyphen.
fn check_human_id(s: &str, kind: IdKind) -> Result<(), IdError> {
    check_chars(s, kind, MAX_HUMAN_ID_LEN)?;
    if s.starts_with('-') || s.ends_with('-') {
        return Err(IdError::new(kind, IdErrorReason::BadHyphen));
    }
    Ok(())
}

/// Checks the length and the characters of an identifier.
fn check_chars(s: &str, kind: IdKind, max: usize) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::new(kind, IdErrorReason::Empty));
    }
    if s.len() > max {
        return Err(IdError::new(
            kind,
            IdErrorReason::TooLong { len: s.len(), max },
        ));
    }
    if let Some(pos) = s.bytes().position(|c| !is_id_char(c)) {
        let reason = if s.is_ascii() {
            IdErrorReason::BadChar { pos }
        } else {
            IdErrorReason::NotAscii
        };
        return Err(IdError::new(kind, reason));
    }
    Ok(())
}

//============ Error Types ===================================================

//------------ IdKind --------------------------------------------------------

/// The kind of identifier that failed to parse.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IdKind {
    /// A [`DeviceId`].
    Device,

    /// A [`ProfileId`].
    Profile,

    /// A [`HumanId`].
    Human,
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdKind::Device => f.write_str("device id"),
            IdKind::Profile => f.write_str("profile id"),
            IdKind::Human => f.write_str("human id"),
        }
    }
}

//------------ IdErrorReason -------------------------------------------------

/// Why an identifier was rejected.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IdErrorReason {
    /// The identifier is empty.
    Empty,

    /// The identifier is longer than allowed.
    TooLong { len: usize, max: usize },

    /// The identifier contains a forbidden ASCII character.
    BadChar { pos: usize },

    /// The identifier contains non-ASCII data.
    NotAscii,

    /// The identifier starts or ends with a hyphen.
    BadHyphen,
}

//------------ IdError -------------------------------------------------------

/// An identifier failed its syntax check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IdError {
    kind: IdKind,
    reason: IdErrorReason,
}

impl IdError {
    fn new(kind: IdKind, reason: IdErrorReason) -> Self {
        Self { kind, reason }
    }

    /// Returns the kind of identifier that was rejected.
    pub fn kind(&self) -> IdKind {
        self.kind
    }

    /// Returns why the identifier was rejected.
    pub fn reason(&self) -> IdErrorReason {
        self.reason
    }
}

impl fmt::Display for IdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bad {}: ", self.kind)?;
        match self.reason {
            IdErrorReason::Empty => f.write_str("empty value"),
            IdErrorReason::TooLong { len, max } => {
                write!(f, "too long: got {len} bytes, max {max}")
            }
            IdErrorReason::BadChar { pos } => {
                write!(f, "bad character at index {pos}")
            }
            IdErrorReason::NotAscii => f.write_str("not ascii"),
            IdErrorReason::BadHyphen => {
                f.write_str("must not start or end with a hyphen")
            }
        }
    }
}

impl std::error::Error for IdError {}

//============ Testing =======================================================
