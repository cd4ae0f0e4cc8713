//! Profiles, devices, and the store that holds them.
//!
//! A [`Profile`] is the policy bundle of a single subscriber. It owns any
//! number of [`Device`]s, each of which may be identified by the device
//! finder through one of several transport-level signals.
//!
//! Profiles are owned by a [`ProfileDb`]. The pipeline only holds on to the
//! shared references it receives from a lookup for the duration of a query.
//! [`MemoryProfileDb`] is a complete in-memory store suitable for tests and
//! for deployments that receive their profiles from elsewhere.

use core::fmt;

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::base::{DeviceId, HumanId, HumanIdLower, ProfileId};
use crate::dnsmsg::BlockingMode;

pub use self::memory::MemoryProfileDb;

pub mod memory;

//------------ Profile -------------------------------------------------------

/// The filtering policy of a single subscriber.
#[derive(Clone, Debug)]
pub struct Profile {
    /// The unique identifier of the profile.
    pub id: ProfileId,

    /// The identifiers of all devices belonging to the profile.
    pub device_ids: HashSet<DeviceId>,

    /// How blocked queries are answered.
    pub blocking_mode: BlockingMode,

    /// Whether rule-list filtering is applied to the profile's queries.
    pub filtering_enabled: bool,

    /// Whether safe search rewriting is applied to the profile's queries.
    pub safe_search_enabled: bool,

    /// Whether the profile has been deleted.
    ///
    /// Stores may keep deleted profiles around for a while. Queries for
    /// their devices are treated as if no device was found.
    pub deleted: bool,
}

impl Profile {
    /// Creates a new, empty profile with the given blocking mode.
    ///
    /// Filtering is enabled and safe search is disabled.
    pub fn new(id: ProfileId, blocking_mode: BlockingMode) -> Self {
        Profile {
            id,
            device_ids: HashSet::new(),
            blocking_mode,
            filtering_enabled: true,
            safe_search_enabled: false,
            deleted: false,
        }
    }
}

//------------ Device --------------------------------------------------------

/// A single client of a profile.
#[derive(Clone, Debug)]
pub struct Device {
    /// The unique identifier of the device.
    pub id: DeviceId,

    /// The lower-cased human identifier, if the device has one.
    pub human_id_lower: Option<HumanIdLower>,

    /// The client address this device is bound to for plain DNS.
    pub linked_ip: Option<IpAddr>,

    /// The server addresses dedicated to this device.
    pub dedicated_ips: Vec<IpAddr>,

    /// The authentication settings of the device.
    pub auth: Option<AuthSettings>,

    /// The kind of the device.
    pub device_type: DeviceType,
}

impl Device {
    /// Creates a new device with no identification or authentication data.
    pub fn new(id: DeviceId) -> Self {
        Device {
            id,
            human_id_lower: None,
            linked_ip: None,
            dedicated_ips: Vec::new(),
            auth: None,
            device_type: DeviceType::Other,
        }
    }
}

//------------ DeviceType ----------------------------------------------------

/// The kind of a device.
///
/// The type is purely informational. It is passed on to the store when a
/// device is created automatically.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum DeviceType {
    Android,
    GameConsole,
    Ios,
    Linux,
    Mac,
    Router,
    SmartTv,
    Windows,
    #[default]
    Other,
}

//------------ AuthSettings --------------------------------------------------

/// How a device authenticates its queries.
#[derive(Clone)]
pub struct AuthSettings {
    /// Whether authentication is enabled at all.
    pub enabled: bool,

    /// Whether authentication is required on every encrypted transport and
    /// not only on those that mandate it.
    pub encrypted_only: bool,

    /// Verifies the credentials presented by the client.
    ///
    /// If this is `None` no credential can ever match.
    pub password: Option<Arc<dyn Authenticator>>,
}

impl AuthSettings {
    /// Returns true if the settings require verifying credentials for a
    /// query received over `proto`.
    pub fn requires_auth(&self, proto: crate::base::Protocol) -> bool {
        self.enabled
            && (proto.mandates_auth()
                || (self.encrypted_only && proto.is_encrypted()))
    }

    /// Checks the presented credential.
    pub fn authenticate(&self, credential: Option<&[u8]>) -> bool {
        match (&self.password, credential) {
            (Some(password), Some(credential)) => {
                password.authenticate(credential)
            }
            _ => false,
        }
    }
}

impl fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSettings")
            .field("enabled", &self.enabled)
            .field("encrypted_only", &self.encrypted_only)
            .field("password", &self.password.as_ref().map(|_| "[hidden]"))
            .finish()
    }
}

//------------ Authenticator -------------------------------------------------

/// Verifies credentials presented by a client.
pub trait Authenticator: Send + Sync {
    /// Returns true if `credential` is valid.
    fn authenticate(&self, credential: &[u8]) -> bool;
}

impl<F> Authenticator for F
where
    F: Fn(&[u8]) -> bool + Send + Sync,
{
    fn authenticate(&self, credential: &[u8]) -> bool {
        (self)(credential)
    }
}

//------------ ProfileDb -----------------------------------------------------

/// The result of a successful profile lookup.
pub type ProfileLookup = (Arc<Profile>, Arc<Device>);

/// A store of profiles and devices.
///
/// All lookups return [`ProfileDbError::NotFound`] when there is no
/// matching device. Implementations must be safe for concurrent use.
#[async_trait]
pub trait ProfileDb: Send + Sync {
    /// Looks up a device by its identifier.
    async fn profile_by_device_id(
        &self,
        id: &DeviceId,
    ) -> Result<ProfileLookup, ProfileDbError>;

    /// Looks up a device by the profile and its lower-cased human
    /// identifier.
    async fn profile_by_human_id(
        &self,
        profile_id: &ProfileId,
        human_id: &HumanIdLower,
    ) -> Result<ProfileLookup, ProfileDbError>;

    /// Looks up the device linked to a client address.
    async fn profile_by_linked_ip(
        &self,
        addr: IpAddr,
    ) -> Result<ProfileLookup, ProfileDbError>;

    /// Looks up the device a server address is dedicated to.
    async fn profile_by_dedicated_ip(
        &self,
        addr: IpAddr,
    ) -> Result<ProfileLookup, ProfileDbError>;

    /// Creates a new device for a human identifier within a profile.
    async fn create_auto_device(
        &self,
        profile_id: &ProfileId,
        human_id: &HumanId,
        device_type: DeviceType,
    ) -> Result<ProfileLookup, ProfileDbError>;
}

//------------ ProfileDbError ------------------------------------------------

/// An error returned by a [`ProfileDb`].
#[derive(Debug)]
pub enum ProfileDbError {
    /// There is no matching profile or device.
    NotFound,

    /// The profile has reached its maximum number of devices.
    DeviceQuotaExceeded,

    /// Too many devices have been created recently.
    RateLimited,

    /// Any other failure of the store.
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl ProfileDbError {
    /// Returns true if this is the not found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProfileDbError::NotFound)
    }
}

impl fmt::Display for ProfileDbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileDbError::NotFound => f.write_str("device not found"),
            ProfileDbError::DeviceQuotaExceeded => {
                f.write_str("device quota exceeded")
            }
            ProfileDbError::RateLimited => {
                f.write_str("device creation rate limited")
            }
            ProfileDbError::Other(err) => write!(f, "profile store: {err}"),
        }
    }
}

impl std::error::Error for ProfileDbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProfileDbError::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

//============ Testing =======================================================
