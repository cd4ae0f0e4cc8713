//! Identifying the device that sent a query.
//!
//! A query carries no explicit information about its sender. Instead, the
//! [`DeviceFinder`] looks at a number of transport-level signals in a fixed
//! order and uses the first one that leads to a device:
//!
//! 1. For plain DNS on a server with bound addresses, the local address
//!    the query arrived at may be dedicated to a device.
//! 2. For plain DNS on a server with linked IPs enabled, the client's
//!    address may be linked to a device.
//! 3. For DoH, DoQ, and DoT, the TLS server name or the DoH path may
//!    contain an identifier below one of the server's device domains.
//!    The identifier is either a device ID or a profile ID and a human ID,
//!    in which case the device is created if it does not exist yet.
//! 4. For plain DNS, the query may contain a device ID in an EDNS option.
//!
//! Queries over DNSCrypt are never identified.
//!
//! Once a device is found, its authentication settings are checked.
//! Unknown devices and devices of deleted profiles result in
//! [`DeviceResult::Empty`] and the query is processed without a profile.

use core::fmt;

use std::sync::Arc;

use domain::base::Message;
use tracing::{debug, trace};

use crate::base::{DeviceId, Protocol};
use crate::metrics::{DeviceFinderMetrics, FindPath};
use crate::profile::{
    Device, DeviceType, Profile, ProfileDb, ProfileDbError, ProfileLookup,
};
use crate::server::{RequestInfo, ServerInfo};

pub use self::ident::{
    edns_device_id, DomainIdent, IdentError, EDNS_DEVICE_ID_OPTION,
};

pub mod ident;

//------------ DeviceFinder --------------------------------------------------

/// Finds the profile and device of a query.
pub struct DeviceFinder {
    db: Arc<dyn ProfileDb>,
    metrics: Arc<DeviceFinderMetrics>,
}

impl DeviceFinder {
    /// Creates a new finder using the given profile store.
    pub fn new(
        db: Arc<dyn ProfileDb>,
        metrics: Arc<DeviceFinderMetrics>,
    ) -> Self {
        DeviceFinder { db, metrics }
    }

    /// Returns the metrics of the finder.
    pub fn metrics(&self) -> &Arc<DeviceFinderMetrics> {
        &self.metrics
    }

    /// Finds the device that sent `req`.
    pub async fn find(
        &self,
        req: &Message<Vec<u8>>,
        srv: &ServerInfo,
        info: &RequestInfo,
    ) -> DeviceResult {
        let res = match self.lookup(req, srv, info).await {
            Ok(Some((lookup, path))) => self.check(lookup, path, srv, info),
            Ok(None) => DeviceResult::Empty,
            Err(err) => DeviceResult::Error(err),
        };
        match &res {
            DeviceResult::Found { .. } => {}
            DeviceResult::Empty => self.metrics.record_empty(),
            DeviceResult::Error(err) => {
                debug!(client = %info.client_addr, "finding device: {err}");
                self.metrics.record_error()
            }
        }
        res
    }

    /// Applies the deletion and authentication checks to a found device.
    fn check(
        &self,
        (profile, device): ProfileLookup,
        path: FindPath,
        srv: &ServerInfo,
        info: &RequestInfo,
    ) -> DeviceResult {
        if profile.deleted {
            trace!(profile = %profile.id, "profile is deleted");
            return DeviceResult::Empty;
        }
        if let Some(auth) = device.auth.as_ref() {
            if auth.requires_auth(srv.protocol)
                && !auth.authenticate(info.credential.as_deref())
            {
                return DeviceResult::Error(DeviceError::new(
                    DeviceErrorKind::AuthenticationFailed,
                    format!("device {}", device.id),
                ));
            }
        }
        self.metrics.record_found(path);
        trace!(
            profile = %profile.id,
            device = %device.id,
            ?path,
            "found device"
        );
        DeviceResult::Found { profile, device }
    }

    /// Runs through the identification signals in order.
    async fn lookup(
        &self,
        req: &Message<Vec<u8>>,
        srv: &ServerInfo,
        info: &RequestInfo,
    ) -> Result<Option<(ProfileLookup, FindPath)>, DeviceError> {
        match srv.protocol {
            Protocol::DnsCrypt => Ok(None),
            Protocol::Dns => self.lookup_plain(req, srv, info).await,
            Protocol::DoH | Protocol::DoQ | Protocol::DoT => {
                let ident = match Self::domain_ident(srv, info)? {
                    Some(ident) => ident,
                    None => return Ok(None),
                };
                let res = self.lookup_ident(ident).await?;
                Ok(res.map(|lookup| (lookup, FindPath::Domain)))
            }
        }
    }

    async fn lookup_plain(
        &self,
        req: &Message<Vec<u8>>,
        srv: &ServerInfo,
        info: &RequestInfo,
    ) -> Result<Option<(ProfileLookup, FindPath)>, DeviceError> {
        if srv.has_bind_addrs() {
            let addr = info.server_addr.ip();
            let res = self.db.profile_by_dedicated_ip(addr).await;
            if let Some(lookup) = not_found_to_none(res)? {
                return Ok(Some((lookup, FindPath::DedicatedIp)));
            }
        }

        if srv.linked_ip_enabled {
            let addr = info.client_addr.ip();
            let res = self.db.profile_by_linked_ip(addr).await;
            if let Some(lookup) = not_found_to_none(res)? {
                return Ok(Some((lookup, FindPath::LinkedIp)));
            }
        }

        let payload = match edns_device_id(req) {
            Some(payload) => payload,
            None => return Ok(None),
        };
        let id = match DeviceId::from_bytes(&payload) {
            Ok(id) => id,
            Err(err) => {
                trace!("ignoring EDNS device id: {err}");
                return Ok(None);
            }
        };
        let res = self.db.profile_by_device_id(&id).await;
        Ok(not_found_to_none(res)?.map(|lookup| (lookup, FindPath::Edns)))
    }

    /// Extracts an identifier from the DoH path or the TLS server name.
    ///
    /// The path takes precedence over the server name.
    fn domain_ident(
        srv: &ServerInfo,
        info: &RequestInfo,
    ) -> Result<Option<DomainIdent>, DeviceError> {
        if srv.protocol == Protocol::DoH {
            if let Some(path) = info.url_path.as_deref() {
                if let Some(ident) = DomainIdent::from_doh_path(path)? {
                    return Ok(Some(ident));
                }
            }
        }
        match info.tls_server_name.as_deref() {
            Some(name) => {
                Ok(DomainIdent::from_server_name(name, srv.device_domains())?)
            }
            None => Ok(None),
        }
    }

    async fn lookup_ident(
        &self,
        ident: DomainIdent,
    ) -> Result<Option<ProfileLookup>, DeviceError> {
        match ident {
            DomainIdent::Device(id) => {
                not_found_to_none(self.db.profile_by_device_id(&id).await)
            }
            DomainIdent::Human(profile_id, human_id) => {
                let res = self
                    .db
                    .profile_by_human_id(&profile_id, &human_id.to_lower())
                    .await;
                if let Some(lookup) = not_found_to_none(res)? {
                    return Ok(Some(lookup));
                }
                let res = self
                    .db
                    .create_auto_device(&profile_id, &human_id, DeviceType::Other)
                    .await;
                not_found_to_none(res)
            }
        }
    }
}

/// Converts the not found error into `None`.
fn not_found_to_none(
    res: Result<ProfileLookup, ProfileDbError>,
) -> Result<Option<ProfileLookup>, DeviceError> {
    match res {
        Ok(lookup) => Ok(Some(lookup)),
        Err(ProfileDbError::NotFound) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

//------------ DeviceResult --------------------------------------------------

/// The outcome of finding a device.
#[derive(Clone, Debug)]
pub enum DeviceResult {
    /// The device and its profile were found.
    Found {
        profile: Arc<Profile>,
        device: Arc<Device>,
    },

    /// The query does not belong to any known device.
    Empty,

    /// Identification failed and the query must not be processed.
    Error(DeviceError),
}

impl DeviceResult {
    /// Returns the profile and device if one was found.
    pub fn found(&self) -> Option<(&Arc<Profile>, &Arc<Device>)> {
        match self {
            DeviceResult::Found { profile, device } => Some((profile, device)),
            _ => None,
        }
    }
}

//------------ DeviceErrorKind -----------------------------------------------

/// The kind of a failure to identify a device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceErrorKind {
    /// The device requires authentication and the credentials didn't match.
    AuthenticationFailed,

    /// The identification data is malformed.
    BadRequest,

    /// A device couldn't be created because the profile is full.
    DeviceQuotaExceeded,

    /// A device couldn't be created because of rate limiting.
    RateLimited,

    /// The profile store failed.
    Internal,
}

impl fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceErrorKind::AuthenticationFailed => "authentication failed",
            DeviceErrorKind::BadRequest => "bad request",
            DeviceErrorKind::DeviceQuotaExceeded => "device quota exceeded",
            DeviceErrorKind::RateLimited => "rate limited",
            DeviceErrorKind::Internal => "internal error",
        })
    }
}

//------------ DeviceError ---------------------------------------------------

/// A failure to identify a device.
#[derive(Clone, Debug)]
pub struct DeviceError {
    kind: DeviceErrorKind,
    detail: String,
}

impl DeviceError {
    /// Creates a new error.
    pub fn new(kind: DeviceErrorKind, detail: impl Into<String>) -> Self {
        DeviceError {
            kind,
            detail: detail.into(),
        }
    }

    /// Returns the kind of the error.
    pub fn kind(&self) -> DeviceErrorKind {
        self.kind
    }

    /// Returns a description of the circumstances.
    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl From<IdentError> for DeviceError {
    fn from(err: IdentError) -> Self {
        DeviceError::new(DeviceErrorKind::BadRequest, err.to_string())
    }
}

impl From<ProfileDbError> for DeviceError {
    fn from(err: ProfileDbError) -> Self {
        let kind = match err {
            ProfileDbError::DeviceQuotaExceeded => {
                DeviceErrorKind::DeviceQuotaExceeded
            }
            ProfileDbError::RateLimited => DeviceErrorKind::RateLimited,
            ProfileDbError::NotFound | ProfileDbError::Other(_) => {
                DeviceErrorKind::Internal
            }
        };
        DeviceError::new(kind, err.to_string())
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            self.kind.fmt(f)
        } else {
            write!(f, "{}: {}", self.kind, self.detail)
        }
    }
}

impl std::error::Error for DeviceError {}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{HumanIdLower, ProfileId};
    use crate::dnsmsg::messages::tests::query;
    use crate::dnsmsg::BlockingMode;
    use crate::profile::{AuthSettings, MemoryProfileDb};
    use domain::base::iana::Rtype;
    use std::net::SocketAddr;

    const CLIENT: &str = "192.0.2.1:53000";
    const SERVER: &str = "198.51.100.1:53";

    fn pid() -> ProfileId {
        ProfileId::new("prof1").unwrap()
    }

    fn did(s: &str) -> DeviceId {
        DeviceId::new(s).unwrap()
    }

    /// Creates a store with one profile and three devices:
    ///
    /// * `dedic` with the dedicated IP 198.51.100.1,
    /// * `linked` linked to 192.0.2.1,
    /// * `dev-42` requiring authentication with password `secret`.
    fn db() -> Arc<MemoryProfileDb> {
        let db = MemoryProfileDb::new(10);
        db.add_profile(Profile::new(pid(), BlockingMode::NullIp));

        let mut dev = Device::new(did("dedic"));
        dev.dedicated_ips = vec!["198.51.100.1".parse().unwrap()];
        db.add_device(&pid(), dev).unwrap();

        let mut dev = Device::new(did("linked"));
        dev.linked_ip = Some("192.0.2.1".parse().unwrap());
        db.add_device(&pid(), dev).unwrap();

        let mut dev = Device::new(did("dev-42"));
        dev.auth = Some(AuthSettings {
            enabled: true,
            encrypted_only: false,
            password: Some(Arc::new(|cred: &[u8]| cred == b"secret")),
        });
        db.add_device(&pid(), dev).unwrap();
        Arc::new(db)
    }

    fn finder(db: Arc<MemoryProfileDb>) -> DeviceFinder {
        DeviceFinder::new(db, Default::default())
    }

    fn info() -> RequestInfo {
        RequestInfo::new(
            CLIENT.parse::<SocketAddr>().unwrap(),
            SERVER.parse::<SocketAddr>().unwrap(),
        )
    }

    fn server(proto: Protocol) -> ServerInfo {
        let mut srv = ServerInfo::new(proto);
        srv.set_device_domains(["d.example.com"]);
        srv
    }

    /// Builds an A query for example.com with an OPT record carrying a
    /// padding option followed by the device ID option.
    fn edns_query(payload: &[u8]) -> Message<Vec<u8>> {
        let mut wire = vec![
            0x12, 0x34, 0x01, 0x00, // id, rd
            0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, // counts
            7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'c', b'o', b'm',
            0, 0x00, 0x01, 0x00, 0x01, // question
            0, 0x00, 0x29, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, // OPT
        ];
        let rdlen = (payload.len() + 4 + 6) as u16;
        wire.extend_from_slice(&rdlen.to_be_bytes());
        wire.extend_from_slice(&[0x00, 0x0c, 0x00, 0x02, 0x00, 0x00]);
        wire.extend_from_slice(&EDNS_DEVICE_ID_OPTION.to_be_bytes());
        wire.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        wire.extend_from_slice(payload);
        Message::from_octets(wire).unwrap()
    }

    fn found_id(res: &DeviceResult) -> Option<&str> {
        res.found().map(|(_, device)| device.id.as_str())
    }

    #[tokio::test]
    async fn dedicated_ip_beats_linked_ip() {
        let finder = finder(db());
        let mut srv = server(Protocol::Dns);
        srv.bind_addrs = vec!["198.51.100.1".parse().unwrap()];
        srv.linked_ip_enabled = true;
        let req = query("example.com.", Rtype::A);

        let res = finder.find(&req, &srv, &info()).await;
        assert_eq!(found_id(&res), Some("dedic"));
        assert_eq!(finder.metrics().found_by(FindPath::DedicatedIp), 1);

        srv.bind_addrs.clear();
        let res = finder.find(&req, &srv, &info()).await;
        assert_eq!(found_id(&res), Some("linked"));
    }

    #[tokio::test]
    async fn linked_ip_only_for_plain_dns() {
        let finder = finder(db());
        let mut srv = server(Protocol::DoT);
        srv.linked_ip_enabled = true;
        let res = finder
            .find(&query("example.com.", Rtype::A), &srv, &info())
            .await;
        assert!(matches!(res, DeviceResult::Empty));
    }

    #[tokio::test]
    async fn edns_option() {
        let finder = finder(db());
        let srv = server(Protocol::Dns);

        let res = finder.find(&edns_query(b"linked"), &srv, &info()).await;
        assert_eq!(found_id(&res), Some("linked"));

        // Plain DNS does not require authentication.
        let res = finder.find(&edns_query(b"dev-42"), &srv, &info()).await;
        assert_eq!(found_id(&res), Some("dev-42"));

        let res = finder
            .find(&edns_query("dév".as_bytes()), &srv, &info())
            .await;
        assert!(matches!(res, DeviceResult::Empty));

        let res = finder.find(&edns_query(b"unknown"), &srv, &info()).await;
        assert!(matches!(res, DeviceResult::Empty));

        // The option is ignored on encrypted transports.
        let res = finder
            .find(&edns_query(b"linked"), &server(Protocol::DoT), &info())
            .await;
        assert!(matches!(res, DeviceResult::Empty));
    }

    #[tokio::test]
    async fn authentication() {
        let finder = finder(db());
        let req = query("example.com.", Rtype::A);
        let mut info = info();
        info.url_path = Some("/dns-query/dev-42".into());
        info.credential = Some(b"wrong".to_vec());

        let res = finder.find(&req, &server(Protocol::DoH), &info).await;
        match res {
            DeviceResult::Error(err) => {
                assert_eq!(err.kind(), DeviceErrorKind::AuthenticationFailed)
            }
            other => panic!("unexpected {other:?}"),
        }

        // DoT does not mandate authentication for this device.
        info.tls_server_name = Some("dev-42.d.example.com".into());
        let res = finder.find(&req, &server(Protocol::DoT), &info).await;
        assert_eq!(found_id(&res), Some("dev-42"));

        info.credential = Some(b"secret".to_vec());
        let res = finder.find(&req, &server(Protocol::DoH), &info).await;
        assert_eq!(found_id(&res), Some("dev-42"));
    }

    #[tokio::test]
    async fn doh_path_beats_server_name() {
        let finder = finder(db());
        let mut info = info();
        info.url_path = Some("/dns-query/linked".into());
        info.tls_server_name = Some("dedic.d.example.com".into());
        let res = finder
            .find(
                &query("example.com.", Rtype::A),
                &server(Protocol::DoH),
                &info,
            )
            .await;
        assert_eq!(found_id(&res), Some("linked"));
    }

    #[tokio::test]
    async fn auto_device() {
        let db = db();
        let finder = finder(db.clone());
        let mut info = info();
        info.tls_server_name = Some("prof1.My-Phone.d.example.com".into());
        let req = query("example.com.", Rtype::A);

        let res = finder.find(&req, &server(Protocol::DoQ), &info).await;
        let (_, device) = res.found().unwrap();
        assert_eq!(
            device.human_id_lower,
            Some(HumanIdLower::new("my-phone").unwrap())
        );
        assert_eq!(db.device_count(), 4);

        // The second query finds the same device.
        let again = finder.find(&req, &server(Protocol::DoQ), &info).await;
        assert_eq!(found_id(&again), Some(device.id.as_str()));
        assert_eq!(db.device_count(), 4);

        // Unknown profiles result in no device.
        info.tls_server_name = Some("other.phone.d.example.com".into());
        let res = finder.find(&req, &server(Protocol::DoQ), &info).await;
        assert!(matches!(res, DeviceResult::Empty));
    }

    #[tokio::test]
    async fn quota_and_bad_requests() {
        let db = Arc::new(MemoryProfileDb::new(0));
        db.add_profile(Profile::new(pid(), BlockingMode::NullIp));
        let finder = finder(db);
        let req = query("example.com.", Rtype::A);
        let mut info = info();

        info.tls_server_name = Some("prof1.phone.d.example.com".into());
        let res = finder.find(&req, &server(Protocol::DoT), &info).await;
        assert!(matches!(
            res,
            DeviceResult::Error(ref err)
                if err.kind() == DeviceErrorKind::DeviceQuotaExceeded
        ));

        info.tls_server_name = Some("a.b.c.d.example.com".into());
        let res = finder.find(&req, &server(Protocol::DoT), &info).await;
        assert!(matches!(
            res,
            DeviceResult::Error(ref err)
                if err.kind() == DeviceErrorKind::BadRequest
        ));
        assert_eq!(finder.metrics().errors(), 2);
    }

    #[tokio::test]
    async fn deleted_profile_and_dnscrypt() {
        let db = db();
        let finder = finder(db.clone());
        let mut srv = server(Protocol::Dns);
        srv.linked_ip_enabled = true;
        let req = query("example.com.", Rtype::A);

        db.delete_profile(&pid());
        let res = finder.find(&req, &srv, &info()).await;
        assert!(matches!(res, DeviceResult::Empty));

        let res = finder
            .find(&edns_query(b"linked"), &server(Protocol::DnsCrypt), &info())
            .await;
        assert!(matches!(res, DeviceResult::Empty));
    }
}
