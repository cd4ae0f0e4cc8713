//! The per-query pipeline.
//!
//! A [`FilterService`] takes a query together with the description of the
//! server and the transport metadata, identifies the device, runs the
//! filters, and decides whether to answer the query directly or to
//! forward it, possibly rewritten, to the upstream resolver. Queries of
//! identified devices are recorded for billing.
//!
//! Responses received from upstream can be checked, too. Their CNAME
//! targets and addresses are matched against the rule lists and the
//! response is replaced if one of them is blocked.

use core::fmt;

use std::net::IpAddr;
use std::sync::Arc;

use domain::base::iana::{Rcode, Rtype};
use domain::base::Message;
use domain::rdata::AllRecordData;
use time::OffsetDateTime;
use tracing::{debug, trace};

use crate::billstat::Recorder;
use crate::devicefinder::{DeviceErrorKind, DeviceFinder, DeviceResult};
use crate::dnsmsg::{BlockingMode, MessageError, Messages, QueryInfo};
use crate::filter::{
    DnsMatch, FilterRequest, FilterResult, RuleListFilter, SafeSearch,
};
use crate::profile::{Device, Profile};
use crate::server::{RequestInfo, ServerInfo};

//------------ FilterService -------------------------------------------------

/// Processes queries from identification to the blocking decision.
pub struct FilterService {
    finder: DeviceFinder,
    rule_lists: Vec<Arc<RuleListFilter>>,
    safe_search: Option<Arc<SafeSearch>>,
    messages: Messages,
    recorder: Arc<dyn Recorder>,
}

impl FilterService {
    /// Creates a service without any filters.
    pub fn new(
        finder: DeviceFinder,
        messages: Messages,
        recorder: Arc<dyn Recorder>,
    ) -> Self {
        FilterService {
            finder,
            rule_lists: Vec::new(),
            safe_search: None,
            messages,
            recorder,
        }
    }

    /// Adds a rule list.
    ///
    /// If several lists match a query, the match with the highest
    /// priority wins. Among equal priorities, the list added first wins.
    pub fn add_rule_list(&mut self, list: Arc<RuleListFilter>) {
        self.rule_lists.push(list)
    }

    /// Sets the safe search filter used for profiles that enable it.
    pub fn set_safe_search(&mut self, filter: Arc<SafeSearch>) {
        self.safe_search = Some(filter)
    }

    /// Processes a query.
    pub async fn handle_request(
        &self,
        req: &Message<Vec<u8>>,
        srv: &ServerInfo,
        info: &RequestInfo,
    ) -> Result<Handled, ServiceError> {
        let query = match QueryInfo::from_message(req) {
            Ok(query) => query,
            Err(err) => {
                debug!(client = %info.client_addr, "bad query: {err}");
                return Ok(Handled::respond(
                    self.messages.rcode_response(req, Rcode::FORMERR)?,
                ));
            }
        };

        let device = self.finder.find(req, srv, info).await;
        let (profile, device) = match device {
            DeviceResult::Found { profile, device } => {
                self.recorder.record(
                    device.id.clone(),
                    info.country,
                    info.asn,
                    OffsetDateTime::now_utc(),
                    srv.protocol,
                );
                (Some(profile), Some(device))
            }
            DeviceResult::Empty => (None, None),
            DeviceResult::Error(err) => {
                let rcode = match err.kind() {
                    DeviceErrorKind::Internal => Rcode::SERVFAIL,
                    _ => Rcode::REFUSED,
                };
                return Ok(Handled::respond(
                    self.messages.rcode_response(req, rcode)?,
                ));
            }
        };

        let ctx = RequestContext {
            query,
            client_ip: info.client_addr.ip(),
            profile,
            device,
        };
        let result = self.filter_request(req, &ctx)?;
        let action = match &result {
            Some(FilterResult::Blocked { list, rule }) => {
                trace!(host = %ctx.query.host, %list, %rule, "blocked");
                Action::Respond(
                    self.messages.blocked_response(req, ctx.blocking_mode())?,
                )
            }
            Some(FilterResult::ModifiedResponse { response, .. }) => {
                Action::Respond(response.clone())
            }
            Some(FilterResult::ModifiedRequest { request, .. }) => {
                Action::Forward(request.clone())
            }
            Some(FilterResult::Allowed { .. }) | None => {
                Action::Forward(req.clone())
            }
        };
        Ok(Handled {
            action,
            context: Some(ctx),
            result,
        })
    }

    /// Runs the rule lists and safe search for a query.
    fn filter_request(
        &self,
        req: &Message<Vec<u8>>,
        ctx: &RequestContext,
    ) -> Result<Option<FilterResult>, ServiceError> {
        let freq = FilterRequest {
            message: req,
            host: &ctx.query.host,
            qtype: ctx.query.qtype,
            client_ip: ctx.client_ip,
            client_name: ctx.client_name(),
        };

        if ctx.filtering_enabled() {
            if let Some((list, found)) = self.match_lists(&freq, false) {
                return Ok(Some(FilterResult::from_match(
                    list,
                    found,
                    &freq,
                    &self.messages,
                )?));
            }
        }

        match &self.safe_search {
            Some(safe_search) if ctx.safe_search_enabled() => {
                Ok(safe_search.check(&freq, &self.messages)?)
            }
            _ => Ok(None),
        }
    }

    /// Returns the best match of all rule lists.
    fn match_lists(
        &self,
        req: &FilterRequest,
        answer_phase: bool,
    ) -> Option<(&Arc<str>, DnsMatch)> {
        let mut best: Option<(&Arc<str>, DnsMatch)> = None;
        for list in &self.rule_lists {
            let found = match list.dns_result(
                req.client_ip,
                req.client_name,
                req.host,
                req.qtype,
                answer_phase,
            ) {
                Some(found) => found,
                None => continue,
            };
            if best
                .as_ref()
                .map_or(true, |(_, best)| found.priority() > best.priority())
            {
                best = Some((list.id(), found));
            }
        }
        best
    }

    /// Checks a response received from upstream.
    ///
    /// Every CNAME target and every address in the answer is matched
    /// against the rule lists. If one of them is blocked, a blocked
    /// response to `req` is returned. Rewrite rules do not apply here.
    pub fn filter_response(
        &self,
        req: &Message<Vec<u8>>,
        resp: &Message<Vec<u8>>,
        ctx: &RequestContext,
    ) -> Result<Option<Message<Vec<u8>>>, ServiceError> {
        if !ctx.filtering_enabled() || self.rule_lists.is_empty() {
            return Ok(None);
        }
        for (host, rtype) in answer_hosts(resp) {
            let freq = FilterRequest {
                message: req,
                host: &host,
                qtype: rtype,
                client_ip: ctx.client_ip,
                client_name: ctx.client_name(),
            };
            if let Some((list, DnsMatch::Block(rule))) =
                self.match_lists(&freq, true)
            {
                trace!(%host, %list, rule = %rule.text(), "response blocked");
                return Ok(Some(
                    self.messages.blocked_response(req, ctx.blocking_mode())?,
                ));
            }
        }
        Ok(None)
    }
}

impl fmt::Debug for FilterService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterService")
            .field("rule_lists", &self.rule_lists)
            .field("safe_search", &self.safe_search)
            .finish()
    }
}

/// Returns the hosts and addresses in the answer of a response.
///
/// Records that fail to parse are skipped.
fn answer_hosts(resp: &Message<Vec<u8>>) -> Vec<(String, Rtype)> {
    let answer = match resp.answer() {
        Ok(answer) => answer,
        Err(_) => return Vec::new(),
    };
    answer
        .limit_to::<AllRecordData<_, _>>()
        .filter_map(Result::ok)
        .filter_map(|rr| match rr.data() {
            AllRecordData::Cname(cname) => {
                let host = cname.cname().to_string().to_ascii_lowercase();
                let host = host.trim_end_matches('.').to_string();
                Some((host, Rtype::CNAME))
            }
            AllRecordData::A(a) => Some((a.addr().to_string(), Rtype::A)),
            AllRecordData::Aaaa(aaaa) => {
                Some((aaaa.addr().to_string(), Rtype::AAAA))
            }
            _ => None,
        })
        .collect()
}

//------------ RequestContext ------------------------------------------------

/// What the pipeline learned about a query.
#[derive(Clone, Debug)]
pub struct RequestContext {
    /// The question of the query.
    pub query: QueryInfo,

    /// The address of the client.
    pub client_ip: IpAddr,

    /// The profile of the device, if one was found.
    pub profile: Option<Arc<Profile>>,

    /// The device that sent the query, if it was found.
    pub device: Option<Arc<Device>>,
}

impl RequestContext {
    /// Returns the name rules with a `$client` modifier see.
    ///
    /// This is the human ID of the device if it has one, its device ID
    /// otherwise, or an empty string without a device.
    pub fn client_name(&self) -> &str {
        match &self.device {
            Some(device) => match &device.human_id_lower {
                Some(human) => human.as_str(),
                None => device.id.as_str(),
            },
            None => "",
        }
    }

    /// Returns how blocked queries are answered.
    pub fn blocking_mode(&self) -> &BlockingMode {
        static NULL_IP: BlockingMode = BlockingMode::NullIp;
        match &self.profile {
            Some(profile) => &profile.blocking_mode,
            None => &NULL_IP,
        }
    }

    fn filtering_enabled(&self) -> bool {
        self.profile.as_ref().map_or(true, |p| p.filtering_enabled)
    }

    fn safe_search_enabled(&self) -> bool {
        self.profile.as_ref().is_some_and(|p| p.safe_search_enabled)
    }
}

//------------ Handled -------------------------------------------------------

/// The outcome of processing a query.
#[derive(Clone, Debug)]
pub struct Handled {
    /// What to do with the query.
    pub action: Action,

    /// What was learned about the query.
    ///
    /// This is `None` if the query was rejected before filtering. Pass it
    /// to [`FilterService::filter_response`] when the query is forwarded.
    pub context: Option<RequestContext>,

    /// The result of the filters, if any of them matched.
    pub result: Option<FilterResult>,
}

impl Handled {
    fn respond(msg: Message<Vec<u8>>) -> Self {
        Handled {
            action: Action::Respond(msg),
            context: None,
            result: None,
        }
    }
}

//------------ Action --------------------------------------------------------

/// What to do with a query.
#[derive(Clone)]
pub enum Action {
    /// Send this response to the client.
    Respond(Message<Vec<u8>>),

    /// Resolve this query upstream.
    ///
    /// This is either the original query or a rewritten one.
    Forward(Message<Vec<u8>>),
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, msg) = match self {
            Action::Respond(msg) => ("Respond", msg),
            Action::Forward(msg) => ("Forward", msg),
        };
        f.debug_struct(name)
            .field("id", &msg.header().id())
            .field("rcode", &msg.header().rcode())
            .finish()
    }
}

//------------ ServiceError --------------------------------------------------

/// A query could not be processed.
#[derive(Clone, Debug)]
pub enum ServiceError {
    /// A response could not be built.
    Message(MessageError),
}

impl From<MessageError> for ServiceError {
    fn from(err: MessageError) -> Self {
        ServiceError::Message(err)
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Message(err) => {
                write!(f, "building message: {err}")
            }
        }
    }
}

impl std::error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServiceError::Message(err) => Some(err),
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{DeviceId, ProfileId, Protocol};
    use crate::billstat::{Records, RuntimeRecorder, UploadError, Uploader};
    use crate::config::{BillStatConfig, FilterConfig};
    use crate::dnsmsg::messages::tests::{answer_addrs, query};
    use crate::filter::TextSource;
    use crate::metrics::{BillStatMetrics, DeviceFinderMetrics, FilterMetrics};
    use crate::profile::{AuthSettings, MemoryProfileDb};
    use async_trait::async_trait;
    use domain::base::{MessageBuilder, Name, Ttl};
    use std::str::FromStr;

    struct NoUpload;

    #[async_trait]
    impl Uploader for NoUpload {
        async fn upload(&self, _: &Records) -> Result<(), UploadError> {
            Err(UploadError::new("not here"))
        }
    }

    const RULES: &str = "\
        ||ads.example^\n\
        @@||good.ads.example^\n\
        ||tracker.example^\n\
        ||rewritten.example^$dnsrewrite=192.0.2.99\n\
        ||192.0.2.66^\n";

    struct Setup {
        service: FilterService,
        db: Arc<MemoryProfileDb>,
        recorder: Arc<RuntimeRecorder>,
    }

    async fn setup() -> Setup {
        let db = Arc::new(MemoryProfileDb::new(10));
        let mut profile = Profile::new(
            ProfileId::new("prof1").unwrap(),
            BlockingMode::NxDomain,
        );
        profile.safe_search_enabled = true;
        db.add_profile(profile);
        let mut device = Device::new(DeviceId::new("dev1").unwrap());
        device.linked_ip = Some("198.51.100.1".parse().unwrap());
        db.add_device(&ProfileId::new("prof1").unwrap(), device).unwrap();

        let list = Arc::new(RuleListFilter::new(
            "general",
            Arc::new(TextSource::new(RULES)),
            &FilterConfig::default(),
            Arc::new(FilterMetrics::new()),
        ));
        list.refresh(false).await.unwrap();
        let safe_search = Arc::new(SafeSearch::new(
            "safe_search",
            Arc::new(TextSource::new(
                "|search.example^$dnsrewrite=NOERROR;A;192.0.2.50\n",
            )),
            &FilterConfig::default(),
            Arc::new(FilterMetrics::new()),
        ));
        safe_search.refresh(false).await.unwrap();

        let recorder = Arc::new(RuntimeRecorder::new(
            Arc::new(NoUpload),
            &BillStatConfig::default(),
            Arc::new(BillStatMetrics::new()),
        ));
        let mut service = FilterService::new(
            DeviceFinder::new(db.clone(), Arc::new(DeviceFinderMetrics::new())),
            Messages::default(),
            recorder.clone(),
        );
        service.add_rule_list(list);
        service.set_safe_search(safe_search);
        Setup {
            service,
            db,
            recorder,
        }
    }

    fn server() -> ServerInfo {
        let mut srv = ServerInfo::new(Protocol::Dns);
        srv.linked_ip_enabled = true;
        srv
    }

    fn info(client: &str) -> RequestInfo {
        RequestInfo::new(
            format!("{client}:5353").parse().unwrap(),
            "192.0.2.53:53".parse().unwrap(),
        )
    }

    fn rcode(action: &Action) -> Rcode {
        match action {
            Action::Respond(msg) => msg.header().rcode(),
            Action::Forward(_) => panic!("forwarded"),
        }
    }

    #[tokio::test]
    async fn anonymous_block_uses_null_ip() {
        let setup = setup().await;
        let req = query("x.ads.example", Rtype::A);
        let handled = setup
            .service
            .handle_request(&req, &server(), &info("203.0.113.1"))
            .await
            .unwrap();
        match &handled.action {
            Action::Respond(msg) => assert_eq!(
                answer_addrs(msg),
                ["0.0.0.0".parse::<IpAddr>().unwrap()]
            ),
            other => panic!("unexpected {other:?}"),
        }
        assert!(handled.context.unwrap().profile.is_none());
        assert!(setup.recorder.is_empty());
    }

    #[tokio::test]
    async fn profile_block_mode_and_billing() {
        let setup = setup().await;
        let req = query("ads.example", Rtype::A);
        let handled = setup
            .service
            .handle_request(&req, &server(), &info("198.51.100.1"))
            .await
            .unwrap();
        assert_eq!(rcode(&handled.action), Rcode::NXDOMAIN);
        assert_eq!(handled.context.unwrap().client_name(), "dev1");

        let rec = setup
            .recorder
            .get(&DeviceId::new("dev1").unwrap())
            .unwrap();
        assert_eq!(rec.queries, 1);
        assert_eq!(rec.proto, Protocol::Dns);
    }

    #[tokio::test]
    async fn allow_and_pass_through() {
        let setup = setup().await;
        for host in ["good.ads.example", "example.org"] {
            let req = query(host, Rtype::A);
            let handled = setup
                .service
                .handle_request(&req, &server(), &info("203.0.113.1"))
                .await
                .unwrap();
            match handled.action {
                Action::Forward(msg) => {
                    assert_eq!(msg.as_slice(), req.as_slice())
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn rewrites_and_safe_search() {
        let setup = setup().await;
        let req = query("rewritten.example", Rtype::A);
        let handled = setup
            .service
            .handle_request(&req, &server(), &info("203.0.113.1"))
            .await
            .unwrap();
        match &handled.action {
            Action::Respond(msg) => assert_eq!(
                answer_addrs(msg),
                ["192.0.2.99".parse::<IpAddr>().unwrap()]
            ),
            other => panic!("unexpected {other:?}"),
        }

        // Safe search only applies to profiles enabling it.
        let req = query("search.example", Rtype::A);
        let handled = setup
            .service
            .handle_request(&req, &server(), &info("203.0.113.1"))
            .await
            .unwrap();
        assert!(matches!(handled.action, Action::Forward(_)));
        let handled = setup
            .service
            .handle_request(&req, &server(), &info("198.51.100.1"))
            .await
            .unwrap();
        match &handled.action {
            Action::Respond(msg) => assert_eq!(
                answer_addrs(msg),
                ["192.0.2.50".parse::<IpAddr>().unwrap()]
            ),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn device_errors_refuse() {
        let setup = setup().await;
        let mut device = Device::new(DeviceId::new("dev2").unwrap());
        device.auth = Some(AuthSettings {
            enabled: true,
            encrypted_only: false,
            password: Some(Arc::new(|cred: &[u8]| cred == b"secret")),
        });
        setup
            .db
            .add_device(&ProfileId::new("prof1").unwrap(), device)
            .unwrap();

        let mut srv = ServerInfo::new(Protocol::DoH);
        srv.set_device_domains(["d.example"]);
        let mut info = info("203.0.113.1");
        info.url_path = Some("/dns-query/dev2".into());
        let req = query("example.org", Rtype::A);
        let handled = setup
            .service
            .handle_request(&req, &srv, &info)
            .await
            .unwrap();
        assert_eq!(rcode(&handled.action), Rcode::REFUSED);
        assert!(setup.recorder.is_empty());
    }

    #[tokio::test]
    async fn bad_query_is_formerr() {
        let setup = setup().await;
        let req = MessageBuilder::new_vec().into_message();
        let handled = setup
            .service
            .handle_request(&req, &server(), &info("203.0.113.1"))
            .await
            .unwrap();
        assert_eq!(rcode(&handled.action), Rcode::FORMERR);
        assert!(handled.context.is_none());
    }

    #[tokio::test]
    async fn blocked_answer_data() {
        let setup = setup().await;
        let req = query("cdn.example", Rtype::A);
        let handled = setup
            .service
            .handle_request(&req, &server(), &info("203.0.113.1"))
            .await
            .unwrap();

        let upstream = |target: &str, addr: &str| {
            let mut answer = MessageBuilder::new_vec()
                .start_answer(&req, Rcode::NOERROR)
                .unwrap();
            let qname = Name::<Vec<u8>>::from_str("cdn.example").unwrap();
            let target = Name::<Vec<u8>>::from_str(target).unwrap();
            answer
                .push((
                    &qname,
                    Ttl::from_secs(60),
                    domain::rdata::Cname::new(target.clone()),
                ))
                .unwrap();
            answer
                .push((
                    &target,
                    Ttl::from_secs(60),
                    domain::rdata::A::new(addr.parse().unwrap()),
                ))
                .unwrap();
            answer.into_message()
        };

        let svc = &setup.service;
        let ctx = handled.context.as_ref().unwrap();
        let resp = upstream("edge.tracker.example", "192.0.2.1");
        let blocked = svc.filter_response(&req, &resp, ctx).unwrap().unwrap();
        assert_eq!(
            answer_addrs(&blocked),
            ["0.0.0.0".parse::<IpAddr>().unwrap()]
        );

        let resp = upstream("edge.cdn.example", "192.0.2.66");
        assert!(svc.filter_response(&req, &resp, ctx).unwrap().is_some());

        let resp = upstream("edge.cdn.example", "192.0.2.1");
        assert!(svc.filter_response(&req, &resp, ctx).unwrap().is_none());
    }

    #[test]
    fn errors_display() {
        let err = ServiceError::from(MessageError::BadQuestion);
        assert!(err.to_string().starts_with("building message"));
    }
}
