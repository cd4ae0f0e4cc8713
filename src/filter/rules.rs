//! Parsing of filtering rules.
//!
//! Rule lists use a subset of the AdGuard DNS filtering syntax:
//!
//! * Lines starting with `!` or `#` are comments.
//! * Hosts file lines `<address> <host> [<host> ...]`. Unspecified and
//!   loopback addresses block the hosts, all other addresses rewrite
//!   them.
//! * Plain domain names block exactly that name.
//! * Network rules `[@@]<pattern>[$<modifiers>]`. The pattern may use `||`
//!   to match a domain and all its subdomains, `|` to anchor at the start
//!   or end, `^` to mark the end of the name, and `*` as a wildcard. A
//!   pattern enclosed in slashes is a regular expression. `@@` turns the
//!   rule into an exception.
//!
//! The supported modifiers are `important`, `dnstype`, `dnsrewrite`, and
//! `client`. Rules with any other modifier are rejected.

use core::fmt;
use core::str::FromStr;

use std::net::IpAddr;
use std::sync::Arc;

use domain::base::iana::{Rcode, Rtype};
use ipnet::IpNet;
use regex::Regex;

//------------ Rule ----------------------------------------------------------

/// A single parsed rule.
#[derive(Clone, Debug)]
pub struct Rule {
    text: Arc<str>,
    pattern: Pattern,
    action: RuleAction,
    important: bool,
    dnstype: Option<DnsTypeFilter>,
    client: Option<ClientFilter>,
}

impl Rule {
    /// Parses a single line of a rule list.
    ///
    /// Returns an empty vector for comments, empty lines, and cosmetic
    /// rules. A hosts file line results in one rule per host.
    pub fn parse_line(line: &str) -> Result<Vec<Rule>, RuleError> {
        let line = line.trim();
        if line.is_empty() || is_comment(line) || is_cosmetic(line) {
            return Ok(Vec::new());
        }
        let text: Arc<str> = line.into();
        if let Some(rules) = parse_hosts_line(&text)? {
            return Ok(rules);
        }
        parse_network_rule(text).map(|rule| vec![rule])
    }

    /// Returns the text of the rule.
    pub fn text(&self) -> &Arc<str> {
        &self.text
    }

    /// Returns the pattern of the rule.
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Returns what the rule does when it matches.
    pub fn action(&self) -> &RuleAction {
        &self.action
    }

    /// Returns whether the rule has the `important` modifier.
    pub fn is_important(&self) -> bool {
        self.important
    }

    /// Returns whether the rule's modifiers accept a query.
    ///
    /// This doesn't check the pattern.
    pub fn accepts(&self, ctx: &MatchContext) -> bool {
        if let Some(dnstype) = &self.dnstype {
            if !dnstype.accepts(ctx.qtype) {
                return false;
            }
        }
        if let Some(client) = &self.client {
            if !client.accepts(ctx.client_ip, ctx.client_name) {
                return false;
            }
        }
        // Rewrites only apply to questions, not to the data in answers.
        !(ctx.answer_phase && matches!(self.action, RuleAction::Rewrite(_)))
    }
}

//------------ MatchContext --------------------------------------------------

/// The data a rule is matched against besides the host.
#[derive(Clone, Copy, Debug)]
pub struct MatchContext<'a> {
    /// The address of the client.
    pub client_ip: IpAddr,

    /// The name of the client, possibly empty.
    pub client_name: &'a str,

    /// The query type.
    pub qtype: Rtype,

    /// Whether the host was taken from the answer of a response.
    pub answer_phase: bool,
}

//------------ Pattern -------------------------------------------------------

/// What hosts a rule matches.
#[derive(Clone, Debug)]
pub enum Pattern {
    /// Exactly this host.
    Exact(String),

    /// This domain and all its subdomains.
    Domain(String),

    /// Any host the regular expression matches.
    Regex(Regex),
}

impl Pattern {
    /// Returns whether the pattern matches a lower-case host.
    pub fn matches(&self, host: &str) -> bool {
        match self {
            Pattern::Exact(exact) => host == exact,
            Pattern::Domain(domain) => {
                host == domain
                    || host
                        .strip_suffix(domain.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'))
            }
            Pattern::Regex(re) => re.is_match(host),
        }
    }
}

//------------ RuleAction ----------------------------------------------------

/// What happens to a query matched by a rule.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RuleAction {
    /// The query is blocked.
    Block,

    /// The query is exempt from blocking.
    Allow,

    /// The response is replaced.
    Rewrite(DnsRewrite),
}

//------------ DnsRewrite ----------------------------------------------------

/// The replacement response of a rewrite rule.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DnsRewrite {
    /// An empty response with this response code.
    Rcode(Rcode),

    /// A response containing this address for queries of its type.
    Address(IpAddr),

    /// The query is resolved for this name instead.
    Cname(String),
}

impl DnsRewrite {
    /// Parses the value of a `dnsrewrite` modifier.
    ///
    /// The value is either `RCODE;RRTYPE;VALUE` or a short form: an
    /// address, a response code keyword, or a domain name.
    pub fn parse(value: &str) -> Result<Self, String> {
        let value = value.trim();
        if value.is_empty() {
            return Err("empty dnsrewrite".into());
        }
        let mut parts = value.splitn(3, ';');
        let first = parts.next().unwrap_or_default();
        match (parts.next(), parts.next()) {
            (None, None) => Self::parse_short(first),
            (Some(rtype), Some(data)) => Self::parse_full(first, rtype, data),
            _ => Err(format!("bad dnsrewrite {value:?}")),
        }
    }

    fn parse_short(value: &str) -> Result<Self, String> {
        if let Ok(addr) = IpAddr::from_str(value) {
            return Ok(DnsRewrite::Address(addr));
        }
        if let Some(rcode) = parse_rcode(value) {
            return Ok(DnsRewrite::Rcode(rcode));
        }
        check_hostname(value).map(DnsRewrite::Cname)
    }

    fn parse_full(rcode: &str, rtype: &str, data: &str) -> Result<Self, String> {
        let rcode = parse_rcode(rcode)
            .ok_or_else(|| format!("unknown response code {rcode:?}"))?;
        if rtype.is_empty() && data.is_empty() {
            return Ok(DnsRewrite::Rcode(rcode));
        }
        if rcode != Rcode::NOERROR {
            return Err("records require NOERROR".into());
        }
        let rtype = Rtype::from_str(&rtype.to_ascii_uppercase())
            .map_err(|_| format!("unknown record type {rtype:?}"))?;
        if rtype == Rtype::A {
            match IpAddr::from_str(data) {
                Ok(addr @ IpAddr::V4(_)) => Ok(DnsRewrite::Address(addr)),
                _ => Err(format!("bad IPv4 address {data:?}")),
            }
        } else if rtype == Rtype::AAAA {
            match IpAddr::from_str(data) {
                Ok(addr @ IpAddr::V6(_)) => Ok(DnsRewrite::Address(addr)),
                _ => Err(format!("bad IPv6 address {data:?}")),
            }
        } else if rtype == Rtype::CNAME {
            check_hostname(data).map(DnsRewrite::Cname)
        } else {
            Err(format!("unsupported record type {rtype}"))
        }
    }
}

fn parse_rcode(s: &str) -> Option<Rcode> {
    match s.to_ascii_uppercase().as_str() {
        "NOERROR" => Some(Rcode::NOERROR),
        "NXDOMAIN" => Some(Rcode::NXDOMAIN),
        "REFUSED" => Some(Rcode::REFUSED),
        "SERVFAIL" => Some(Rcode::SERVFAIL),
        _ => None,
    }
}

//------------ DnsTypeFilter -------------------------------------------------

/// The value of a `dnstype` modifier.
#[derive(Clone, Debug, Default)]
struct DnsTypeFilter {
    include: Vec<Rtype>,
    exclude: Vec<Rtype>,
}

impl DnsTypeFilter {
    fn parse(value: &str) -> Result<Self, String> {
        let mut res = DnsTypeFilter::default();
        for item in value.split('|') {
            let (list, name) = match item.strip_prefix('~') {
                Some(name) => (&mut res.exclude, name),
                None => (&mut res.include, item),
            };
            let rtype = Rtype::from_str(&name.trim().to_ascii_uppercase())
                .map_err(|_| format!("unknown record type {name:?}"))?;
            list.push(rtype);
        }
        Ok(res)
    }

    fn accepts(&self, qtype: Rtype) -> bool {
        (self.include.is_empty() || self.include.contains(&qtype))
            && !self.exclude.contains(&qtype)
    }
}

//------------ ClientFilter --------------------------------------------------

/// The value of a `client` modifier.
#[derive(Clone, Debug, Default)]
struct ClientFilter {
    include: Vec<ClientMatch>,
    exclude: Vec<ClientMatch>,
}

#[derive(Clone, Debug)]
enum ClientMatch {
    Net(IpNet),
    Name(String),
}

impl ClientFilter {
    fn parse(value: &str) -> Result<Self, String> {
        let mut res = ClientFilter::default();
        for item in value.split('|') {
            let item = item.trim();
            let (list, item) = match item.strip_prefix('~') {
                Some(item) => (&mut res.exclude, item),
                None => (&mut res.include, item),
            };
            let item = item.trim_matches(|c| c == '\'' || c == '"');
            if item.is_empty() {
                return Err("empty client".into());
            }
            let client = if let Ok(net) = IpNet::from_str(item) {
                ClientMatch::Net(net)
            } else if let Ok(addr) = IpAddr::from_str(item) {
                ClientMatch::Net(IpNet::from(addr))
            } else {
                ClientMatch::Name(item.to_lowercase())
            };
            list.push(client);
        }
        Ok(res)
    }

    fn accepts(&self, addr: IpAddr, name: &str) -> bool {
        let hit = |client: &ClientMatch| match client {
            ClientMatch::Net(net) => net.contains(&addr),
            ClientMatch::Name(client) => {
                !name.is_empty() && client.eq_ignore_ascii_case(name)
            }
        };
        (self.include.is_empty() || self.include.iter().any(hit))
            && !self.exclude.iter().any(hit)
    }
}

//------------ Parsing -------------------------------------------------------

fn is_comment(line: &str) -> bool {
    line.starts_with('!') || (line.starts_with('#') && !line.starts_with("##"))
}

fn is_cosmetic(line: &str) -> bool {
    ["##", "#@#", "#?#", "#$#", "#%#"]
        .iter()
        .any(|marker| line.contains(marker))
}

/// Parses a hosts file line.
///
/// Returns `Ok(None)` if the line doesn't start with an address.
fn parse_hosts_line(text: &Arc<str>) -> Result<Option<Vec<Rule>>, RuleError> {
    let content = match text.split_once('#') {
        Some((content, _)) => content,
        None => text,
    };
    let mut fields = content.split_whitespace();
    let addr = match fields.next().map(IpAddr::from_str) {
        Some(Ok(addr)) => addr,
        _ => return Ok(None),
    };
    let action = if addr.is_unspecified() || addr.is_loopback() {
        RuleAction::Block
    } else {
        RuleAction::Rewrite(DnsRewrite::Address(addr))
    };
    let mut rules = Vec::new();
    for host in fields {
        let host = check_hostname(host)
            .map_err(|reason| RuleError::new(text, reason))?;
        rules.push(Rule {
            text: text.clone(),
            pattern: Pattern::Exact(host),
            action: action.clone(),
            important: false,
            dnstype: None,
            client: None,
        });
    }
    if rules.is_empty() {
        return Err(RuleError::new(text, "hosts line without hosts"));
    }
    Ok(Some(rules))
}

/// Parses a network rule or a plain domain name.
fn parse_network_rule(text: Arc<str>) -> Result<Rule, RuleError> {
    let err = |reason: String| RuleError::new(&text, reason);
    let (allow, rest) = match text.strip_prefix("@@") {
        Some(rest) => (true, rest),
        None => (false, &*text),
    };
    let (pattern, modifiers) = split_modifiers(rest);
    let pattern = parse_pattern(pattern, modifiers.is_some()).map_err(err)?;

    let mut rule = Rule {
        text: text.clone(),
        pattern,
        action: if allow {
            RuleAction::Allow
        } else {
            RuleAction::Block
        },
        important: false,
        dnstype: None,
        client: None,
    };
    for modifier in modifiers.into_iter().flat_map(|m| m.split(',')) {
        let (name, value) = match modifier.split_once('=') {
            Some((name, value)) => (name.trim(), Some(value)),
            None => (modifier.trim(), None),
        };
        match (name, value) {
            ("important", None) => rule.important = true,
            ("dnstype", Some(value)) => {
                rule.dnstype = Some(DnsTypeFilter::parse(value).map_err(err)?)
            }
            ("client", Some(value)) => {
                rule.client = Some(ClientFilter::parse(value).map_err(err)?)
            }
            ("dnsrewrite", Some(value)) if !allow => {
                rule.action =
                    RuleAction::Rewrite(DnsRewrite::parse(value).map_err(err)?)
            }
            ("dnsrewrite", _) if allow => {}
            _ => return Err(err(format!("unsupported modifier {name:?}"))),
        }
    }
    Ok(rule)
}

/// Splits a rule into the pattern and the modifiers.
fn split_modifiers(rule: &str) -> (&str, Option<&str>) {
    if rule.starts_with('/') {
        if let Some(end) = rule.rfind('/').filter(|end| *end > 0) {
            let (pattern, rest) = rule.split_at(end + 1);
            if let Some(modifiers) = rest.strip_prefix('$') {
                return (pattern, Some(modifiers));
            }
            if rest.is_empty() {
                return (pattern, None);
            }
        }
    }
    match rule.split_once('$') {
        Some((pattern, modifiers)) => (pattern, Some(modifiers)),
        None => (rule, None),
    }
}

/// Parses the pattern part of a network rule.
fn parse_pattern(pattern: &str, has_modifiers: bool) -> Result<Pattern, String> {
    if pattern.len() > 2 && pattern.starts_with('/') && pattern.ends_with('/')
    {
        let inner = &pattern[1..pattern.len() - 1];
        return Regex::new(&format!("(?i){inner}"))
            .map(Pattern::Regex)
            .map_err(|err| format!("bad regular expression: {err}"));
    }
    let pattern = pattern.to_ascii_lowercase();
    if pattern.is_empty() || pattern == "|" || pattern == "||" {
        return Err("empty pattern".into());
    }

    let (domain_anchor, body) = match pattern.strip_prefix("||") {
        Some(body) => (true, body),
        None => (false, pattern.as_str()),
    };
    let (start_anchor, body) = match body.strip_prefix('|') {
        Some(body) if !domain_anchor => (true, body),
        _ => (false, body),
    };
    let (end_anchor, body) = match body
        .strip_suffix('^')
        .or_else(|| body.strip_suffix('|'))
    {
        Some(body) => (true, body),
        None => (false, body),
    };

    if is_hostname(body) {
        if domain_anchor && end_anchor {
            return Ok(Pattern::Domain(body.into()));
        }
        if start_anchor && end_anchor {
            return Ok(Pattern::Exact(body.into()));
        }
        if !domain_anchor && !start_anchor && !end_anchor && !has_modifiers
        {
            return Ok(Pattern::Exact(body.into()));
        }
    }
    Regex::new(&pattern_to_regex(&pattern))
        .map(Pattern::Regex)
        .map_err(|err| format!("bad pattern: {err}"))
}

/// Converts a wildcard pattern into a regular expression.
fn pattern_to_regex(pattern: &str) -> String {
    let mut res = String::from("(?i)");
    let mut rest = pattern;
    if let Some(body) = rest.strip_prefix("||") {
        res.push_str(r"^(?:.*\.)?");
        rest = body;
    } else if let Some(body) = rest.strip_prefix('|') {
        res.push('^');
        rest = body;
    }
    let end_anchor = rest.ends_with('|');
    let rest = rest.strip_suffix('|').unwrap_or(rest);
    let mut buf = [0u8; 4];
    for ch in rest.chars() {
        match ch {
            '*' => res.push_str(".*"),
            // In a host name, only the end can be a separator.
            '^' => res.push('$'),
            _ => res.push_str(&regex::escape(ch.encode_utf8(&mut buf))),
        }
    }
    if end_anchor {
        res.push('$');
    }
    res
}

/// Returns whether `s` consists of host name characters only.
fn is_hostname(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('.')
        && s.bytes().all(|c| {
            c.is_ascii_alphanumeric() || c == b'-' || c == b'.' || c == b'_'
        })
}

/// Checks and normalizes a host name.
fn check_hostname(s: &str) -> Result<String, String> {
    let host = s.trim_end_matches('.').to_ascii_lowercase();
    if is_hostname(&host) && !host.contains("..") {
        Ok(host)
    } else {
        Err(format!("bad host name {s:?}"))
    }
}

//------------ RuleError -----------------------------------------------------

/// A line of a rule list could not be parsed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RuleError {
    line: String,
    reason: String,
}

impl RuleError {
    fn new(line: &str, reason: impl Into<String>) -> Self {
        RuleError {
            line: line.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns the offending line.
    pub fn line(&self) -> &str {
        &self.line
    }

    /// Returns why the line was rejected.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bad rule {:?}: {}", self.line, self.reason)
    }
}

impl std::error::Error for RuleError {}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn one(line: &str) -> Rule {
        let mut rules = Rule::parse_line(line).unwrap();
        assert_eq!(rules.len(), 1, "{line}");
        rules.remove(0)
    }

    fn ctx(qtype: Rtype) -> MatchContext<'static> {
        MatchContext {
            client_ip: "192.0.2.1".parse().unwrap(),
            client_name: "laptop",
            qtype,
            answer_phase: false,
        }
    }

    #[rstest]
    #[case("")]
    #[case("! comment")]
    #[case("# comment")]
    #[case("example.com##.banner")]
    #[case("example.com#@#.banner")]
    fn skipped_lines(#[case] line: &str) {
        assert!(Rule::parse_line(line).unwrap().is_empty());
    }

    #[rstest]
    #[case("||example.com^", "example.com", true)]
    #[case("||example.com^", "ads.example.com", true)]
    #[case("||example.com^", "badexample.com", false)]
    #[case("|example.com^", "example.com", true)]
    #[case("|example.com^", "ads.example.com", false)]
    #[case("example.com", "example.com", true)]
    #[case("example.com", "www.example.com", false)]
    #[case("ads*.example.org^", "ads1.example.org", true)]
    #[case("ads*.example.org^", "x-ads1.example.org", true)]
    #[case("||ads*.example.org^", "www.ads-x.example.org", true)]
    #[case("||ads*.example.org^", "xads.example.org", false)]
    #[case("/^ad[0-9]+\\./", "ad12.example.net", true)]
    #[case("/^ad[0-9]+\\./", "bad12.example.net", false)]
    #[case("||EXAMPLE.com^", "example.com", true)]
    fn patterns(#[case] line: &str, #[case] host: &str, #[case] hit: bool) {
        assert_eq!(one(line).pattern().matches(host), hit, "{line} {host}");
    }

    #[test]
    fn pattern_kinds() {
        assert!(matches!(one("||a.example^").pattern(), Pattern::Domain(_)));
        assert!(matches!(one("|a.example|").pattern(), Pattern::Exact(_)));
        assert!(matches!(one("a.example").pattern(), Pattern::Exact(_)));
        assert!(matches!(
            one("a.example$important").pattern(),
            Pattern::Regex(_)
        ));
    }

    #[test]
    fn hosts_lines() {
        let rules = Rule::parse_line("0.0.0.0 a.example b.example # ads")
            .unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[1].action(), &RuleAction::Block);
        assert!(rules[1].pattern().matches("b.example"));

        let rule = one("192.0.2.7 local.example");
        assert_eq!(
            rule.action(),
            &RuleAction::Rewrite(DnsRewrite::Address(
                "192.0.2.7".parse().unwrap()
            ))
        );
    }

    #[test]
    fn allow_and_important() {
        let rule = one("@@||example.com^$important");
        assert_eq!(rule.action(), &RuleAction::Allow);
        assert!(rule.is_important());
    }

    #[rstest]
    #[case("NXDOMAIN;;", DnsRewrite::Rcode(Rcode::NXDOMAIN))]
    #[case("REFUSED", DnsRewrite::Rcode(Rcode::REFUSED))]
    #[case("NOERROR;A;1.2.3.4", DnsRewrite::Address("1.2.3.4".parse().unwrap()))]
    #[case("NOERROR;AAAA;2001:db8::1", DnsRewrite::Address("2001:db8::1".parse().unwrap()))]
    #[case("NOERROR;CNAME;safe.example", DnsRewrite::Cname("safe.example".into()))]
    #[case("1.2.3.4", DnsRewrite::Address("1.2.3.4".parse().unwrap()))]
    #[case("Safe.Example.", DnsRewrite::Cname("safe.example".into()))]
    fn dnsrewrite(#[case] value: &str, #[case] expected: DnsRewrite) {
        assert_eq!(DnsRewrite::parse(value), Ok(expected));
    }

    #[rstest]
    #[case("NOERROR;A;2001:db8::1")]
    #[case("NOERROR;MX;mail.example")]
    #[case("NXDOMAIN;A;1.2.3.4")]
    #[case("BOGUS;;")]
    #[case("a;b")]
    fn bad_dnsrewrite(#[case] value: &str) {
        assert!(DnsRewrite::parse(value).is_err());
    }

    #[test]
    fn dnstype_modifier() {
        let rule = one("||example.com^$dnstype=AAAA|https");
        assert!(rule.accepts(&ctx(Rtype::AAAA)));
        assert!(rule.accepts(&ctx(Rtype::HTTPS)));
        assert!(!rule.accepts(&ctx(Rtype::A)));

        let rule = one("||example.com^$dnstype=~A");
        assert!(!rule.accepts(&ctx(Rtype::A)));
        assert!(rule.accepts(&ctx(Rtype::TXT)));
    }

    #[test]
    fn client_modifier() {
        let rule = one("||example.com^$client=192.0.2.0/24");
        assert!(rule.accepts(&ctx(Rtype::A)));

        let rule = one("||example.com^$client=~'Laptop'");
        assert!(!rule.accepts(&ctx(Rtype::A)));

        let rule = one("||example.com^$client=10.0.0.1|phone");
        assert!(!rule.accepts(&ctx(Rtype::A)));
    }

    #[test]
    fn rewrites_skip_answer_phase() {
        let rule = one("||example.com^$dnsrewrite=1.2.3.4");
        let mut ctx = ctx(Rtype::A);
        assert!(rule.accepts(&ctx));
        ctx.answer_phase = true;
        assert!(!rule.accepts(&ctx));
    }

    #[rstest]
    #[case("||example.com^$unknown")]
    #[case("||example.com^$dnstype=BOGUS")]
    #[case("||example.com^$dnsrewrite=NOERROR;TXT;x")]
    #[case("/unclosed(/")]
    #[case("0.0.0.0")]
    #[case("0.0.0.0 bad!host")]
    #[case("||")]
    fn bad_rules(#[case] line: &str) {
        assert!(Rule::parse_line(line).is_err(), "{line}");
    }
}
