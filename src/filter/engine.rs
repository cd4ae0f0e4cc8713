//! The compiled form of a rule list.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use super::rules::{MatchContext, Pattern, Rule, RuleAction, RuleError};

//------------ RuleEngine ----------------------------------------------------

/// An immutable, indexed set of rules.
///
/// Rules matching exact hosts and whole domains are kept in hash maps so
/// that a lookup only needs to walk the labels of the host. Rules with
/// wildcards or regular expressions are checked one by one.
#[derive(Debug, Default)]
pub struct RuleEngine {
    rules: Vec<Arc<Rule>>,
    exact: HashMap<String, Vec<usize>>,
    domains: HashMap<String, Vec<usize>>,
    others: Vec<usize>,
}

impl RuleEngine {
    /// Creates an engine without any rules.
    pub fn empty() -> Self {
        Default::default()
    }

    /// Compiles the text of a rule list.
    ///
    /// Lines that fail to parse are skipped and returned along with the
    /// engine.
    pub fn compile(text: &str) -> (Self, Vec<RuleError>) {
        let mut res = RuleEngine::default();
        let mut errors = Vec::new();
        for line in text.lines() {
            match Rule::parse_line(line) {
                Ok(rules) => {
                    for rule in rules {
                        res.push(rule);
                    }
                }
                Err(err) => errors.push(err),
            }
        }
        (res, errors)
    }

    fn push(&mut self, rule: Rule) {
        let idx = self.rules.len();
        match rule.pattern() {
            Pattern::Exact(host) => {
                self.exact.entry(host.clone()).or_default().push(idx)
            }
            Pattern::Domain(domain) => {
                self.domains.entry(domain.clone()).or_default().push(idx)
            }
            Pattern::Regex(_) => self.others.push(idx),
        }
        self.rules.push(Arc::new(rule));
    }

    /// Returns the number of rules.
    pub fn rules_count(&self) -> usize {
        self.rules.len()
    }

    /// Matches a lower-case host against the rules.
    ///
    /// If several rules match, the outcome is chosen by priority:
    /// important exceptions, important rewrites, important blocking rules,
    /// exceptions, rewrites, and finally blocking rules.
    pub fn match_host(
        &self,
        host: &str,
        ctx: &MatchContext,
    ) -> Option<DnsMatch> {
        let mut found = Candidates::default();
        if let Some(idxs) = self.exact.get(host) {
            self.collect(idxs, ctx, &mut found);
        }
        for suffix in suffixes(host) {
            if let Some(idxs) = self.domains.get(suffix) {
                self.collect(idxs, ctx, &mut found);
            }
        }
        for &idx in &self.others {
            let rule = &self.rules[idx];
            if rule.pattern().matches(host) && rule.accepts(ctx) {
                found.push(rule);
            }
        }
        let res = found.into_match();
        if let Some(res) = &res {
            trace!(host, rule = %res.rule_text(), "rule matched");
        }
        res
    }

    fn collect<'a>(
        &'a self,
        idxs: &[usize],
        ctx: &MatchContext,
        found: &mut Candidates<'a>,
    ) {
        for &idx in idxs {
            let rule = &self.rules[idx];
            if rule.accepts(ctx) {
                found.push(rule);
            }
        }
    }
}

/// Returns the host and all its parent domains.
fn suffixes(host: &str) -> impl Iterator<Item = &str> {
    std::iter::once(host).chain(
        host.match_indices('.')
            .map(move |(pos, _)| &host[pos + 1..])
            .filter(|suffix| !suffix.is_empty()),
    )
}

//------------ Candidates ----------------------------------------------------

/// The rules matching a host, sorted by tier.
#[derive(Default)]
struct Candidates<'a> {
    important_allow: Option<&'a Arc<Rule>>,
    important_rewrites: Vec<Arc<Rule>>,
    important_block: Option<&'a Arc<Rule>>,
    allow: Option<&'a Arc<Rule>>,
    rewrites: Vec<Arc<Rule>>,
    block: Option<&'a Arc<Rule>>,
}

impl<'a> Candidates<'a> {
    fn push(&mut self, rule: &'a Arc<Rule>) {
        let important = rule.is_important();
        match (rule.action(), important) {
            (RuleAction::Allow, true) => {
                self.important_allow.get_or_insert(rule);
            }
            (RuleAction::Allow, false) => {
                self.allow.get_or_insert(rule);
            }
            (RuleAction::Rewrite(_), true) => {
                self.important_rewrites.push(rule.clone())
            }
            (RuleAction::Rewrite(_), false) => self.rewrites.push(rule.clone()),
            (RuleAction::Block, true) => {
                self.important_block.get_or_insert(rule);
            }
            (RuleAction::Block, false) => {
                self.block.get_or_insert(rule);
            }
        }
    }

    fn into_match(self) -> Option<DnsMatch> {
        if let Some(rule) = self.important_allow {
            return Some(DnsMatch::Allow(rule.clone()));
        }
        if !self.important_rewrites.is_empty() {
            return Some(DnsMatch::Rewrite(self.important_rewrites));
        }
        if let Some(rule) = self.important_block {
            return Some(DnsMatch::Block(rule.clone()));
        }
        if let Some(rule) = self.allow {
            return Some(DnsMatch::Allow(rule.clone()));
        }
        if !self.rewrites.is_empty() {
            return Some(DnsMatch::Rewrite(self.rewrites));
        }
        self.block.map(|rule| DnsMatch::Block(rule.clone()))
    }
}

//------------ DnsMatch ------------------------------------------------------

/// The outcome of matching a host against a rule list.
#[derive(Clone, Debug)]
pub enum DnsMatch {
    /// The query is blocked by this rule.
    Block(Arc<Rule>),

    /// The query is exempted by this rule.
    Allow(Arc<Rule>),

    /// The response is replaced according to these rules.
    ///
    /// The vector is never empty.
    Rewrite(Vec<Arc<Rule>>),
}

impl DnsMatch {
    /// Returns the text of the deciding rule.
    pub fn rule_text(&self) -> &Arc<str> {
        match self {
            DnsMatch::Block(rule) | DnsMatch::Allow(rule) => rule.text(),
            DnsMatch::Rewrite(rules) => rules[0].text(),
        }
    }

    /// Returns the priority of the match when combining several lists.
    ///
    /// Higher values win.
    pub fn priority(&self) -> u8 {
        match self {
            DnsMatch::Allow(rule) if rule.is_important() => 5,
            DnsMatch::Rewrite(rules) if rules[0].is_important() => 4,
            DnsMatch::Block(rule) if rule.is_important() => 3,
            DnsMatch::Allow(_) => 2,
            DnsMatch::Rewrite(_) => 1,
            DnsMatch::Block(_) => 0,
        }
    }
}

//============ Testing =======================================================
