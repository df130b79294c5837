//! Priority-indexed rule accumulation.
//!
//! A [`RuleSetBuilder`] maps integer priorities to rule lists; building
//! concatenates the lists in ascending priority order, preserving insertion
//! order within a priority. Lower priorities are applied first.

use std::collections::BTreeMap;

/// A firewall rule, probably of the iptables variety, although nothing about
/// the value is assumed here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule(pub String);

impl Rule {
    /// The rule as the argument string handed to the firewall tool.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Rule {
    fn from(s: &str) -> Self {
        Rule(s.to_owned())
    }
}

impl From<String> for Rule {
    fn from(s: String) -> Self {
        Rule(s)
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A set of rules to be applied in order.
pub type RuleSet = Vec<Rule>;

/// Maps priorities to the rules at those priorities. Some rules exported here
/// have "special" priorities that can be depended upon: when [`base_rules`] is
/// used, priorities [0, 10) and [990, 1000) are reserved.
#[derive(Debug, Default)]
pub struct RuleSetBuilder {
    rules: BTreeMap<i32, Vec<Rule>>,
}

impl RuleSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `rules` to the list at `priority`.
    pub fn add<I, R>(&mut self, priority: i32, rules: I) -> &mut Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Rule>,
    {
        self.rules
            .entry(priority)
            .or_default()
            .extend(rules.into_iter().map(Into::into));
        self
    }

    /// Standard extensibility hook: hand the builder to a contributor.
    pub fn apply<F>(&mut self, mutate: F) -> &mut Self
    where
        F: FnOnce(&mut RuleSetBuilder),
    {
        mutate(self);
        self
    }

    /// Concatenate all per-priority lists in ascending priority order.
    pub fn build(&self) -> RuleSet {
        self.rules.values().flatten().cloned().collect()
    }
}

/// Adds the base rule contribution to the builder. When this is used,
/// priorities [0, 10) and [990, 1000) are reserved.
pub fn base_rules(b: &mut RuleSetBuilder) {
    b.add(0, POLICY_RULES.iter().copied())
        .add(1, BASE_CHAINS.iter().copied())
        .add(999, REJECTIONS.iter().copied());
}

const POLICY_RULES: &[&str] = &[
    "-t filter -P INPUT DROP",
    "-t filter -P FORWARD DROP",
    "-t filter -N in-tcp",
    "-t filter -N in-udp",
    "-t filter -N fw-interfaces",
    "-t filter -N fw-open",
];

const BASE_CHAINS: &[&str] = &[
    "-t filter -A INPUT -j DROP -m state --state INVALID",
    "-t filter -A INPUT -j ACCEPT -m conntrack --ctstate RELATED,ESTABLISHED",
    "-t filter -A INPUT -j ACCEPT -i lo",
    "-t filter -A INPUT -j ACCEPT -p icmp --icmp-type 8 -m conntrack --ctstate NEW",
    "-t filter -A INPUT -j in-tcp -p tcp --tcp-flags FIN,SYN,RST,ACK SYN -m conntrack --ctstate NEW",
    "-t filter -A INPUT -j in-udp -p udp -m conntrack --ctstate NEW",
    "-t filter -A INPUT -j REJECT --reject-with icmp-proto-unreachable",
    "-t filter -A FORWARD -j ACCEPT -m conntrack --ctstate ESTABLISHED,RELATED",
    "-t filter -A FORWARD -j fw-interfaces",
    "-t filter -A FORWARD -j fw-open",
    "-t filter -A FORWARD -j REJECT --reject-with icmp-host-unreach",
    "-t nat -A PREROUTING -j ACCEPT -m conntrack --ctstate RELATED,ESTABLISHED",
];

const REJECTIONS: &[&str] = &[
    "-t filter -A in-tcp -j REJECT -p tcp --reject-with tcp-reset",
    "-t filter -A in-udp -j REJECT -p udp --reject-with icmp-port-unreachable",
];
