//! Builds the full rule set for a configuration and feeds it to the firewall
//! tool, one invocation per rule, in order.

use std::path::Path;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::metrics;

use super::rules::{base_rules, Rule, RuleSet, RuleSetBuilder};
use super::{forward, forward_to_subnet, masquerade, FwConfig};

/// Gateway contribution priority. Sits between the reserved base-rule bands.
const GATEWAY_PRIORITY: i32 = 50;
/// Extra-rule contribution priority.
const EXTRA_PRIORITY: i32 = 60;

#[derive(Debug, Error)]
pub enum FwError {
    #[error("rule {rule:?} is not splittable into arguments")]
    BadRule { rule: Rule },
    #[error("could not run firewall tool for rule {rule:?}: {source}")]
    Spawn {
        rule: Rule,
        #[source]
        source: std::io::Error,
    },
    #[error("firewall tool exited with {status} for rule {rule:?}")]
    RuleFailed {
        rule: Rule,
        status: std::process::ExitStatus,
    },
}

/// Composes the base rules, the gateway forwarding/masquerade contribution,
/// and the configuration's extra rules into one ordered set.
pub fn build_rule_set<C: FwConfig + ?Sized>(cfg: &C) -> RuleSet {
    let mut b = RuleSetBuilder::new();
    b.apply(base_rules)
        .apply(|b| add_flat_network_forwarding(cfg, b))
        .add(
            GATEWAY_PRIORITY,
            [forward(cfg.lan(), cfg.uplink()), masquerade(cfg.uplink())],
        )
        .add(EXTRA_PRIORITY, cfg.extra_rules());
    b.build()
}

fn add_flat_network_forwarding<C: FwConfig + ?Sized>(cfg: &C, b: &mut RuleSetBuilder) {
    let rs: RuleSet = cfg
        .flat_networks()
        .iter()
        .map(|s| forward_to_subnet(cfg.lan(), &s.link, &s.subnet))
        .collect();
    b.add(GATEWAY_PRIORITY, rs);
}

/// Builds and applies the rule set for `cfg`. Any non-zero exit of the
/// firewall tool aborts immediately; no rollback is attempted. The process is
/// expected to exit and be restarted on such a failure.
pub async fn apply<C: FwConfig + ?Sized>(iptables_bin: &Path, cfg: &C) -> Result<(), FwError> {
    apply_rule_set(iptables_bin, &build_rule_set(cfg)).await
}

pub async fn apply_rule_set(iptables_bin: &Path, rs: &RuleSet) -> Result<(), FwError> {
    for rule in rs {
        trace!(%rule, "applying rule");
        run_iptables(iptables_bin, rule).await?;
        metrics::FW_RULES_APPLIED.inc();
    }
    debug!(rules = rs.len(), "firewall applied");
    Ok(())
}

async fn run_iptables(iptables_bin: &Path, rule: &Rule) -> Result<(), FwError> {
    let args = shlex::split(rule.as_str()).ok_or_else(|| FwError::BadRule { rule: rule.clone() })?;
    let status = Command::new(iptables_bin)
        .args(&args)
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(|source| FwError::Spawn {
            rule: rule.clone(),
            source,
        })?;
    if !status.success() {
        return Err(FwError::RuleFailed {
            rule: rule.clone(),
            status,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fw::{Addr, Link, StaticRoute};

    struct TestConfig {
        lan: Link,
        uplink: Link,
        flat: Vec<StaticRoute>,
        extra: RuleSet,
    }

    impl FwConfig for TestConfig {
        fn lan(&self) -> &Link {
            &self.lan
        }
        fn uplink(&self) -> &Link {
            &self.uplink
        }
        fn flat_networks(&self) -> &[StaticRoute] {
            &self.flat
        }
        fn extra_rules(&self) -> RuleSet {
            self.extra.clone()
        }
    }

    fn minimal() -> TestConfig {
        TestConfig {
            lan: Link::new("eth0"),
            uplink: Link::new("eth1"),
            flat: vec![],
            extra: vec![],
        }
    }

    #[test]
    fn minimal_firewall_assembly() {
        let rs = build_rule_set(&minimal());
        let strs: Vec<&str> = rs.iter().map(Rule::as_str).collect();

        // Base policy first, terminal rejects last.
        assert_eq!(strs[0], "-t filter -P INPUT DROP");
        assert_eq!(
            strs[strs.len() - 2],
            "-t filter -A in-tcp -j REJECT -p tcp --reject-with tcp-reset"
        );

        let fwd = strs
            .iter()
            .position(|r| *r == "-t filter -A fw-interfaces -j ACCEPT -i eth0 -o eth1")
            .expect("forward rule present");
        let masq = strs
            .iter()
            .position(|r| *r == "-t nat -A POSTROUTING -j MASQUERADE -o eth1")
            .expect("masquerade rule present");
        let last_base = strs
            .iter()
            .position(|r| *r == "-t nat -A PREROUTING -j ACCEPT -m conntrack --ctstate RELATED,ESTABLISHED")
            .unwrap();
        let first_reject = strs
            .iter()
            .position(|r| r.starts_with("-t filter -A in-tcp -j REJECT"))
            .unwrap();

        assert!(last_base < fwd);
        assert!(fwd < masq);
        assert!(masq < first_reject);
    }

    #[test]
    fn flat_network_routing_precedes_lan_forward() {
        let mut cfg = minimal();
        cfg.flat = vec![StaticRoute {
            link: Link::new("eth2"),
            subnet: "10.0.0.0/24".parse().unwrap(),
        }];
        let rs = build_rule_set(&cfg);
        let strs: Vec<&str> = rs.iter().map(Rule::as_str).collect();

        let flat = strs
            .iter()
            .position(|r| *r == "-t filter -A fw-interfaces -j ACCEPT -d 10.0.0.0/24 -i eth0 -o eth2")
            .expect("flat network rule present");
        let fwd = strs
            .iter()
            .position(|r| *r == "-t filter -A fw-interfaces -j ACCEPT -i eth0 -o eth1")
            .unwrap();
        assert!(flat < fwd, "flat rule must precede the LAN->uplink forward");
    }

    #[test]
    fn extra_rules_come_after_gateway_rules() {
        let mut cfg = minimal();
        cfg.extra = vec![Rule::from("-I in-tcp -j ACCEPT -p tcp --dport 22")];
        let rs = build_rule_set(&cfg);
        let strs: Vec<&str> = rs.iter().map(Rule::as_str).collect();

        let masq = strs
            .iter()
            .position(|r| *r == "-t nat -A POSTROUTING -j MASQUERADE -o eth1")
            .unwrap();
        let extra = strs
            .iter()
            .position(|r| *r == "-I in-tcp -j ACCEPT -p tcp --dport 22")
            .unwrap();
        let first_reject = strs
            .iter()
            .position(|r| r.starts_with("-t filter -A in-tcp -j REJECT"))
            .unwrap();
        assert!(masq < extra);
        assert!(extra < first_reject);
    }
}
