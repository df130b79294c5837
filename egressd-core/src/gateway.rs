//! # Gateway assembly
//!
//! Builds the LAN and uplink virtual-address suites from a
//! [`GatewayConfig`], applies the firewall alongside them, and runs the
//! process until a terminal condition: a suite active failing, the HA
//! coordinator returning, or outside cancellation.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use pnet::util::MacAddr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::fw::{self, rules::RuleSet, Addr, FwConfig, Link, StaticRoute};
use crate::ha::{Coordinator, Follower, Leader, LeaseCheck, Member, MemberGroup};
use crate::netlink::Netlink;
use crate::task::{self, Canceled, TaskGroup};
use crate::vaddr::dhcp::{self, LeaseStore};
use crate::vaddr::util::{GratuitousArp, Ip, Up, VirtualMac};
use crate::vaddr::{Hold, Suite};

/// Firewall application deadline.
const FW_APPLY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// The full capability set of a gateway. Optional behavior is keyed purely on
/// field presence; see the builders below for the exact effect of each.
pub struct GatewayConfig {
    pub lan: Link,
    pub uplink: Link,
    pub flat_networks: Vec<StaticRoute>,
    pub extra_rules: RuleSet,

    /// Virtual MAC for the LAN interface.
    pub lan_hw_addr: Option<MacAddr>,
    /// The IP+net of the LAN interface expected by local clients.
    pub lan_addr: Option<Addr>,
    /// Virtual MAC for the uplink. Without `uplink_addr`, implies DHCP.
    pub uplink_hw_addr: Option<MacAddr>,
    /// Static IP+net of the uplink, preferred over DHCP.
    pub uplink_addr: Option<Addr>,
    /// Lease persistence for the DHCP-managed uplink address.
    pub uplink_lease_store: Option<Arc<dyn LeaseStore>>,
    /// When present, the gateway identity runs under leader election.
    pub ha_coordinator: Option<Arc<dyn Coordinator>>,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("lan", &self.lan)
            .field("uplink", &self.uplink)
            .field("flat_networks", &self.flat_networks)
            .field("extra_rules", &self.extra_rules.len())
            .field("lan_hw_addr", &self.lan_hw_addr)
            .field("lan_addr", &self.lan_addr)
            .field("uplink_hw_addr", &self.uplink_hw_addr)
            .field("uplink_addr", &self.uplink_addr)
            .field("uplink_lease_store", &self.uplink_lease_store)
            .field("has_ha_coordinator", &self.ha_coordinator.is_some())
            .finish()
    }
}

impl FwConfig for GatewayConfig {
    fn lan(&self) -> &Link {
        &self.lan
    }

    fn uplink(&self) -> &Link {
        &self.uplink
    }

    fn flat_networks(&self) -> &[StaticRoute] {
        &self.flat_networks
    }

    fn extra_rules(&self) -> RuleSet {
        self.extra_rules.clone()
    }
}

/// The LAN-side suite: admin-up always, then virtual MAC, IP, and gratuitous
/// ARP as configured.
pub fn lan_suite(cfg: &GatewayConfig, netlink: &Netlink) -> Suite {
    let mut s = Suite::new();
    s.wrappers.push(Box::new(Up {
        netlink: netlink.clone(),
        link: cfg.lan.clone(),
    }));
    if let Some(hw) = cfg.lan_hw_addr {
        s.wrappers
            .push(Box::new(VirtualMac::new(netlink.clone(), cfg.lan.clone(), hw)));
    }
    if let Some(addr) = cfg.lan_addr {
        s.wrappers.push(Box::new(Ip {
            netlink: netlink.clone(),
            link: cfg.lan.clone(),
            addr,
        }));
    }
    if let (Some(hw), Some(addr)) = (cfg.lan_hw_addr, cfg.lan_addr) {
        if let IpAddr::V4(ip) = addr.ip {
            s.wrappers.push(Box::new(GratuitousArp {
                link: cfg.lan.clone(),
                hw_addr: hw,
                ip,
            }));
        }
    }
    s
}

/// The uplink-side suite. Mirrors the LAN contributions, except that a
/// virtual MAC without a static address enables the DHCP active in place of
/// the IP and ARP wrappers.
pub fn uplink_suite(cfg: &GatewayConfig, netlink: &Netlink) -> Suite {
    let mut s = Suite::new();
    s.wrappers.push(Box::new(Up {
        netlink: netlink.clone(),
        link: cfg.uplink.clone(),
    }));
    if let Some(hw) = cfg.uplink_hw_addr {
        s.wrappers.push(Box::new(VirtualMac::new(
            netlink.clone(),
            cfg.uplink.clone(),
            hw,
        )));
    }
    match (cfg.uplink_hw_addr, cfg.uplink_addr) {
        (hw, Some(addr)) => {
            s.wrappers.push(Box::new(Ip {
                netlink: netlink.clone(),
                link: cfg.uplink.clone(),
                addr,
            }));
            if let (Some(hw), IpAddr::V4(ip)) = (hw, addr.ip) {
                s.wrappers.push(Box::new(GratuitousArp {
                    link: cfg.uplink.clone(),
                    hw_addr: hw,
                    ip,
                }));
            }
        }
        (Some(hw), None) => {
            s.actives.push(Box::new(dhcp::VAddr {
                hw_addr: hw,
                link: cfg.uplink.clone(),
                netlink: netlink.clone(),
                lease_store: cfg.uplink_lease_store.clone(),
            }));
        }
        (None, None) => {}
    }
    s
}

fn build_suite(cfg: &GatewayConfig, netlink: &Netlink) -> Suite {
    Suite::join([lan_suite(cfg, netlink), uplink_suite(cfg, netlink)])
}

/// Runs a suite to completion, keeping wrapper-only suites resident until
/// cancellation.
async fn run_resident(mut suite: Suite, token: &CancellationToken) -> anyhow::Result<()> {
    if !suite.has_actives() {
        suite.actives.push(Box::new(Hold));
    }
    suite.run(token).await
}

/// HA member wrapping the gateway suite: leading runs the suite; following
/// holds no addresses and just waits out the term.
pub struct SuiteMember {
    config: Arc<GatewayConfig>,
    netlink: Netlink,
}

impl fmt::Debug for SuiteMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuiteMember").finish()
    }
}

#[async_trait]
impl Leader for SuiteMember {
    async fn lead(
        &self,
        token: CancellationToken,
        _is_lease_acceptable: Option<LeaseCheck>,
    ) -> anyhow::Result<()> {
        info!("leading; bringing up gateway identity");
        run_resident(build_suite(&self.config, &self.netlink), &token).await
    }
}

#[async_trait]
impl Follower for SuiteMember {
    async fn follow(&self, token: CancellationToken, leader: &str) -> anyhow::Result<()> {
        info!(%leader, "following; gateway identity stays down");
        token.cancelled().await;
        Err(Canceled.into())
    }
}

/// Top-level orchestration.
#[derive(Debug)]
pub struct Gateway {
    pub config: GatewayConfig,
    pub netlink: Netlink,
    pub iptables_bin: PathBuf,
}

impl Gateway {
    /// Applies the firewall once and runs the gateway suite (under HA when
    /// configured) until a terminal condition. Clean cancellation is `Ok`.
    pub async fn run(self, token: &CancellationToken) -> anyhow::Result<()> {
        let Gateway {
            config,
            netlink,
            iptables_bin,
        } = self;
        let config = Arc::new(config);

        let (group, child) = TaskGroup::new(token);

        {
            let config = Arc::clone(&config);
            let t = child.clone();
            group.spawn(async move {
                tokio::select! {
                    _ = t.cancelled() => Err(Canceled.into()),
                    res = tokio::time::timeout(
                        FW_APPLY_TIMEOUT,
                        fw::apply(&iptables_bin, config.as_ref()),
                    ) => {
                        res.context("firewall application timed out")??;
                        debug!("firewall rules in place");
                        Ok(())
                    }
                }
            });
        }

        {
            let config = Arc::clone(&config);
            let netlink = netlink.clone();
            let t = child.clone();
            group.spawn(async move { run_gateway_suite(config, netlink, t).await });
        }

        task::ok_if_canceled(group.wait().await)
    }
}

async fn run_gateway_suite(
    config: Arc<GatewayConfig>,
    netlink: Netlink,
    token: CancellationToken,
) -> anyhow::Result<()> {
    match config.ha_coordinator.clone() {
        Some(coordinator) => {
            let member = Arc::new(SuiteMember {
                config: Arc::clone(&config),
                netlink,
            });
            let group = Arc::new(MemberGroup::new());
            group.add(member as Arc<dyn Member>).await;
            coordinator.run(token, group as Arc<dyn Member>).await
        }
        None => run_resident(build_suite(&config, &netlink), &token).await,
    }
}
