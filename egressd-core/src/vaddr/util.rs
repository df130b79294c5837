//! Link-level wrappers: admin state, virtual MAC, addresses, the default
//! route, and gratuitous ARP announcements.

use std::net::Ipv4Addr;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use pnet::datalink::{self, Channel};
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet::util::MacAddr;
use tracing::{debug, warn};

use crate::fw::{Addr, Link};
use crate::netlink::Netlink;

use super::Wrapper;

/// Brings the link administratively up, and back down on release.
#[derive(Debug)]
pub struct Up {
    pub netlink: Netlink,
    pub link: Link,
}

#[async_trait]
impl Wrapper for Up {
    async fn start(&mut self) -> anyhow::Result<()> {
        self.netlink.link_set_up(self.link.name()).await?;
        debug!(link = %self.link, "link up");
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        self.netlink.link_set_down(self.link.name()).await?;
        debug!(link = %self.link, "link down");
        Ok(())
    }
}

/// Applies the consistent MAC address to the device and saves the original
/// for restoration on release.
#[derive(Debug)]
pub struct VirtualMac {
    pub netlink: Netlink,
    pub link: Link,
    pub addr: MacAddr,

    original_addr: Option<MacAddr>,
}

impl VirtualMac {
    pub fn new(netlink: Netlink, link: Link, addr: MacAddr) -> Self {
        VirtualMac {
            netlink,
            link,
            addr,
            original_addr: None,
        }
    }
}

#[async_trait]
impl Wrapper for VirtualMac {
    async fn start(&mut self) -> anyhow::Result<()> {
        let current = self.netlink.link_hw_addr(self.link.name()).await?;
        self.original_addr = Some(current);
        if current == self.addr {
            warn!(
                link = %self.link,
                addr = %self.addr,
                "link already had MAC address (setting it anyway...)"
            );
        }

        self.netlink
            .link_set_hw_addr(self.link.name(), self.addr)
            .await
            .with_context(|| format!("failed to set link {:?} MAC address {}", self.link.name(), self.addr))?;
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(original) = self.original_addr {
            self.netlink
                .link_set_hw_addr(self.link.name(), original)
                .await
                .with_context(|| {
                    format!(
                        "failed to set link {:?} MAC address {}",
                        self.link.name(),
                        original
                    )
                })?;
        }
        Ok(())
    }
}

/// Adds an IP to the link. An address that already exists is success.
#[derive(Debug)]
pub struct Ip {
    pub netlink: Netlink,
    pub link: Link,
    pub addr: Addr,
}

#[async_trait]
impl Wrapper for Ip {
    async fn start(&mut self) -> anyhow::Result<()> {
        self.netlink
            .addr_add(self.link.name(), self.addr.ip, self.addr.prefix)
            .await?;
        debug!(link = %self.link, addr = %self.addr, "address added");
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        self.netlink
            .addr_del(self.link.name(), self.addr.ip, self.addr.prefix)
            .await?;
        Ok(())
    }
}

/// Installs the default route through a gateway, replacing a pre-existing
/// default route. Removal treats "no such entry" as success.
#[derive(Debug)]
pub struct DefaultRoute {
    pub netlink: Netlink,
    pub link: Link,
    pub gw: Ipv4Addr,
}

#[async_trait]
impl Wrapper for DefaultRoute {
    async fn start(&mut self) -> anyhow::Result<()> {
        self.netlink
            .route_add_default(self.link.name(), self.gw)
            .await?;
        debug!(link = %self.link, gw = %self.gw, "default route installed");
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        self.netlink
            .route_del_default(self.link.name(), self.gw)
            .await?;
        Ok(())
    }
}

/// Sends out a gratuitous ARP to speed up failover resolution. Release is a
/// no-op since we only announce when bringing up a vaddr.
#[derive(Debug)]
pub struct GratuitousArp {
    pub link: Link,
    pub hw_addr: MacAddr,
    pub ip: Ipv4Addr,
}

#[async_trait]
impl Wrapper for GratuitousArp {
    async fn start(&mut self) -> anyhow::Result<()> {
        send_gratuitous_arp(&self.link, self.hw_addr, self.ip)?;
        debug!(link = %self.link, ip = %self.ip, hw = %self.hw_addr, "gratuitous ARP sent");
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

const ETHERNET_HEADER_LEN: usize = 14;
const ARP_PACKET_LEN: usize = 28;

fn send_gratuitous_arp(link: &Link, hw_addr: MacAddr, ip: Ipv4Addr) -> anyhow::Result<()> {
    let interface = datalink::interfaces()
        .into_iter()
        .find(|i| i.name == link.name())
        .ok_or_else(|| anyhow!("could not get interface {:?}", link.name()))?;

    let mut tx = match datalink::channel(&interface, datalink::Config::default())
        .with_context(|| format!("could not get ARP channel on {:?}", link.name()))?
    {
        Channel::Ethernet(tx, _rx) => tx,
        _ => bail!("unsupported channel type for interface {:?}", link.name()),
    };

    let mut buf = [0u8; ETHERNET_HEADER_LEN + ARP_PACKET_LEN];
    {
        let mut eth = MutableEthernetPacket::new(&mut buf)
            .ok_or_else(|| anyhow!("could not construct ethernet frame"))?;
        eth.set_destination(MacAddr::broadcast());
        eth.set_source(hw_addr);
        eth.set_ethertype(EtherTypes::Arp);
    }
    {
        let mut arp = MutableArpPacket::new(&mut buf[ETHERNET_HEADER_LEN..])
            .ok_or_else(|| anyhow!("could not construct gratuitous ARP request"))?;
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Request);
        arp.set_sender_hw_addr(hw_addr);
        arp.set_sender_proto_addr(ip);
        arp.set_target_hw_addr(MacAddr::broadcast());
        arp.set_target_proto_addr(ip);
    }

    match tx.send_to(&buf, None) {
        Some(Ok(())) => Ok(()),
        Some(Err(err)) => {
            Err(anyhow::Error::new(err).context("could not write gratuitous ARP request"))
        }
        None => bail!("could not write gratuitous ARP request"),
    }
}
