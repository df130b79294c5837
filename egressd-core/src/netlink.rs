//! Thin client over the kernel's rtnetlink control plane.
//!
//! One connection task is spawned per [`Netlink`]; handles are cheap clones.
//! Benign outcomes ("already exists" on address add, "no such entry" on route
//! delete) are recognized here and converted to success so callers see the
//! intended state, not the syscall detail.

use std::net::{IpAddr, Ipv4Addr};

use futures::TryStreamExt;
use pnet::util::MacAddr;
use rtnetlink::packet_route::address::AddressAttribute;
use rtnetlink::packet_route::link::{LinkAttribute, LinkMessage};
use rtnetlink::{Handle, LinkUnspec, RouteMessageBuilder};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum NetlinkError {
    #[error("could not open netlink connection: {0}")]
    Connect(#[source] std::io::Error),
    #[error("failed to get link {0:?}: link not found")]
    LinkNotFound(String),
    #[error("link {link:?} has no hardware address")]
    NoHardwareAddr { link: String },
    #[error("{op} failed for link {link:?}: {source}")]
    Op {
        op: &'static str,
        link: String,
        #[source]
        source: rtnetlink::Error,
    },
}

/// A handle to the kernel's routing netlink socket.
#[derive(Debug, Clone)]
pub struct Netlink {
    handle: Handle,
}

impl Netlink {
    /// Opens a netlink connection and spawns its IO task onto the current
    /// runtime.
    pub fn new() -> Result<Self, NetlinkError> {
        let (conn, handle, _) = rtnetlink::new_connection().map_err(NetlinkError::Connect)?;
        tokio::spawn(conn);
        Ok(Netlink { handle })
    }

    async fn link_by_name(&self, name: &str) -> Result<LinkMessage, NetlinkError> {
        self.handle
            .link()
            .get()
            .match_name(name.to_owned())
            .execute()
            .try_next()
            .await
            .map_err(|source| self.op_err("link get", name, source))?
            .ok_or_else(|| NetlinkError::LinkNotFound(name.to_owned()))
    }

    /// The kernel interface index for `name`.
    pub async fn link_index(&self, name: &str) -> Result<u32, NetlinkError> {
        Ok(self.link_by_name(name).await?.header.index)
    }

    /// The link's current hardware address.
    pub async fn link_hw_addr(&self, name: &str) -> Result<MacAddr, NetlinkError> {
        let msg = self.link_by_name(name).await?;
        for attr in &msg.attributes {
            if let LinkAttribute::Address(bytes) = attr {
                if let [a, b, c, d, e, f] = bytes[..] {
                    return Ok(MacAddr::new(a, b, c, d, e, f));
                }
            }
        }
        Err(NetlinkError::NoHardwareAddr {
            link: name.to_owned(),
        })
    }

    pub async fn link_set_up(&self, name: &str) -> Result<(), NetlinkError> {
        let index = self.link_index(name).await?;
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).up().build())
            .execute()
            .await
            .map_err(|source| self.op_err("link up", name, source))
    }

    pub async fn link_set_down(&self, name: &str) -> Result<(), NetlinkError> {
        let index = self.link_index(name).await?;
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).down().build())
            .execute()
            .await
            .map_err(|source| self.op_err("link down", name, source))
    }

    pub async fn link_set_hw_addr(&self, name: &str, addr: MacAddr) -> Result<(), NetlinkError> {
        let index = self.link_index(name).await?;
        self.handle
            .link()
            .set(
                LinkUnspec::new_with_index(index)
                    .address(addr.octets().to_vec())
                    .build(),
            )
            .execute()
            .await
            .map_err(|source| self.op_err("link set address", name, source))
    }

    /// Adds `ip/prefix` to the link. "Already exists" is success.
    pub async fn addr_add(&self, name: &str, ip: IpAddr, prefix: u8) -> Result<(), NetlinkError> {
        let index = self.link_index(name).await?;
        match self.handle.address().add(index, ip, prefix).execute().await {
            Ok(()) => Ok(()),
            Err(err) if is_errno(&err, libc::EEXIST) => {
                debug!(link = name, %ip, prefix, "address already present");
                Ok(())
            }
            Err(source) => Err(self.op_err("address add", name, source)),
        }
    }

    /// Removes `ip/prefix` from the link. An address that is already gone is
    /// success.
    pub async fn addr_del(&self, name: &str, ip: IpAddr, prefix: u8) -> Result<(), NetlinkError> {
        let index = self.link_index(name).await?;
        let mut addrs = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        while let Some(msg) = addrs
            .try_next()
            .await
            .map_err(|source| self.op_err("address get", name, source))?
        {
            if msg.header.prefix_len != prefix {
                continue;
            }
            let matches = msg.attributes.iter().any(|attr| {
                matches!(attr,
                    AddressAttribute::Address(a) | AddressAttribute::Local(a) if *a == ip)
            });
            if !matches {
                continue;
            }
            return match self.handle.address().del(msg).execute().await {
                Ok(()) => Ok(()),
                Err(err) if is_errno(&err, libc::EADDRNOTAVAIL) => Ok(()),
                Err(source) => Err(self.op_err("address del", name, source)),
            };
        }
        debug!(link = name, %ip, prefix, "address not present; nothing to delete");
        Ok(())
    }

    /// Installs the default route via `gw` on the link, replacing any existing
    /// default route.
    pub async fn route_add_default(&self, name: &str, gw: Ipv4Addr) -> Result<(), NetlinkError> {
        let index = self.link_index(name).await?;
        let route = RouteMessageBuilder::<Ipv4Addr>::new()
            .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
            .gateway(gw)
            .output_interface(index)
            .build();
        match self.handle.route().add(route).execute().await {
            Ok(()) => Ok(()),
            Err(err) if is_errno(&err, libc::EEXIST) => {
                let route = RouteMessageBuilder::<Ipv4Addr>::new()
                    .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
                    .gateway(gw)
                    .output_interface(index)
                    .build();
                self.handle
                    .route()
                    .add(route)
                    .replace()
                    .execute()
                    .await
                    .map_err(|source| self.op_err("route replace", name, source))
            }
            Err(source) => Err(self.op_err("route add", name, source)),
        }
    }

    /// Removes the default route via `gw`. "No such entry" is success.
    pub async fn route_del_default(&self, name: &str, gw: Ipv4Addr) -> Result<(), NetlinkError> {
        let index = self.link_index(name).await?;
        let route = RouteMessageBuilder::<Ipv4Addr>::new()
            .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
            .gateway(gw)
            .output_interface(index)
            .build();
        match self.handle.route().del(route).execute().await {
            Ok(()) => Ok(()),
            Err(err) if is_errno(&err, libc::ESRCH) || is_errno(&err, libc::ENOENT) => {
                debug!(link = name, %gw, "default route not present; nothing to delete");
                Ok(())
            }
            Err(source) => Err(self.op_err("route del", name, source)),
        }
    }

    fn op_err(&self, op: &'static str, link: &str, source: rtnetlink::Error) -> NetlinkError {
        NetlinkError::Op {
            op,
            link: link.to_owned(),
            source,
        }
    }
}

fn is_errno(err: &rtnetlink::Error, errno: i32) -> bool {
    matches!(err, rtnetlink::Error::NetlinkError(e) if e.raw_code() == -errno)
}
