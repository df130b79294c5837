//! # DHCP client
//!
//! Maintains a valid lease for a virtual MAC on the uplink for as long as the
//! owning suite is alive. While a lease is held, the leased IP, the default
//! route through the leased gateway, and a gratuitous-ARP announcement are
//! kept in place.
//!
//! Releases are deliberately never issued: a stable virtual MAC makes the
//! leased IP a function of identity, so floating over on failover works even
//! without release.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pnet::util::MacAddr;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fw::{Addr, Link};
use crate::metrics;
use crate::netlink::Netlink;
use crate::task::Canceled;

use super::util::{DefaultRoute, GratuitousArp, Ip};
use super::{Active, Suite, SuiteWrappers};

mod lease;
mod net;

pub use self::lease::{Lease, LeaseStore};

use self::lease::{lease_from_exchange, reusable_binding};
use self::net::DhcpSocket;

#[derive(Debug, Error)]
pub enum DhcpError {
    #[error("could not create dhcp client socket: {0}")]
    Socket(#[source] std::io::Error),
    #[error("could not encode dhcp message: {0}")]
    Encode(String),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("server NAKed the request")]
    Nak,
    #[error("no offered {field}")]
    MissingField { field: &'static str },
    #[error("got subnet mask that is not contiguous: {0}")]
    BadSubnetMask(Ipv4Addr),
    #[error("could not get unexpired lease; last lease seen: {last:?}")]
    NoUnexpiredLease { last: Option<Lease> },
}

/// Client states, for the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Acquiring,
    Bound,
    Renewing,
    Rebinding,
    Expiring,
}

/// The DHCP-maintained virtual address: an [`Active`] that acquires a lease
/// under `hw_addr` on `link` and keeps the binding live until cancellation.
#[derive(Debug)]
pub struct VAddr {
    pub hw_addr: MacAddr,
    pub link: Link,
    pub netlink: Netlink,
    pub lease_store: Option<Arc<dyn LeaseStore>>,
}

/// The started wrapper sub-suite for one lease.
struct Binding {
    wrappers: Option<SuiteWrappers>,
}

impl Binding {
    fn none() -> Self {
        Binding { wrappers: None }
    }

    async fn release(&mut self) -> anyhow::Result<()> {
        match self.wrappers.take() {
            Some(mut w) => w.stop().await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Active for VAddr {
    async fn run(self: Box<Self>, token: CancellationToken) -> anyhow::Result<()> {
        let sock = DhcpSocket::bind(&self.link, self.hw_addr)?;
        let mut binding = Binding::none();
        let mut cur: Option<Lease> = None;

        let res = self.run_machine(&token, &sock, &mut binding, &mut cur).await;

        // The sub-suite release is part of this active's teardown; errors are
        // logged, not surfaced over the machine's own result.
        if let Err(err) = binding.release().await {
            warn!(?err, link = %self.link, "error releasing dhcp binding");
        }
        res
    }
}

impl VAddr {
    async fn run_machine(
        &self,
        token: &CancellationToken,
        sock: &DhcpSocket,
        binding: &mut Binding,
        cur: &mut Option<Lease>,
    ) -> anyhow::Result<()> {
        loop {
            debug!(state = ?State::Acquiring, link = %self.link, "acquiring lease");
            let lease = tokio::select! {
                _ = token.cancelled() => return Err(Canceled.into()),
                res = self.get_lease(sock) => res?,
            };
            metrics::DHCP_LEASES_ACQUIRED.inc();
            info!(
                ip = %lease.leased_ip,
                gw = %lease.gateway_ip,
                expires = %lease.expires_at(),
                "lease acquired"
            );

            let mut lease = self.maybe_bind(binding, cur, lease).await?;

            loop {
                debug!(state = ?State::Bound, renew_at = %lease.renew_at(), "lease bound");
                self.hold_bound(token, &lease).await?;

                debug!(state = ?State::Renewing, until = %lease.rebind_at(), "renewing lease");
                if let Some(renewed) = tokio::select! {
                    _ = token.cancelled() => return Err(Canceled.into()),
                    renewed = self.renew_loop(sock, &lease, lease.rebind_at(), false) => renewed,
                } {
                    metrics::DHCP_LEASE_RENEWALS.inc();
                    lease = self.maybe_bind(binding, cur, renewed).await?;
                    continue;
                }

                debug!(state = ?State::Rebinding, until = %lease.expires_at(), "rebinding lease");
                if let Some(rebound) = tokio::select! {
                    _ = token.cancelled() => return Err(Canceled.into()),
                    rebound = self.renew_loop(sock, &lease, lease.expires_at(), true) => rebound,
                } {
                    metrics::DHCP_LEASE_REBINDS.inc();
                    lease = self.maybe_bind(binding, cur, rebound).await?;
                    continue;
                }

                debug!(state = ?State::Expiring, ip = %lease.leased_ip, "lease expired");
                metrics::DHCP_LEASES_EXPIRED.inc();
                warn!(ip = %lease.leased_ip, "lease expired without renewal; reacquiring");
                if let Err(err) = binding.release().await {
                    warn!(?err, "error releasing expired binding");
                }
                *cur = None;
                break;
            }
        }
    }

    /// Races an active DHCP exchange against the lease store. The first
    /// result still ahead of its renew time wins; expired results are
    /// discarded. A fresh network result is preferred over a stored one that
    /// arrives later.
    async fn get_lease(&self, sock: &DhcpSocket) -> anyhow::Result<Lease> {
        let network = async {
            let (offer, ack) = sock.request_lease().await?;
            Ok::<_, anyhow::Error>(lease_from_exchange(Some(&offer), &ack, Utc::now())?)
        };
        let store = async {
            match &self.lease_store {
                Some(store) => store.get().await.context("lease store get failed"),
                None => std::future::pending().await,
            }
        };
        tokio::pin!(network);
        tokio::pin!(store);

        let mut network_done = false;
        let mut store_done = self.lease_store.is_none();
        let mut last: Option<Lease> = None;

        while !(network_done && store_done) {
            let lease = tokio::select! {
                res = &mut network, if !network_done => {
                    network_done = true;
                    res?
                }
                res = &mut store, if !store_done => {
                    store_done = true;
                    res?
                }
            };
            if lease.is_current(Utc::now()) {
                return Ok(lease);
            }
            debug!(ip = %lease.leased_ip, start = %lease.start_time, "discarding expired lease");
            last = Some(lease);
        }

        Err(DhcpError::NoUnexpiredLease { last }.into())
    }

    /// Re-uses the current binding when the new lease matches it; otherwise
    /// stops the old sub-suite and starts a fresh one built from the new
    /// lease. Returns the lease the binding now reflects.
    async fn maybe_bind(
        &self,
        binding: &mut Binding,
        cur: &mut Option<Lease>,
        new: Lease,
    ) -> anyhow::Result<Lease> {
        if let Some(c) = cur.as_ref() {
            if reusable_binding(c, &new) {
                debug!(ip = %c.leased_ip, "new lease matches current binding; re-using");
                return Ok(c.clone());
            }
        }

        if let Err(err) = binding.release().await {
            warn!(?err, "error releasing previous binding");
        }
        *cur = None;

        let (mut wrappers, _) = self.binding_suite(&new).split();
        wrappers.start().await.context("could not apply lease")?;
        binding.wrappers = Some(wrappers);
        *cur = Some(new.clone());
        Ok(new)
    }

    fn binding_suite(&self, lease: &Lease) -> Suite {
        Suite {
            wrappers: vec![
                Box::new(Ip {
                    netlink: self.netlink.clone(),
                    link: self.link.clone(),
                    addr: Addr::new(lease.leased_ip.into(), lease.subnet_mask),
                }),
                Box::new(DefaultRoute {
                    netlink: self.netlink.clone(),
                    link: self.link.clone(),
                    gw: lease.gateway_ip,
                }),
                Box::new(GratuitousArp {
                    link: self.link.clone(),
                    hw_addr: self.hw_addr,
                    ip: lease.leased_ip,
                }),
            ],
            actives: vec![],
        }
    }

    /// Holds the lease until its renew time. The lease is written to the
    /// store concurrently; a store failure is fatal to the held lease.
    async fn hold_bound(&self, token: &CancellationToken, lease: &Lease) -> anyhow::Result<()> {
        let put = async {
            match &self.lease_store {
                Some(store) => store.put(lease).await.context("lease store put failed"),
                None => std::future::pending().await,
            }
        };
        tokio::pin!(put);
        let mut put_done = self.lease_store.is_none();

        let sleep = sleep_until(lease.renew_at());
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = token.cancelled() => return Err(Canceled.into()),
                _ = &mut sleep => return Ok(()),
                res = &mut put, if !put_done => {
                    res?;
                    put_done = true;
                    debug!(ip = %lease.leased_ip, "lease persisted");
                }
            }
        }
    }

    /// Attempts renewal until `deadline`: unicast to the leasing server, or
    /// broadcast while rebinding. Returns `None` once the deadline passes.
    async fn renew_loop(
        &self,
        sock: &DhcpSocket,
        lease: &Lease,
        deadline: DateTime<Utc>,
        broadcast: bool,
    ) -> Option<Lease> {
        let expired = sleep_until(deadline);
        tokio::pin!(expired);

        loop {
            let attempt = async {
                let ack = sock
                    .request_renew(lease.leased_ip, lease.server_ip, broadcast)
                    .await?;
                Ok::<_, anyhow::Error>(lease_from_exchange(None, &ack, Utc::now())?)
            };

            tokio::select! {
                _ = &mut expired => return None,
                res = attempt => match res {
                    Ok(renewed) => return Some(renewed),
                    Err(err) => {
                        debug!(?err, broadcast, "renew attempt failed; retrying");
                        tokio::select! {
                            _ = &mut expired => return None,
                            _ = tokio::time::sleep(RENEW_RETRY_DELAY) => {}
                        }
                    }
                },
            }
        }
    }
}

const RENEW_RETRY_DELAY: Duration = Duration::from_secs(10);

async fn sleep_until(t: DateTime<Utc>) {
    loop {
        let now = Utc::now();
        if t <= now {
            return;
        }
        // Re-check after long sleeps so wall-clock adjustments can't leave us
        // sleeping past the deadline's intent.
        let remaining = (t - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(Duration::from_secs(3600));
        tokio::time::sleep(remaining).await;
    }
}
