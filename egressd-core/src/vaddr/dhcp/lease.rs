//! Lease data model and the offer/ACK field merge.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dhcproto::v4;
use tracing::warn;

use super::DhcpError;

/// A DHCP assignment with associated timings.
///
/// Invariant: `renew_after <= rebind_after <= duration`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub leased_ip: Ipv4Addr,
    pub subnet_mask: u8,
    pub gateway_ip: Ipv4Addr,
    pub server_ip: Ipv4Addr,

    pub start_time: DateTime<Utc>,
    pub duration: Duration,
    pub renew_after: Duration,
    pub rebind_after: Duration,
}

impl Default for Lease {
    /// The empty lease: all-zero addresses, started at the epoch with no
    /// duration. It will never pass [`Lease::is_current`].
    fn default() -> Self {
        Lease {
            leased_ip: Ipv4Addr::UNSPECIFIED,
            subnet_mask: 0,
            gateway_ip: Ipv4Addr::UNSPECIFIED,
            server_ip: Ipv4Addr::UNSPECIFIED,
            start_time: DateTime::UNIX_EPOCH,
            duration: Duration::ZERO,
            renew_after: Duration::ZERO,
            rebind_after: Duration::ZERO,
        }
    }
}

const DEFAULT_LEASE_TIME: Duration = Duration::from_secs(24 * 60 * 60);

fn default_renew(d: Duration) -> Duration {
    d / 2
}

fn default_rebind(d: Duration) -> Duration {
    d * 9 / 10
}

impl Lease {
    pub fn renew_at(&self) -> DateTime<Utc> {
        at(self.start_time, self.renew_after)
    }

    pub fn rebind_at(&self) -> DateTime<Utc> {
        at(self.start_time, self.rebind_after)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        at(self.start_time, self.duration)
    }

    /// A lease is current while it has not yet entered its renew phase. This
    /// is the filter applied to every result of the acquisition race: leases
    /// already due for renewal are discarded so a stored lease can't race a
    /// fresh request in a loop until it actually expires.
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.renew_at() > now
    }
}

fn at(start: DateTime<Utc>, offset: Duration) -> DateTime<Utc> {
    match chrono::Duration::from_std(offset) {
        Ok(d) => start + d,
        Err(_) => DateTime::<Utc>::MAX_UTC,
    }
}

/// Persists leases so a replacement process (or replica) can skip the initial
/// DHCP round-trip. A store with nothing saved yields the empty lease, not an
/// error.
#[async_trait]
pub trait LeaseStore: Send + Sync + fmt::Debug {
    async fn get(&self) -> anyhow::Result<Lease>;
    async fn put(&self, lease: &Lease) -> anyhow::Result<()>;
}

/// Whether the binding built for `cur` can be kept when `new` arrives: same
/// address parameters and the current lease is the fresher of the two.
pub(super) fn reusable_binding(cur: &Lease, new: &Lease) -> bool {
    cur.leased_ip == new.leased_ip
        && cur.subnet_mask == new.subnet_mask
        && cur.gateway_ip == new.gateway_ip
        && cur.start_time > new.start_time
}

/// The lease-relevant fields of a single DHCP message.
#[derive(Debug, Clone, Copy, Default)]
struct LeaseFields {
    leased_ip: Option<Ipv4Addr>,
    subnet_mask: Option<u8>,
    gateway_ip: Option<Ipv4Addr>,
    server_ip: Option<Ipv4Addr>,
    lease_time: Option<u32>,
    renewal_time: Option<u32>,
    rebinding_time: Option<u32>,
}

fn extract_fields(msg: &v4::Message) -> Result<LeaseFields, DhcpError> {
    let mut f = LeaseFields {
        leased_ip: specified(msg.yiaddr()),
        ..Default::default()
    };

    if let Some(v4::DhcpOption::SubnetMask(mask)) = msg.opts().get(v4::OptionCode::SubnetMask) {
        f.subnet_mask = Some(mask_len(*mask)?);
    }
    // The router option is authoritative for the gateway; the relay field is
    // only a fallback for servers that leave it unset.
    if let Some(v4::DhcpOption::Router(routers)) = msg.opts().get(v4::OptionCode::Router) {
        f.gateway_ip = routers.first().copied().and_then(specified);
    }
    if f.gateway_ip.is_none() {
        f.gateway_ip = specified(msg.giaddr());
    }
    if let Some(v4::DhcpOption::ServerIdentifier(ip)) =
        msg.opts().get(v4::OptionCode::ServerIdentifier)
    {
        f.server_ip = specified(*ip);
    }
    if f.server_ip.is_none() {
        f.server_ip = specified(msg.siaddr());
    }
    if let Some(v4::DhcpOption::AddressLeaseTime(secs)) =
        msg.opts().get(v4::OptionCode::AddressLeaseTime)
    {
        f.lease_time = nonzero(*secs);
    }
    if let Some(v4::DhcpOption::Renewal(secs)) = msg.opts().get(v4::OptionCode::Renewal) {
        f.renewal_time = nonzero(*secs);
    }
    if let Some(v4::DhcpOption::Rebinding(secs)) = msg.opts().get(v4::OptionCode::Rebinding) {
        f.rebinding_time = nonzero(*secs);
    }
    Ok(f)
}

fn specified(ip: Ipv4Addr) -> Option<Ipv4Addr> {
    (!ip.is_unspecified()).then_some(ip)
}

fn nonzero(secs: u32) -> Option<u32> {
    (secs != 0).then_some(secs)
}

fn mask_len(mask: Ipv4Addr) -> Result<u8, DhcpError> {
    let bits = u32::from(mask);
    if bits.count_ones() != bits.leading_ones() {
        return Err(DhcpError::BadSubnetMask(mask));
    }
    Ok(bits.count_ones() as u8)
}

/// For each field: if offer and ACK agree, use it; if one side is absent, use
/// the other and warn; if they differ, use the ACK and warn.
fn merge<T: PartialEq + Copy + fmt::Display>(
    name: &str,
    offer: Option<T>,
    ack: Option<T>,
) -> Option<T> {
    match (offer, ack) {
        (None, None) => None,
        (Some(o), Some(a)) if o == a => Some(a),
        (None, Some(a)) => {
            warn!("offer had no {name}; using {name} from ack");
            Some(a)
        }
        (Some(o), None) => {
            warn!("ack had no {name}; using {name} from offer");
            Some(o)
        }
        (Some(o), Some(a)) => {
            warn!("offer and ack {name}s differed (offer={o}, ack={a}); using {name} from ack");
            Some(a)
        }
    }
}

/// Builds a [`Lease`] from a DISCOVER/OFFER/REQUEST/ACK exchange (or from a
/// lone renewal ACK), started at `now`.
pub(super) fn lease_from_exchange(
    offer: Option<&v4::Message>,
    ack: &v4::Message,
    now: DateTime<Utc>,
) -> Result<Lease, DhcpError> {
    let ack_fields = extract_fields(ack)?;
    let offer_fields = match offer {
        Some(offer) => extract_fields(offer)?,
        // A renewal has no offer leg; merging the ACK with itself keeps one
        // code path without spurious warnings.
        None => ack_fields,
    };

    let leased_ip = merge("lease IP", offer_fields.leased_ip, ack_fields.leased_ip)
        .ok_or(DhcpError::MissingField { field: "lease IP" })?;
    let subnet_mask = merge(
        "subnet mask",
        offer_fields.subnet_mask,
        ack_fields.subnet_mask,
    )
    .ok_or(DhcpError::MissingField {
        field: "subnet mask",
    })?;
    let server_ip = merge("server IP", offer_fields.server_ip, ack_fields.server_ip).ok_or(
        DhcpError::MissingField {
            field: "server IP",
        },
    )?;
    // The gateway defaults to the server when nothing announces a router.
    let gateway_ip =
        merge("gateway IP", offer_fields.gateway_ip, ack_fields.gateway_ip).unwrap_or(server_ip);

    let duration = merge("lease time", offer_fields.lease_time, ack_fields.lease_time)
        .map(|secs| Duration::from_secs(secs.into()))
        .unwrap_or(DEFAULT_LEASE_TIME);
    let renew_after = merge(
        "renewal time",
        offer_fields.renewal_time,
        ack_fields.renewal_time,
    )
    .map(|secs| Duration::from_secs(secs.into()))
    .unwrap_or_else(|| default_renew(duration));
    let rebind_after = merge(
        "rebinding time",
        offer_fields.rebinding_time,
        ack_fields.rebinding_time,
    )
    .map(|secs| Duration::from_secs(secs.into()))
    .unwrap_or_else(|| default_rebind(duration));

    let mut lease = Lease {
        leased_ip,
        subnet_mask,
        gateway_ip,
        server_ip,
        start_time: now,
        duration,
        renew_after,
        rebind_after,
    };
    clamp_times(&mut lease);
    Ok(lease)
}

fn clamp_times(lease: &mut Lease) {
    if lease.rebind_after > lease.duration {
        warn!(
            rebind_after = ?lease.rebind_after,
            duration = ?lease.duration,
            "rebinding time exceeds lease time; clamping"
        );
        lease.rebind_after = lease.duration;
    }
    if lease.renew_after > lease.rebind_after {
        warn!(
            renew_after = ?lease.renew_after,
            rebind_after = ?lease.rebind_after,
            "renewal time exceeds rebinding time; clamping"
        );
        lease.renew_after = lease.rebind_after;
    }
}
