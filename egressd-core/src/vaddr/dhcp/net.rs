//! DHCPv4 wire exchanges over a device-bound UDP socket.

use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::{FromRawFd, IntoRawFd};
use std::time::Duration;

use dhcproto::{v4, Decodable, Decoder, Encodable};
use pnet::util::MacAddr;
use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::fw::Link;

use super::DhcpError;

/// Per-attempt response wait.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause between failed attempts so a dead segment isn't hammered.
const RETRY_DELAY: Duration = Duration::from_secs(3);

const BROADCAST: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(Ipv4Addr::BROADCAST),
    v4::SERVER_PORT,
);

/// A DHCP client socket bound to the client port on one interface.
#[derive(Debug)]
pub(super) struct DhcpSocket {
    socket: UdpSocket,
    hw_addr: MacAddr,
}

impl DhcpSocket {
    pub(super) fn bind(link: &Link, hw_addr: MacAddr) -> Result<Self, DhcpError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, None).map_err(DhcpError::Socket)?;
        socket.set_nonblocking(true).map_err(DhcpError::Socket)?;
        socket.set_broadcast(true).map_err(DhcpError::Socket)?;
        socket
            .set_reuse_address(true)
            .map_err(DhcpError::Socket)?;
        socket
            .bind_device(Some(link.name().as_bytes()))
            .map_err(DhcpError::Socket)?;
        socket
            .bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, v4::CLIENT_PORT)).into())
            .map_err(DhcpError::Socket)?;

        let std_socket = unsafe { std::net::UdpSocket::from_raw_fd(socket.into_raw_fd()) };
        let socket = UdpSocket::from_std(std_socket).map_err(DhcpError::Socket)?;
        Ok(DhcpSocket { socket, hw_addr })
    }

    /// Ephemeral loopback socket; exercises everything but the privileged
    /// bind.
    #[cfg(test)]
    pub(super) fn bind_loopback(hw_addr: MacAddr) -> Self {
        let std_socket = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        std_socket.set_nonblocking(true).unwrap();
        DhcpSocket {
            socket: UdpSocket::from_std(std_socket).unwrap(),
            hw_addr,
        }
    }

    /// Runs a full DISCOVER/OFFER/REQUEST/ACK exchange, retrying forever.
    /// Callers bound the wait by dropping this future.
    pub(super) async fn request_lease(&self) -> Result<(v4::Message, v4::Message), DhcpError> {
        loop {
            let xid = rand::random();
            let offer = match self
                .exchange(&self.build_discover(xid), BROADCAST, v4::MessageType::Offer)
                .await
            {
                Ok(offer) => offer,
                Err(err) => {
                    debug!(?err, "no OFFER; retrying discovery");
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            };

            let offered_ip = offer.yiaddr();
            if offered_ip.is_unspecified() {
                warn!("offer missing yiaddr; restarting discovery");
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
            let server_id = extract_server_id(&offer);

            let ack = match self
                .exchange(
                    &self.build_request_selecting(offer.xid(), offered_ip, server_id),
                    BROADCAST,
                    v4::MessageType::Ack,
                )
                .await
            {
                Ok(ack) => ack,
                Err(DhcpError::Nak) => {
                    warn!(ip = %offered_ip, "server NAKed our request; restarting discovery");
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
                Err(err) => {
                    debug!(?err, "no ACK; restarting discovery");
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            };

            return Ok((offer, ack));
        }
    }

    /// One renewal attempt: a REQUEST carrying the leased IP, unicast to the
    /// server while renewing, broadcast while rebinding.
    pub(super) async fn request_renew(
        &self,
        leased_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
        broadcast: bool,
    ) -> Result<v4::Message, DhcpError> {
        let target = if broadcast {
            BROADCAST
        } else {
            SocketAddr::from((server_ip, v4::SERVER_PORT))
        };
        self.exchange(
            &self.build_request_renew(rand::random(), leased_ip),
            target,
            v4::MessageType::Ack,
        )
        .await
    }

    /// Sends `msg` and waits for a matching-xid reply of type `expect`. A NAK
    /// short-circuits with [`DhcpError::Nak`]; anything else is ignored until
    /// the attempt times out.
    async fn exchange(
        &self,
        msg: &v4::Message,
        target: SocketAddr,
        expect: v4::MessageType,
    ) -> Result<v4::Message, DhcpError> {
        let payload = msg.to_vec().map_err(|err| DhcpError::Encode(err.to_string()))?;
        self.socket
            .send_to(&payload, target)
            .await
            .map_err(DhcpError::Socket)?;
        trace!(xid = msg.xid(), ?target, ?expect, "request sent");

        let xid = msg.xid();
        tokio::time::timeout(EXCHANGE_TIMEOUT, self.recv_matching(xid, expect))
            .await
            .map_err(|_| DhcpError::Timeout(EXCHANGE_TIMEOUT))?
    }

    async fn recv_matching(
        &self,
        xid: u32,
        expect: v4::MessageType,
    ) -> Result<v4::Message, DhcpError> {
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, from) = self
                .socket
                .recv_from(&mut buf)
                .await
                .map_err(DhcpError::Socket)?;
            let msg = match v4::Message::decode(&mut Decoder::new(&buf[..len])) {
                Ok(msg) => msg,
                Err(err) => {
                    trace!(?err, %from, "ignoring undecodable datagram");
                    continue;
                }
            };
            if msg.xid() != xid {
                trace!(got = msg.xid(), want = xid, "ignoring reply with foreign xid");
                continue;
            }
            match msg.opts().msg_type() {
                Some(t) if t == expect => return Ok(msg),
                Some(v4::MessageType::Nak) => return Err(DhcpError::Nak),
                other => {
                    trace!(?other, "ignoring unexpected message type");
                    continue;
                }
            }
        }
    }

    fn new_message(&self, xid: u32, ciaddr: Ipv4Addr) -> v4::Message {
        let chaddr = self.hw_addr.octets();
        let mut msg = v4::Message::new_with_id(
            xid,
            ciaddr,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            &chaddr,
        );
        msg.opts_mut()
            .insert(v4::DhcpOption::ClientIdentifier(chaddr.to_vec()));
        msg
    }

    fn build_discover(&self, xid: u32) -> v4::Message {
        let mut msg = self.new_message(xid, Ipv4Addr::UNSPECIFIED);
        msg.set_flags(v4::Flags::default().set_broadcast());
        msg.opts_mut()
            .insert(v4::DhcpOption::MessageType(v4::MessageType::Discover));
        msg.opts_mut()
            .insert(v4::DhcpOption::ParameterRequestList(vec![
                v4::OptionCode::SubnetMask,
                v4::OptionCode::Router,
                v4::OptionCode::AddressLeaseTime,
                v4::OptionCode::Renewal,
                v4::OptionCode::Rebinding,
            ]));
        msg
    }

    fn build_request_selecting(
        &self,
        xid: u32,
        requested_ip: Ipv4Addr,
        server_id: Option<Ipv4Addr>,
    ) -> v4::Message {
        let mut msg = self.new_message(xid, Ipv4Addr::UNSPECIFIED);
        msg.set_flags(v4::Flags::default().set_broadcast());
        msg.opts_mut()
            .insert(v4::DhcpOption::MessageType(v4::MessageType::Request));
        msg.opts_mut()
            .insert(v4::DhcpOption::RequestedIpAddress(requested_ip));
        if let Some(server_id) = server_id {
            msg.opts_mut()
                .insert(v4::DhcpOption::ServerIdentifier(server_id));
        }
        msg
    }

    fn build_request_renew(&self, xid: u32, leased_ip: Ipv4Addr) -> v4::Message {
        let mut msg = self.new_message(xid, leased_ip);
        msg.opts_mut()
            .insert(v4::DhcpOption::MessageType(v4::MessageType::Request));
        msg
    }
}

fn extract_server_id(msg: &v4::Message) -> Option<Ipv4Addr> {
    if let Some(&v4::DhcpOption::ServerIdentifier(ip)) =
        msg.opts().get(v4::OptionCode::ServerIdentifier)
    {
        Some(ip)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket_for_test() -> DhcpSocket {
        DhcpSocket::bind_loopback(MacAddr::new(0xde, 0xad, 0xbe, 0xef, 0x00, 0x01))
    }

    #[tokio::test]
    async fn discover_has_broadcast_flag_and_prl() {
        let sock = socket_for_test();
        let msg = sock.build_discover(7);
        assert_eq!(msg.xid(), 7);
        assert!(msg.flags().broadcast());
        assert_eq!(
            msg.opts().msg_type(),
            Some(v4::MessageType::Discover)
        );
        assert!(msg.opts().get(v4::OptionCode::ParameterRequestList).is_some());
    }

    #[tokio::test]
    async fn renew_request_carries_ciaddr() {
        let sock = socket_for_test();
        let msg = sock.build_request_renew(9, Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(msg.ciaddr(), Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(msg.opts().msg_type(), Some(v4::MessageType::Request));
        assert!(msg.opts().get(v4::OptionCode::RequestedIpAddress).is_none());
    }

    #[tokio::test]
    async fn selecting_request_references_offer() {
        let sock = socket_for_test();
        let msg = sock.build_request_selecting(
            11,
            Ipv4Addr::new(10, 0, 0, 9),
            Some(Ipv4Addr::new(10, 0, 0, 1)),
        );
        assert!(matches!(
            msg.opts().get(v4::OptionCode::RequestedIpAddress),
            Some(&v4::DhcpOption::RequestedIpAddress(ip)) if ip == Ipv4Addr::new(10, 0, 0, 9)
        ));
        assert!(matches!(
            msg.opts().get(v4::OptionCode::ServerIdentifier),
            Some(&v4::DhcpOption::ServerIdentifier(ip)) if ip == Ipv4Addr::new(10, 0, 0, 1)
        ));
    }

    #[tokio::test]
    async fn exchange_round_trip_over_loopback() {
        let server = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = socket_for_test();

        let request = client.build_discover(42);
        let reply_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let req = v4::Message::decode(&mut Decoder::new(&buf[..len])).unwrap();
            let mut resp = req.clone();
            resp.set_yiaddr(Ipv4Addr::new(10, 0, 0, 50));
            resp.opts_mut()
                .insert(v4::DhcpOption::MessageType(v4::MessageType::Offer));
            server.send_to(&resp.to_vec().unwrap(), from).await.unwrap();
        });

        let offer = client
            .exchange(&request, server_addr, v4::MessageType::Offer)
            .await
            .unwrap();
        assert_eq!(offer.yiaddr(), Ipv4Addr::new(10, 0, 0, 50));
        reply_task.await.unwrap();
    }

    #[tokio::test]
    async fn nak_reply_short_circuits() {
        let server = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = socket_for_test();

        let request = client.build_request_renew(43, Ipv4Addr::new(10, 0, 0, 50));
        let reply_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let req = v4::Message::decode(&mut Decoder::new(&buf[..len])).unwrap();
            let mut resp = req.clone();
            resp.opts_mut()
                .insert(v4::DhcpOption::MessageType(v4::MessageType::Nak));
            server.send_to(&resp.to_vec().unwrap(), from).await.unwrap();
        });

        let err = client
            .exchange(&request, server_addr, v4::MessageType::Ack)
            .await
            .unwrap_err();
        assert!(matches!(err, DhcpError::Nak));
        reply_task.await.unwrap();
    }
}
