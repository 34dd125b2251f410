//! `ProtocolHandler`: binds one `UdpSocket` per running `Server` and
//! decodes/dispatches DHCP DISCOVER/REQUEST/RELEASE/DECLINE. Mirrors the
//! teacher's `util::new_msg` response-construction idiom and its
//! cancellation-token shutdown pattern, but processes packets directly
//! against `ignite-core` rather than through a plugin pipeline.
use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use chrono::Utc;
use dhcproto::{
    v4::{DhcpOption, Message, MessageType, Opcode, OptionCode},
    Decodable, Decoder, Encodable,
};
use ignite_core::{
    allocator, error::IgniteError, model::MacAddr, repo::LeaseRepository, LeaseState, Server,
};
use tokio::{net::UdpSocket, sync::Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::HandlerConfig;

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;
const IPXE_VENDOR_CLASS: &[&str] = &["iPXE", "gPXE"];

/// One running instance, bound to a server's configured IP on :67.
pub struct ProtocolHandler {
    server_id: uuid::Uuid,
    token: CancellationToken,
    stopped: Arc<Notify>,
}

impl ProtocolHandler {
    /// Binds the socket and spawns the receive loop. Returns immediately;
    /// bind failures surface synchronously as `IgniteError::Network`.
    pub async fn start(
        server: Server,
        lease_repo: Arc<dyn LeaseRepository>,
        cfg: HandlerConfig,
    ) -> Result<Self, IgniteError> {
        let addr = std::net::SocketAddr::from((server.ip, DHCP_SERVER_PORT));
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| IgniteError::Network(format!("bind {addr}: {e}")))?;
        socket
            .set_broadcast(true)
            .map_err(|e| IgniteError::Network(format!("set_broadcast: {e}")))?;

        let token = CancellationToken::new();
        let stopped = Arc::new(Notify::new());
        let server_id = server.id;

        let loop_token = token.clone();
        let loop_stopped = stopped.clone();
        tokio::spawn(async move {
            recv_loop(socket, server, lease_repo, cfg, loop_token).await;
            loop_stopped.notify_waiters();
        });

        Ok(Self {
            server_id,
            token,
            stopped,
        })
    }

    pub fn server_id(&self) -> uuid::Uuid {
        self.server_id
    }

    /// Cancels the receive loop and waits up to `stop_timeout` for it to
    /// exit, per spec.md §4.E.
    pub async fn stop(&self, stop_timeout: Duration) -> Result<(), IgniteError> {
        self.token.cancel();
        tokio::time::timeout(stop_timeout, self.stopped.notified())
            .await
            .map_err(|_| IgniteError::Timeout(format!("handler {} stop", self.server_id)))
    }
}

async fn recv_loop(
    socket: UdpSocket,
    server: Server,
    lease_repo: Arc<dyn LeaseRepository>,
    cfg: HandlerConfig,
    token: CancellationToken,
) {
    let mut buf = [0u8; 1500];
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!(server_id = %server.id, "protocol handler shutting down");
                return;
            }
            recv = socket.recv_from(&mut buf) => {
                let (len, peer) = match recv {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(server_id = %server.id, error = %e, "recv_from failed");
                        continue;
                    }
                };
                // processed synchronously -- see spec.md §4.E ordering guarantee
                if let Err(e) = handle_packet(&buf[..len], peer, &socket, &server, lease_repo.as_ref(), &cfg).await {
                    debug!(server_id = %server.id, %peer, error = %e, "dropped malformed or unhandled packet");
                }
            }
        }
    }
}

#[instrument(level = "debug", skip(buf, socket, server, repo, cfg))]
async fn handle_packet(
    buf: &[u8],
    peer: std::net::SocketAddr,
    socket: &UdpSocket,
    server: &Server,
    repo: &dyn LeaseRepository,
    cfg: &HandlerConfig,
) -> Result<(), IgniteError> {
    let req = Message::decode(&mut Decoder::new(buf))
        .map_err(|e| IgniteError::Network(format!("decode: {e}")))?;
    if req.opcode() != Opcode::BootRequest {
        return Ok(());
    }
    let mac = chaddr_to_mac(&req)?;
    ignite_core::metrics::DHCP_RECV
        .with_label_values(&[msg_type_label(req.opts().msg_type())])
        .inc();

    let response = match req.opts().msg_type() {
        Some(MessageType::Discover) => on_discover(&req, mac, server, repo, cfg)?,
        Some(MessageType::Request) => on_request(&req, mac, server, repo)?,
        Some(MessageType::Release) | Some(MessageType::Decline) => {
            on_release_or_decline(mac, server, repo)?;
            None
        }
        _ => None,
    };

    if let Some(resp) = response {
        ignite_core::metrics::DHCP_SENT
            .with_label_values(&[msg_type_label(resp.opts().msg_type())])
            .inc();
        let bytes = resp
            .to_vec()
            .map_err(|e| IgniteError::Network(format!("encode: {e}")))?;
        let dest = broadcast_or_unicast(&req, peer);
        socket
            .send_to(&bytes, dest)
            .await
            .map_err(|e| IgniteError::Network(format!("send_to {dest}: {e}")))?;
    }
    Ok(())
}

fn msg_type_label(mt: Option<MessageType>) -> &'static str {
    match mt {
        Some(MessageType::Discover) => "discover",
        Some(MessageType::Offer) => "offer",
        Some(MessageType::Request) => "request",
        Some(MessageType::Decline) => "decline",
        Some(MessageType::Ack) => "ack",
        Some(MessageType::Nak) => "nak",
        Some(MessageType::Release) => "release",
        Some(MessageType::Inform) => "inform",
        _ => "unknown",
    }
}

/// The client may still be unconfigured (ciaddr 0.0.0.0); RFC 2131 §4.1
/// says to reply via broadcast in that case, otherwise unicast to ciaddr.
fn broadcast_or_unicast(req: &Message, peer: std::net::SocketAddr) -> std::net::SocketAddr {
    if !req.ciaddr().is_unspecified() {
        std::net::SocketAddr::from((req.ciaddr(), DHCP_CLIENT_PORT))
    } else if peer.ip().is_unspecified() {
        std::net::SocketAddr::from((Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT))
    } else {
        peer
    }
}

fn chaddr_to_mac(req: &Message) -> Result<MacAddr, IgniteError> {
    let chaddr = req.chaddr();
    if chaddr.len() < 6 {
        return Err(IgniteError::Validation("chaddr too short".into()));
    }
    let mut octets = [0u8; 6];
    octets.copy_from_slice(&chaddr[..6]);
    Ok(MacAddr::from(octets))
}

fn is_ipxe_vendor_class(req: &Message) -> bool {
    match req.opts().get(OptionCode::ClassIdentifier) {
        Some(DhcpOption::ClassIdentifier(bytes)) => {
            let s = String::from_utf8_lossy(bytes);
            IPXE_VENDOR_CLASS.iter().any(|v| s == *v)
        }
        _ => false,
    }
}

fn boot_filename<'a>(req: &Message, cfg: &'a HandlerConfig) -> &'a str {
    if is_ipxe_vendor_class(req) {
        &cfg.efi_filename
    } else {
        &cfg.bios_filename
    }
}

fn new_reply(req: &Message, server_ip: Ipv4Addr) -> Message {
    let mut msg = Message::new_with_id(
        req.xid(),
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        server_ip,
        req.giaddr(),
        req.chaddr(),
    );
    msg.set_opcode(Opcode::BootReply)
        .set_htype(req.htype())
        .set_flags(req.flags())
        .set_hops(req.hops());
    msg
}

fn populate_reply_options(msg: &mut Message, req: &Message, server: &Server, yiaddr: Ipv4Addr, filename: &str) {
    msg.set_yiaddr(yiaddr);

    let requested: Vec<OptionCode> = match req.opts().get(OptionCode::ParameterRequestList) {
        Some(DhcpOption::ParameterRequestList(codes)) => codes.clone(),
        _ => Vec::new(),
    };
    let want = |code: OptionCode| requested.is_empty() || requested.contains(&code);

    let opts = msg.opts_mut();
    if want(OptionCode::SubnetMask) {
        opts.insert(DhcpOption::SubnetMask(server.options.subnet_mask));
    }
    if want(OptionCode::Router) {
        opts.insert(DhcpOption::Router(vec![server.options.gateway]));
    }
    if want(OptionCode::DomainNameServer) {
        opts.insert(DhcpOption::DomainNameServer(vec![server.options.dns]));
    }
    if want(OptionCode::AddressLeaseTime) {
        opts.insert(DhcpOption::AddressLeaseTime(server.lease_duration_secs as u32));
    }
    if want(OptionCode::TFTPServerName) {
        opts.insert(DhcpOption::TFTPServerName(server.ip.to_string().into()));
    }
    if want(OptionCode::BootfileName) {
        opts.insert(DhcpOption::BootfileName(filename.to_string().into()));
    }
    opts.insert(DhcpOption::ServerIdentifier(server.ip));
}

fn on_discover(
    req: &Message,
    mac: MacAddr,
    server: &Server,
    repo: &dyn LeaseRepository,
    cfg: &HandlerConfig,
) -> Result<Option<Message>, IgniteError> {
    let now = Utc::now();
    let filename = boot_filename(req, cfg).to_string();

    // (iii)/(iv): reserved or still-live existing lease wins outright.
    if let Some(existing) = repo.get_by_mac(server.id, mac)? {
        if existing.reserved || existing.is_live(now) {
            let mut resp = new_reply(req, server.ip);
            resp.opts_mut().insert(DhcpOption::MessageType(MessageType::Offer));
            populate_reply_options(&mut resp, req, server, existing.ip, &filename);
            return Ok(Some(resp));
        }
    }

    // (v): ask the allocator which free IP it would offer -- DISCOVER never
    // commits a lease, only REQUEST does (spec.md §3 lifecycle).
    let requested_ip = match req.opts().get(OptionCode::RequestedIpAddress) {
        Some(DhcpOption::RequestedIpAddress(ip)) => Some(*ip),
        _ => None,
    };
    match allocator::select_ip(repo, server, mac, requested_ip, now) {
        Ok(ip) => {
            let mut resp = new_reply(req, server.ip);
            resp.opts_mut().insert(DhcpOption::MessageType(MessageType::Offer));
            populate_reply_options(&mut resp, req, server, ip, &filename);
            Ok(Some(resp))
        }
        // (vi): no address available -- stay silent, let the client retry.
        Err(IgniteError::Conflict(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn on_request(
    req: &Message,
    mac: MacAddr,
    server: &Server,
    repo: &dyn LeaseRepository,
) -> Result<Option<Message>, IgniteError> {
    if let Some(DhcpOption::ServerIdentifier(sid)) = req.opts().get(OptionCode::ServerIdentifier) {
        if *sid != server.ip {
            return Ok(None);
        }
    }

    let requested_ip = match req.opts().get(OptionCode::RequestedIpAddress) {
        Some(DhcpOption::RequestedIpAddress(ip)) => *ip,
        _ => req.ciaddr(),
    };

    let now = Utc::now();
    let existing = repo.get_by_mac(server.id, mac)?;

    let granted_ip = if let Some(mut lease) = existing {
        if requested_ip != lease.ip {
            return Ok(Some(nak(req, server.ip)));
        }
        lease.expiry = now + chrono::Duration::seconds(server.lease_duration_secs as i64);
        lease.last_seen = now;
        repo.put(&lease)?;
        lease.ip
    } else if server.contains(requested_ip) {
        let held_by_other = repo
            .get_by_ip(server.id, requested_ip)?
            .map(|l| l.mac != mac && l.is_live(now))
            .unwrap_or(false);
        if held_by_other {
            return Ok(Some(nak(req, server.ip)));
        }
        let mut lease = allocator::allocate(repo, server, mac, Some(requested_ip), now)?;
        lease.state = LeaseState::Assigned;
        lease.state_updated_at = now;
        repo.put(&lease)?;
        lease.ip
    } else {
        return Ok(Some(nak(req, server.ip)));
    };

    let mut resp = new_reply(req, server.ip);
    resp.opts_mut().insert(DhcpOption::MessageType(MessageType::Ack));
    populate_reply_options(&mut resp, req, server, granted_ip, "");
    Ok(Some(resp))
}

fn nak(req: &Message, server_ip: Ipv4Addr) -> Message {
    let mut resp = new_reply(req, server_ip);
    resp.opts_mut().insert(DhcpOption::MessageType(MessageType::Nak));
    resp.opts_mut().insert(DhcpOption::ServerIdentifier(server_ip));
    resp
}

fn on_release_or_decline(
    mac: MacAddr,
    server: &Server,
    repo: &dyn LeaseRepository,
) -> Result<(), IgniteError> {
    repo.delete_by_mac(server.id, mac)
}
