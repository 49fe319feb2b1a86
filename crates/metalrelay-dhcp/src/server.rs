//! DHCP server implementation
//!
//! UDP listeners for DHCPv4 and DHCPv6. Each datagram is handled on its own
//! task: it is parsed, given a base reply, run through the plugin chain and
//! answered only when every plugin lets it continue.

use crate::config::ServerConfig;
use crate::error::{DhcpError, Result};
use crate::packet::{
    base_reply_v4, base_reply_v6, encode_v4, encode_v6, encode_v6_relay, reply_ia_address,
    reply_type_v4, server_duid, DhcpRequest, Dhcpv6Packet, RelayedRequest,
};
use crate::plugins::{PluginChain, Verdict};
use metalrelay_crd::MacAddr;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Largest UDP payload; nested relay chains can exceed an Ethernet MTU
const MAX_DATAGRAM: usize = 65_535;

/// All_DHCP_Relay_Agents_and_Servers
const ALL_DHCP_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2);

/// Event emitted by the DHCP server
#[derive(Debug, Clone)]
pub enum DhcpEvent {
    /// A listener is up
    Started { bind_addr: SocketAddr },
    /// Received a DHCP request
    Request {
        mac: Option<MacAddr>,
        message_type: String,
    },
    /// Sent a DHCP reply
    Response {
        mac: Option<MacAddr>,
        message_type: String,
        address: Option<IpAddr>,
    },
    /// A plugin dropped the request
    Dropped { mac: Option<MacAddr> },
    /// The request failed and was not answered
    Error { mac: Option<MacAddr>, error: String },
    /// Server stopped
    Stopped,
}

/// Per-request handling shared by every spawned task
#[derive(Clone)]
struct Dispatcher {
    chain: Arc<PluginChain>,
    server_ip: Ipv4Addr,
    duid: Arc<Vec<u8>>,
    events: broadcast::Sender<DhcpEvent>,
}

impl Dispatcher {
    fn emit(&self, event: DhcpEvent) {
        let _ = self.events.send(event);
    }

    /// Reply bytes and destination for a DHCPv4 datagram, if it gets one
    async fn handle_v4(&self, data: &[u8]) -> Result<Option<(Vec<u8>, SocketAddr)>> {
        let request = match DhcpRequest::parse(data) {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, "Failed to parse DHCPv4 packet");
                return Ok(None);
            }
        };

        debug!(mac = %request.mac, msg_type = ?request.message_type, "Received DHCPv4 request");
        self.emit(DhcpEvent::Request {
            mac: Some(request.mac),
            message_type: format!("{:?}", request.message_type),
        });

        let Some(reply) = base_reply_v4(&request, self.server_ip) else {
            debug!(
                mac = %request.mac,
                msg_type = ?request.message_type,
                "No reply for message type"
            );
            return Ok(None);
        };

        let reply = match self.chain.handle_v4(&request, reply).await {
            Verdict::Continue(reply) => reply,
            Verdict::Drop => {
                self.emit(DhcpEvent::Dropped {
                    mac: Some(request.mac),
                });
                return Ok(None);
            }
            Verdict::Error(e) => {
                self.emit(DhcpEvent::Error {
                    mac: Some(request.mac),
                    error: e.to_string(),
                });
                return Ok(None);
            }
        };

        let dest = if request.relay_ip != Ipv4Addr::UNSPECIFIED {
            // Relayed request - send to relay agent
            SocketAddr::new(request.relay_ip.into(), 67)
        } else if request.client_ip != Ipv4Addr::UNSPECIFIED {
            SocketAddr::new(request.client_ip.into(), 68)
        } else {
            SocketAddr::new(Ipv4Addr::BROADCAST.into(), 68)
        };

        let message_type = reply_type_v4(&reply)
            .map(|t| format!("{:?}", t))
            .unwrap_or_default();
        let address = Some(reply.yiaddr())
            .filter(|ip| !ip.is_unspecified())
            .map(IpAddr::V4);
        let bytes = encode_v4(&reply)?;

        info!(
            mac = %request.mac,
            msg_type = %message_type,
            address = ?address,
            dest = %dest,
            "Sending DHCPv4 reply"
        );
        self.emit(DhcpEvent::Response {
            mac: Some(request.mac),
            message_type,
            address,
        });
        Ok(Some((bytes, dest)))
    }

    /// Reply bytes for a DHCPv6 datagram, if it gets one
    ///
    /// Relayed requests are answered with a Relay-Reply chain mirroring the
    /// relays they came through.
    async fn handle_v6(&self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let packet = match Dhcpv6Packet::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(error = %e, "Failed to parse DHCPv6 packet");
                return Ok(None);
            }
        };

        let relayed = match &packet {
            Dhcpv6Packet::Relayed(_) => match RelayedRequest::decapsulate(&packet) {
                Ok(request) => Some(request),
                Err(e) => {
                    debug!(error = %e, "Malformed relay chain");
                    return Ok(None);
                }
            },
            Dhcpv6Packet::Direct(_) => None,
        };
        let message = match (&relayed, &packet) {
            (Some(request), _) => &request.message,
            (None, Dhcpv6Packet::Direct(message)) => message,
            (None, Dhcpv6Packet::Relayed(_)) => return Ok(None),
        };
        let mac = relayed.as_ref().and_then(|r| r.hardware_address().ok());

        debug!(
            mac = ?mac,
            msg_type = ?message.msg_type(),
            relayed = relayed.is_some(),
            "Received DHCPv6 request"
        );
        self.emit(DhcpEvent::Request {
            mac,
            message_type: format!("{:?}", message.msg_type()),
        });

        let reply = base_reply_v6(message, &self.duid);
        let reply = match self.chain.handle_v6(&packet, reply).await {
            Verdict::Continue(reply) => reply,
            Verdict::Drop => {
                self.emit(DhcpEvent::Dropped { mac });
                return Ok(None);
            }
            Verdict::Error(e) => {
                self.emit(DhcpEvent::Error {
                    mac,
                    error: e.to_string(),
                });
                return Ok(None);
            }
        };

        let message_type = format!("{:?}", reply.msg_type());
        let address = reply_ia_address(&reply).map(IpAddr::V6);
        let bytes = match &relayed {
            Some(request) => encode_v6_relay(&request.encapsulate(reply))?,
            None => encode_v6(&reply)?,
        };

        info!(mac = ?mac, msg_type = %message_type, address = ?address, "Sending DHCPv6 reply");
        self.emit(DhcpEvent::Response {
            mac,
            message_type,
            address,
        });
        Ok(Some(bytes))
    }
}

/// DHCP server
pub struct DhcpServer {
    config: ServerConfig,
    dispatcher: Dispatcher,
}

impl DhcpServer {
    /// Create a new DHCP server around a plugin chain
    pub fn new(config: ServerConfig, chain: Arc<PluginChain>) -> Self {
        let (event_sender, _) = broadcast::channel(1024);
        let dispatcher = Dispatcher {
            chain,
            server_ip: config.server_ip,
            duid: Arc::new(server_duid(config.server_ip)),
            events: event_sender,
        };
        Self { config, dispatcher }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Subscribe to server events
    pub fn subscribe(&self) -> broadcast::Receiver<DhcpEvent> {
        self.dispatcher.events.subscribe()
    }

    /// Run the DHCP server until the shutdown signal flips to `true`
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.config.listen_v4.is_none() && self.config.listen_v6.is_none() {
            return Err(DhcpError::ConfigError(
                "no DHCPv4 or DHCPv6 listener configured".to_string(),
            ));
        }

        let v4 = match self.config.listen_v4 {
            Some(addr) => Some(self.bind(addr)?),
            None => None,
        };
        let v6 = match self.config.listen_v6 {
            Some(addr) => Some(self.bind(addr)?),
            None => None,
        };

        info!(
            v4 = ?self.config.listen_v4,
            v6 = ?self.config.listen_v6,
            plugins = ?self.dispatcher.chain.names(),
            "DHCP server started"
        );

        let mut buf_v4 = datagram_buffer();
        let mut buf_v6 = datagram_buffer();
        let mut shutdown = shutdown;

        loop {
            tokio::select! {
                result = recv(v4.as_ref(), &mut buf_v4) => {
                    match result {
                        Ok((len, src)) => self.spawn_v4(v4.clone(), buf_v4[..len].to_vec(), src),
                        Err(e) => error!(error = %e, "Error receiving DHCPv4 packet"),
                    }
                }
                result = recv(v6.as_ref(), &mut buf_v6) => {
                    match result {
                        Ok((len, src)) => self.spawn_v6(v6.clone(), buf_v6[..len].to_vec(), src),
                        Err(e) => error!(error = %e, "Error receiving DHCPv6 packet"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("DHCP server shutting down");
                        self.dispatcher.emit(DhcpEvent::Stopped);
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    fn spawn_v4(&self, socket: Option<Arc<UdpSocket>>, data: Vec<u8>, src: SocketAddr) {
        let Some(socket) = socket else { return };
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            match dispatcher.handle_v4(&data).await {
                Ok(Some((bytes, dest))) => {
                    if let Err(e) = socket.send_to(&bytes, dest).await {
                        warn!(dest = %dest, error = %e, "Failed to send DHCPv4 reply");
                    }
                }
                Ok(None) => {}
                Err(e) => error!(src = %src, error = %e, "Error handling DHCPv4 packet"),
            }
        });
    }

    fn spawn_v6(&self, socket: Option<Arc<UdpSocket>>, data: Vec<u8>, src: SocketAddr) {
        let Some(socket) = socket else { return };
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            match dispatcher.handle_v6(&data).await {
                Ok(Some(bytes)) => {
                    if let Err(e) = socket.send_to(&bytes, src).await {
                        warn!(dest = %src, error = %e, "Failed to send DHCPv6 reply");
                    }
                }
                Ok(None) => {}
                Err(e) => error!(src = %src, error = %e, "Error handling DHCPv6 packet"),
            }
        });
    }

    /// Create, configure and bind a UDP socket
    fn bind(&self, bind_addr: SocketAddr) -> Result<Arc<UdpSocket>> {
        let bind_err = |e: std::io::Error| DhcpError::BindFailed {
            addr: bind_addr,
            source: e,
        };

        let socket = socket2::Socket::new(
            socket2::Domain::for_address(bind_addr),
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .map_err(bind_err)?;

        socket.set_reuse_address(true).ok();
        match bind_addr {
            SocketAddr::V4(_) => {
                socket.set_broadcast(true).ok();
            }
            SocketAddr::V6(_) => {
                socket.set_only_v6(true).map_err(bind_err)?;
            }
        }

        socket.bind(&bind_addr.into()).map_err(bind_err)?;

        if bind_addr.is_ipv6() {
            if let Err(e) = socket.join_multicast_v6(&ALL_DHCP_SERVERS, 0) {
                debug!(error = %e, "Not joining the DHCPv6 server multicast group");
            }
        }

        socket.set_nonblocking(true).map_err(bind_err)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(bind_err)?;
        let local = socket.local_addr().unwrap_or(bind_addr);
        info!(addr = %local, "Listening");
        self.dispatcher
            .emit(DhcpEvent::Started { bind_addr: local });
        Ok(Arc::new(socket))
    }
}

fn datagram_buffer() -> Vec<u8> {
    vec![0u8; MAX_DATAGRAM]
}

/// Receive on a listener; a disabled listener never yields
async fn recv(
    socket: Option<&Arc<UdpSocket>>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

impl std::fmt::Debug for DhcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhcpServer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::DelegationLength;
    use crate::packet::testing::{ia_na, relay_forward, solicit, v4_message};
    use crate::plugins::{OnmetalPlugin, Plugin};
    use async_trait::async_trait;
    use dhcproto::{v4, v6};
    use dhcproto::{Decodable, Encodable};
    use std::time::Duration;

    struct Refuser;

    #[async_trait]
    impl Plugin for Refuser {
        fn name(&self) -> &str {
            "refuser"
        }

        async fn handle_v4(
            &self,
            _request: &DhcpRequest,
            _reply: v4::Message,
        ) -> Verdict<v4::Message> {
            Verdict::Error(DhcpError::MissingAddress("test".to_string()))
        }
    }

    fn server(chain: PluginChain) -> DhcpServer {
        let config = ServerConfig::new(Ipv4Addr::new(10, 0, 0, 1))
            .with_listen_v4(Some("127.0.0.1:0".parse().unwrap()))
            .with_listen_v6(None);
        DhcpServer::new(config, Arc::new(chain))
    }

    fn discover() -> Vec<u8> {
        v4_message("aa:bb:cc:dd:ee:ff".parse().unwrap(), v4::MessageType::Discover)
            .to_vec()
            .unwrap()
    }

    #[test]
    fn test_dhcp_server_new() {
        let server = server(PluginChain::new());
        assert_eq!(server.config().server_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(server.config().listen_v6, None);
    }

    #[test]
    fn test_dhcp_server_subscribe() {
        let server = server(PluginChain::new());
        let _receiver = server.subscribe();
    }

    #[tokio::test]
    async fn test_v4_reply_is_broadcast() {
        let server = server(PluginChain::new());
        let mut events = server.subscribe();

        let (bytes, dest) = server
            .dispatcher
            .handle_v4(&discover())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dest, "255.255.255.255:68".parse().unwrap());

        let reply = DhcpRequest::parse(&bytes).map(|r| r.message_type);
        assert!(matches!(reply, Ok(v4::MessageType::Offer)));

        assert!(matches!(events.recv().await, Ok(DhcpEvent::Request { .. })));
        assert!(matches!(
            events.recv().await,
            Ok(DhcpEvent::Response { address: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_v4_relayed_reply_goes_to_relay() {
        let server = server(PluginChain::new());
        let mut message =
            v4_message("aa:bb:cc:dd:ee:ff".parse().unwrap(), v4::MessageType::Discover);
        message.set_giaddr(Ipv4Addr::new(10, 1, 0, 1));

        let (_, dest) = server
            .dispatcher
            .handle_v4(&message.to_vec().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dest, "10.1.0.1:67".parse().unwrap());
    }

    #[tokio::test]
    async fn test_failed_request_gets_no_reply() {
        let mut chain = PluginChain::new();
        chain.push(Arc::new(Refuser));
        let server = server(chain);
        let mut events = server.subscribe();

        let reply = server.dispatcher.handle_v4(&discover()).await.unwrap();
        assert!(reply.is_none());

        assert!(matches!(events.recv().await, Ok(DhcpEvent::Request { .. })));
        assert!(matches!(events.recv().await, Ok(DhcpEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_garbage_is_ignored() {
        let server = server(PluginChain::new());
        assert!(server.dispatcher.handle_v4(&[1, 2, 3]).await.unwrap().is_none());
        assert!(server.dispatcher.handle_v6(&[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_v6_relayed_reply_is_wrapped() {
        let server = server(PluginChain::new());
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let bytes = relay_forward(
            "2001:db8::1".parse().unwrap(),
            "fe80::1".parse().unwrap(),
            Some(mac),
            &solicit(&[ia_na(1, None)]),
        );

        let reply = server.dispatcher.handle_v6(&bytes).await.unwrap().unwrap();
        let relay = v6::RelayMessage::from_bytes(&reply).unwrap();
        assert_eq!(relay.msg_type(), v6::MessageType::RelayRepl);
        assert_eq!(relay.peer_addr(), "fe80::1".parse::<Ipv6Addr>().unwrap());
        match relay.opts().get(v6::OptionCode::RelayMsg) {
            Some(v6::DhcpOption::RelayMsg(v6::RelayMessageData::Message(inner))) => {
                assert_eq!(inner.msg_type(), v6::MessageType::Advertise);
                assert_eq!(inner.xid(), [0x01, 0x02, 0x03]);
            }
            other => panic!("expected the client reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_v6_response_event_reports_address() {
        let mut chain = PluginChain::new();
        chain.push(Arc::new(OnmetalPlugin::new(
            DelegationLength::new(80).unwrap(),
            3600,
            7200,
        )));
        let server = server(chain);
        let mut events = server.subscribe();
        let bytes = relay_forward(
            "2001:db8::1".parse().unwrap(),
            "fe80::1".parse().unwrap(),
            Some("aa:bb:cc:dd:ee:ff".parse().unwrap()),
            &solicit(&[ia_na(1, None)]),
        );

        assert!(server.dispatcher.handle_v6(&bytes).await.unwrap().is_some());
        assert!(matches!(events.recv().await, Ok(DhcpEvent::Request { .. })));
        match events.recv().await {
            Ok(DhcpEvent::Response { address, .. }) => {
                assert_eq!(address, Some("2001:db8::2".parse().unwrap()));
            }
            other => panic!("expected Response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_datagram_larger_than_mtu_arrives_whole() {
        let listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let payload = vec![0xab; 4000];
        sender
            .send_to(&payload, listener.local_addr().unwrap())
            .await
            .unwrap();

        let mut buf = datagram_buffer();
        let (len, src) = recv(Some(&listener), &mut buf).await.unwrap();
        assert_eq!(len, payload.len());
        assert_eq!(&buf[..len], payload.as_slice());
        assert_eq!(src, sender.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let server = Arc::new(server(PluginChain::new()));
        let mut events = server.subscribe();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn({
            let server = server.clone();
            async move { server.run(rx).await }
        });

        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Ok(DhcpEvent::Started { bind_addr })) => {
                assert!(bind_addr.ip().is_loopback());
                assert_ne!(bind_addr.port(), 0);
            }
            other => panic!("expected Started, got {:?}", other),
        }

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert!(matches!(events.recv().await, Ok(DhcpEvent::Stopped)));
    }

    #[tokio::test]
    async fn test_run_without_listeners_fails() {
        let config = ServerConfig::new(Ipv4Addr::LOCALHOST)
            .with_listen_v4(None)
            .with_listen_v6(None);
        let server = DhcpServer::new(config, Arc::new(PluginChain::new()));
        let (_tx, rx) = watch::channel(false);
        assert!(matches!(
            server.run(rx).await,
            Err(DhcpError::ConfigError(_))
        ));
    }
}
