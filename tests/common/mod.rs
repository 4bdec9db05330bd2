//! Shared helpers for the end-to-end tests.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use session_gateway::cluster::{ClientLink, ClusterLink};
use session_gateway::config::{ClientConfig, ClusterConfig, KeepaliveConfig, ProxyConfig};
use session_gateway::core::codec::FrameCodec;
use session_gateway::core::frame::{Command, Frame};
use session_gateway::protocol::messages::{AuthRequest, AuthResponse, LinkType};
use session_gateway::proxy::ProxyManager;
use session_gateway::session::logic::AuthState;
use session_gateway::utils::compression::{self, CompressionKind};
use session_gateway::utils::crypto::{Direction, SessionCipher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::codec::Framed;

pub const AREA: u16 = 1;
pub const PLATFORM: &str = "pc";
pub const WAIT: Duration = Duration::from_secs(5);

pub async fn start_gateway(keepalive: KeepaliveConfig) -> (Arc<ProxyManager>, SocketAddr) {
    let manager = ProxyManager::new(ProxyConfig::default_with_overrides(|c| {
        c.listened_port = 0;
        c.session_thread_num = 2;
        c.keepalive = keepalive;
    }))
    .expect("gateway");
    let bound = manager.start().await.expect("listen");
    (manager, SocketAddr::from(([127, 0, 0, 1], bound.port())))
}

/// Poll `check` until it yields a value or `WAIT` runs out.
pub async fn eventually<T>(mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(Instant::now() < deadline, "condition not met within {WAIT:?}");
        sleep(Duration::from_millis(5)).await;
    }
}

pub async fn connect_server(gateway: SocketAddr, sid: u16) -> ClusterLink {
    let link = ClusterLink::connect(ClusterConfig {
        proxy_ip: gateway.ip().to_string(),
        proxy_port: gateway.port(),
        sid,
        area_id: AREA,
        platform: PLATFORM.to_string(),
        ..ClusterConfig::default()
    })
    .expect("cluster link");
    eventually(|| (link.auth_state() != AuthState::Unverified).then_some(())).await;
    link
}

pub async fn connect_client(gateway: SocketAddr, sid: u16) -> ClientLink {
    let link = ClientLink::connect(ClientConfig {
        proxy_ip: gateway.ip().to_string(),
        proxy_port: gateway.port(),
        sid,
        area_id: AREA,
        platform: PLATFORM.to_string(),
        ..ClientConfig::default()
    })
    .expect("client link");
    eventually(|| (link.auth_state() != AuthState::Unverified).then_some(())).await;
    link
}

/// A client speaking the wire protocol by hand
pub struct RawClient {
    framed: Framed<TcpStream, FrameCodec>,
    sent: u32,
    cipher: Option<SessionCipher>,
}

impl RawClient {
    pub async fn connect(gateway: SocketAddr) -> Self {
        let stream = TcpStream::connect(gateway).await.expect("connect");
        Self {
            framed: Framed::new(stream, FrameCodec),
            sent: 0,
            cipher: None,
        }
    }

    pub fn next_sequence(&mut self) -> u32 {
        self.sent += 1;
        self.sent
    }

    pub async fn send_frame(&mut self, frame: Frame) {
        self.framed.send(frame).await.expect("send frame");
    }

    /// Next frame, `None` on EOF or error or after `WAIT`
    pub async fn recv(&mut self) -> Option<Frame> {
        match timeout(WAIT, self.framed.next()).await {
            Ok(Some(Ok(frame))) => Some(frame),
            Ok(_) => None,
            Err(_) => panic!("no frame within {WAIT:?}"),
        }
    }

    pub async fn authenticate(&mut self, sid: u16) -> AuthResponse {
        let request = AuthRequest {
            area_id: AREA,
            server_id: sid,
            link_type: LinkType::ClientProxy,
            platform: PLATFORM.as_bytes().to_vec(),
        };
        let sequence = self.next_sequence();
        let frame = Frame::seal(
            Command::AuthenticationAAA.as_u16(),
            false,
            sequence,
            request.encode(),
        )
        .unwrap();
        self.send_frame(frame).await;

        let response = self.recv_auth_response().await;
        if response.is_success() {
            self.cipher = Some(SessionCipher::new(&response.material));
        }
        response
    }

    /// Next frame, which must be an AAA reply
    pub async fn recv_auth_response(&mut self) -> AuthResponse {
        let reply = self.recv().await.expect("auth reply");
        reply.verify().expect("reply mask");
        assert_eq!(reply.header.command(), Some(Command::AuthenticationAAA));
        AuthResponse::decode(&reply.payload).expect("auth response")
    }

    pub async fn send_payload(&mut self, body: &[u8], compress: bool) {
        let cipher = self.cipher.as_ref().expect("authenticated");
        let plain = if compress {
            compression::compress(body, CompressionKind::Lz4).unwrap()
        } else {
            body.to_vec()
        };
        let sequence = self.sent + 1;
        let sealed = cipher.seal(Direction::Upstream, sequence, &plain).unwrap();
        let frame = Frame::seal(
            Command::RoutingTransparent.as_u16(),
            compress,
            sequence,
            Bytes::from(sealed),
        )
        .unwrap();
        self.sent = sequence;
        self.send_frame(frame).await;
    }

    /// Next non-keepalive payload, decrypted and decompressed
    pub async fn recv_payload(&mut self) -> (Command, Vec<u8>) {
        loop {
            let frame = self.recv().await.expect("payload frame");
            frame.verify().expect("mask");
            if frame.header.is_keepalive() {
                continue;
            }
            let cipher = self.cipher.as_ref().expect("authenticated");
            let plain = cipher
                .open(Direction::Downstream, frame.header.sequence, &frame.payload)
                .expect("decrypt");
            let plain = if frame.header.compressed {
                compression::decompress(&plain, CompressionKind::Lz4).unwrap()
            } else {
                plain
            };
            return (frame.header.command().expect("known command"), plain);
        }
    }

    /// True once the gateway has closed its side, skipping keepalives
    pub async fn closed_by_gateway(&mut self) -> bool {
        loop {
            match self.recv().await {
                None => return true,
                Some(frame) if frame.header.is_keepalive() => continue,
                Some(_) => return false,
            }
        }
    }
}
