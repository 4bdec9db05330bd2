//! # Connection
//!
//! One TCP socket driven by one task on the connection's lane. The task
//! owns the socket halves, the reassembly buffer, the timers and the logic;
//! everybody else talks to it through a [`ConnectionHandle`], which posts
//! instructions into a FIFO mailbox.
//!
//! ## States
//! ```text
//! Init --accept/connect--> WaitConnect --ok--> Connecting
//! WaitConnect --connect error--> ClosedDone
//! Connecting --close(graceful)--> ToClose --FIN/error/linger--> ClosedDone
//! Connecting --close(hard)/protocol violation/io error--> ClosedDone
//! ```
//! Frames are read and delivered, and sends and ticks are serviced, only
//! while `Connecting`. `ClosedDone` is terminal.
//!
//! Sockets linger on close for up to `LINGER_TIMEOUT`. The final close runs
//! on the lane runtime's blocking pool, never on the lane thread itself.

use crate::config::{KeepaliveConfig, DELIVERY_RETRY_DELAY, LINGER_TIMEOUT};
use crate::core::codec::FrameCodec;
use crate::core::frame::{Frame, FrameHeader};
use crate::core::Uid;
use crate::error::{GatewayError, Result};
use crate::runtime::LanePool;
use crate::session::logic::{Outgoing, ProtocolLogic, SessionLogic, Unwrapped};
use crate::utils::metrics::GatewayMetrics;
use bytes::{Bytes, BytesMut};
use futures::SinkExt;
use socket2::SockRef;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::codec::{Decoder, FramedWrite};
use tracing::{debug, info, instrument, warn};

const READ_CHUNK: usize = 4096;

/// An empty reassembly buffer larger than this is released
const MAX_IDLE_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Init = 0,
    WaitConnect = 1,
    Connecting = 2,
    ToClose = 3,
    ClosedDone = 4,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Init,
            1 => ConnectionState::WaitConnect,
            2 => ConnectionState::Connecting,
            3 => ConnectionState::ToClose,
            _ => ConnectionState::ClosedDone,
        }
    }
}

pub(crate) enum Instruction {
    Send(Outgoing),
    Close { graceful: bool },
}

struct Shared {
    uid: Uid,
    state: AtomicU8,
    mailbox: mpsc::UnboundedSender<Instruction>,
    peer: OnceLock<SocketAddr>,
}

/// Cheap, cloneable reference to a connection
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn uid(&self) -> Uid {
        self.shared.uid
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.shared.state.store(state as u8, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::ClosedDone
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer.get().copied()
    }

    /// Peer IPv4 address, unspecified when unknown or not IPv4
    pub fn remote_ipv4(&self) -> Ipv4Addr {
        match self.peer_addr().map(|addr| addr.ip()) {
            Some(IpAddr::V4(ip)) => ip,
            Some(IpAddr::V6(ip)) => ip.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
            None => Ipv4Addr::UNSPECIFIED,
        }
    }

    /// Queue `outgoing` behind everything already posted.
    pub fn send(&self, outgoing: Outgoing) -> Result<()> {
        match self.state() {
            ConnectionState::ToClose | ConnectionState::ClosedDone => {
                Err(GatewayError::ConnectionClosed)
            }
            _ => self
                .shared
                .mailbox
                .send(Instruction::Send(outgoing))
                .map_err(|_| GatewayError::ConnectionClosed),
        }
    }

    /// Request a close. Runs on the connection's own lane after anything
    /// queued before it; a no-op once closed.
    pub fn close(&self, graceful: bool) {
        if self.is_closed() {
            return;
        }
        let _ = self.shared.mailbox.send(Instruction::Close { graceful });
    }

    pub fn kick(&self) {
        self.close(true);
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection(Arc::downgrade(&self.shared))
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("uid", &self.uid())
            .field("state", &self.state())
            .field("peer", &self.peer_addr())
            .finish()
    }
}

/// Back-reference held by a logic; upgrading fails once the connection is gone.
#[derive(Clone, Default)]
pub struct WeakConnection(Weak<Shared>);

impl WeakConnection {
    pub fn upgrade(&self) -> Option<ConnectionHandle> {
        self.0.upgrade().map(|shared| ConnectionHandle { shared })
    }
}

impl fmt::Debug for WeakConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(handle) => write!(f, "WeakConnection({})", handle.uid()),
            None => f.write_str("WeakConnection(gone)"),
        }
    }
}

/// A connection that has not started I/O yet
pub struct Connection {
    handle: ConnectionHandle,
    mailbox: mpsc::UnboundedReceiver<Instruction>,
    logic: SessionLogic,
    metrics: Arc<GatewayMetrics>,
}

impl Connection {
    pub fn new(uid: Uid, mut logic: SessionLogic, metrics: Arc<GatewayMetrics>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            shared: Arc::new(Shared {
                uid,
                state: AtomicU8::new(ConnectionState::Init as u8),
                mailbox: tx,
                peer: OnceLock::new(),
            }),
        };
        logic.attach(handle.downgrade());
        Self {
            handle,
            mailbox: rx,
            logic,
            metrics,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn uid(&self) -> Uid {
        self.handle.uid()
    }

    /// Drive an accepted socket on the connection's lane.
    pub fn accept(
        self,
        lanes: &LanePool,
        stream: TcpStream,
        keepalive: KeepaliveConfig,
    ) -> Result<ConnectionHandle> {
        let handle = self.handle();
        if let Ok(peer) = stream.peer_addr() {
            let _ = handle.shared.peer.set(peer);
        }
        handle.set_state(ConnectionState::WaitConnect);
        self.metrics.connection_opened();

        // Re-register the socket with the lane's own reactor.
        let std_stream = match stream.into_std() {
            Ok(s) => s,
            Err(e) => {
                handle.set_state(ConnectionState::ClosedDone);
                self.metrics.connection_closed();
                return Err(e.into());
            }
        };

        lanes.spawn(handle.uid(), async move {
            match TcpStream::from_std(std_stream) {
                Ok(stream) => {
                    apply_socket_options(&stream, self.uid());
                    self.drive(stream, keepalive).await;
                }
                Err(e) => {
                    warn!(uid = self.uid(), error = %e, "Failed to adopt accepted socket");
                    self.metrics.connection_error();
                    self.abandon();
                }
            }
        });
        Ok(handle)
    }

    /// Connect to `addr` from the connection's lane and drive the socket.
    /// Anything sent through the handle before the connect completes is
    /// written once it does.
    pub fn connect(
        self,
        lanes: &LanePool,
        addr: SocketAddr,
        keepalive: KeepaliveConfig,
    ) -> ConnectionHandle {
        let handle = self.handle();
        handle.set_state(ConnectionState::WaitConnect);
        self.metrics.connection_opened();

        lanes.spawn(handle.uid(), async move {
            match open_stream(addr).await {
                Ok(stream) => {
                    if let Ok(peer) = stream.peer_addr() {
                        let _ = self.handle.shared.peer.set(peer);
                    }
                    apply_socket_options(&stream, self.uid());
                    info!(uid = self.uid(), %addr, "Connected");
                    self.drive(stream, keepalive).await;
                }
                Err(e) => {
                    warn!(uid = self.uid(), %addr, error = %e, "Connect failed");
                    self.metrics.connection_error();
                    self.abandon();
                }
            }
        });
        handle
    }

    fn abandon(self) {
        self.handle.set_state(ConnectionState::ClosedDone);
        self.metrics.connection_closed();
    }

    async fn drive(self, stream: TcpStream, keepalive: KeepaliveConfig) {
        let (reader, writer) = stream.into_split();
        let now = Instant::now();
        let driver = Driver {
            handle: self.handle,
            mailbox: self.mailbox,
            logic: self.logic,
            metrics: self.metrics,
            reader,
            writer: FramedWrite::new(writer, FrameCodec),
            codec: FrameCodec,
            inbound: BytesMut::with_capacity(READ_CHUNK),
            pending: None,
            keepalive,
            ticks: 0,
            last_recv: now,
            last_send: now,
        };
        driver.handle.set_state(ConnectionState::Connecting);
        driver.run().await;
    }
}

async fn open_stream(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.connect(addr).await
}

/// Same options for accepted and outbound sockets.
fn apply_socket_options(stream: &TcpStream, uid: Uid) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(uid, error = %e, "Failed to disable Nagle");
    }
    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_keepalive(false) {
        warn!(uid, error = %e, "Failed to disable OS keep-alive");
    }
    if let Err(e) = sock_ref.set_linger(Some(LINGER_TIMEOUT)) {
        warn!(uid, error = %e, "Failed to set linger");
    }
}

/// Close the socket off the lane thread. With linger set, `close` may block
/// until unsent data is out or `LINGER_TIMEOUT` passes.
fn release_socket(uid: Uid, reader: OwnedReadHalf, writer: OwnedWriteHalf) {
    let stream = match reader.reunite(writer) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(uid, error = %e, "Socket halves did not match");
            return;
        }
    };
    match stream.into_std() {
        Ok(socket) => {
            tokio::task::spawn_blocking(move || {
                let _ = socket.set_nonblocking(false);
                drop(socket);
            });
        }
        Err(e) => debug!(uid, error = %e, "Failed to detach socket"),
    }
}

struct Driver {
    handle: ConnectionHandle,
    mailbox: mpsc::UnboundedReceiver<Instruction>,
    logic: SessionLogic,
    metrics: Arc<GatewayMetrics>,
    reader: OwnedReadHalf,
    writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    codec: FrameCodec,
    inbound: BytesMut,
    /// Delivery the logic refused, retried before any later frame
    pending: Option<(FrameHeader, Bytes)>,
    keepalive: KeepaliveConfig,
    ticks: u64,
    last_recv: Instant,
    last_send: Instant,
}

impl Driver {
    fn uid(&self) -> Uid {
        self.handle.uid()
    }

    fn connecting(&self) -> bool {
        self.handle.state() == ConnectionState::Connecting
    }

    #[instrument(name = "connection", skip(self), fields(uid = self.handle.uid()))]
    async fn run(mut self) {
        let period = self.keepalive.tick_interval.max(Duration::from_millis(1));
        let mut tick = time::interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let retry = time::sleep(Duration::ZERO);
        tokio::pin!(retry);
        let mut retry_armed = false;

        while self.connecting() {
            tokio::select! {
                msg = self.mailbox.recv() => match msg {
                    Some(Instruction::Send(outgoing)) => self.send(outgoing).await,
                    Some(Instruction::Close { graceful }) => self.shutdown(graceful).await,
                    None => self.shutdown(false).await,
                },
                _ = &mut retry, if retry_armed => {
                    retry_armed = false;
                    self.retry_delivery().await;
                }
                read = self.reader.read_buf(&mut self.inbound), if self.pending.is_none() => {
                    self.on_read(read).await;
                }
                _ = tick.tick() => self.on_tick().await,
            }

            if self.pending.is_some() && !retry_armed {
                retry.as_mut().reset(Instant::now() + DELIVERY_RETRY_DELAY);
                retry_armed = true;
            }
        }

        // Timers go before the socket.
        drop(tick);
        self.pending = None;

        if self.handle.state() == ConnectionState::ToClose {
            self.drain().await;
        }
        self.finish();
    }

    async fn on_read(&mut self, read: io::Result<usize>) {
        match read {
            Ok(0) => {
                debug!("Peer closed the connection");
                self.shutdown(false).await;
            }
            Ok(n) => {
                self.last_recv = Instant::now();
                self.metrics.bytes_read(n);
                self.process_inbound().await;
            }
            Err(e) => {
                debug!(error = %e, "Read failed");
                self.metrics.connection_error();
                self.shutdown(false).await;
            }
        }
    }

    /// Consume every complete frame in the buffer, stopping early when a
    /// delivery is refused or the connection leaves `Connecting`.
    async fn process_inbound(&mut self) {
        while self.pending.is_none() && self.connecting() {
            let frame = match self.codec.decode(&mut self.inbound) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    self.violation(e).await;
                    return;
                }
            };
            self.metrics.frame_received();
            self.consume(frame).await;
        }

        if self.inbound.is_empty() && self.inbound.capacity() > MAX_IDLE_BUFFER {
            self.inbound = BytesMut::with_capacity(READ_CHUNK);
        } else {
            self.inbound.reserve(READ_CHUNK);
        }
    }

    async fn consume(&mut self, frame: Frame) {
        match self.logic.unwrap(frame) {
            Ok(Unwrapped::Consumed) => {}
            Ok(Unwrapped::Deliver(header, payload)) => {
                if !self.logic.try_deliver(&header, &payload) {
                    self.metrics.delivery_retry();
                    self.pending = Some((header, payload));
                }
            }
            Ok(Unwrapped::Handshake { reply, next }) => {
                self.metrics.auth_result(next.is_some());
                self.write_frame(reply).await;
                match next {
                    Some(mut next) => {
                        next.attach(self.handle.downgrade());
                        debug!(role = ?next.role(), "Session logic replaced");
                        self.logic = next;
                    }
                    None => self.shutdown(true).await,
                }
            }
            Err(e) => self.violation(e).await,
        }
    }

    async fn retry_delivery(&mut self) {
        let Some((header, payload)) = self.pending.take() else {
            return;
        };
        if self.logic.try_deliver(&header, &payload) {
            self.process_inbound().await;
        } else {
            self.metrics.delivery_retry();
            self.pending = Some((header, payload));
        }
    }

    async fn violation(&mut self, error: GatewayError) {
        warn!(role = ?self.logic.role(), error = %error, "Closing connection");
        if error.is_protocol_violation() {
            self.metrics.protocol_error();
        }
        self.shutdown(false).await;
    }

    async fn send(&mut self, outgoing: Outgoing) {
        match self.logic.wrap(outgoing) {
            Ok(frame) => self.write_frame(frame).await,
            Err(e) => warn!(error = %e, "Dropping outgoing payload"),
        }
    }

    async fn write_frame(&mut self, frame: Frame) {
        let len = frame.encoded_len();
        match self.writer.send(frame).await {
            Ok(()) => {
                self.last_send = Instant::now();
                self.metrics.frame_sent(len);
            }
            Err(e) => {
                debug!(error = %e, "Write failed");
                self.metrics.connection_error();
                self.shutdown(false).await;
            }
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        self.ticks = self.ticks.wrapping_add(1);

        if self.ticks % self.keepalive.ticks_per_check() == 0
            && now.duration_since(self.last_recv) > self.keepalive.keep_alive_timeout
        {
            info!(
                idle_ms = now.duration_since(self.last_recv).as_millis() as u64,
                "Keepalive timeout"
            );
            self.shutdown(true).await;
            return;
        }

        if now.duration_since(self.last_send) > self.keepalive.send_deadline() {
            self.send(Outgoing::Keepalive).await;
        }
    }

    async fn shutdown(&mut self, graceful: bool) {
        if !self.connecting() {
            return;
        }
        self.pending = None;
        if graceful {
            self.handle.set_state(ConnectionState::ToClose);
            if let Err(e) = self.writer.get_mut().shutdown().await {
                debug!(error = %e, "Write-side shutdown failed");
            }
        } else {
            self.handle.set_state(ConnectionState::ClosedDone);
        }
    }

    /// Discard inbound bytes until FIN, error, a hard close or the linger limit.
    async fn drain(&mut self) {
        let deadline = Instant::now() + LINGER_TIMEOUT;
        loop {
            self.inbound.clear();
            tokio::select! {
                read = self.reader.read_buf(&mut self.inbound) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                },
                _ = time::sleep_until(deadline) => {
                    debug!("Linger expired while draining");
                    break;
                }
                msg = self.mailbox.recv() => match msg {
                    Some(Instruction::Close { graceful: false }) | None => break,
                    Some(_) => {}
                },
            }
        }
    }

    fn finish(self) {
        let Driver {
            handle,
            mut logic,
            metrics,
            reader,
            writer,
            ..
        } = self;
        handle.set_state(ConnectionState::ClosedDone);
        release_socket(handle.uid(), reader, writer.into_inner());
        logic.kick_peer();
        metrics.connection_closed();
        debug!(uid = handle.uid(), "Connection closed");
    }
}

#[cfg(test)]
impl Connection {
    /// Next queued instruction, for tests that never start I/O
    pub(crate) fn try_next_sent(&mut self) -> Option<Outgoing> {
        loop {
            match self.mailbox.try_recv().ok()? {
                Instruction::Send(outgoing) => return Some(outgoing),
                Instruction::Close { .. } => continue,
            }
        }
    }

    /// True if a close request is queued
    pub(crate) fn close_requested(&mut self) -> bool {
        while let Ok(instruction) = self.mailbox.try_recv() {
            if let Instruction::Close { .. } = instruction {
                return true;
            }
        }
        false
    }

    pub(crate) fn mark_closed(&self) {
        self.handle.set_state(ConnectionState::ClosedDone);
    }
}
