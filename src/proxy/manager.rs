//! # Proxy Manager
//!
//! Owns the listening socket, the execution lanes and the routing tables.
//! Every accepted connection starts in the unmanaged table with the
//! default logic; authentication promotes it to the client or the server
//! table through [`Router::verify_authentication`].
//!
//! ## Responsibilities
//! - Accept loop and lane assignment
//! - Role decision and table promotion
//! - Client/server routing, broadcast fan-out, kicks
//! - Periodic sweep of closed connections

use crate::config::{ProxyConfig, CLEANUP_PERIOD};
use crate::core::frame::Command;
use crate::core::Uid;
use crate::error::constants::{ERR_ALREADY_STARTED, ERR_UID_TAKEN, ERR_UNSUPPORTED_ROLE};
use crate::error::{GatewayError, Result};
use crate::protocol::messages::{ConnectConfirm, LinkType, ServerIdentity};
use crate::proxy::tables::{Route, RoutingTables, Table};
use crate::runtime::LanePool;
use crate::session::connection::{Connection, ConnectionHandle};
use crate::session::handshake::DefaultLogic;
use crate::session::logic::{Outgoing, Router, SessionLogic, Verdict};
use crate::utils::metrics::GatewayMetrics;
use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, instrument, warn};

const LISTEN_BACKLOG: u32 = 1024;

/// Pause after a failed accept, so a persistent error cannot spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct ProxyManager {
    config: ProxyConfig,
    lanes: LanePool,
    tables: RoutingTables,
    metrics: Arc<GatewayMetrics>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    local_addr: OnceLock<SocketAddr>,
}

impl ProxyManager {
    pub fn new(config: ProxyConfig) -> Result<Arc<Self>> {
        config.validate_strict()?;
        let lanes = LanePool::new(config.session_thread_num)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            lanes,
            tables: RoutingTables::new(),
            metrics: Arc::new(GatewayMetrics::new()),
            shutdown_tx,
            shutdown_rx,
            local_addr: OnceLock::new(),
        }))
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    pub fn tables(&self) -> &RoutingTables {
        &self.tables
    }

    /// Bound address, once `start` succeeded
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn table_of(&self, uid: Uid) -> Option<Table> {
        self.tables.table_of(uid)
    }

    /// Bind the listening socket and start the accept and cleanup loops.
    #[instrument(skip(self), fields(port = self.config.listened_port))]
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.listened_port));
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;
        let bound = listener.local_addr()?;
        if self.local_addr.set(bound).is_err() {
            return Err(GatewayError::InvalidState(ERR_ALREADY_STARTED));
        }

        tokio::spawn(Arc::clone(self).accept_loop(listener));
        tokio::spawn(Arc::clone(self).cleanup_loop());
        info!(address = %bound, lanes = self.lanes.len(), "Gateway listening");
        Ok(bound)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut incoming = TcpListenerStream::new(listener);
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Accept loop stopped");
                        return;
                    }
                }
                accepted = incoming.next() => match accepted {
                    Some(Ok(stream)) => {
                        if let Err(e) = self.admit(stream) {
                            warn!(error = %e, "Failed to admit connection");
                        }
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Error accepting connection");
                        self.metrics.connection_error();
                        time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                    None => return,
                },
            }
        }
    }

    /// Register an accepted socket as unmanaged and start driving it.
    fn admit(self: &Arc<Self>, stream: TcpStream) -> Result<ConnectionHandle> {
        let router: Arc<dyn Router> = Arc::clone(self) as Arc<dyn Router>;
        let logic = SessionLogic::Default(DefaultLogic::new(router, self.config.compression));
        let connection = Connection::new(self.lanes.next_uid(), logic, Arc::clone(&self.metrics));
        let uid = connection.uid();
        if !self.tables.register_unmanaged(connection.handle()) {
            return Err(GatewayError::InvalidState(ERR_UID_TAKEN));
        }
        let handle = connection.accept(&self.lanes, stream, self.config.keepalive)?;
        debug!(uid, peer = ?handle.peer_addr(), lane = self.lanes.lane_index(uid), "Accepted");
        Ok(handle)
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let mut interval = time::interval(CLEANUP_PERIOD);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = interval.tick() => {
                    self.cleanup_sweep();
                }
            }
        }
    }

    /// Drop closed connections from every table.
    pub fn cleanup_sweep(&self) -> usize {
        let removed = self.tables.sweep_closed();
        if removed > 0 {
            self.metrics.swept(removed);
            debug!(
                removed,
                unmanaged = self.tables.count(Table::Unmanaged),
                clients = self.tables.count(Table::Client),
                servers = self.tables.count(Table::Server),
                "Swept closed connections"
            );
        }
        removed
    }

    /// Stop accepting, drop every connection and join the lanes.
    pub fn stop(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        let connections = self.tables.drain();
        info!(connections = connections.len(), "Stopping gateway");
        for connection in &connections {
            connection.close(false);
        }
        self.lanes.shutdown();
        self.metrics.log_metrics();
    }

    /// Gracefully close every server of `link_type`; returns how many.
    pub fn kick_server_peers_of_type(&self, link_type: LinkType) -> usize {
        let servers = self.tables.select(
            |route| matches!(route, Route::Server { link_type: l, .. } if *l == link_type),
        );
        for (_, connection) in &servers {
            connection.kick();
        }
        servers.len()
    }

    fn authenticate_client(
        &self,
        identity: ServerIdentity,
        uid: Uid,
        remote_ip: Ipv4Addr,
    ) -> Result<Verdict> {
        let (server_uid, server_link, server) = self
            .tables
            .find_server(identity)
            .ok_or(GatewayError::ServerNotFound(identity.0))?;
        self.tables
            .promote(uid, Route::Client { server: server_uid })?;

        let confirm = ConnectConfirm {
            client_uid: uid,
            remote_ip,
        };
        if let Err(e) = server.send(Outgoing::Command(
            Command::ConnectionConfirm,
            confirm.encode(),
        )) {
            debug!(uid, server = server_uid, error = %e, "Connect confirm not delivered");
        }
        Ok(Verdict {
            assigned_uid: server_uid,
            link_type: server_link,
        })
    }

    fn authenticate_server(
        &self,
        link_type: LinkType,
        identity: ServerIdentity,
        uid: Uid,
    ) -> Result<Verdict> {
        let role = link_type.server_role();
        self.tables.promote(
            uid,
            Route::Server {
                link_type: role,
                identity,
            },
        )?;
        info!(uid, link_type = ?role, identity = identity.0, "Server registered");
        Ok(Verdict {
            assigned_uid: uid,
            link_type: role,
        })
    }
}

impl Router for ProxyManager {
    fn verify_authentication(
        &self,
        link_type: LinkType,
        identity: ServerIdentity,
        uid: Uid,
        remote_ip: Ipv4Addr,
    ) -> Result<Verdict> {
        if link_type == LinkType::ClientProxy {
            self.authenticate_client(identity, uid, remote_ip)
        } else if link_type.is_server() {
            self.authenticate_server(link_type, identity, uid)
        } else {
            Err(GatewayError::Malformed(ERR_UNSUPPORTED_ROLE))
        }
    }

    fn send_to_server(&self, server: Uid, outgoing: Outgoing) -> Result<()> {
        match self.tables.lookup(Table::Server, server) {
            Some(connection) => connection.send(outgoing),
            None => {
                self.metrics.route_miss();
                Err(GatewayError::RouteMiss(server))
            }
        }
    }

    fn send_to_client(&self, client: Uid, payload: Bytes) -> Result<()> {
        match self.tables.lookup(Table::Client, client) {
            Some(connection) => connection.send(Outgoing::Payload(payload)),
            None => {
                self.metrics.route_miss();
                Err(GatewayError::RouteMiss(client))
            }
        }
    }

    fn broadcast_fanout(&self, targets: &[Uid], payload: Bytes) -> usize {
        targets
            .iter()
            .filter(|client| self.send_to_client(**client, payload.clone()).is_ok())
            .count()
    }

    fn kick_client(&self, client: Uid) -> bool {
        match self.tables.lookup(Table::Client, client) {
            Some(connection) => {
                connection.kick();
                true
            }
            None => false,
        }
    }

    fn kick_clients_of_server(&self, server: Uid) -> usize {
        let clients = self
            .tables
            .select(|route| matches!(route, Route::Client { server: s } if *s == server));
        for (_, connection) in &clients {
            connection.kick();
        }
        clients.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::protocol::messages::decode_addressed;

    fn manager() -> Arc<ProxyManager> {
        ProxyManager::new(ProxyConfig::default_with_overrides(|c| {
            c.listened_port = 0;
            c.session_thread_num = 2;
        }))
        .unwrap()
    }

    /// A registered connection that never starts I/O
    fn detached(manager: &Arc<ProxyManager>) -> Connection {
        let router: Arc<dyn Router> = Arc::clone(manager) as Arc<dyn Router>;
        let logic = SessionLogic::Default(DefaultLogic::new(router, Default::default()));
        let connection = Connection::new(
            manager.lanes.next_uid(),
            logic,
            Arc::clone(&manager.metrics),
        );
        assert!(manager.tables.register_unmanaged(connection.handle()));
        connection
    }

    fn identity(server_id: u16) -> ServerIdentity {
        ServerIdentity::derive(3, server_id, b"pc")
    }

    fn register_server(manager: &Arc<ProxyManager>, server_id: u16) -> Connection {
        let server = detached(manager);
        manager
            .verify_authentication(
                LinkType::ActiveGameServer,
                identity(server_id),
                server.uid(),
                Ipv4Addr::LOCALHOST,
            )
            .unwrap();
        server
    }

    #[test]
    fn client_is_routed_to_matching_server() {
        let manager = manager();
        let mut server = register_server(&manager, 7);
        assert_eq!(manager.table_of(server.uid()), Some(Table::Server));

        let client = detached(&manager);
        let ip = Ipv4Addr::new(10, 1, 2, 3);
        let verdict = manager
            .verify_authentication(LinkType::ClientProxy, identity(7), client.uid(), ip)
            .unwrap();
        assert_eq!(verdict.assigned_uid, server.uid());
        assert_eq!(verdict.link_type, LinkType::GameServer);
        assert_eq!(manager.table_of(client.uid()), Some(Table::Client));

        match server.try_next_sent() {
            Some(Outgoing::Command(Command::ConnectionConfirm, body)) => {
                let confirm = ConnectConfirm::decode(&body).unwrap();
                assert_eq!(confirm.client_uid, client.uid());
                assert_eq!(confirm.remote_ip, ip);
            }
            other => panic!("expected connect confirm, got {other:?}"),
        }
        manager.stop();
    }

    #[test]
    fn unknown_server_leaves_client_unmanaged() {
        let manager = manager();
        let client = detached(&manager);
        let result = manager.verify_authentication(
            LinkType::ClientProxy,
            identity(99),
            client.uid(),
            Ipv4Addr::LOCALHOST,
        );
        assert!(matches!(result, Err(GatewayError::ServerNotFound(_))));
        assert_eq!(manager.table_of(client.uid()), Some(Table::Unmanaged));
        manager.stop();
    }

    #[test]
    fn duplicate_server_keeps_first_registration() {
        let manager = manager();
        let server = register_server(&manager, 1);
        let again = manager.verify_authentication(
            LinkType::GameServer,
            identity(1),
            server.uid(),
            Ipv4Addr::LOCALHOST,
        );
        assert!(matches!(again, Err(GatewayError::DuplicateServer(_))));
        assert_eq!(manager.table_of(server.uid()), Some(Table::Server));
        assert!(manager
            .send_to_server(server.uid(), Outgoing::Keepalive)
            .is_ok());
        manager.stop();
    }

    #[test]
    fn inner_pair_cannot_authenticate() {
        let manager = manager();
        let conn = detached(&manager);
        let result = manager.verify_authentication(
            LinkType::InnerPair,
            identity(1),
            conn.uid(),
            Ipv4Addr::LOCALHOST,
        );
        assert!(matches!(result, Err(GatewayError::Malformed(_))));
        manager.stop();
    }

    #[test]
    fn broadcast_reaches_only_listed_clients() {
        let manager = manager();
        let _server = register_server(&manager, 2);
        let mut clients: Vec<Connection> = (0..5).map(|_| detached(&manager)).collect();
        for client in &clients {
            manager
                .verify_authentication(
                    LinkType::ClientProxy,
                    identity(2),
                    client.uid(),
                    Ipv4Addr::LOCALHOST,
                )
                .unwrap();
        }

        let targets = [clients[0].uid(), clients[2].uid(), clients[4].uid(), 9_999];
        let body = Bytes::from_static(b"hello");
        assert_eq!(manager.broadcast_fanout(&targets, body.clone()), 3);

        for (i, client) in clients.iter_mut().enumerate() {
            let sent = client.try_next_sent();
            if i % 2 == 0 {
                assert_eq!(sent, Some(Outgoing::Payload(body.clone())));
            } else {
                assert_eq!(sent, None);
            }
        }
        assert_eq!(manager.metrics().snapshot().route_misses, 1);
        manager.stop();
    }

    #[test]
    fn server_departure_kicks_its_clients() {
        let manager = manager();
        let server = register_server(&manager, 4);
        let _other = register_server(&manager, 5);
        let mut mine = detached(&manager);
        let mut theirs = detached(&manager);
        manager
            .verify_authentication(LinkType::ClientProxy, identity(4), mine.uid(), Ipv4Addr::LOCALHOST)
            .unwrap();
        manager
            .verify_authentication(LinkType::ClientProxy, identity(5), theirs.uid(), Ipv4Addr::LOCALHOST)
            .unwrap();

        assert_eq!(manager.kick_clients_of_server(server.uid()), 1);
        assert!(mine.close_requested());
        assert!(!theirs.close_requested());
        manager.stop();
    }

    #[test]
    fn client_payload_reaches_server_with_uid_prefix() {
        let manager = manager();
        let mut server = register_server(&manager, 6);
        let routed = crate::protocol::messages::encode_addressed(42, b"move");
        manager
            .send_to_server(server.uid(), Outgoing::Payload(routed))
            .unwrap();

        match server.try_next_sent() {
            Some(Outgoing::Payload(body)) => {
                let (uid, rest) = decode_addressed(&body).unwrap();
                assert_eq!(uid, 42);
                assert_eq!(&rest[..], b"move");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            manager.send_to_client(42, Bytes::from_static(b"x")),
            Err(GatewayError::RouteMiss(42))
        ));
        manager.stop();
    }

    #[test]
    fn sweep_removes_closed_connections() {
        let manager = manager();
        let server = register_server(&manager, 8);
        let idle = detached(&manager);
        let live = detached(&manager);
        server.mark_closed();
        idle.mark_closed();

        assert_eq!(manager.cleanup_sweep(), 2);
        assert_eq!(manager.table_of(server.uid()), None);
        assert_eq!(manager.table_of(idle.uid()), None);
        assert_eq!(manager.table_of(live.uid()), Some(Table::Unmanaged));
        assert_eq!(manager.metrics().snapshot().swept, 2);
        manager.stop();
    }

    #[test]
    fn kick_by_server_type() {
        let manager = manager();
        let mut game = register_server(&manager, 1);
        let mut chat = detached(&manager);
        manager
            .verify_authentication(LinkType::ChatServer, identity(2), chat.uid(), Ipv4Addr::LOCALHOST)
            .unwrap();

        assert_eq!(manager.kick_server_peers_of_type(LinkType::GameServer), 1);
        assert!(game.close_requested());
        assert!(!chat.close_requested());
        manager.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_ends_accept_loop_and_is_idempotent() {
        let manager = manager();
        let bound = manager.start().await.unwrap();
        let target = SocketAddr::from(([127, 0, 0, 1], bound.port()));
        tokio::task::block_in_place(|| {
            manager.stop();
            manager.stop();
        });

        // The listener goes away with the accept loop.
        let deadline = time::Instant::now() + Duration::from_secs(5);
        while TcpStream::connect(target).await.is_ok() {
            assert!(time::Instant::now() < deadline, "listener still open");
            time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(
            manager.start().await,
            Err(GatewayError::InvalidState(_))
        ));
    }
}
