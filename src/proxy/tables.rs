//! # Routing Tables
//!
//! The unmanaged, client and server tables live in one sharded map keyed by
//! uid. Each entry carries a [`Route`] whose variant names the table the
//! uid belongs to. Promotion rewrites the route of one entry while holding
//! that entry's shard lock, so a concurrent lookup sees the uid either in
//! its old table or in its new one, never in both or neither.

use crate::core::Uid;
use crate::error::constants::ERR_NOT_UNMANAGED;
use crate::error::{GatewayError, Result};
use crate::protocol::messages::{LinkType, ServerIdentity};
use crate::session::connection::ConnectionHandle;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Unmanaged,
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Accepted, not yet authenticated
    Unverified,
    /// Authenticated client and the server uid it talks to
    Client { server: Uid },
    /// Authenticated backend server
    Server {
        link_type: LinkType,
        identity: ServerIdentity,
    },
}

impl Route {
    pub fn table(&self) -> Table {
        match self {
            Route::Unverified => Table::Unmanaged,
            Route::Client { .. } => Table::Client,
            Route::Server { .. } => Table::Server,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub route: Route,
    pub connection: ConnectionHandle,
}

#[derive(Default)]
pub struct RoutingTables {
    entries: DashMap<Uid, RouteEntry>,
}

impl RoutingTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fresh connection to the unmanaged table. False if the uid is taken.
    pub fn register_unmanaged(&self, connection: ConnectionHandle) -> bool {
        match self.entries.entry(connection.uid()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(RouteEntry {
                    route: Route::Unverified,
                    connection,
                });
                true
            }
        }
    }

    pub fn table_of(&self, uid: Uid) -> Option<Table> {
        self.entries.get(&uid).map(|entry| entry.route.table())
    }

    pub fn route_of(&self, uid: Uid) -> Option<Route> {
        self.entries.get(&uid).map(|entry| entry.route)
    }

    /// Handle for `uid` if it is currently in `table`
    pub fn lookup(&self, table: Table, uid: Uid) -> Option<ConnectionHandle> {
        self.entries
            .get(&uid)
            .filter(|entry| entry.route.table() == table)
            .map(|entry| entry.connection.clone())
    }

    /// Move an unmanaged uid to the table named by `route`.
    pub fn promote(&self, uid: Uid, route: Route) -> Result<ConnectionHandle> {
        let mut entry = self
            .entries
            .get_mut(&uid)
            .ok_or(GatewayError::RouteMiss(uid))?;
        match (entry.route, route) {
            (Route::Unverified, _) => {}
            (Route::Server { .. }, Route::Server { .. }) => {
                return Err(GatewayError::DuplicateServer(uid))
            }
            _ => return Err(GatewayError::InvalidState(ERR_NOT_UNMANAGED)),
        }
        entry.route = route;
        Ok(entry.connection.clone())
    }

    /// First live server registered under `identity`
    pub fn find_server(&self, identity: ServerIdentity) -> Option<(Uid, LinkType, ConnectionHandle)> {
        self.entries.iter().find_map(|entry| match entry.route {
            Route::Server {
                link_type,
                identity: registered,
            } if registered == identity && !entry.connection.is_closed() => {
                Some((*entry.key(), link_type, entry.connection.clone()))
            }
            _ => None,
        })
    }

    /// Every entry whose route matches `predicate`
    pub fn select<F>(&self, predicate: F) -> Vec<(Uid, ConnectionHandle)>
    where
        F: Fn(&Route) -> bool,
    {
        self.entries
            .iter()
            .filter(|entry| predicate(&entry.route))
            .map(|entry| (*entry.key(), entry.connection.clone()))
            .collect()
    }

    pub fn count(&self, table: Table) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.route.table() == table)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn remove(&self, uid: Uid) -> Option<RouteEntry> {
        self.entries.remove(&uid).map(|(_, entry)| entry)
    }

    /// Drop every entry whose connection reached `ClosedDone`, in all tables.
    pub fn sweep_closed(&self) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.connection.is_closed();
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Empty all tables, returning the connections that were in them.
    pub fn drain(&self) -> Vec<ConnectionHandle> {
        let uids: Vec<Uid> = self.entries.iter().map(|entry| *entry.key()).collect();
        uids.into_iter()
            .filter_map(|uid| self.remove(uid).map(|entry| entry.connection))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::session::connection::Connection;
    use crate::session::inner::InnerPairLogic;
    use crate::session::logic::SessionLogic;
    use crate::utils::metrics::GatewayMetrics;
    use crate::utils::ring_buffer::ring_buffer;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Barrier};

    fn detached(uid: Uid) -> Connection {
        let (producer, _consumer) = ring_buffer(64);
        Connection::new(
            uid,
            SessionLogic::InnerPair(InnerPairLogic::new(producer)),
            Arc::new(GatewayMetrics::new()),
        )
    }

    fn server_route(id: u16) -> Route {
        Route::Server {
            link_type: LinkType::GameServer,
            identity: ServerIdentity::derive(1, id, b"test"),
        }
    }

    #[test]
    fn promotion_moves_between_tables() {
        let tables = RoutingTables::new();
        let conn = detached(5);
        assert!(tables.register_unmanaged(conn.handle()));
        assert!(!tables.register_unmanaged(conn.handle()));
        assert_eq!(tables.table_of(5), Some(Table::Unmanaged));

        tables.promote(5, Route::Client { server: 9 }).unwrap();
        assert_eq!(tables.table_of(5), Some(Table::Client));
        assert!(tables.lookup(Table::Unmanaged, 5).is_none());
        assert!(tables.lookup(Table::Client, 5).is_some());
        assert_eq!(tables.count(Table::Client), 1);
        assert_eq!(tables.count(Table::Unmanaged), 0);
    }

    #[test]
    fn second_server_promotion_is_a_duplicate() {
        let tables = RoutingTables::new();
        let conn = detached(7);
        tables.register_unmanaged(conn.handle());
        tables.promote(7, server_route(1)).unwrap();

        assert!(matches!(
            tables.promote(7, server_route(1)),
            Err(GatewayError::DuplicateServer(7))
        ));
        assert!(tables.lookup(Table::Server, 7).is_some());
        assert!(matches!(
            tables.promote(7, Route::Client { server: 1 }),
            Err(GatewayError::InvalidState(_))
        ));
        assert!(matches!(
            tables.promote(8, server_route(1)),
            Err(GatewayError::RouteMiss(8))
        ));
    }

    #[test]
    fn find_server_skips_closed_connections() {
        let tables = RoutingTables::new();
        let dead = detached(1);
        let live = detached(2);
        for conn in [&dead, &live] {
            tables.register_unmanaged(conn.handle());
            tables.promote(conn.uid(), server_route(4)).unwrap();
        }
        dead.mark_closed();

        let identity = ServerIdentity::derive(1, 4, b"test");
        let (uid, link, _) = tables.find_server(identity).unwrap();
        assert_eq!(uid, 2);
        assert_eq!(link, LinkType::GameServer);
        assert!(tables
            .find_server(ServerIdentity::derive(1, 5, b"test"))
            .is_none());
    }

    #[test]
    fn sweep_clears_closed_entries_from_every_table() {
        let tables = RoutingTables::new();
        let conns: Vec<Connection> = (1..=4).map(detached).collect();
        for conn in &conns {
            tables.register_unmanaged(conn.handle());
        }
        tables.promote(2, Route::Client { server: 3 }).unwrap();
        tables.promote(3, server_route(1)).unwrap();

        conns[0].mark_closed();
        conns[1].mark_closed();
        conns[2].mark_closed();

        assert_eq!(tables.sweep_closed(), 3);
        assert_eq!(tables.len(), 1);
        assert_eq!(tables.table_of(4), Some(Table::Unmanaged));
    }

    #[test]
    fn promotion_is_atomic_for_concurrent_readers() {
        const UIDS: u32 = 2_000;
        let tables = Arc::new(RoutingTables::new());
        let conns: Vec<Connection> = (1..=UIDS).map(detached).collect();
        for conn in &conns {
            tables.register_unmanaged(conn.handle());
        }

        const READERS: usize = 4;
        let done = Arc::new(AtomicBool::new(false));
        let ready = Arc::new(Barrier::new(READERS + 1));
        let readers: Vec<_> = (0..READERS)
            .map(|_| {
                let tables = Arc::clone(&tables);
                let done = Arc::clone(&done);
                let ready = Arc::clone(&ready);
                std::thread::spawn(move || {
                    let check = |uid: Uid| {
                        let table = tables.table_of(uid);
                        assert!(
                            matches!(table, Some(Table::Unmanaged) | Some(Table::Client)),
                            "uid {uid} seen in {table:?}"
                        );
                        let in_unmanaged = tables.lookup(Table::Unmanaged, uid).is_some();
                        let in_client = tables.lookup(Table::Client, uid).is_some();
                        assert!(in_unmanaged || in_client, "uid {uid} in no table");
                    };
                    // One full pass before any promotion starts.
                    (1..=UIDS).for_each(&check);
                    ready.wait();

                    let mut passes = 1u64;
                    while !done.load(Ordering::Acquire) {
                        (1..=UIDS).for_each(&check);
                        passes += 1;
                    }
                    passes
                })
            })
            .collect();

        ready.wait();
        for uid in 1..=UIDS {
            tables.promote(uid, Route::Client { server: 1 }).unwrap();
        }
        done.store(true, Ordering::Release);

        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
        assert_eq!(tables.count(Table::Client), UIDS as usize);
    }
}
