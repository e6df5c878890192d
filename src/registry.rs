//! # Connection Registry
//!
//! Tracks every connection and circuit the router currently knows about:
//!
//! | Map | Meaning |
//! |-----|---------|
//! | `circuit_conn` | circuit ID → connection the ID rides on |
//! | `next_of` / `prev_of` | bidirectional circuit-ID translation; strict inverses |
//! | `is_entry` / `is_exit` | role of this hop for an incoming ID |
//! | `conns` | dialed peer address → connection, for coalescing parallel circuits |
//!
//! One readers-writer lock guards the whole map set: point lookups take
//! the read lock, mutations the write lock, and a CREATE installs all of
//! its entries under a single write hold so no reader observes a
//! half-built circuit. Fine-grained locking is a deliberate non-goal at
//! this scale.
//!
//! ID allocation keeps the two namespaces disjoint: connection IDs are
//! random u32s, circuit IDs random u64s at or above `2^32`, so one u64
//! sink key can route either. Generation retries on collision.
//!
//! Lock order: registry → connection → queue.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use rand::rngs::OsRng;
use rand::RngCore;

use crate::conn::Conn;

/// Lowest valid circuit ID; everything below is connection-ID space.
pub const MIN_CIRCUIT_ID: u64 = 1 << 32;

/// Role of a hop for a newly created circuit.
pub enum CircuitRole {
    /// Relay toward another router.
    Relay { next_conn: Arc<Conn> },
    /// Terminal hop speaking plaintext to the destination.
    Exit,
}

/// Routing facts for one incoming cell, snapshotted under a single read
/// hold.
#[derive(Clone, Default)]
pub struct RouteSnapshot {
    pub prev_id: Option<u64>,
    pub next_id: Option<u64>,
    pub exit: bool,
    /// True iff the hop receiving on `prev_id` has a proxy upstream.
    pub entry_prev: bool,
    pub next_conn: Option<Arc<Conn>>,
    pub prev_conn: Option<Arc<Conn>>,
}

#[derive(Default)]
struct RouteMaps {
    circuit_conn: HashMap<u64, Arc<Conn>>,
    next_of: HashMap<u64, u64>,
    prev_of: HashMap<u64, u64>,
    is_entry: HashMap<u64, bool>,
    is_exit: HashMap<u64, bool>,
    conns: HashMap<String, Arc<Conn>>,
}

pub struct Registry {
    maps: RwLock<RouteMaps>,
    conn_ids: Mutex<HashSet<u32>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(RouteMaps::default()),
            conn_ids: Mutex::new(HashSet::new()),
        }
    }

    /// Allocate a connection ID unique within this process.
    pub fn new_conn_id(&self) -> u32 {
        let mut ids = self.conn_ids.lock().expect("conn id lock poisoned");
        loop {
            let id = OsRng.next_u32();
            if ids.insert(id) {
                return id;
            }
        }
    }

    pub fn release_conn_id(&self, id: u32) {
        self.conn_ids
            .lock()
            .expect("conn id lock poisoned")
            .remove(&id);
    }

    /// Snapshot the routing facts for an incoming cell ID.
    pub fn route(&self, id: u64) -> RouteSnapshot {
        let maps = self.maps.read().expect("registry lock poisoned");
        let prev_id = maps.prev_of.get(&id).copied();
        let next_id = maps.next_of.get(&id).copied();
        RouteSnapshot {
            prev_id,
            next_id,
            exit: maps.is_exit.get(&id).copied().unwrap_or(false),
            entry_prev: prev_id
                .map(|p| maps.is_entry.get(&p).copied().unwrap_or(false))
                .unwrap_or(false),
            next_conn: next_id.and_then(|n| maps.circuit_conn.get(&n).cloned()),
            prev_conn: prev_id.and_then(|p| maps.circuit_conn.get(&p).cloned()),
        }
    }

    /// Install one hop of a new circuit under a single write hold:
    /// allocates the outgoing ID and populates every map before any
    /// reader can observe the circuit. Returns the outgoing ID.
    ///
    /// For an exit hop the outgoing ID is mapped to the owning connection
    /// so the map-shape invariants hold; the destination socket itself is
    /// owned by the exit worker, not the registry.
    pub fn install_circuit(
        &self,
        conn: &Arc<Conn>,
        id: u64,
        entry: bool,
        role: CircuitRole,
    ) -> u64 {
        let mut maps = self.maps.write().expect("registry lock poisoned");
        let new_id = loop {
            let candidate = OsRng.next_u64();
            if candidate >= MIN_CIRCUIT_ID && !maps.prev_of.contains_key(&candidate) {
                break candidate;
            }
        };
        maps.next_of.insert(id, new_id);
        maps.prev_of.insert(new_id, id);
        maps.circuit_conn.insert(id, conn.clone());
        maps.is_entry.insert(id, entry);
        match role {
            CircuitRole::Relay { next_conn } => {
                maps.is_exit.insert(id, false);
                maps.circuit_conn.insert(new_id, next_conn);
            }
            CircuitRole::Exit => {
                maps.is_exit.insert(id, true);
                maps.circuit_conn.insert(new_id, conn.clone());
            }
        }
        new_id
    }

    /// Remove one hop's ID pair: the incoming (upstream-side) ID and the
    /// outgoing (downstream-side) ID it translates to.
    pub fn remove_circuit_pair(&self, up_id: u64, down_id: u64) {
        let mut maps = self.maps.write().expect("registry lock poisoned");
        maps.circuit_conn.remove(&up_id);
        maps.circuit_conn.remove(&down_id);
        maps.next_of.remove(&up_id);
        maps.prev_of.remove(&down_id);
        maps.is_entry.remove(&up_id);
        maps.is_exit.remove(&up_id);
    }

    /// Remember a dialed connection by peer address for reuse.
    pub fn register_conn(&self, addr: &str, conn: Arc<Conn>) {
        let mut maps = self.maps.write().expect("registry lock poisoned");
        maps.conns.insert(addr.to_string(), conn);
    }

    pub fn lookup_conn(&self, addr: &str) -> Option<Arc<Conn>> {
        let maps = self.maps.read().expect("registry lock poisoned");
        maps.conns.get(addr).cloned()
    }

    pub fn remove_conn(&self, addr: &str) {
        let mut maps = self.maps.write().expect("registry lock poisoned");
        maps.conns.remove(addr);
    }

    pub fn dialed_conns(&self) -> Vec<Arc<Conn>> {
        let maps = self.maps.read().expect("registry lock poisoned");
        maps.conns.values().cloned().collect()
    }

    pub fn is_entry(&self, id: u64) -> bool {
        let maps = self.maps.read().expect("registry lock poisoned");
        maps.is_entry.get(&id).copied().unwrap_or(false)
    }

    pub fn is_exit(&self, id: u64) -> bool {
        let maps = self.maps.read().expect("registry lock poisoned");
        maps.is_exit.get(&id).copied().unwrap_or(false)
    }

    pub fn next_of(&self, id: u64) -> Option<u64> {
        let maps = self.maps.read().expect("registry lock poisoned");
        maps.next_of.get(&id).copied()
    }

    /// True when no circuit state remains.
    pub fn no_circuits(&self) -> bool {
        let maps = self.maps.read().expect("registry lock poisoned");
        maps.circuit_conn.is_empty() && maps.next_of.is_empty() && maps.prev_of.is_empty()
    }

    /// Check the structural invariants of the map set. Returns a
    /// description of the first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        let maps = self.maps.read().expect("registry lock poisoned");
        for (&up, &down) in &maps.next_of {
            if maps.prev_of.get(&down) != Some(&up) {
                return Err(format!("next_of[{up:#x}]={down:#x} lacks inverse"));
            }
        }
        for (&down, &up) in &maps.prev_of {
            if maps.next_of.get(&up) != Some(&down) {
                return Err(format!("prev_of[{down:#x}]={up:#x} lacks inverse"));
            }
        }
        let mut expected: HashSet<u64> = maps.is_entry.keys().copied().collect();
        expected.extend(maps.is_exit.keys());
        expected.extend(maps.next_of.values());
        let actual: HashSet<u64> = maps.circuit_conn.keys().copied().collect();
        if expected != actual {
            return Err("circuit_conn keys diverge from entry/exit/next_of ids".into());
        }
        for id in maps.next_of.keys().chain(maps.prev_of.keys()) {
            if *id < MIN_CIRCUIT_ID {
                return Err(format!("circuit id {id:#x} in connection-id range"));
            }
        }
        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
