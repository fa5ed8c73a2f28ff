//! Connection registry
//!
//! Source of truth for every connection a pool tracks. Records are keyed by
//! `ConnectionId`; everything else in the pool (metrics, callers, background
//! loops) refers to a connection only through its id.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Opaque handle identifying a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnectionId {
    fn from(raw: u64) -> Self {
        ConnectionId(raw)
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Metadata and handle for one tracked connection
pub struct ConnectionRecord<C> {
    conn: Arc<C>,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub last_validated_at: Instant,
    pub in_use: bool,
}

impl<C> ConnectionRecord<C> {
    fn new(conn: Arc<C>) -> Self {
        let now = Instant::now();
        Self {
            conn,
            created_at: now,
            last_used_at: now,
            last_validated_at: now,
            in_use: false,
        }
    }

    pub fn connection(&self) -> &Arc<C> {
        &self.conn
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Connections picked by one maintenance sweep
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepPlan {
    pub expired: Vec<ConnectionId>,
    pub idle: Vec<ConnectionId>,
    pub to_validate: Vec<ConnectionId>,
}

/// Map of connection id to record, plus the set of ids ready for hand-out
///
/// Invariants kept by every method:
/// - every id in `available` is a key of `connections`
/// - a record is in `available` iff it is not `in_use`
pub struct Registry<C> {
    connections: HashMap<ConnectionId, ConnectionRecord<C>>,
    available: VecDeque<ConnectionId>,
    next_id: u64,
    /// Creations in flight that already hold a slot
    reserved: usize,
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Registry<C> {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            available: VecDeque::new(),
            next_id: 1,
            reserved: 0,
        }
    }

    /// Tracked connections, in use or not
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    pub fn active_count(&self) -> usize {
        self.connections.len() - self.available.len()
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionRecord<C>> {
        self.connections.get(&id)
    }

    /// Claim a slot for a creation about to start, if `limit` allows it
    pub fn try_reserve(&mut self, limit: usize) -> bool {
        if self.connections.len() + self.reserved < limit {
            self.reserved += 1;
            true
        } else {
            false
        }
    }

    /// Give back a slot whose creation failed
    pub fn cancel_reservation(&mut self) {
        self.reserved = self.reserved.saturating_sub(1);
    }

    /// Insert a freshly created connection into a reserved slot
    pub fn insert_reserved(&mut self, conn: C, in_use: bool) -> (ConnectionId, Arc<C>) {
        self.cancel_reservation();
        self.insert(conn, in_use)
    }

    fn insert(&mut self, conn: C, in_use: bool) -> (ConnectionId, Arc<C>) {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;

        let conn = Arc::new(conn);
        let mut record = ConnectionRecord::new(Arc::clone(&conn));
        record.in_use = in_use;
        self.connections.insert(id, record);
        if !in_use {
            self.available.push_back(id);
        }
        (id, conn)
    }

    /// Hand out the most recently returned available connection
    pub fn checkout(&mut self) -> Option<(ConnectionId, Arc<C>)> {
        while let Some(id) = self.available.pop_back() {
            if let Some(record) = self.connections.get_mut(&id) {
                record.in_use = true;
                record.last_used_at = Instant::now();
                return Some((id, Arc::clone(&record.conn)));
            }
        }
        None
    }

    /// Take a specific idle connection out of circulation
    pub fn checkout_id(&mut self, id: ConnectionId) -> Option<Arc<C>> {
        let record = self.connections.get_mut(&id)?;
        if record.in_use {
            return None;
        }
        record.in_use = true;
        self.available.retain(|candidate| *candidate != id);
        Some(Arc::clone(&record.conn))
    }

    /// Return an in-use connection to the available set
    ///
    /// Returns false if the id is unknown. Returning a connection that is
    /// already available is a no-op.
    pub fn check_in(&mut self, id: ConnectionId) -> bool {
        match self.connections.get_mut(&id) {
            Some(record) => {
                if record.in_use {
                    record.in_use = false;
                    record.last_used_at = Instant::now();
                    self.available.push_back(id);
                }
                true
            }
            None => false,
        }
    }

    /// Return a connection taken by `checkout_id` after a successful
    /// validation, without counting it as a use
    pub fn restore_validated(&mut self, id: ConnectionId) -> bool {
        match self.connections.get_mut(&id) {
            Some(record) => {
                record.last_validated_at = Instant::now();
                if record.in_use {
                    record.in_use = false;
                    self.available.push_back(id);
                }
                true
            }
            None => false,
        }
    }

    /// Drop a connection from the registry, handing its handle back for closing
    pub fn remove(&mut self, id: ConnectionId) -> Option<Arc<C>> {
        let record = self.connections.remove(&id)?;
        if !record.in_use {
            self.available.retain(|candidate| *candidate != id);
        }
        Some(record.conn)
    }

    /// Remove every connection, in use or not
    pub fn drain(&mut self) -> Vec<(ConnectionId, Arc<C>)> {
        self.available.clear();
        self.connections
            .drain()
            .map(|(id, record)| (id, record.conn))
            .collect()
    }

    /// Pick idle connections for eviction and validation
    ///
    /// Expired connections go first; idle-timeout eviction stops once the pool
    /// would drop to `min_size`. Validation candidates are idle connections
    /// not validated within `validation_interval`.
    pub fn plan_sweep(
        &self,
        max_lifetime: Duration,
        idle_timeout: Duration,
        validation_interval: Duration,
        min_size: usize,
    ) -> SweepPlan {
        let mut plan = SweepPlan::default();
        let mut remaining = self.connections.len();

        let mut idle: Vec<(&ConnectionId, &ConnectionRecord<C>)> = self
            .connections
            .iter()
            .filter(|(_, record)| !record.in_use)
            .collect();
        // Longest idle first
        idle.sort_by_key(|(_, record)| record.last_used_at);

        for (id, record) in idle {
            if record.age() >= max_lifetime {
                plan.expired.push(*id);
                remaining -= 1;
            } else if record.idle_for() >= idle_timeout && remaining > min_size {
                plan.idle.push(*id);
                remaining -= 1;
            } else if record.last_validated_at.elapsed() >= validation_interval {
                plan.to_validate.push(*id);
            }
        }

        plan
    }

    /// Up to `count` available connections, least recently used first
    pub fn least_recently_used(&self, count: usize) -> Vec<ConnectionId> {
        let mut idle: Vec<(ConnectionId, Instant)> = self
            .available
            .iter()
            .filter_map(|id| self.connections.get(id).map(|r| (*id, r.last_used_at)))
            .collect();
        idle.sort_by_key(|(_, last_used)| *last_used);
        idle.into_iter().take(count).map(|(id, _)| id).collect()
    }
}
