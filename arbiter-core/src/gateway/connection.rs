//! WebSocket connection bookkeeping.

use std::collections::HashSet;
use uuid::Uuid;

/// Tracks live connections and enforces the connection cap.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: HashSet<Uuid>,
    max_connections: usize,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashSet::new(),
            max_connections,
        }
    }

    /// Register a new connection. Returns `None` if the limit is reached.
    pub fn add_connection(&mut self) -> Option<Uuid> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        let id = Uuid::new_v4();
        self.connections.insert(id);
        Some(id)
    }

    pub fn remove_connection(&mut self, id: &Uuid) -> bool {
        self.connections.remove(id)
    }

    pub fn active_count(&self) -> usize {
        self.connections.len()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}
