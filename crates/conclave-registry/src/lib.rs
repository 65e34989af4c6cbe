// SPDX-License-Identifier: Apache-2.0
//!
//! Single-map-with-status registries for agents, services, and clients, plus
//! the pending/bound connection registry.
//!
//! A registry keeps exactly one `HashMap<Id, PeerRecord<Id>>` as its source
//! of truth; name and connection lookups are derived by scanning it rather
//! than maintained as separate indexes, so there is no secondary structure
//! that can drift out of sync with the primary map.

use std::collections::HashMap;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use conclave_ids::ConnectionId;
use conclave_proto::DiscoveryFilter;
use serde_json::Value;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Online,
    Offline,
    Busy,
    Error,
}

impl PeerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerStatus::Online => "online",
            PeerStatus::Offline => "offline",
            PeerStatus::Busy => "busy",
            PeerStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerRecord<Id> {
    pub id: Id,
    pub name: String,
    pub capabilities: Vec<String>,
    pub manifest: Value,
    pub status: PeerStatus,
    pub connection_id: Option<ConnectionId>,
    pub status_details: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
}

impl<Id: Clone> PeerRecord<Id> {
    pub fn new(id: Id, name: impl Into<String>, connection_id: ConnectionId) -> Self {
        Self {
            id,
            name: name.into(),
            capabilities: Vec::new(),
            manifest: Value::Null,
            status: PeerStatus::Online,
            connection_id: Some(connection_id),
            status_details: None,
            registered_at: Utc::now(),
            disconnected_at: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_manifest(mut self, manifest: Value) -> Self {
        self.manifest = manifest;
        self
    }
}

/// Registry of peers of one kind (agents, services, or clients).
///
/// `register` implements the name-collision rule from the data model: if an
/// online record with the same name but a different id already exists, it is
/// transitioned to `offline` before the new record is inserted.
pub struct Registry<Id: Eq + Hash + Clone> {
    records: RwLock<HashMap<Id, PeerRecord<Id>>>,
}

impl<Id: Eq + Hash + Clone> Default for Registry<Id> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id: Eq + Hash + Clone> Registry<Id> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts `record`, offlining any prior online record with the same
    /// name but a different id. Returns the id of the record that was
    /// offlined, if any.
    pub async fn register(&self, record: PeerRecord<Id>) -> Option<Id> {
        let mut guard = self.records.write().await;
        let collided = guard
            .values_mut()
            .find(|r| r.name == record.name && r.id != record.id && r.status == PeerStatus::Online);
        let offlined = if let Some(old) = collided {
            old.status = PeerStatus::Offline;
            old.connection_id = None;
            old.disconnected_at = Some(Utc::now());
            Some(old.id.clone())
        } else {
            None
        };
        guard.insert(record.id.clone(), record);
        offlined
    }

    pub async fn get_by_id(&self, id: &Id) -> Option<PeerRecord<Id>> {
        self.records.read().await.get(id).cloned()
    }

    pub async fn get_by_name(&self, name: &str) -> Option<PeerRecord<Id>> {
        self.records
            .read()
            .await
            .values()
            .find(|r| r.name == name && r.status == PeerStatus::Online)
            .cloned()
    }

    /// Like [`Registry::get_by_name`] but also matches offline records, so a
    /// reconnecting peer can recover its previous id instead of minting a new
    /// one under the same name.
    pub async fn get_any_by_name(&self, name: &str) -> Option<PeerRecord<Id>> {
        self.records.read().await.values().find(|r| r.name == name).cloned()
    }

    pub async fn get_by_connection_id(&self, conn: &ConnectionId) -> Option<PeerRecord<Id>> {
        self.records
            .read()
            .await
            .values()
            .find(|r| r.connection_id.as_ref() == Some(conn))
            .cloned()
    }

    pub async fn all(&self, filter: &DiscoveryFilter) -> Vec<PeerRecord<Id>> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| match &filter.status {
                Some(s) => r.status.as_str() == s,
                None => true,
            })
            .filter(|r| match &filter.name {
                Some(n) => &r.name == n,
                None => true,
            })
            .filter(|r| match &filter.capabilities {
                Some(caps) => caps.iter().all(|c| r.capabilities.contains(c)),
                None => true,
            })
            .cloned()
            .collect()
    }

    pub async fn update_status(&self, id: &Id, status: PeerStatus, details: Option<String>) {
        let mut guard = self.records.write().await;
        if let Some(rec) = guard.get_mut(id) {
            rec.status = status;
            rec.status_details = details;
            if status == PeerStatus::Offline {
                rec.connection_id = None;
                rec.disconnected_at = Some(Utc::now());
            }
        }
    }

    /// Marks the record bound to `conn` as offline and clears its connection
    /// binding. Returns the affected id, if any.
    pub async fn remove_by_connection_id(&self, conn: &ConnectionId) -> Option<Id> {
        let mut guard = self.records.write().await;
        let hit = guard
            .values_mut()
            .find(|r| r.connection_id.as_ref() == Some(conn))?;
        hit.status = PeerStatus::Offline;
        hit.connection_id = None;
        hit.disconnected_at = Some(Utc::now());
        Some(hit.id.clone())
    }

    /// Marks every record offline and clears its connection binding. Called
    /// once by the shutdown controller.
    pub async fn offline_all(&self) {
        let mut guard = self.records.write().await;
        for rec in guard.values_mut() {
            rec.status = PeerStatus::Offline;
            rec.connection_id = None;
            rec.disconnected_at = Some(Utc::now());
        }
    }
}

/// State of a single live connection, before and after identity binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Bound { peer_id: String },
}

/// Tracks every open connection on a hub, independent of which identity
/// registry eventually claims it.
pub struct ConnectionRegistry {
    conns: RwLock<HashMap<ConnectionId, ConnectionState>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
        }
    }

    pub async fn accept(&self, id: ConnectionId) {
        self.conns.write().await.insert(id, ConnectionState::Pending);
    }

    pub async fn bind(&self, id: &ConnectionId, peer_id: String) {
        if let Some(state) = self.conns.write().await.get_mut(id) {
            *state = ConnectionState::Bound { peer_id };
        }
    }

    pub async fn state(&self, id: &ConnectionId) -> Option<ConnectionState> {
        self.conns.read().await.get(id).cloned()
    }

    /// Drops the connection entirely; callers use this on channel close.
    pub async fn remove(&self, id: &ConnectionId) -> Option<ConnectionState> {
        self.conns.write().await.remove(id)
    }

    pub async fn is_pending(&self, id: &ConnectionId) -> bool {
        matches!(self.state(id).await, Some(ConnectionState::Pending))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_ids::AgentId;

    fn agent(id: AgentId, name: &str) -> PeerRecord<AgentId> {
        PeerRecord::new(id, name, ConnectionId::new())
    }

    #[tokio::test]
    async fn register_then_get_by_id_and_name() {
        let reg: Registry<AgentId> = Registry::new();
        let id = AgentId::new();
        reg.register(agent(id, "Echo")).await;
        assert!(reg.get_by_id(&id).await.is_some());
        assert_eq!(reg.get_by_name("Echo").await.unwrap().id, id);
    }

    #[tokio::test]
    async fn same_name_different_id_offlines_older_record() {
        let reg: Registry<AgentId> = Registry::new();
        let old_id = AgentId::new();
        let new_id = AgentId::new();
        reg.register(agent(old_id, "Echo")).await;
        let offlined = reg.register(agent(new_id, "Echo")).await;
        assert_eq!(offlined, Some(old_id));
        assert_eq!(reg.get_by_id(&old_id).await.unwrap().status, PeerStatus::Offline);
        assert_eq!(reg.get_by_name("Echo").await.unwrap().id, new_id);
    }

    #[tokio::test]
    async fn get_any_by_name_finds_offline_records_get_by_name_does_not() {
        let reg: Registry<AgentId> = Registry::new();
        let id = AgentId::new();
        reg.register(agent(id, "Echo")).await;
        reg.remove_by_connection_id(&reg.get_by_id(&id).await.unwrap().connection_id.unwrap()).await;
        assert!(reg.get_by_name("Echo").await.is_none());
        assert_eq!(reg.get_any_by_name("Echo").await.unwrap().id, id);
    }

    #[tokio::test]
    async fn remove_by_connection_id_offlines_and_clears_binding() {
        let reg: Registry<AgentId> = Registry::new();
        let id = AgentId::new();
        let conn = ConnectionId::new();
        reg.register(PeerRecord::new(id, "Echo", conn)).await;
        let removed = reg.remove_by_connection_id(&conn).await;
        assert_eq!(removed, Some(id));
        let rec = reg.get_by_id(&id).await.unwrap();
        assert_eq!(rec.status, PeerStatus::Offline);
        assert!(rec.connection_id.is_none());
    }

    #[tokio::test]
    async fn discovery_filter_matches_capabilities_and_status() {
        let reg: Registry<AgentId> = Registry::new();
        reg.register(agent(AgentId::new(), "Echo").with_capabilities(vec!["echo".into()]))
            .await;
        reg.register(agent(AgentId::new(), "Other").with_capabilities(vec!["sum".into()]))
            .await;
        let filter = DiscoveryFilter {
            capabilities: Some(vec!["echo".into()]),
            ..Default::default()
        };
        let hits = reg.all(&filter).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "Echo");
    }

    #[tokio::test]
    async fn offline_all_clears_every_binding() {
        let reg: Registry<AgentId> = Registry::new();
        reg.register(agent(AgentId::new(), "Echo")).await;
        reg.register(agent(AgentId::new(), "Sum")).await;
        reg.offline_all().await;
        let filter = DiscoveryFilter::default();
        for rec in reg.all(&filter).await {
            assert_eq!(rec.status, PeerStatus::Offline);
            assert!(rec.connection_id.is_none());
        }
    }

    #[tokio::test]
    async fn connection_registry_pending_then_bound() {
        let conns = ConnectionRegistry::new();
        let id = ConnectionId::new();
        conns.accept(id).await;
        assert!(conns.is_pending(&id).await);
        conns.bind(&id, "agent-1".into()).await;
        assert_eq!(
            conns.state(&id).await,
            Some(ConnectionState::Bound { peer_id: "agent-1".into() })
        );
    }
}
