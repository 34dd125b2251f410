//! `ServerRepository` / `LeaseRepository` traits -- the "capability set"
//! abstraction spec.md §9 calls for, so the allocator and state machine can
//! be exercised against an in-memory double in tests without paying for a
//! real redb file, mirroring the teacher's `Storage` trait / `IpManager<T>`
//! split.
use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::{IgniteError, Result},
    model::{Lease, MacAddr, Server},
    store::{Db, LEASES_TABLE, SERVERS_TABLE},
};

pub trait ServerRepository: Send + Sync {
    fn get(&self, id: Uuid) -> Result<Option<Server>>;
    fn get_by_ip(&self, ip: Ipv4Addr) -> Result<Option<Server>>;
    fn list(&self) -> Result<Vec<Server>>;
    fn put(&self, server: &Server) -> Result<()>;
    fn delete(&self, id: Uuid) -> Result<()>;
}

pub trait LeaseRepository: Send + Sync {
    fn get(&self, id: Uuid) -> Result<Option<Lease>>;
    fn get_by_ip(&self, server_id: Uuid, ip: Ipv4Addr) -> Result<Option<Lease>>;
    fn get_by_mac(&self, server_id: Uuid, mac: MacAddr) -> Result<Option<Lease>>;
    fn get_by_server(&self, server_id: Uuid) -> Result<Vec<Lease>>;
    fn get_expired(&self, server_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Lease>>;
    fn get_by_state(&self, state: crate::model::LeaseState) -> Result<Vec<Lease>>;
    fn put(&self, lease: &Lease) -> Result<()>;
    fn delete(&self, id: Uuid) -> Result<()>;
    fn delete_by_mac(&self, server_id: Uuid, mac: MacAddr) -> Result<()>;
    fn delete_by_server(&self, server_id: Uuid) -> Result<()>;
    /// `CleanupExpired()`: removes every lease across all servers that is
    /// past its expiry and not `reserved` (spec.md §4.B, §8 property 7 --
    /// reserved leases are never auto-expired by this operation). Returns
    /// the number of leases removed.
    fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

fn server_key(id: Uuid) -> String {
    id.to_string()
}

fn lease_key(id: Uuid) -> String {
    id.to_string()
}

/// redb-backed `ServerRepository`.
pub struct KvServerRepo {
    db: Db,
}

impl KvServerRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

impl ServerRepository for KvServerRepo {
    fn get(&self, id: Uuid) -> Result<Option<Server>> {
        match self.db.get(SERVERS_TABLE, &server_key(id))? {
            Some(json) => Ok(Some(serde_json::from_str(&json).map_err(|e| IgniteError::Codec { op: "decode server".into(), source: e })?)),
            None => Ok(None),
        }
    }

    fn get_by_ip(&self, ip: Ipv4Addr) -> Result<Option<Server>> {
        for (_, json) in self.db.for_each(SERVERS_TABLE)? {
            let server: Server = serde_json::from_str(&json)
                .map_err(|e| IgniteError::Codec { op: "decode server".into(), source: e })?;
            if server.ip == ip {
                return Ok(Some(server));
            }
        }
        Ok(None)
    }

    fn list(&self) -> Result<Vec<Server>> {
        let mut out = Vec::new();
        for (_, json) in self.db.for_each(SERVERS_TABLE)? {
            out.push(
                serde_json::from_str(&json)
                    .map_err(|e| IgniteError::Codec { op: "decode server".into(), source: e })?,
            );
        }
        Ok(out)
    }

    fn put(&self, server: &Server) -> Result<()> {
        let json = serde_json::to_string(server)
            .map_err(|e| IgniteError::Codec { op: "encode server".into(), source: e })?;
        self.db.put(SERVERS_TABLE, &server_key(server.id), &json)
    }

    fn delete(&self, id: Uuid) -> Result<()> {
        self.db.delete(SERVERS_TABLE, &server_key(id))
    }
}

/// redb-backed `LeaseRepository`. Secondary lookups (by IP, by MAC, by
/// server, expired) are linear scans over the `leases` table -- acceptable
/// at the scale this store targets (spec.md §4.B).
pub struct KvLeaseRepo {
    db: Db,
}

impl KvLeaseRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    fn decode(json: &str) -> Result<Lease> {
        serde_json::from_str(json)
            .map_err(|e| IgniteError::Codec { op: "decode lease".into(), source: e })
    }
}

impl LeaseRepository for KvLeaseRepo {
    fn get(&self, id: Uuid) -> Result<Option<Lease>> {
        match self.db.get(LEASES_TABLE, &lease_key(id))? {
            Some(json) => Ok(Some(Self::decode(&json)?)),
            None => Ok(None),
        }
    }

    fn get_by_ip(&self, server_id: Uuid, ip: Ipv4Addr) -> Result<Option<Lease>> {
        for (_, json) in self.db.for_each(LEASES_TABLE)? {
            let lease = Self::decode(&json)?;
            if lease.server_id == server_id && lease.ip == ip {
                return Ok(Some(lease));
            }
        }
        Ok(None)
    }

    fn get_by_mac(&self, server_id: Uuid, mac: MacAddr) -> Result<Option<Lease>> {
        for (_, json) in self.db.for_each(LEASES_TABLE)? {
            let lease = Self::decode(&json)?;
            if lease.server_id == server_id && lease.mac == mac {
                return Ok(Some(lease));
            }
        }
        Ok(None)
    }

    fn get_by_server(&self, server_id: Uuid) -> Result<Vec<Lease>> {
        let mut out = Vec::new();
        for (_, json) in self.db.for_each(LEASES_TABLE)? {
            let lease = Self::decode(&json)?;
            if lease.server_id == server_id {
                out.push(lease);
            }
        }
        Ok(out)
    }

    fn get_expired(&self, server_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Lease>> {
        let mut out = Vec::new();
        for (_, json) in self.db.for_each(LEASES_TABLE)? {
            let lease = Self::decode(&json)?;
            if lease.server_id == server_id && !lease.is_live(now) {
                out.push(lease);
            }
        }
        Ok(out)
    }

    fn get_by_state(&self, state: crate::model::LeaseState) -> Result<Vec<Lease>> {
        let mut out = Vec::new();
        for (_, json) in self.db.for_each(LEASES_TABLE)? {
            let lease = Self::decode(&json)?;
            if lease.state == state {
                out.push(lease);
            }
        }
        Ok(out)
    }

    fn put(&self, lease: &Lease) -> Result<()> {
        let json = serde_json::to_string(lease)
            .map_err(|e| IgniteError::Codec { op: "encode lease".into(), source: e })?;
        self.db.put(LEASES_TABLE, &lease_key(lease.id), &json)
    }

    fn delete(&self, id: Uuid) -> Result<()> {
        self.db.delete(LEASES_TABLE, &lease_key(id))
    }

    fn delete_by_mac(&self, server_id: Uuid, mac: MacAddr) -> Result<()> {
        for (key, json) in self.db.for_each(LEASES_TABLE)? {
            let lease = Self::decode(&json)?;
            if lease.server_id == server_id && lease.mac == mac {
                self.db.delete(LEASES_TABLE, &key)?;
            }
        }
        Ok(())
    }

    fn delete_by_server(&self, server_id: Uuid) -> Result<()> {
        for (key, json) in self.db.for_each(LEASES_TABLE)? {
            let lease = Self::decode(&json)?;
            if lease.server_id == server_id {
                self.db.delete(LEASES_TABLE, &key)?;
            }
        }
        Ok(())
    }

    fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for (key, json) in self.db.for_each(LEASES_TABLE)? {
            let lease = Self::decode(&json)?;
            if !lease.reserved && !lease.is_live(now) {
                self.db.delete(LEASES_TABLE, &key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// In-memory doubles used by this crate's (and downstream crates')
/// test suites -- the substitution spec.md §9 calls for.
#[derive(Default)]
pub struct MemServerRepo {
    inner: Mutex<HashMap<Uuid, Server>>,
}

impl ServerRepository for MemServerRepo {
    fn get(&self, id: Uuid) -> Result<Option<Server>> {
        Ok(self.inner.lock().unwrap().get(&id).cloned())
    }

    fn get_by_ip(&self, ip: Ipv4Addr) -> Result<Option<Server>> {
        Ok(self.inner.lock().unwrap().values().find(|s| s.ip == ip).cloned())
    }

    fn list(&self) -> Result<Vec<Server>> {
        Ok(self.inner.lock().unwrap().values().cloned().collect())
    }

    fn put(&self, server: &Server) -> Result<()> {
        self.inner.lock().unwrap().insert(server.id, server.clone());
        Ok(())
    }

    fn delete(&self, id: Uuid) -> Result<()> {
        self.inner.lock().unwrap().remove(&id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemLeaseRepo {
    inner: Mutex<HashMap<Uuid, Lease>>,
}

impl LeaseRepository for MemLeaseRepo {
    fn get(&self, id: Uuid) -> Result<Option<Lease>> {
        Ok(self.inner.lock().unwrap().get(&id).cloned())
    }

    fn get_by_ip(&self, server_id: Uuid, ip: Ipv4Addr) -> Result<Option<Lease>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .values()
            .find(|l| l.server_id == server_id && l.ip == ip)
            .cloned())
    }

    fn get_by_mac(&self, server_id: Uuid, mac: MacAddr) -> Result<Option<Lease>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .values()
            .find(|l| l.server_id == server_id && l.mac == mac)
            .cloned())
    }

    fn get_by_server(&self, server_id: Uuid) -> Result<Vec<Lease>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .values()
            .filter(|l| l.server_id == server_id)
            .cloned()
            .collect())
    }

    fn get_expired(&self, server_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Lease>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .values()
            .filter(|l| l.server_id == server_id && !l.is_live(now))
            .cloned()
            .collect())
    }

    fn get_by_state(&self, state: crate::model::LeaseState) -> Result<Vec<Lease>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .values()
            .filter(|l| l.state == state)
            .cloned()
            .collect())
    }

    fn put(&self, lease: &Lease) -> Result<()> {
        self.inner.lock().unwrap().insert(lease.id, lease.clone());
        Ok(())
    }

    fn delete(&self, id: Uuid) -> Result<()> {
        self.inner.lock().unwrap().remove(&id);
        Ok(())
    }

    fn delete_by_mac(&self, server_id: Uuid, mac: MacAddr) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .retain(|_, l| !(l.server_id == server_id && l.mac == mac));
        Ok(())
    }

    fn delete_by_server(&self, server_id: Uuid) -> Result<()> {
        self.inner.lock().unwrap().retain(|_, l| l.server_id != server_id);
        Ok(())
    }

    fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.len();
        inner.retain(|_, l| l.reserved || l.is_live(now));
        Ok(before - inner.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LeaseState, ServerOptions, Source};

    fn sample_server() -> Server {
        let now = Utc::now();
        Server {
            id: Uuid::new_v4(),
            ip: Ipv4Addr::new(10, 0, 0, 10),
            ip_start: Ipv4Addr::new(10, 0, 0, 50),
            lease_range: 10,
            lease_duration_secs: 3600,
            options: ServerOptions {
                subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
                gateway: Ipv4Addr::new(10, 0, 0, 1),
                dns: Ipv4Addr::new(10, 0, 0, 1),
                tftp_server: Ipv4Addr::new(10, 0, 0, 10),
                extra: Default::default(),
            },
            started: false,
            created_at: now,
            updated_at: now,
            extra: Default::default(),
        }
    }

    fn sample_lease(server_id: Uuid, ip: Ipv4Addr) -> Lease {
        let now = Utc::now();
        Lease {
            id: Uuid::new_v4(),
            server_id,
            ip,
            mac: MacAddr::from([0, 1, 2, 3, 4, 5]),
            expiry: now + chrono::Duration::seconds(3600),
            reserved: false,
            state: LeaseState::Assigned,
            state_updated_at: now,
            last_seen: now,
            state_history: vec![],
            menu: Default::default(),
            ipmi: Default::default(),
            extra: Default::default(),
        }
    }

    #[test]
    fn kv_server_repo_round_trips_and_finds_by_ip() {
        let (db, _dir) = Db::open_temp();
        let repo = KvServerRepo::new(db);
        let server = sample_server();
        repo.put(&server).unwrap();
        assert_eq!(repo.get(server.id).unwrap(), Some(server.clone()));
        assert_eq!(repo.get_by_ip(server.ip).unwrap().unwrap().id, server.id);
        repo.delete(server.id).unwrap();
        assert_eq!(repo.get(server.id).unwrap(), None);
    }

    #[test]
    fn kv_lease_repo_secondary_lookups() {
        let (db, _dir) = Db::open_temp();
        let repo = KvLeaseRepo::new(db);
        let server_id = Uuid::new_v4();
        let lease = sample_lease(server_id, Ipv4Addr::new(10, 0, 0, 51));
        repo.put(&lease).unwrap();
        assert_eq!(repo.get_by_ip(server_id, lease.ip).unwrap().unwrap().id, lease.id);
        assert_eq!(repo.get_by_mac(server_id, lease.mac).unwrap().unwrap().id, lease.id);
        assert_eq!(repo.get_by_server(server_id).unwrap().len(), 1);
        assert_eq!(repo.get_by_state(LeaseState::Assigned).unwrap().len(), 1);
    }

    #[test]
    fn mem_repos_mirror_kv_behavior() {
        let repo = MemLeaseRepo::default();
        let server_id = Uuid::new_v4();
        let lease = sample_lease(server_id, Ipv4Addr::new(10, 0, 0, 52));
        repo.put(&lease).unwrap();
        assert_eq!(repo.get_by_ip(server_id, lease.ip).unwrap().unwrap().id, lease.id);
        let expired = repo
            .get_expired(server_id, Utc::now() + chrono::Duration::seconds(7200))
            .unwrap();
        assert_eq!(expired.len(), 1);
    }

    #[test]
    fn source_display_matches_lowercase_name() {
        assert_eq!(Source::Manual.to_string(), "manual");
    }

    #[test]
    fn cleanup_expired_skips_reserved_leases() {
        let repo = MemLeaseRepo::default();
        let server_id = Uuid::new_v4();
        let now = Utc::now();

        let mut reserved = sample_lease(server_id, Ipv4Addr::new(10, 0, 0, 51));
        reserved.reserved = true;
        reserved.expiry = now - chrono::Duration::seconds(3600);
        repo.put(&reserved).unwrap();

        let mut expired = sample_lease(server_id, Ipv4Addr::new(10, 0, 0, 52));
        expired.expiry = now - chrono::Duration::seconds(3600);
        repo.put(&expired).unwrap();

        let removed = repo.cleanup_expired(now).unwrap();
        assert_eq!(removed, 1);
        assert!(repo.get(reserved.id).unwrap().is_some());
        assert!(repo.get(expired.id).unwrap().is_none());
    }

    #[test]
    fn kv_cleanup_expired_skips_reserved_leases() {
        let (db, _dir) = Db::open_temp();
        let repo = KvLeaseRepo::new(db);
        let server_id = Uuid::new_v4();
        let now = Utc::now();

        let mut reserved = sample_lease(server_id, Ipv4Addr::new(10, 0, 0, 53));
        reserved.reserved = true;
        reserved.expiry = now - chrono::Duration::seconds(3600);
        repo.put(&reserved).unwrap();

        let mut expired = sample_lease(server_id, Ipv4Addr::new(10, 0, 0, 54));
        expired.expiry = now - chrono::Duration::seconds(3600);
        repo.put(&expired).unwrap();

        let removed = repo.cleanup_expired(now).unwrap();
        assert_eq!(removed, 1);
        assert!(repo.get(reserved.id).unwrap().is_some());
        assert!(repo.get(expired.id).unwrap().is_none());
    }

    #[test]
    fn delete_by_mac_removes_matching_lease_only() {
        let repo = MemLeaseRepo::default();
        let server_id = Uuid::new_v4();
        let a = sample_lease(server_id, Ipv4Addr::new(10, 0, 0, 55));
        let mut b = sample_lease(server_id, Ipv4Addr::new(10, 0, 0, 56));
        b.mac = MacAddr::from([1, 1, 1, 1, 1, 1]);
        repo.put(&a).unwrap();
        repo.put(&b).unwrap();

        repo.delete_by_mac(server_id, a.mac).unwrap();
        assert!(repo.get(a.id).unwrap().is_none());
        assert!(repo.get(b.id).unwrap().is_some());
    }

    #[test]
    fn delete_by_server_removes_all_its_leases() {
        let repo = MemLeaseRepo::default();
        let server_a = Uuid::new_v4();
        let server_b = Uuid::new_v4();
        let a1 = sample_lease(server_a, Ipv4Addr::new(10, 0, 0, 57));
        let mut a2 = sample_lease(server_a, Ipv4Addr::new(10, 0, 0, 58));
        a2.mac = MacAddr::from([2, 2, 2, 2, 2, 2]);
        let b1 = sample_lease(server_b, Ipv4Addr::new(10, 0, 0, 59));
        repo.put(&a1).unwrap();
        repo.put(&a2).unwrap();
        repo.put(&b1).unwrap();

        repo.delete_by_server(server_a).unwrap();
        assert!(repo.get_by_server(server_a).unwrap().is_empty());
        assert_eq!(repo.get_by_server(server_b).unwrap().len(), 1);
    }
}
