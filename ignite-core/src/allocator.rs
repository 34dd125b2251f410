//! Free-function IP allocator. Takes a `&dyn LeaseRepository` rather than
//! owning one so it runs unchanged against the redb-backed repo in
//! production and the in-memory repo in tests (the teacher's `IpManager<T>`
//! plays the same role over its `Storage` trait).
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::{IgniteError, Result},
    model::{Lease, LeaseState, MacAddr, Server, Source},
    repo::LeaseRepository,
};

/// Resolves which IP would be offered to `mac` without persisting anything --
/// the DISCOVER half of the four-step algorithm `allocate` commits. A lease
/// is only ever created by a successful REQUEST (or the reservation API), so
/// DISCOVER must be free to run this repeatedly without occupying an address.
pub fn select_ip(
    repo: &dyn LeaseRepository,
    server: &Server,
    mac: MacAddr,
    requested_ip: Option<std::net::Ipv4Addr>,
    now: DateTime<Utc>,
) -> Result<std::net::Ipv4Addr> {
    // Step 1: a still-live lease already held by this MAC wins outright.
    if let Some(existing) = repo.get_by_mac(server.id, mac)? {
        if existing.is_live(now) {
            return Ok(existing.ip);
        }
    }

    let held_by_other = |ip: std::net::Ipv4Addr| -> Result<bool> {
        Ok(repo
            .get_by_ip(server.id, ip)?
            .map(|l| l.mac != mac && l.is_live(now))
            .unwrap_or(false))
    };

    // Step 2: honor the client's requested IP if it's in-range and free.
    if let Some(ip) = requested_ip {
        if server.contains(ip) && !held_by_other(ip)? {
            return Ok(ip);
        }
    }

    // Step 3: linear scan from the start of the range for the first free IP.
    let start: u32 = server.ip_start.into();
    for i in 0..server.lease_range {
        let candidate = std::net::Ipv4Addr::from(start.wrapping_add(i));
        if !held_by_other(candidate)? {
            return Ok(candidate);
        }
    }

    // Step 4: range exhausted.
    Err(IgniteError::Conflict(format!(
        "no addresses available on server {}",
        server.id
    )))
}

/// Claims an IP for `mac` against `server`, honoring `requested_ip` when
/// possible, and persists the resulting lease. Called on a successful
/// REQUEST (or by the reservation API) -- never on a bare DISCOVER, which
/// should use `select_ip` instead. See the four-step algorithm this mirrors
/// exactly.
pub fn allocate(
    repo: &dyn LeaseRepository,
    server: &Server,
    mac: MacAddr,
    requested_ip: Option<std::net::Ipv4Addr>,
    now: DateTime<Utc>,
) -> Result<Lease> {
    // Step 1: extend an existing non-expired (or reserved) lease for this MAC.
    if let Some(mut existing) = repo.get_by_mac(server.id, mac)? {
        if existing.is_live(now) {
            existing.expiry = now + chrono::Duration::seconds(server.lease_duration_secs as i64);
            existing.last_seen = now;
            repo.put(&existing)?;
            return Ok(existing);
        }
    }

    let held_by_other = |ip: std::net::Ipv4Addr| -> Result<bool> {
        Ok(repo
            .get_by_ip(server.id, ip)?
            .map(|l| l.mac != mac && l.is_live(now))
            .unwrap_or(false))
    };

    // Step 2: honor the client's requested IP if it's in-range and free.
    if let Some(ip) = requested_ip {
        if server.contains(ip) && !held_by_other(ip)? {
            return claim(repo, server, mac, ip, now);
        }
    }

    // Step 3: linear scan from the start of the range for the first free IP.
    let start: u32 = server.ip_start.into();
    for i in 0..server.lease_range {
        let candidate = std::net::Ipv4Addr::from(start.wrapping_add(i));
        if !held_by_other(candidate)? {
            return claim(repo, server, mac, candidate, now);
        }
    }

    // Step 4: range exhausted.
    Err(IgniteError::Conflict(format!(
        "no addresses available on server {}",
        server.id
    )))
}

fn claim(
    repo: &dyn LeaseRepository,
    server: &Server,
    mac: MacAddr,
    ip: std::net::Ipv4Addr,
    now: DateTime<Utc>,
) -> Result<Lease> {
    // An expired, non-reserved lease already sitting on this IP (possibly for
    // a different MAC) is reclaimed by overwriting it in place.
    let existing = repo.get_by_ip(server.id, ip)?;
    let mut lease = match existing {
        Some(mut stale) if stale.mac == mac => {
            stale.last_seen = now;
            stale
        }
        Some(stale) => {
            let mut lease = new_lease(server.id, ip, mac, now);
            lease.id = stale.id;
            lease
        }
        None => new_lease(server.id, ip, mac, now),
    };
    lease.expiry = now + chrono::Duration::seconds(server.lease_duration_secs as i64);
    repo.put(&lease)?;
    Ok(lease)
}

fn new_lease(
    server_id: Uuid,
    ip: std::net::Ipv4Addr,
    mac: MacAddr,
    now: DateTime<Utc>,
) -> Lease {
    Lease {
        id: Uuid::new_v4(),
        server_id,
        ip,
        mac,
        expiry: now, // overwritten by claim() once the lease duration is known
        reserved: false,
        state: LeaseState::Assigned,
        state_updated_at: now,
        last_seen: now,
        state_history: vec![crate::model::StateTransition {
            from_state: String::new(),
            to_state: LeaseState::Assigned.as_str().to_string(),
            timestamp: now,
            source: Source::Dhcp,
        }],
        menu: Default::default(),
        ipmi: Default::default(),
        extra: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::ServerOptions, repo::MemLeaseRepo};
    use std::net::Ipv4Addr;

    fn server() -> Server {
        let now = Utc::now();
        Server {
            id: Uuid::new_v4(),
            ip: Ipv4Addr::new(10, 0, 0, 1),
            ip_start: Ipv4Addr::new(10, 0, 0, 50),
            lease_range: 3,
            lease_duration_secs: 3600,
            options: ServerOptions {
                subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
                gateway: Ipv4Addr::new(10, 0, 0, 1),
                dns: Ipv4Addr::new(10, 0, 0, 1),
                tftp_server: Ipv4Addr::new(10, 0, 0, 1),
                extra: Default::default(),
            },
            started: false,
            created_at: now,
            updated_at: now,
            extra: Default::default(),
        }
    }

    #[test]
    fn first_discover_gets_first_free_ip() {
        let repo = MemLeaseRepo::default();
        let srv = server();
        let mac: MacAddr = "aa:bb:cc:dd:ee:01".parse().unwrap();
        let now = Utc::now();
        let lease = allocate(&repo, &srv, mac, None, now).unwrap();
        assert_eq!(lease.ip, Ipv4Addr::new(10, 0, 0, 50));
    }

    #[test]
    fn repeat_discover_extends_existing_lease() {
        let repo = MemLeaseRepo::default();
        let srv = server();
        let mac: MacAddr = "aa:bb:cc:dd:ee:01".parse().unwrap();
        let now = Utc::now();
        let first = allocate(&repo, &srv, mac, None, now).unwrap();
        let later = now + chrono::Duration::seconds(10);
        let second = allocate(&repo, &srv, mac, None, later).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.ip, second.ip);
        assert!(second.expiry > first.expiry);
    }

    #[test]
    fn requested_ip_honored_when_free() {
        let repo = MemLeaseRepo::default();
        let srv = server();
        let mac: MacAddr = "aa:bb:cc:dd:ee:02".parse().unwrap();
        let now = Utc::now();
        let lease = allocate(&repo, &srv, mac, Some(Ipv4Addr::new(10, 0, 0, 52)), now).unwrap();
        assert_eq!(lease.ip, Ipv4Addr::new(10, 0, 0, 52));
    }

    #[test]
    fn requested_ip_outside_range_falls_back_to_scan() {
        let repo = MemLeaseRepo::default();
        let srv = server();
        let mac: MacAddr = "aa:bb:cc:dd:ee:03".parse().unwrap();
        let now = Utc::now();
        let lease = allocate(&repo, &srv, mac, Some(Ipv4Addr::new(192, 168, 1, 1)), now).unwrap();
        assert_eq!(lease.ip, Ipv4Addr::new(10, 0, 0, 50));
    }

    #[test]
    fn exhausted_range_fails() {
        let repo = MemLeaseRepo::default();
        let srv = server();
        let now = Utc::now();
        for i in 0..3 {
            let mac = MacAddr::from([0, 0, 0, 0, 0, i]);
            allocate(&repo, &srv, mac, None, now).unwrap();
        }
        let mac = MacAddr::from([0, 0, 0, 0, 0, 99]);
        let err = allocate(&repo, &srv, mac, None, now).unwrap_err();
        assert!(matches!(err, IgniteError::Conflict(_)));
    }

    #[test]
    fn expired_non_reserved_lease_is_reclaimed() {
        let repo = MemLeaseRepo::default();
        let srv = server();
        let mac_a = MacAddr::from([0, 0, 0, 0, 0, 1]);
        let now = Utc::now();
        for i in 0..3 {
            let mac = MacAddr::from([0, 0, 0, 0, 0, i]);
            allocate(&repo, &srv, mac, None, now).unwrap();
        }
        let much_later = now + chrono::Duration::seconds(7200);
        let mac_new = MacAddr::from([0, 0, 0, 0, 0, 77]);
        let lease = allocate(&repo, &srv, mac_new, None, much_later).unwrap();
        assert_eq!(lease.ip, Ipv4Addr::new(10, 0, 0, 50));
        assert_ne!(lease.mac, mac_a);
    }

    #[test]
    fn reserved_lease_blocks_ip_even_when_expired() {
        let repo = MemLeaseRepo::default();
        let srv = server();
        let now = Utc::now();
        let mac_a = MacAddr::from([0, 0, 0, 0, 0, 1]);
        let mut lease = allocate(&repo, &srv, mac_a, None, now).unwrap();
        lease.reserved = true;
        lease.expiry = now - chrono::Duration::seconds(1);
        repo.put(&lease).unwrap();

        let much_later = now + chrono::Duration::seconds(100_000);
        let mac_b = MacAddr::from([0, 0, 0, 0, 0, 2]);
        let second = allocate(&repo, &srv, mac_b, None, much_later).unwrap();
        assert_ne!(second.ip, lease.ip);
    }

    #[test]
    fn select_ip_does_not_persist_a_lease() {
        let repo = MemLeaseRepo::default();
        let srv = server();
        let mac: MacAddr = "aa:bb:cc:dd:ee:04".parse().unwrap();
        let now = Utc::now();

        let ip = select_ip(&repo, &srv, mac, None, now).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 50));
        assert!(repo.get_by_mac(srv.id, mac).unwrap().is_none());

        // repeatable: a second DISCOVER offers the same free IP again.
        let ip_again = select_ip(&repo, &srv, mac, None, now).unwrap();
        assert_eq!(ip_again, ip);
    }

    #[test]
    fn select_ip_honors_live_existing_lease_without_rewriting_it() {
        let repo = MemLeaseRepo::default();
        let srv = server();
        let mac: MacAddr = "aa:bb:cc:dd:ee:05".parse().unwrap();
        let now = Utc::now();
        let committed = allocate(&repo, &srv, mac, None, now).unwrap();

        let selected = select_ip(&repo, &srv, mac, None, now).unwrap();
        assert_eq!(selected, committed.ip);
        let unchanged = repo.get_by_mac(srv.id, mac).unwrap().unwrap();
        assert_eq!(unchanged.expiry, committed.expiry);
    }

    #[test]
    fn select_ip_fails_when_range_exhausted() {
        let repo = MemLeaseRepo::default();
        let srv = server();
        let now = Utc::now();
        for i in 0..3 {
            let mac = MacAddr::from([0, 0, 0, 0, 0, i]);
            allocate(&repo, &srv, mac, None, now).unwrap();
        }
        let mac = MacAddr::from([0, 0, 0, 0, 0, 99]);
        let err = select_ip(&repo, &srv, mac, None, now).unwrap_err();
        assert!(matches!(err, IgniteError::Conflict(_)));
    }
}
