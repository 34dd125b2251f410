//! External event ingress: the entry points the (out-of-core) admin UI and
//! imaging agents call to mutate lease state, reservations, and boot
//! config. No HTTP framework lives here -- callers are plain async-free
//! functions over the repository traits, per spec.md §4.G.
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use ignite_core::{
    error::{IgniteError, Result},
    model::{BootMenu, IpmiInput, LeaseState, MacAddr, Source},
    repo::{LeaseRepository, ServerRepository},
    Lease,
};
use uuid::Uuid;

/// `ReserveLease(server_id, mac, ip)`: validates `ip ∈ server range`,
/// rejects on IP-in-use-by-other-MAC, replaces any existing lease for this
/// MAC, writes `reserved=true`, state `assigned`, source `manual`.
pub fn reserve_lease(
    server_repo: &dyn ServerRepository,
    lease_repo: &dyn LeaseRepository,
    server_id: Uuid,
    mac: MacAddr,
    ip: Ipv4Addr,
    now: DateTime<Utc>,
) -> Result<Lease> {
    let server = server_repo
        .get(server_id)?
        .ok_or_else(|| IgniteError::NotFound(format!("server {server_id}")))?;
    if !server.contains(ip) {
        return Err(IgniteError::Validation(format!(
            "{ip} is not within server {server_id}'s range"
        )));
    }
    if let Some(holder) = lease_repo.get_by_ip(server_id, ip)? {
        if holder.mac != mac && holder.is_live(now) {
            return Err(IgniteError::Conflict(format!(
                "{ip} is already leased to a different mac"
            )));
        }
    }

    let id = lease_repo
        .get_by_mac(server_id, mac)?
        .map(|existing| existing.id)
        .unwrap_or_else(Uuid::new_v4);

    let lease = Lease {
        id,
        server_id,
        ip,
        mac,
        expiry: now + chrono::Duration::seconds(server.lease_duration_secs as i64),
        reserved: true,
        state: LeaseState::Assigned,
        state_updated_at: now,
        last_seen: now,
        state_history: vec![ignite_core::model::StateTransition {
            from_state: String::new(),
            to_state: LeaseState::Assigned.as_str().to_string(),
            timestamp: now,
            source: Source::Manual,
        }],
        menu: BootMenu::default(),
        ipmi: Default::default(),
        extra: Default::default(),
    };
    lease_repo.put(&lease)?;
    Ok(lease)
}

/// `UnreserveLease(mac)`: flips the reservation flag back off.
pub fn unreserve_lease(
    lease_repo: &dyn LeaseRepository,
    server_id: Uuid,
    mac: MacAddr,
) -> Result<()> {
    let mut lease = lease_repo
        .get_by_mac(server_id, mac)?
        .ok_or_else(|| IgniteError::NotFound(format!("lease for mac {mac}")))?;
    lease.reserved = false;
    lease_repo.put(&lease)
}

/// `UpdateLeaseState(mac, state, source)`.
pub fn update_lease_state(
    lease_repo: &dyn LeaseRepository,
    server_id: Uuid,
    mac: MacAddr,
    state: LeaseState,
    source: Source,
    now: DateTime<Utc>,
) -> Result<()> {
    ignite_core::state_machine::update_state(lease_repo, server_id, mac, state, source, now)
}

/// `RecordHeartbeat(mac)`.
pub fn record_heartbeat(
    lease_repo: &dyn LeaseRepository,
    server_id: Uuid,
    mac: MacAddr,
    now: DateTime<Utc>,
) -> Result<()> {
    ignite_core::state_machine::record_heartbeat(lease_repo, server_id, mac, now)
}

/// `GetLeaseStateHistory(mac)`.
pub fn get_lease_state_history(
    lease_repo: &dyn LeaseRepository,
    server_id: Uuid,
    mac: MacAddr,
) -> Result<Vec<ignite_core::model::StateTransition>> {
    ignite_core::state_machine::get_lease_state_history(lease_repo, server_id, mac)
}

/// `GetLeasesByState(state)`.
pub fn get_leases_by_state(lease_repo: &dyn LeaseRepository, state: LeaseState) -> Result<Vec<Lease>> {
    lease_repo.get_by_state(state)
}

/// `UpdateLease(lease)`: boot-menu / IPMI edits, treated as an opaque blob
/// replacement -- no state transition is implied.
pub fn update_lease(
    lease_repo: &dyn LeaseRepository,
    lease_id: Uuid,
    menu: Option<BootMenu>,
    ipmi: Option<IpmiInput>,
) -> Result<Lease> {
    let mut lease = lease_repo
        .get(lease_id)?
        .ok_or_else(|| IgniteError::NotFound(format!("lease {lease_id}")))?;
    if let Some(menu) = menu {
        lease.menu = menu;
    }
    if let Some(ipmi) = ipmi {
        lease.ipmi = ipmi.into();
    }
    lease_repo.put(&lease)?;
    Ok(lease)
}
