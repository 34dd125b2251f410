//! Lease lifecycle: legal transitions, heartbeat, and the offline sweeper.
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::{IgniteError, Result},
    model::{LeaseState, MacAddr, Source},
    repo::LeaseRepository,
};

/// Directed edges legal for `UpdateState`, not counting the "any non-terminal
/// state may fail" and "any active state may go offline" escape hatches
/// handled separately below.
const HAPPY_PATH: &[(LeaseState, LeaseState)] = &[
    (LeaseState::Assigned, LeaseState::PxeRequested),
    (LeaseState::PxeRequested, LeaseState::Booting),
    (LeaseState::Booting, LeaseState::Imaging),
    (LeaseState::Imaging, LeaseState::Imaged),
    (LeaseState::Imaged, LeaseState::Configuring),
    (LeaseState::Configuring, LeaseState::Complete),
    (LeaseState::Offline, LeaseState::Assigned),
];

fn transition_allowed(from: LeaseState, to: LeaseState) -> bool {
    if from == to {
        return true;
    }
    if to == LeaseState::Failed {
        return !matches!(from, LeaseState::Complete | LeaseState::Failed);
    }
    if to == LeaseState::Offline {
        return from.is_active();
    }
    HAPPY_PATH.contains(&(from, to))
}

/// `UpdateState(mac, newState, source)` from spec.md §4.D. A no-op when
/// `newState == currentState`, but `last_seen` is always bumped.
pub fn update_state(
    repo: &dyn LeaseRepository,
    server_id: Uuid,
    mac: MacAddr,
    new_state: LeaseState,
    source: Source,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut lease = repo
        .get_by_mac(server_id, mac)?
        .ok_or_else(|| IgniteError::NotFound(format!("lease for mac {mac} on server {server_id}")))?;

    if !transition_allowed(lease.state, new_state) {
        return Err(IgniteError::Conflict(format!(
            "illegal transition {} -> {}",
            lease.state, new_state
        )));
    }

    lease.last_seen = now;
    if new_state != lease.state {
        lease.append_transition(new_state, source, now);
        crate::metrics::LEASES_BY_STATE
            .with_label_values(&[new_state.as_str()])
            .inc();
    }
    repo.put(&lease)
}

/// `RecordHeartbeat(mac)`: bumps `last_seen` without appending history.
pub fn record_heartbeat(
    repo: &dyn LeaseRepository,
    server_id: Uuid,
    mac: MacAddr,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut lease = repo
        .get_by_mac(server_id, mac)?
        .ok_or_else(|| IgniteError::NotFound(format!("lease for mac {mac} on server {server_id}")))?;
    lease.last_seen = now;
    repo.put(&lease)
}

/// `GetLeaseStateHistory(mac)`.
pub fn get_lease_state_history(
    repo: &dyn LeaseRepository,
    server_id: Uuid,
    mac: MacAddr,
) -> Result<Vec<crate::model::StateTransition>> {
    let lease = repo
        .get_by_mac(server_id, mac)?
        .ok_or_else(|| IgniteError::NotFound(format!("lease for mac {mac} on server {server_id}")))?;
    Ok(lease.state_history)
}

/// `MarkOfflineLeases(threshold)`: marks any active lease whose `last_seen`
/// predates `now - threshold` as offline. Continues past individual save
/// failures, logging them (spec.md §4.D failure semantics), and returns how
/// many leases it actually flipped.
pub fn mark_offline_leases(
    repo: &dyn LeaseRepository,
    server_id: Uuid,
    threshold: Duration,
    now: DateTime<Utc>,
) -> usize {
    let leases = match repo.get_by_server(server_id) {
        Ok(l) => l,
        Err(e) => {
            warn!(error = %e, %server_id, "failed to list leases for offline sweep");
            return 0;
        }
    };

    let cutoff = now - threshold;
    let mut marked = 0;
    for mut lease in leases {
        if lease.is_active() && lease.last_seen < cutoff {
            lease.append_transition(LeaseState::Offline, Source::Heartbeat, now);
            crate::metrics::LEASES_BY_STATE
                .with_label_values(&[LeaseState::Offline.as_str()])
                .inc();
            match repo.put(&lease) {
                Ok(()) => marked += 1,
                Err(e) => warn!(error = %e, lease_id = %lease.id, "failed to persist offline sweep update"),
            }
        }
    }
    marked
}

/// Background task driving `mark_offline_leases` across every server on a
/// fixed interval, cancellable via `token` -- the teacher's
/// `CancellationToken` + `tokio::select!` shutdown idiom.
pub async fn run_offline_sweeper(
    lease_repo: Arc<dyn LeaseRepository>,
    server_repo: Arc<dyn crate::repo::ServerRepository>,
    threshold: Duration,
    period: std::time::Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("offline sweeper shutting down");
                return;
            }
            _ = ticker.tick() => {
                let servers = match server_repo.list() {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(error = %e, "failed to list servers for offline sweep");
                        continue;
                    }
                };
                let now = Utc::now();
                let mut total_marked = 0i64;
                for server in servers {
                    let marked = mark_offline_leases(lease_repo.as_ref(), server.id, threshold, now);
                    if marked > 0 {
                        info!(server_id = %server.id, marked, "offline sweep marked leases");
                    }
                    total_marked += marked as i64;
                }
                crate::metrics::OFFLINE_SWEEP_MARKED.set(total_marked);

                match lease_repo.cleanup_expired(now) {
                    Ok(removed) if removed > 0 => {
                        info!(removed, "cleanup_expired removed non-reserved expired leases");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "cleanup_expired failed"),
                }
            }
        }
    }
}
