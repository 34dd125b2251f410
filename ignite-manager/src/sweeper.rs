//! Thin wrapper spawning `ignite_core::state_machine::run_offline_sweeper`
//! as a background task, following the teacher's `spawn_lease_gc_task`
//! idiom (interval-driven, `CancellationToken`-cancellable, logged not
//! propagated on per-tick failure).
use std::{sync::Arc, time::Duration};

use chrono::Duration as ChronoDuration;
use ignite_core::repo::{LeaseRepository, ServerRepository};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default offline threshold and sweep period, both from spec.md §5.
pub const DEFAULT_OFFLINE_THRESHOLD_SECS: i64 = 300;
pub const DEFAULT_SWEEP_PERIOD_SECS: u64 = 30;

pub fn spawn_offline_sweeper(
    lease_repo: Arc<dyn LeaseRepository>,
    server_repo: Arc<dyn ServerRepository>,
    offline_threshold: ChronoDuration,
    sweep_period: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(ignite_core::state_machine::run_offline_sweeper(
        lease_repo,
        server_repo,
        offline_threshold,
        sweep_period,
        token,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ignite_core::{model::MacAddr, LeaseState, MemLeaseRepo, MemServerRepo, Source};

    #[tokio::test(start_paused = true)]
    async fn sweeper_marks_stale_lease_offline_on_tick() {
        let lease_repo: Arc<dyn LeaseRepository> = Arc::new(MemLeaseRepo::default());
        let server_repo: Arc<dyn ServerRepository> = Arc::new(MemServerRepo::default());

        let server = ignite_core::Server {
            id: uuid::Uuid::new_v4(),
            ip: "10.0.0.1".parse().unwrap(),
            ip_start: "10.0.0.50".parse().unwrap(),
            lease_range: 5,
            lease_duration_secs: 3600,
            options: ignite_core::model::ServerOptions {
                subnet_mask: "255.255.255.0".parse().unwrap(),
                gateway: "10.0.0.1".parse().unwrap(),
                dns: "10.0.0.1".parse().unwrap(),
                tftp_server: "10.0.0.1".parse().unwrap(),
                extra: Default::default(),
            },
            started: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            extra: Default::default(),
        };
        server_repo.put(&server).unwrap();

        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let now = Utc::now();
        let stale_seen = now - ChronoDuration::seconds(600);
        lease_repo
            .put(&ignite_core::Lease {
                id: uuid::Uuid::new_v4(),
                server_id: server.id,
                ip: "10.0.0.50".parse().unwrap(),
                mac,
                expiry: now + ChronoDuration::seconds(3600),
                reserved: false,
                state: LeaseState::Booting,
                state_updated_at: stale_seen,
                last_seen: stale_seen,
                state_history: vec![],
                menu: Default::default(),
                ipmi: Default::default(),
                extra: Default::default(),
            })
            .unwrap();

        let token = CancellationToken::new();
        let handle = spawn_offline_sweeper(
            lease_repo.clone(),
            server_repo,
            ChronoDuration::seconds(DEFAULT_OFFLINE_THRESHOLD_SECS),
            Duration::from_secs(DEFAULT_SWEEP_PERIOD_SECS),
            token.clone(),
        );

        tokio::time::advance(Duration::from_secs(DEFAULT_SWEEP_PERIOD_SECS + 1)).await;
        tokio::task::yield_now().await;

        let lease = lease_repo.get_by_mac(server.id, mac).unwrap().unwrap();
        assert_eq!(lease.state, LeaseState::Offline);
        assert_eq!(lease.state_history.last().unwrap().source, Source::Heartbeat);

        token.cancel();
        let _ = handle.await;
    }
}
