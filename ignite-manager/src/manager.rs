//! `ServerManager`: owns the map of running `ProtocolHandler`s and is the
//! only place allowed to call `ProtocolHandler::start`/`stop`, mirroring
//! the teacher's single-process `Register`-driven plugin tree in spirit --
//! one map of live handlers, mutated only through this type.
use std::{collections::HashMap, sync::Arc, time::Duration};

use ignite_core::{
    error::{IgniteError, Result},
    repo::{LeaseRepository, ServerRepository},
    Server,
};
use ignite_dhcp::{HandlerConfig, ProtocolHandler};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct ServerManager {
    server_repo: Arc<dyn ServerRepository>,
    lease_repo: Arc<dyn LeaseRepository>,
    handler_cfg: HandlerConfig,
    handlers: Mutex<HashMap<Uuid, ProtocolHandler>>,
}

impl ServerManager {
    pub fn new(
        server_repo: Arc<dyn ServerRepository>,
        lease_repo: Arc<dyn LeaseRepository>,
        handler_cfg: HandlerConfig,
    ) -> Self {
        Self {
            server_repo,
            lease_repo,
            handler_cfg,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// `CreateServer(config)`: validates, rejects IP conflicts, persists
    /// with `started=false`.
    pub fn create_server(&self, mut server: Server) -> Result<Server> {
        server.validate()?;
        if self.server_repo.get_by_ip(server.ip)?.is_some() {
            return Err(IgniteError::AlreadyExists(format!(
                "server with ip {}",
                server.ip
            )));
        }
        server.started = false;
        self.server_repo.put(&server)?;
        Ok(server)
    }

    /// `UpdateServer(id, config)`: if the server was running, stop it,
    /// apply the mutation, and restart best-effort (a failed restart is
    /// logged, not rolled back).
    pub async fn update_server(&self, id: Uuid, mut new_config: Server) -> Result<Server> {
        new_config.validate()?;
        let current = self
            .server_repo
            .get(id)?
            .ok_or_else(|| IgniteError::NotFound(format!("server {id}")))?;

        let was_started = current.started;
        if was_started {
            if let Err(e) = self.stop_server(id).await {
                warn!(server_id = %id, error = %e, "failed to stop server before update");
            }
        }

        new_config.id = id;
        new_config.started = false;
        self.server_repo.put(&new_config)?;

        if was_started {
            if let Err(e) = self.start_server(id).await {
                error!(server_id = %id, error = %e, "failed to restart server after update");
            }
        }

        self.server_repo
            .get(id)?
            .ok_or_else(|| IgniteError::NotFound(format!("server {id}")))
    }

    /// `StartServer(id)`: rejects if already running, persists
    /// `started=true` on success.
    pub async fn start_server(&self, id: Uuid) -> Result<()> {
        let mut handlers = self.handlers.lock().await;
        if handlers.contains_key(&id) {
            return Err(IgniteError::Conflict(format!("server {id} already started")));
        }
        let server = self
            .server_repo
            .get(id)?
            .ok_or_else(|| IgniteError::NotFound(format!("server {id}")))?;

        let handler = ProtocolHandler::start(
            server.clone(),
            self.lease_repo.clone(),
            self.handler_cfg.clone(),
        )
        .await?;

        let mut started = server;
        started.started = true;
        if let Err(e) = self.server_repo.put(&started) {
            // persistence failed: stop what we just started and don't leave
            // a handler running that the DB doesn't know about.
            let _ = handler.stop(self.handler_cfg.stop_timeout).await;
            return Err(e);
        }
        handlers.insert(id, handler);
        info!(server_id = %id, "server started");
        Ok(())
    }

    /// `StopServer(id)`: symmetric to `start_server`.
    pub async fn stop_server(&self, id: Uuid) -> Result<()> {
        let mut handlers = self.handlers.lock().await;
        let handler = handlers
            .remove(&id)
            .ok_or_else(|| IgniteError::NotFound(format!("running handler for server {id}")))?;
        let result = handler.stop(self.handler_cfg.stop_timeout).await;

        if let Some(mut server) = self.server_repo.get(id)? {
            server.started = false;
            self.server_repo.put(&server)?;
        }
        info!(server_id = %id, "server stopped");
        result
    }

    /// `DeleteServer(id)`: stops if running, deletes leases, then the
    /// server. Each step is independent; any failure is surfaced.
    pub async fn delete_server(&self, id: Uuid) -> Result<()> {
        if self.handlers.lock().await.contains_key(&id) {
            self.stop_server(id).await?;
        }
        self.lease_repo.delete_by_server(id)?;
        self.server_repo.delete(id)
    }

    /// Startup reconciliation (spec.md §6.2): attempt to start every server
    /// persisted with `started=true`, clearing the flag and logging on
    /// failure rather than aborting the whole process.
    pub async fn reconcile_on_startup(&self) -> Result<()> {
        for server in self.server_repo.list()? {
            if !server.started {
                continue;
            }
            let id = server.id;
            if let Err(e) = self.start_server(id).await {
                error!(server_id = %id, error = %e, "failed to restart server on startup");
                if let Some(mut server) = self.server_repo.get(id)? {
                    server.started = false;
                    let _ = self.server_repo.put(&server);
                }
            }
        }
        Ok(())
    }

    /// Stops every currently-running handler. Used on process shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<Uuid> = self.handlers.lock().await.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.stop_server(id).await {
                warn!(server_id = %id, error = %e, "failed to stop server during shutdown");
            }
        }
    }

    pub fn stop_timeout(&self) -> Duration {
        self.handler_cfg.stop_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ignite_core::{model::ServerOptions, MemLeaseRepo, MemServerRepo};
    use std::net::Ipv4Addr;

    fn sample_server() -> Server {
        let now = chrono::Utc::now();
        Server {
            id: Uuid::new_v4(),
            ip: Ipv4Addr::new(127, 0, 0, 1),
            ip_start: Ipv4Addr::new(10, 0, 0, 50),
            lease_range: 10,
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

    fn manager() -> ServerManager {
        ServerManager::new(
            Arc::new(MemServerRepo::default()),
            Arc::new(MemLeaseRepo::default()),
            HandlerConfig::default(),
        )
    }

    #[test]
    fn create_server_rejects_duplicate_ip() {
        let mgr = manager();
        let server = sample_server();
        mgr.create_server(server.clone()).unwrap();

        let mut dup = sample_server();
        dup.id = Uuid::new_v4();
        dup.ip = server.ip;
        let err = mgr.create_server(dup).unwrap_err();
        assert!(matches!(err, IgniteError::AlreadyExists(_)));
    }

    #[test]
    fn create_server_rejects_invalid_config() {
        let mgr = manager();
        let mut server = sample_server();
        server.lease_range = 0;
        assert!(mgr.create_server(server).is_err());
    }

    #[tokio::test]
    async fn delete_server_removes_leases_and_server() {
        let mgr = manager();
        let server = mgr.create_server(sample_server()).unwrap();
        assert!(mgr.delete_server(server.id).await.is_ok());
        assert!(mgr.server_repo.get(server.id).unwrap().is_none());
    }
}
