//! Top-level wiring: owns the catalog, connection manager, and transaction
//! session registry for a single process.

use dbgate_common::Result;

use crate::catalog::ServerCatalog;
use crate::config::GatewayConfig;
use crate::manager::ConnectionManager;
use crate::session::TransactionSessionRegistry;

/// The gateway a process builds once at startup and shares across request
/// handlers.
pub struct Gateway {
    pub manager: ConnectionManager,
    pub sessions: TransactionSessionRegistry,
}

impl Gateway {
    pub fn new(catalog: ServerCatalog, pool_config: crate::connection::PoolConfig, read_only: bool) -> Self {
        Self {
            manager: ConnectionManager::new(catalog, pool_config, read_only),
            sessions: TransactionSessionRegistry::new(),
        }
    }

    /// Builds a gateway from environment-driven config (CA2).
    pub fn from_config(config: GatewayConfig) -> Result<Self> {
        let catalog = ServerCatalog::from_json(&config.server_catalog_json);
        let read_only = config.is_read_only();
        Ok(Self::new(catalog, config.pool, read_only))
    }

    /// Spawns the transaction session sweeper as a background task.
    ///
    /// The returned handle is owned by the caller; dropping it does not
    /// stop the sweeper (it runs until the process exits), matching the
    /// teacher's background-task lifecycle for long-running sweepers.
    pub fn spawn_session_sweeper(self: &std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        let gateway = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            gateway.sessions.run_sweeper_loop(&gateway.manager).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_builds_gateway() {
        let config = GatewayConfig::new(
            r#"{"primary": {"host": "h"}}"#,
            "readonly",
            crate::connection::PoolConfig::default(),
        );
        let gateway = Gateway::from_config(config).unwrap();
        assert!(gateway.manager.is_read_only());
        assert_eq!(gateway.manager.catalog().len(), 1);
        assert!(gateway.sessions.is_empty());
    }
}
