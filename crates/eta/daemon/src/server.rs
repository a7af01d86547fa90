//! Server setup and lifecycle management

use crate::api::create_router;
use crate::api::rest::state::AppState;
use crate::config::{DaemonConfig, StorageConfig};
use crate::error::{DaemonError, DaemonResult};
use eta_engine::{EtaEngine, SystemClock};
use eta_storage::{EtaStore, InMemoryEtaStore, InMemoryReference, ReferenceStore, SqliteEtaStore};
use eta_types::SegmentReference;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// ETA Daemon Server
pub struct Server {
    config: DaemonConfig,
    engine: Arc<EtaEngine>,
}

impl Server {
    /// Open storage, seed reference data and build the engine.
    pub async fn new(config: DaemonConfig) -> DaemonResult<Self> {
        let (store, reference) = open_storage(&config.storage).await?;

        if let Some(path) = &config.reference.seed_file {
            let count = seed_references(reference.as_ref(), path).await?;
            tracing::info!(count, path = %path.display(), "seeded segment reference data");
        }

        let engine = EtaEngine::new(
            config.engine.clone(),
            store,
            reference,
            Arc::new(SystemClock),
        )?;

        Ok(Self {
            config,
            engine: Arc::new(engine),
        })
    }

    /// Run the server
    pub async fn run(self) -> DaemonResult<()> {
        let addr = self.config.server.listen_addr;

        let state = AppState::new(Arc::clone(&self.engine));
        let app = create_router(state, &self.config.server);

        let listener = TcpListener::bind(addr).await?;
        tracing::info!("ETA daemon listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| DaemonError::Server(e.to_string()))?;

        tracing::info!("ETA daemon shutting down");
        Ok(())
    }
}

/// Build the learning-core store and the reference store for `config`.
pub async fn open_storage(
    config: &StorageConfig,
) -> DaemonResult<(Arc<dyn EtaStore>, Arc<dyn ReferenceStore>)> {
    match config {
        StorageConfig::Memory => {
            tracing::warn!("using in-memory storage; learned statistics are lost on exit");
            let store: Arc<dyn EtaStore> = Arc::new(InMemoryEtaStore::new());
            let reference: Arc<dyn ReferenceStore> = Arc::new(InMemoryReference::new());
            Ok((store, reference))
        }
        StorageConfig::Sqlite {
            url,
            max_connections,
            busy_timeout_ms,
        } => {
            let store = Arc::new(
                SqliteEtaStore::connect_with_options(
                    url,
                    *max_connections,
                    Duration::from_millis(*busy_timeout_ms),
                )
                .await?,
            );
            tracing::info!(url = %url, "opened sqlite storage");
            let reference: Arc<dyn ReferenceStore> = store.clone();
            let store: Arc<dyn EtaStore> = store;
            Ok((store, reference))
        }
    }
}

/// Load a JSON array of segment references into `reference`.
pub async fn seed_references(reference: &dyn ReferenceStore, path: &Path) -> DaemonResult<usize> {
    let raw = tokio::fs::read_to_string(path).await?;
    let references: Vec<SegmentReference> = serde_json::from_str(&raw)
        .map_err(|e| DaemonError::Seed(format!("{}: {}", path.display(), e)))?;

    let count = references.len();
    for entry in references {
        reference.upsert_segment(entry).await?;
    }
    Ok(count)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to install signal handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eta_types::SegmentKey;

    #[tokio::test]
    async fn test_seed_references_from_file() {
        let path = std::env::temp_dir().join(format!("eta-seed-{}.json", std::process::id()));
        tokio::fs::write(
            &path,
            r#"[
                {"route_id":"500D","direction_id":0,"from_stop_id":"S1","to_stop_id":"S2","scheduled_duration_sec":120},
                {"route_id":"500D","direction_id":0,"from_stop_id":"S2","to_stop_id":"S3","scheduled_duration_sec":95.5}
            ]"#,
        )
        .await
        .unwrap();

        let reference = InMemoryReference::new();
        let count = seed_references(&reference, &path).await.unwrap();
        tokio::fs::remove_file(&path).await.unwrap();

        assert_eq!(count, 2);
        assert_eq!(
            reference
                .scheduled_duration(&SegmentKey::new("500D", 0, "S2", "S3"))
                .await
                .unwrap(),
            Some(95.5)
        );
    }

    #[tokio::test]
    async fn test_bad_seed_file_is_reported() {
        let path = std::env::temp_dir().join(format!("eta-bad-seed-{}.json", std::process::id()));
        tokio::fs::write(&path, "{not json").await.unwrap();
        let result = seed_references(&InMemoryReference::new(), &path).await;
        tokio::fs::remove_file(&path).await.unwrap();
        assert!(matches!(result, Err(DaemonError::Seed(_))));
    }
}
