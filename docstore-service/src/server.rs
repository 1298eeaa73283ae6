//! Accept loop and shared engine registry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::engine::Engine;
use crate::session::Session;

/// Shared map of database name to engine. One engine exists per database and
/// is handed out as a shared reference; engines created by `CREATE_DB` are
/// registered here so every session sees them.
pub struct EngineRegistry {
    dir: PathBuf,
    engines: Mutex<HashMap<String, Arc<Engine>>>,
}

impl EngineRegistry {
    pub fn new(dir: PathBuf) -> Self {
        EngineRegistry {
            dir,
            engines: Mutex::new(HashMap::new()),
        }
    }

    /// Directory holding the database files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Engine>> {
        self.engines.lock().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.engines.lock().await.contains_key(name)
    }

    pub async fn register(&self, name: &str, path: PathBuf) -> Arc<Engine> {
        let mut engines = self.engines.lock().await;
        engines
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Engine::new(path, false)))
            .clone()
    }

    pub async fn snapshot(&self) -> Vec<(String, Arc<Engine>)> {
        self.engines
            .lock()
            .await
            .iter()
            .map(|(name, engine)| (name.clone(), engine.clone()))
            .collect()
    }
}

pub struct Server {
    catalog: Arc<Catalog>,
    engines: Arc<EngineRegistry>,
    listener: TcpListener,
}

impl Server {
    /// Bind the listen endpoint from the catalog and pre-register an engine
    /// for every known database.
    pub async fn bind(catalog: Arc<Catalog>) -> anyhow::Result<Self> {
        let (host, port) = catalog.listen_addr().await;
        let listener = TcpListener::bind((host.as_str(), port))
            .await
            .with_context(|| format!("failed to bind {host}:{port}"))?;

        let engines = Arc::new(EngineRegistry::new(catalog.db_dir().await));
        for entry in catalog.databases().await {
            let path = engines.dir().join(&entry.filename);
            engines.register(&entry.name, path).await;
        }

        info!(host = %host, port, "server started");
        Ok(Server {
            catalog,
            engines,
            listener,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until a shutdown signal arrives, then drain the
    /// active sessions and flush every engine.
    pub async fn run(self) -> anyhow::Result<()> {
        let Server {
            catalog,
            engines,
            listener,
        } = self;

        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let session = Session::new(catalog.clone(), engines.clone(), peer);
                        handlers.spawn(session.run(stream));
                    }
                    Err(err) => warn!(error = %err, "failed to accept connection"),
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        drop(listener);
        while handlers.join_next().await.is_some() {}
        for (name, engine) in engines.snapshot().await {
            if let Err(err) = engine.commit().await {
                warn!(db = %name, error = %err, "failed to flush database");
            }
        }
        info!("server stopped");
        Ok(())
    }
}
