//! Process wiring: builds every component from [`Config`], runs the
//! listeners and tears everything down on SIGINT/SIGTERM.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jackal_xmpp::cluster::{ClusterDelegate, ClusterEvent};
use jackal_xmpp::s2s::S2sOutProvider;
use jackal_xmpp::{
    C2sListener, Cluster, ComponentListener, Hosts, MemoryStorage, Modules, Router, S2s, S2sListener, Storage,
    StreamRegistry,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, StorageKind};
use crate::debug;

/// Time granted to live streams to close after shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const CLUSTER_EVENT_QUEUE: usize = 1024;

pub async fn run(config: Config) -> Result<()> {
    let pid_file = config.pid_path.as_deref().map(PidFile::create).transpose()?;

    let storage: Arc<dyn Storage> = match config.storage.kind {
        StorageKind::Memory => Arc::new(MemoryStorage::new()),
    };
    let hosts = Arc::new(Hosts::new(&config.router.hosts).context("failed to load hosts")?);
    let registry = Arc::new(StreamRegistry::new());

    let s2s = config
        .s2s
        .clone()
        .map(|s2s_config| S2s::new(s2s_config, Arc::clone(&hosts)))
        .transpose()
        .context("failed to initialize s2s")?;
    let out_provider = s2s.clone().map(|s| s as Arc<dyn S2sOutProvider>);

    let router = Arc::new(Router::new(Arc::clone(&hosts), registry, Arc::clone(&storage), out_provider));
    if let Some(s2s) = &s2s {
        s2s.set_router(Arc::downgrade(&router));
    }
    let modules = Modules::new(&config.modules, Arc::clone(&router));

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let cluster = match config.cluster.clone() {
        Some(cluster_config) => {
            if !storage.is_cluster_compatible() {
                warn!("Storage backend is not shared between nodes; user data stays local to each node");
            }
            let (tx, rx) = mpsc::channel::<ClusterEvent>(CLUSTER_EVENT_QUEUE);
            let cluster = Cluster::start(cluster_config, tx)
                .await
                .context("failed to start cluster")?;
            router.set_cluster(Arc::clone(&cluster));
            let delegate = ClusterDelegate::new(Arc::clone(&router), Arc::clone(&cluster));
            tasks.spawn(delegate.run(rx, shutdown.clone()));
            Some(cluster)
        }
        None => None,
    };

    for c2s_config in config.c2s.clone() {
        let listener = C2sListener::new(c2s_config, Arc::clone(&router), Arc::clone(&modules));
        let token = shutdown.clone();
        tasks.spawn(async move {
            let id = listener.config().id.clone();
            if let Err(e) = listener.run(token).await {
                error!(listener = %id, error = %e, "C2S listener failed");
            }
        });
    }

    if let Some(s2s) = &s2s {
        let listener = S2sListener::new(Arc::clone(s2s), Arc::clone(&router)).with_modules(Arc::clone(&modules));
        let token = shutdown.clone();
        tasks.spawn(async move {
            if let Err(e) = listener.run(token).await {
                error!(error = %e, "S2S listener failed");
            }
        });
    }

    for component_config in config.components.clone() {
        let listener = ComponentListener::new(component_config, Arc::clone(&router));
        let token = shutdown.clone();
        tasks.spawn(async move {
            if let Err(e) = listener.run(token).await {
                error!(error = %e, "Component listener failed");
            }
        });
    }

    if let Some(port) = config.debug.port {
        let router = Arc::clone(&router);
        let token = shutdown.clone();
        tasks.spawn(async move {
            if let Err(e) = debug::serve(port, router, token).await {
                error!(error = %e, "Debug listener failed");
            }
        });
    }

    info!(
        hosts = ?hosts.host_names(),
        c2s = config.c2s.len(),
        s2s = s2s.is_some(),
        cluster = cluster.is_some(),
        "jackal is running"
    );

    shutdown_signal().await;
    info!("Shutting down");
    shutdown.cancel();

    if let Some(cluster) = &cluster {
        cluster.shutdown().await;
    }

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = tasks.len(), "Shutdown grace period elapsed; aborting tasks");
        tasks.abort_all();
    }

    modules.shutdown();
    if let Some(s2s) = &s2s {
        s2s.shutdown().await;
    }
    if let Err(e) = storage.close().await {
        warn!(error = %e, "Failed to close storage");
    }
    drop(pid_file);

    info!("jackal stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// PID file removed on drop.
#[derive(Debug)]
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn create(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        }
        std::fs::write(path, std::process::id().to_string())
            .with_context(|| format!("failed to write PID file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
        }
    }
}
