use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use libvfs::{Vfs, VfsOptions};
use log::{error, info};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::server::serve;
use crate::slave::{SlaveContext, SlaveManager, SlaveSettings};
use crate::stats;

/// The namespace and the slave registry, wired together.
pub struct Master {
    cfg: Config,
    vfs: Arc<Vfs>,
    manager: Arc<SlaveManager>,
}

impl Master {
    pub fn open(cfg: Config) -> anyhow::Result<Self> {
        cfg.validate()?;
        let vfs = Vfs::open(&cfg.vfs_root, VfsOptions::default())
            .with_context(|| format!("Failed to open vfs at {}", cfg.vfs_root.display()))?;
        let ctx = SlaveContext::new(Arc::clone(&vfs), SlaveSettings::from_config(&cfg));
        let manager = SlaveManager::load(ctx).context("Failed to load slaves")?;
        vfs.set_slave_ops(manager.clone());
        Ok(Master { cfg, vfs, manager })
    }

    pub fn vfs(&self) -> &Arc<Vfs> {
        &self.vfs
    }

    pub fn manager(&self) -> &Arc<SlaveManager> {
        &self.manager
    }

    /// Serves slaves until ctrl-c, then shuts everything down and writes
    /// what is pending.
    pub async fn run(self) -> anyhow::Result<()> {
        let addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid listen address {}", self.cfg.addr))?;
        let shutdown = CancellationToken::new();
        let flusher = self
            .vfs
            .commits()
            .spawn_flusher(self.cfg.commit_interval(), shutdown.clone());
        let resetter = stats::spawn_resetter(Arc::clone(&self.manager), shutdown.clone());

        let server = {
            let manager = Arc::clone(&self.manager);
            let shutdown = shutdown.clone();
            let tls = self.cfg.tls.clone();
            tokio::spawn(async move { serve(addr, &tls, manager, shutdown).await })
        };

        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("Failed to listen for ctrl-c")?;
                info!("[rkfs] ctrl-c received, shutting down");
            }
            _ = shutdown.cancelled() => {}
        }
        shutdown.cancel();

        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("[rkfs] slave listener failed: {e:#}"),
            Err(e) => error!("[rkfs] slave listener panicked: {e}"),
        }
        self.manager.shutdown();
        let _ = resetter.await;
        let _ = flusher.await;
        info!("[rkfs] master stopped");
        Ok(())
    }
}
