//! Process assembly: shared services, one router and listener per
//! `[[server]]`, and the background tasks that keep them fresh.

use std::sync::Arc;

use anyhow::{Context, Result};
use edge_networking::{Dialer, Resolver, ResolverConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::auth::{DigestAuth, HtdigestFile};
use crate::config::{FileConfig, ServerConfig};
use crate::forward::{origin_tls_config, DirectForwarder, Forwarder, ParentForwarder};
use crate::proxy::{
    CertificateSet, Listener, ListenerConfig, RustlsProvider, TlsProvider, TunnelManager,
};
use crate::router::{HandlerProvider, ProxyServices, Router};
use crate::upstream::UpstreamPool;

/// A bound gateway, ready to run.
pub struct Gateway {
    listeners: Vec<Arc<Listener>>,
    pool: Option<Arc<UpstreamPool>>,
    credentials: Vec<Arc<HtdigestFile>>,
}

impl Gateway {
    /// Build shared services and bind every listener. Any failure is fatal.
    pub async fn bind(
        file: &FileConfig,
        resolver: ResolverConfig,
        max_connections: usize,
        provider: Option<&dyn HandlerProvider>,
    ) -> Result<Self> {
        let dialer = Arc::new(Dialer::new(Arc::new(Resolver::new(resolver))));

        let pool = match &file.upstream {
            Some(upstream) => {
                let pool = UpstreamPool::new(upstream.target()?, upstream.idle_timeout())?;
                info!(upstream = %pool.target().addr(), "Parent proxy configured");
                Some(Arc::new(pool))
            }
            None => None,
        };

        let forwarder: Arc<dyn Forwarder> = match &pool {
            Some(pool) => Arc::new(ParentForwarder::new(Arc::clone(pool))),
            None => Arc::new(DirectForwarder::new(
                Arc::clone(&dialer),
                origin_tls_config()?,
            )),
        };
        let services = ProxyServices {
            tunnels: Arc::new(TunnelManager::new(Arc::clone(&dialer), pool.clone())),
            dialer,
            forwarder,
        };

        let mut listeners = Vec::with_capacity(file.server.len());
        let mut credentials = Vec::new();
        for server in &file.server {
            let auth = match server_auth(server).await? {
                Some((auth, store)) => {
                    credentials.push(store);
                    Some(auth)
                }
                None => None,
            };
            let router = Router::from_config(server, &services, provider, auth)
                .with_context(|| format!("building routes for {}:{}", server.host, server.port))?;
            let tls = server_tls(server)?;

            let mut listener_config = ListenerConfig::new(server.bind_addr()?);
            listener_config.max_connections = max_connections;
            let listener = Listener::bind(listener_config, Arc::new(router), tls)
                .await
                .with_context(|| format!("binding {}:{}", server.host, server.port))?;
            listeners.push(Arc::new(listener));
        }

        Ok(Self {
            listeners,
            pool,
            credentials,
        })
    }

    pub fn listeners(&self) -> &[Arc<Listener>] {
        &self.listeners
    }

    /// Start every listener and background task. They stop when `shutdown`
    /// flips to `true`.
    pub fn spawn(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if let Some(pool) = &self.pool {
            handles.push(Arc::clone(pool).spawn_liveness(shutdown.clone()));
        }
        for store in &self.credentials {
            handles.push(Arc::clone(store).spawn_reload(shutdown.clone()));
        }
        for listener in &self.listeners {
            let listener = Arc::clone(listener);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = listener.run(shutdown).await {
                    error!(error = %e, "Listener error");
                }
            }));
        }

        handles
    }
}

async fn server_auth(
    server: &ServerConfig,
) -> Result<Option<(Arc<DigestAuth>, Arc<HtdigestFile>)>> {
    if !server.enable_auth {
        return Ok(None);
    }
    let (Some(path), Some(realm)) = (&server.passwd_file, &server.realm) else {
        return Ok(None);
    };

    let store = Arc::new(HtdigestFile::open(path).await?);
    info!(path = %path.display(), users = store.len(), realm = %realm, "Credential file loaded");
    let auth = DigestAuth::new(realm.clone(), store.clone());
    Ok(Some((Arc::new(auth), store)))
}

fn server_tls(server: &ServerConfig) -> Result<Option<Arc<dyn TlsProvider>>> {
    if !server.has_tls() {
        return Ok(None);
    }

    let mut certs = CertificateSet::new();
    for vhost in &server.vhost {
        if let (Some(cert), Some(key)) = (&vhost.cert, &vhost.key) {
            certs.add(&vhost.hostname, CertificateSet::load_pem(cert, key)?);
        }
    }
    Ok(Some(Arc::new(RustlsProvider::new(certs)?)))
}
