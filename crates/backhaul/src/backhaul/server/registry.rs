use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use serde::Serialize;

use crate::backhaul::server::{
    client::{DEFAULT_GRACE, ServerClient},
    ids,
    ingress::MultiplexedIngress,
    pool::{DEFAULT_MAX_TCP_SOCKETS, PoolError, PoolMode, PoolOptions, SocketPool},
};

/// What collaborators learn about a tunnel when it is created or closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelInfo {
    pub id: String,
    pub domain: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewClientInfo {
    pub id: String,
    pub port: u16,
    pub url: String,
    pub domain: String,
    pub max_conn_count: usize,
}

pub type TunnelHook = Arc<dyn Fn(&TunnelInfo) + Send + Sync>;

#[derive(Clone)]
pub struct RegistryOptions {
    pub max_tcp_sockets: usize,
    /// Shared ingress; dedicated per-tunnel listeners when `None`.
    pub ingress: Option<Arc<MultiplexedIngress>>,
    /// Host dedicated listeners bind on.
    pub bind_host: String,
    pub grace: Duration,
    pub on_tunnel_created: Option<TunnelHook>,
    pub on_tunnel_closed: Option<TunnelHook>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            max_tcp_sockets: DEFAULT_MAX_TCP_SOCKETS,
            ingress: None,
            bind_host: "0.0.0.0".to_string(),
            grace: DEFAULT_GRACE,
            on_tunnel_created: None,
            on_tunnel_closed: None,
        }
    }
}

impl std::fmt::Debug for RegistryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryOptions")
            .field("max_tcp_sockets", &self.max_tcp_sockets)
            .field("shared_ingress", &self.ingress.is_some())
            .field("bind_host", &self.bind_host)
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry: tunnel {id}: {source}")]
    Listen {
        id: String,
        #[source]
        source: PoolError,
    },
}

struct Entry {
    client: ServerClient,
    info: TunnelInfo,
}

/// All live tunnels on the public side, keyed by id.
pub struct TunnelRegistry {
    opts: RegistryOptions,
    clients: Mutex<HashMap<String, Entry>>,
}

impl std::fmt::Debug for TunnelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelRegistry")
            .field("opts", &self.opts)
            .field("tunnels", &self.tunnel_count())
            .finish()
    }
}

impl TunnelRegistry {
    pub fn new(opts: RegistryOptions) -> Arc<Self> {
        Arc::new(Self {
            opts,
            clients: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn new_client(
        self: &Arc<Self>,
        requested_id: Option<&str>,
        url: &str,
        domain: &str,
    ) -> Result<NewClientInfo, RegistryError> {
        let url = url.to_string();
        self.new_client_with(requested_id, domain, move |_| url).await
    }

    /// Like [`Self::new_client`], with the URL built from the id actually assigned.
    pub async fn new_client_with<F>(
        self: &Arc<Self>,
        requested_id: Option<&str>,
        domain: &str,
        url_for_id: F,
    ) -> Result<NewClientInfo, RegistryError>
    where
        F: FnOnce(&str) -> String,
    {
        let (client, info) = {
            let mut clients = self.lock();
            let id = match requested_id.map(str::trim).filter(|s| !s.is_empty()) {
                Some(req) if !clients.contains_key(req) => req.to_string(),
                _ => loop {
                    let id = ids::random_id();
                    if !clients.contains_key(&id) {
                        break id;
                    }
                },
            };

            let mode = match &self.opts.ingress {
                Some(ingress) => PoolMode::Shared(ingress.clone()),
                None => PoolMode::Dedicated {
                    bind_host: self.opts.bind_host.clone(),
                },
            };
            let (pool, events) = SocketPool::new(PoolOptions {
                id: id.clone(),
                max_tcp_sockets: self.opts.max_tcp_sockets,
                mode,
            });
            let client = ServerClient::new(id.clone(), pool, events, self.opts.grace);
            let info = TunnelInfo {
                url: url_for_id(&id),
                id: id.clone(),
                domain: domain.to_string(),
            };
            clients.insert(
                id,
                Entry {
                    client: client.clone(),
                    info: info.clone(),
                },
            );
            (client, info)
        };

        let port = match client.pool().listen().await {
            Ok(port) => port,
            Err(source) => {
                let rolled_back = {
                    let mut clients = self.lock();
                    take_if_serial(&mut clients, &info.id, client.serial())
                };
                drop(rolled_back);
                client.close();
                tracing::warn!(id = %info.id, err = %source, "registry: tunnel allocation failed");
                return Err(RegistryError::Listen {
                    id: info.id,
                    source,
                });
            }
        };

        metrics::gauge!("backhaul_tunnels").increment(1.0);
        tracing::info!(id = %info.id, port, url = %info.url, "registry: tunnel created");
        if let Some(hook) = &self.opts.on_tunnel_created {
            hook(&info);
        }
        self.watch_close(&client);

        Ok(NewClientInfo {
            id: info.id,
            port,
            url: info.url,
            domain: info.domain,
            max_conn_count: self.opts.max_tcp_sockets,
        })
    }

    fn watch_close(self: &Arc<Self>, client: &ServerClient) {
        let registry = Arc::downgrade(self);
        let id = client.id().to_string();
        let serial = client.serial();
        let closed = client.closed();
        tokio::spawn(async move {
            closed.await;
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let entry = {
                let mut clients = registry.lock();
                take_if_serial(&mut clients, &id, serial)
            };
            if let Some(entry) = entry {
                registry.finish(entry);
            }
        });
    }

    pub fn get_client(&self, id: &str) -> Option<ServerClient> {
        self.lock().get(id).map(|e| e.client.clone())
    }

    pub fn has_client(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn tunnel_count(&self) -> usize {
        self.lock().len()
    }

    /// Close and forget tunnel `id`. Unknown ids are ignored.
    pub fn remove_client(&self, id: &str) {
        let entry = self.lock().remove(id);
        if let Some(entry) = entry {
            self.finish(entry);
        }
    }

    /// Close every tunnel.
    pub fn close_all(&self) {
        let entries: Vec<Entry> = self.lock().drain().map(|(_, e)| e).collect();
        for entry in entries {
            self.finish(entry);
        }
    }

    fn finish(&self, entry: Entry) {
        metrics::gauge!("backhaul_tunnels").decrement(1.0);
        entry.client.close();
        tracing::info!(id = %entry.info.id, "registry: tunnel removed");
        if let Some(hook) = &self.opts.on_tunnel_closed {
            hook(&entry.info);
        }
    }
}

fn take_if_serial(clients: &mut HashMap<String, Entry>, id: &str, serial: u64) -> Option<Entry> {
    if clients.get(id).map(|e| e.client.serial()) == Some(serial) {
        clients.remove(id)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::net::TcpStream;

    use super::*;

    fn options() -> RegistryOptions {
        RegistryOptions {
            bind_host: "127.0.0.1".into(),
            ..Default::default()
        }
    }

    fn counting_hooks(opts: &mut RegistryOptions) -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let c = created.clone();
        opts.on_tunnel_created = Some(Arc::new(move |_: &TunnelInfo| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let c = closed.clone();
        opts.on_tunnel_closed = Some(Arc::new(move |_: &TunnelInfo| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        (created, closed)
    }

    #[tokio::test]
    async fn has_client_tracks_new_and_remove() {
        let mut opts = options();
        let (created, closed) = counting_hooks(&mut opts);
        let reg = TunnelRegistry::new(opts);

        let info = reg
            .new_client(Some("brave-otter-1"), "http://brave-otter-1.relay.test", "relay.test")
            .await
            .expect("new client");
        assert_eq!(info.id, "brave-otter-1");
        assert_eq!(info.max_conn_count, DEFAULT_MAX_TCP_SOCKETS);
        assert_ne!(info.port, 0);
        assert!(reg.has_client("brave-otter-1"));
        assert_eq!(reg.tunnel_count(), 1);
        assert_eq!(created.load(Ordering::SeqCst), 1);

        let client = reg.get_client("brave-otter-1").expect("client");
        reg.remove_client("brave-otter-1");
        assert!(!reg.has_client("brave-otter-1"));
        assert!(client.is_closed());
        reg.remove_client("brave-otter-1");
        reg.remove_client("never-existed");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn requested_id_in_use_gets_a_fresh_one() {
        let reg = TunnelRegistry::new(RegistryOptions {
            grace: Duration::from_secs(60),
            ..options()
        });

        let first = reg.new_client(Some("taken"), "u1", "d").await.expect("first");
        let second = reg
            .new_client_with(Some("taken"), "d", |id| format!("http://{id}.d"))
            .await
            .expect("second");
        assert_eq!(first.id, "taken");
        assert_ne!(second.id, "taken");
        assert_eq!(second.url, format!("http://{}.d", second.id));
        assert!(reg.has_client("taken"));
        assert!(reg.has_client(&second.id));
        assert_eq!(reg.get_client("taken").expect("first").id(), "taken");
        reg.close_all();
        assert_eq!(reg.tunnel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tunnel_without_sockets_is_removed_after_grace() {
        let mut opts = options();
        let (_, closed) = counting_hooks(&mut opts);
        let reg = TunnelRegistry::new(opts);
        let info = reg.new_client(None, "u", "d").await.expect("new client");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(reg.has_client(&info.id));
        tokio::time::sleep(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;
        assert!(!reg.has_client(&info.id));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tunnel_going_offline_is_removed_after_grace() {
        let reg = TunnelRegistry::new(options());
        let info = reg.new_client(None, "u", "d").await.expect("new client");
        let client = reg.get_client(&info.id).expect("client");

        let link = TcpStream::connect(("127.0.0.1", info.port)).await.expect("link");
        tokio::time::timeout(Duration::from_secs(5), async {
            while client.stats().connected_sockets != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("online");
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(reg.has_client(&info.id), "online tunnel must survive the grace period");

        drop(link);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(reg.has_client(&info.id));
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(!reg.has_client(&info.id));
    }

    #[tokio::test]
    async fn failed_listen_rolls_back_without_hooks() {
        let mut opts = options();
        opts.bind_host = "256.0.0.1".into();
        let (created, closed) = counting_hooks(&mut opts);
        let reg = TunnelRegistry::new(opts);

        let err = reg.new_client(Some("nope"), "u", "d").await.expect_err("bind fails");
        assert!(matches!(err, RegistryError::Listen { .. }));
        assert!(!reg.has_client("nope"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(created.load(Ordering::SeqCst), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shared_ingress_tunnels_report_port_zero() {
        let ingress = Arc::new(MultiplexedIngress::new(Default::default()));
        let reg = TunnelRegistry::new(RegistryOptions {
            ingress: Some(ingress.clone()),
            ..options()
        });
        let info = reg.new_client(Some("shared-1"), "u", "d").await.expect("new client");
        assert_eq!(info.port, 0);
        assert!(ingress.is_registered("shared-1"));

        reg.remove_client("shared-1");
        assert!(!ingress.is_registered("shared-1"));
    }

    #[tokio::test]
    async fn late_close_of_old_instance_keeps_new_one() {
        let reg = TunnelRegistry::new(RegistryOptions {
            grace: Duration::from_secs(60),
            ..options()
        });
        reg.new_client(Some("reused"), "u", "d").await.expect("first");
        let old = reg.get_client("reused").expect("old");
        reg.remove_client("reused");
        reg.new_client(Some("reused"), "u", "d").await.expect("second");

        old.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let current = reg.get_client("reused").expect("new instance kept");
        assert_ne!(current.serial(), old.serial());
        reg.close_all();
    }
}
