use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{net::TcpListener, sync::watch, task::JoinSet};

use crate::backhaul::{
    client::session::{ClientSession, SessionEvent, SessionOptions},
    config::{self, ClientConfig, Config, ConfigPathSource, ServerConfig},
    logging, net,
    server::{
        edge::{Edge, EdgeOptions, RequestHook, RequestInfo},
        ingress::{IngressOptions, MultiplexedIngress},
        registry::{RegistryOptions, TunnelHook, TunnelInfo, TunnelRegistry},
    },
    telemetry,
};

/// Command-line overrides for `backhaul server`.
#[derive(Debug, Default, clap::Args)]
pub struct ServerArgs {
    /// Public listen address (`:8080`, `127.0.0.1:80`).
    #[arg(long)]
    pub address: Option<String>,
    /// Base domain tunnels are served under; repeatable.
    #[arg(long = "domain")]
    pub domains: Vec<String>,
    /// Advertise https:// tunnel URLs.
    #[arg(long)]
    pub secure: bool,
    /// Accept tunnel sockets for every tunnel on this one port.
    #[arg(long)]
    pub tunnel_port: Option<u16>,
    /// Maximum sockets a single client may hold open.
    #[arg(long)]
    pub max_sockets: Option<usize>,
}

/// Command-line overrides for `backhaul client`.
#[derive(Debug, Default, clap::Args)]
pub struct ClientArgs {
    /// Local port to expose.
    #[arg(long, short = 'p')]
    pub port: Option<u16>,
    /// Relay server base URL.
    #[arg(long)]
    pub host: Option<String>,
    /// Request this subdomain.
    #[arg(long, short = 's')]
    pub subdomain: Option<String>,
    /// Proxy to this host instead of localhost; also rewrites the Host header.
    #[arg(long)]
    pub local_host: Option<String>,
    /// Talk TLS to the local service.
    #[arg(long)]
    pub local_https: bool,
    #[arg(long)]
    pub local_cert: Option<String>,
    #[arg(long)]
    pub local_key: Option<String>,
    #[arg(long)]
    pub local_ca: Option<String>,
    /// Skip certificate verification for the local service.
    #[arg(long)]
    pub allow_invalid_cert: bool,
    /// Print each proxied request line.
    #[arg(long)]
    pub print_requests: bool,
}

#[derive(Debug)]
pub enum Mode {
    Server(ServerArgs),
    Client(ClientArgs),
}

pub async fn run(config_path: Option<PathBuf>, mode: Mode) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = match config::ensure_config_file(&resolved.path) {
        Ok(created) => created,
        // A missing system-wide default is not fatal; run on built-in defaults.
        Err(err) if resolved.source == ConfigPathSource::Default => {
            eprintln!("backhaul: {err:#}; using built-in defaults");
            false
        }
        Err(err) => return Err(err),
    };

    let cfg = if resolved.path.is_file() {
        config::load_config(&resolved.path)
            .with_context(|| format!("load config: {}", resolved.path.display()))?
    } else {
        Config::default()
    };

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    if !cfg.metrics_addr.is_empty() {
        let handle = telemetry::init_prometheus()?;
        let addr = cfg.metrics_addr.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { telemetry::serve_metrics(&addr, handle, shutdown).await });
    }

    match mode {
        Mode::Server(args) => {
            let server = apply_server_args(cfg.server.clone(), args);
            run_server(server, &mut tasks, shutdown_tx, shutdown_rx).await
        }
        Mode::Client(args) => {
            let client = apply_client_args(cfg.client.clone().unwrap_or_default(), args);
            run_client(client, &mut tasks, shutdown_tx).await
        }
    }
}

fn apply_server_args(mut cfg: ServerConfig, args: ServerArgs) -> ServerConfig {
    if let Some(addr) = args.address {
        cfg.listen_addr = addr;
    }
    if !args.domains.is_empty() {
        cfg.domains = args
            .domains
            .into_iter()
            .map(|d| d.trim().trim_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
    }
    cfg.secure |= args.secure;
    if let Some(port) = args.tunnel_port.filter(|p| *p != 0) {
        cfg.tunnel_port = Some(port);
    }
    if let Some(n) = args.max_sockets.filter(|n| *n > 0) {
        cfg.max_tcp_sockets = n;
    }
    cfg
}

fn apply_client_args(mut cfg: ClientConfig, args: ClientArgs) -> ClientConfig {
    if let Some(port) = args.port {
        cfg.local.port = port;
    }
    if let Some(host) = args.host {
        cfg.host = host;
    }
    if let Some(sub) = args.subdomain {
        cfg.subdomain = Some(sub);
    }
    if let Some(host) = args.local_host {
        cfg.local.host = host.clone();
        cfg.local_host = Some(host);
    }
    cfg.local.https |= args.local_https;
    cfg.local.cert_file = args.local_cert.or(cfg.local.cert_file);
    cfg.local.key_file = args.local_key.or(cfg.local.key_file);
    cfg.local.ca_file = args.local_ca.or(cfg.local.ca_file);
    cfg.local.allow_invalid_cert |= args.allow_invalid_cert;
    cfg.print_requests |= args.print_requests;
    cfg
}

async fn run_server(
    cfg: ServerConfig,
    tasks: &mut JoinSet<anyhow::Result<()>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!(
        listen_addr = %cfg.listen_addr,
        domains = ?cfg.domains,
        secure = cfg.secure,
        tunnel_port = ?cfg.tunnel_port,
        max_tcp_sockets = cfg.max_tcp_sockets,
        "backhaul: starting server"
    );

    let ingress = match cfg.tunnel_port {
        Some(port) => {
            let ingress = Arc::new(MultiplexedIngress::new(IngressOptions {
                handshake_timeout: cfg.handshake_timeout,
                ..IngressOptions::default()
            }));
            let ln = TcpListener::bind((cfg.tunnel_bind.as_str(), port))
                .await
                .with_context(|| format!("ingress: bind {}:{port}", cfg.tunnel_bind))?;
            let shutdown = shutdown_rx.clone();
            let serving = ingress.clone();
            tasks.spawn(async move { serving.listen_and_serve(ln, shutdown).await });
            Some(ingress)
        }
        None => None,
    };

    let on_created: TunnelHook = Arc::new(|t: &TunnelInfo| {
        tracing::info!(id = %t.id, url = %t.url, "tunnel: created");
    });
    let on_closed: TunnelHook = Arc::new(|t: &TunnelInfo| {
        tracing::info!(id = %t.id, "tunnel: closed");
    });
    let registry = TunnelRegistry::new(RegistryOptions {
        max_tcp_sockets: cfg.max_tcp_sockets,
        ingress,
        bind_host: cfg.bind_host.clone(),
        grace: cfg.grace,
        on_tunnel_created: Some(on_created),
        on_tunnel_closed: Some(on_closed),
    });

    let on_request: RequestHook = Arc::new(|r: &RequestInfo| {
        tracing::debug!(
            id = %r.tunnel_id,
            method = %r.method,
            path = %r.path,
            remote = r.remote_address.as_deref().unwrap_or("-"),
            "edge: request"
        );
    });
    let edge = Edge::new(
        EdgeOptions {
            domains: cfg.domains.clone(),
            secure: cfg.secure,
            tunnel_port: cfg.tunnel_port,
            on_request: Some(on_request),
        },
        registry.clone(),
    );

    let addr = net::normalize_bind_addr(&cfg.listen_addr).into_owned();
    let ln = TcpListener::bind(addr.as_str())
        .await
        .with_context(|| format!("edge: bind {addr}"))?;
    {
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { edge.listen_and_serve(ln, shutdown).await });
    }

    let res = wait(tasks, &shutdown_tx).await;
    registry.close_all();
    drain(tasks).await;
    res
}

async fn run_client(
    cfg: ClientConfig,
    tasks: &mut JoinSet<anyhow::Result<()>>,
    shutdown_tx: watch::Sender<bool>,
) -> anyhow::Result<()> {
    let (session, mut events) = ClientSession::new(SessionOptions {
        control_host: cfg.host.clone(),
        subdomain: cfg.subdomain.clone(),
        headers: cfg.headers.clone(),
        local: cfg.local.clone(),
        rewrite_host: cfg.local_host.is_some(),
        retry: cfg.retry.clone(),
    });

    tracing::info!(
        host = %cfg.host,
        local = %format!("{}:{}", cfg.local.host_or_default(), cfg.local.port),
        subdomain = cfg.subdomain.as_deref().unwrap_or("-"),
        "backhaul: starting client"
    );

    let opening = session.clone();
    let info = tokio::select! {
        res = opening.open() => res.context("open tunnel")?,
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            session.close();
            let _ = shutdown_tx.send(true);
            drain(tasks).await;
            return Ok(());
        }
    };
    tracing::debug!(id = %info.id, url = %info.url, "client: tunnel allocated");

    let print_requests = cfg.print_requests;
    let res = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            Ok(())
        }
        res = async {
            while let Some(ev) = events.recv().await {
                match ev {
                    SessionEvent::Url(url) => println!("your url is: {url}"),
                    SessionEvent::Request(req) if print_requests => {
                        let now = humantime::format_rfc3339_seconds(std::time::SystemTime::now());
                        println!("{now} {} {}", req.method, req.path);
                    }
                    SessionEvent::Request(_) => {}
                    SessionEvent::Error(err) => tracing::warn!(err = %err, "client: link error"),
                    SessionEvent::Close => break,
                }
            }
            Ok::<(), anyhow::Error>(())
        } => res,
        res = wait_task(tasks) => res,
    };

    session.close();
    let _ = shutdown_tx.send(true);
    drain(tasks).await;
    res
}

async fn wait(
    tasks: &mut JoinSet<anyhow::Result<()>>,
    shutdown_tx: &watch::Sender<bool>,
) -> anyhow::Result<()> {
    let res = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            Ok(())
        }
        res = wait_task(tasks) => res,
    };
    let _ = shutdown_tx.send(true);
    res
}

/// Resolves when a background task ends; never resolves if there are none.
async fn wait_task(tasks: &mut JoinSet<anyhow::Result<()>>) -> anyhow::Result<()> {
    match tasks.join_next().await {
        Some(Ok(res)) => res,
        Some(Err(join_err)) => Err(join_err.into()),
        None => std::future::pending().await,
    }
}

async fn drain(tasks: &mut JoinSet<anyhow::Result<()>>) {
    let all = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), all).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_flags_override_config() {
        let base = ClientConfig {
            host: "https://relay.example.com".into(),
            ..ClientConfig::default()
        };
        let cfg = apply_client_args(
            base,
            ClientArgs {
                port: Some(3000),
                local_host: Some("app.internal".into()),
                print_requests: true,
                ..ClientArgs::default()
            },
        );
        assert_eq!(cfg.host, "https://relay.example.com");
        assert_eq!(cfg.local.port, 3000);
        assert_eq!(cfg.local.host, "app.internal");
        assert_eq!(cfg.local_host.as_deref(), Some("app.internal"));
        assert!(cfg.print_requests);
        assert!(!cfg.local.https);
    }

    #[test]
    fn server_flags_override_config() {
        let cfg = apply_server_args(
            ServerConfig::default(),
            ServerArgs {
                domains: vec![".Tunnel.Example.com".into()],
                tunnel_port: Some(0),
                max_sockets: Some(3),
                ..ServerArgs::default()
            },
        );
        assert_eq!(cfg.domains, vec!["tunnel.example.com".to_string()]);
        assert_eq!(cfg.tunnel_port, None);
        assert_eq!(cfg.max_tcp_sockets, 3);
        assert_eq!(cfg.listen_addr, ":8080");
    }
}
