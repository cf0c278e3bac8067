//! Process orchestration: resolve config, init logging/metrics, spawn the
//! listener and per-upstream transports plus the admin server into a
//! `JoinSet`, then race a shutdown signal against early task termination
//! and drain everything within a bounded window.

use std::{collections::HashMap, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{net::UdpSocket, task::JoinSet};
use tracing::{info, warn};

use crate::dnsforward::{
    admin, config, dns,
    forwarder::{self, ForwardOptions, ForwardOutcome, ForwardRequest},
    logging, telemetry,
    transport::{Protocol, TokioDialer, Transport, TransportConfig},
};

pub async fn run(config_path: Option<PathBuf>, admin_addr_override: Option<String>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;
    let mut cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    if let Some(addr) = admin_addr_override {
        cfg.admin_addr = addr;
    }

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt;

    if created {
        warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    info!(
        config = %resolved.path.display(),
        listen_addr = %cfg.listen_addr,
        admin_addr = %cfg.admin_addr,
        upstreams = cfg.upstreams.len(),
        "dnsforward: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);

    let transport_cfg = TransportConfig {
        min_dial_timeout: cfg.transport.min_dial_timeout,
        max_dial_timeout: cfg.transport.max_dial_timeout,
        expire: cfg.transport.expire,
    };

    let mut transports = HashMap::new();
    for up in &cfg.upstreams {
        let t = Transport::start(
            up.addr.clone(),
            up.proxy_name.clone(),
            up.tls,
            Box::new(TokioDialer::new()),
            transport_cfg,
        );
        transports.insert(up.addr.clone(), t);
    }
    let transports = Arc::new(transports);
    let primary_upstream = cfg
        .upstreams
        .first()
        .map(|u| u.addr.clone())
        .context("config: at least one upstream is required")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    {
        let state = admin::AdminState { metrics: prom.clone() };
        let addr: SocketAddr = cfg
            .admin_addr
            .parse()
            .with_context(|| format!("config: invalid admin_addr {}", cfg.admin_addr))?;
        tasks.spawn(async move { admin::serve(addr, state).await });
    }

    {
        let listen_addr: SocketAddr = cfg
            .listen_addr
            .parse()
            .with_context(|| format!("config: invalid listen_addr {}", cfg.listen_addr))?;
        let transports = transports.clone();
        let read_timeout = cfg.read_timeout;
        let max_timeout = cfg.max_timeout;
        let mut shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            run_udp_listener(
                listen_addr,
                transports,
                primary_upstream,
                read_timeout,
                max_timeout,
                &mut shutdown,
            )
            .await
        });
    }

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    for t in transports.values() {
        t.stop().await;
    }

    Ok(())
}

/// A minimal UDP forwarding front-end: reads a client datagram, forwards it
/// to the configured primary upstream, and writes back the response. TCP
/// listeners and multi-upstream routing policy are deliberately out of scope
/// here; this is a runnable stand-in that exercises the forwarder end to end.
async fn run_udp_listener(
    addr: SocketAddr,
    transports: Arc<HashMap<String, Arc<Transport>>>,
    primary_upstream: String,
    read_timeout: Duration,
    max_timeout: Duration,
    shutdown: &mut tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let sock = UdpSocket::bind(addr).await.with_context(|| format!("bind {addr}"))?;
    info!(%addr, "listener: listening");

    let transport = transports
        .get(&primary_upstream)
        .cloned()
        .context("config: primary upstream transport missing")?;

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
            res = sock.recv_from(&mut buf) => {
                let (n, peer) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "listener: recv_from failed");
                        continue;
                    }
                };
                let raw = bytes::Bytes::copy_from_slice(&buf[..n]);
                let transport = transport.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_one(raw, peer, transport, read_timeout, max_timeout).await {
                        warn!(error = %e, %peer, "listener: forward failed");
                    }
                });
            }
        }
    }
}

async fn handle_one(
    raw: bytes::Bytes,
    peer: SocketAddr,
    transport: Arc<Transport>,
    read_timeout: Duration,
    max_timeout: Duration,
) -> anyhow::Result<()> {
    let msg = dns::parse_message(raw).context("parse inbound datagram")?;
    let mut req = ForwardRequest {
        msg,
        client_udp_size: 512,
        qtype: dns::Qtype::Other(0),
        proto: Protocol::Udp,
    };
    let opts = ForwardOptions {
        force_tcp: false,
        prefer_udp: false,
        read_timeout,
        max_timeout,
    };

    match forwarder::connect(&transport, &mut req, &opts).await {
        Ok(ForwardOutcome::Answer(answer)) => {
            let sock = UdpSocket::bind(("0.0.0.0", 0)).await?;
            sock.connect(peer).await?;
            sock.send(answer.raw()).await?;
        }
        Ok(ForwardOutcome::ZoneTransfer(_)) => {
            warn!(%peer, "listener: zone transfer over udp front-end is not supported");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
