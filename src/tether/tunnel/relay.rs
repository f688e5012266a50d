use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
};

use crate::tether::{
    net,
    offline::{OfflineSession, Phase},
    status::StatusResponder,
    telemetry::GaugeGuard,
    tunnel::{
        control::{COMMAND_QUEUE, ControlChannel},
        pipe,
        registry::{PendingGuard, Registry},
        wire::{self, Hello},
    },
};

/// Bytes a public client may send while its tunnel is being set up.
const MAX_PREFIX_BYTES: usize = 64 * 1024;

/// How long an offline status connection may sit silent.
const OFFLINE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub auth_token: String,
    pub hello_timeout: Duration,
    pub pending_timeout: Duration,
}

/// Relay side of the tunnel: the public game listener plus the internal
/// control/tunnel listener the origin dials into.
#[derive(Debug)]
pub struct Relay {
    opts: RelayOptions,
    control: Arc<ControlChannel>,
    registry: Arc<Registry>,
    responder: Arc<StatusResponder>,
}

impl Relay {
    pub fn new(
        opts: RelayOptions,
        registry: Arc<Registry>,
        responder: Arc<StatusResponder>,
    ) -> Self {
        Self {
            opts,
            control: Arc::new(ControlChannel::new()),
            registry,
            responder,
        }
    }

    pub fn control(&self) -> Arc<ControlChannel> {
        self.control.clone()
    }

    pub async fn serve_control_with_shutdown(
        self: Arc<Self>,
        listen_addr: &str,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let ln = bind(listen_addr).await?;
        tracing::info!(listen_addr = %listen_addr, "control: listening");
        self.serve_control_on(ln, shutdown).await
    }

    pub async fn serve_control_on(
        self: Arc<Self>,
        ln: TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let conn_shutdown = shutdown.clone();
        net::accept_loop("control", || ln.accept(), shutdown, |conn, peer| {
            let relay = self.clone();
            let shutdown = conn_shutdown.clone();
            tokio::spawn(async move {
                relay.handle_internal(conn, peer, shutdown).await;
            });
        })
        .await;
        Ok(())
    }

    pub async fn serve_public_with_shutdown(
        self: Arc<Self>,
        listen_addr: &str,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let ln = bind(listen_addr).await?;
        tracing::info!(listen_addr = %listen_addr, "public: listening");
        self.serve_public_on(ln, shutdown).await
    }

    pub async fn serve_public_on(
        self: Arc<Self>,
        ln: TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        net::accept_loop("public", || ln.accept(), shutdown, |conn, peer| {
            let relay = self.clone();
            tokio::spawn(async move {
                if tracing::enabled!(tracing::Level::DEBUG) {
                    tracing::debug!(client = %peer, "public: accepted");
                }
                metrics::counter!("tether_public_connections_total").increment(1);
                relay.handle_public(conn, peer).await;
            });
        })
        .await;
        Ok(())
    }

    async fn handle_internal(
        self: Arc<Self>,
        mut conn: TcpStream,
        peer: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) {
        let hello =
            wire::read_hello(&mut conn, &self.opts.auth_token, self.opts.hello_timeout).await;
        match hello {
            Ok(Hello::Control) => self.serve_control_link(conn, peer, shutdown).await,
            Ok(Hello::Tunnel(id)) => {
                if self.registry.complete(&id, conn) {
                    metrics::counter!("tether_tunnel_requests_total", "result" => "matched")
                        .increment(1);
                } else {
                    metrics::counter!("tether_tunnel_requests_total", "result" => "unknown")
                        .increment(1);
                }
            }
            Err(err) => {
                tracing::debug!(peer = %peer, err = %err, "control: rejected connection");
            }
        }
    }

    async fn serve_control_link(
        &self,
        conn: TcpStream,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (mut rd, mut wr) = conn.into_split();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(COMMAND_QUEUE);
        let (link, mut stop) = self.control.set(tx, Some(peer));
        let generation = link.generation();
        drop(link);

        tracing::info!(peer = %peer, generation, "control: origin authenticated; tunnel mode");

        let mut buf = [0u8; 512];
        let reason = loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break "shutdown";
                    }
                }
                res = stop.changed() => {
                    if res.is_err() || *stop.borrow() {
                        break "replaced";
                    }
                }
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break "closed" };
                    if let Err(err) = wr.write_all(&cmd).await {
                        tracing::debug!(err = %err, "control: write failed");
                        break "write error";
                    }
                }
                res = rd.read(&mut buf) => match res {
                    Ok(0) => break "eof",
                    Ok(n) => {
                        tracing::debug!(peer = %peer, bytes = n, "control: ignoring inbound data");
                    }
                    Err(err) => {
                        tracing::debug!(err = %err, "control: read failed");
                        break "read error";
                    }
                },
            }
        };

        let _ = wr.shutdown().await;
        if self.control.clear(generation) {
            tracing::warn!(
                peer = %peer,
                generation,
                reason,
                "control: channel lost; switching to offline mode"
            );
        } else {
            tracing::debug!(peer = %peer, generation, reason, "control: stale channel closed");
        }
    }

    async fn handle_public(&self, conn: TcpStream, peer: SocketAddr) {
        if self.control.is_authenticated() {
            match self.registry.request(&self.control, Some(peer)) {
                Ok(guard) => {
                    self.run_tunnel(conn, peer, guard, BytesMut::new()).await;
                    return;
                }
                Err(err) => {
                    metrics::counter!("tether_tunnel_requests_total", "result" => "rejected")
                        .increment(1);
                    tracing::warn!(client = %peer, err = %err, "tunnel: request failed; answering offline");
                }
            }
        }
        self.run_offline(conn, peer).await;
    }

    async fn run_offline(&self, mut conn: TcpStream, peer: SocketAddr) {
        let mut session = OfflineSession::new(self.responder.clone());
        let mut buf = vec![0u8; 4096];

        loop {
            let n = match tokio::time::timeout(OFFLINE_IDLE_TIMEOUT, conn.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return,
                Ok(Ok(n)) => n,
                Err(_) => {
                    tracing::debug!(client = %peer, "offline: idle timeout");
                    return;
                }
            };

            if session.can_switch() && self.control.is_authenticated() {
                match self.registry.request(&self.control, Some(peer)) {
                    Ok(guard) => {
                        let mut prefix = BytesMut::from(session.replay().as_ref());
                        prefix.extend_from_slice(&buf[..n]);
                        tracing::debug!(client = %peer, replay = prefix.len(), "offline: origin is back; switching to tunnel");
                        self.run_tunnel(conn, peer, guard, prefix).await;
                        return;
                    }
                    Err(err) => {
                        tracing::debug!(client = %peer, err = %err, "offline: switch failed; staying offline");
                    }
                }
            }

            for reply in session.feed(&buf[..n]) {
                if conn.write_all(&reply).await.is_err() {
                    return;
                }
            }
            if session.phase() == Phase::Failed {
                tracing::debug!(client = %peer, "offline: dropping connection");
                return;
            }
        }
    }

    async fn run_tunnel(
        &self,
        mut conn: TcpStream,
        peer: SocketAddr,
        mut guard: PendingGuard,
        mut prefix: BytesMut,
    ) {
        let deadline = tokio::time::sleep(self.opts.pending_timeout);
        tokio::pin!(deadline);
        let mut buf = vec![0u8; 4096];

        let origin = loop {
            tokio::select! {
                origin = guard.matched() => match origin {
                    Some(origin) => break origin,
                    None => return,
                },
                res = conn.read(&mut buf) => match res {
                    Ok(0) | Err(_) => {
                        tracing::debug!(client = %peer, id = %guard.id(), "tunnel: client left before origin connected");
                        return;
                    }
                    Ok(n) => {
                        if prefix.len() + n > MAX_PREFIX_BYTES {
                            tracing::debug!(client = %peer, "tunnel: too much data before origin connected");
                            return;
                        }
                        prefix.extend_from_slice(&buf[..n]);
                    }
                },
                _ = &mut deadline => {
                    metrics::counter!("tether_tunnel_requests_total", "result" => "timeout").increment(1);
                    tracing::warn!(client = %peer, id = %guard.id(), "tunnel: origin did not connect in time");
                    return;
                }
            }
        };
        drop(guard);

        let mut origin = origin;
        let prefix: Bytes = prefix.freeze();
        if !prefix.is_empty() {
            if let Err(err) = origin.write_all(&prefix).await {
                tracing::debug!(client = %peer, err = %err, "tunnel: replay to origin failed");
                return;
            }
        }

        let _active = GaugeGuard::new("tether_active_tunnels");
        let out = pipe::splice(conn, origin).await;
        tracing::debug!(
            client = %peer,
            ended = ?out.ended,
            err = ?out.error,
            up = out.a_to_b,
            down = out.b_to_a,
            "tunnel: closed"
        );
    }
}

async fn bind(listen_addr: &str) -> anyhow::Result<TcpListener> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind tcp {listen_addr}"))
}
