//! Voice bridge: UDP datagrams carried over one persistent TCP stream as
//! newline-delimited JSON records.
//!
//! The relay owns the public UDP socket and forwards every datagram to the
//! origin tagged with its source endpoint. The origin keeps one local UDP
//! socket per remote endpoint so replies from the local voice service can be
//! tagged with the endpoint they belong to.

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};

use crate::tether::{net, tunnel::control::ControlChannel};

/// Records queued for the bridge writer before datagrams are dropped.
pub const VOICE_QUEUE: usize = 1024;

const MAX_DATAGRAM_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid ip {0:?}")]
    Ip(String),
}

/// One datagram on the bridge, tagged with the public endpoint it came from
/// or should go to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceRecord {
    pub ip: String,
    pub port: u16,
    pub data: String,
}

impl VoiceRecord {
    pub fn new(endpoint: SocketAddr, payload: &[u8]) -> Self {
        Self {
            ip: endpoint.ip().to_string(),
            port: endpoint.port(),
            data: BASE64.encode(payload),
        }
    }

    pub fn endpoint(&self) -> Result<SocketAddr, RecordError> {
        let ip: IpAddr = self
            .ip
            .trim()
            .parse()
            .map_err(|_| RecordError::Ip(self.ip.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn payload(&self) -> Result<Vec<u8>, RecordError> {
        Ok(BASE64.decode(self.data.as_bytes())?)
    }
}

/// Serialize one record, newline included.
pub fn encode_record(endpoint: SocketAddr, payload: &[u8]) -> Result<Vec<u8>, RecordError> {
    let mut out = serde_json::to_vec(&VoiceRecord::new(endpoint, payload))?;
    out.push(b'\n');
    Ok(out)
}

pub fn decode_record(line: &[u8]) -> Result<(SocketAddr, Vec<u8>), RecordError> {
    let rec: VoiceRecord = serde_json::from_slice(line)?;
    Ok((rec.endpoint()?, rec.payload()?))
}

/// Splits the bridge byte stream into lines.
///
/// Lines longer than `max_line` are dropped whole: everything up to the next
/// newline is discarded.
#[derive(Debug)]
pub struct RecordReader {
    buf: BytesMut,
    max_line: usize,
    discarding: bool,
}

impl RecordReader {
    pub fn new(max_line: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_line: max_line.max(1),
            discarding: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        let mut out = Vec::new();
        let mut rest = chunk;

        while !rest.is_empty() {
            let Some(i) = rest.iter().position(|&b| b == b'\n') else {
                if !self.discarding {
                    if self.buf.len() + rest.len() > self.max_line {
                        tracing::debug!(max = self.max_line, "voice: record too long; discarding");
                        self.buf.clear();
                        self.discarding = true;
                    } else {
                        self.buf.extend_from_slice(rest);
                    }
                }
                break;
            };

            let seg = &rest[..i];
            rest = &rest[i + 1..];

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if self.buf.len() + seg.len() > self.max_line {
                tracing::debug!(max = self.max_line, "voice: record too long; discarding");
                self.buf.clear();
                continue;
            }

            self.buf.extend_from_slice(seg);
            let line = self.buf.split().freeze();
            if !line.iter().all(u8::is_ascii_whitespace) {
                out.push(line);
            }
        }

        out
    }
}

#[derive(Debug, Clone)]
pub struct VoiceRelayOptions {
    pub max_record_bytes: usize,
}

/// Relay half of the bridge.
#[derive(Debug)]
pub struct VoiceRelay {
    opts: VoiceRelayOptions,
    bridge: ControlChannel,
    udp: Arc<UdpSocket>,
}

impl VoiceRelay {
    pub async fn bind(listen_addr: &str, opts: VoiceRelayOptions) -> anyhow::Result<Self> {
        let bind_addr = net::normalize_bind_addr(listen_addr);
        let udp = UdpSocket::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("bind udp {listen_addr}"))?;
        tracing::info!(listen_addr = %listen_addr, "voice: public udp listening");
        Ok(Self::from_socket(udp, opts))
    }

    pub fn from_socket(udp: UdpSocket, opts: VoiceRelayOptions) -> Self {
        Self {
            opts,
            bridge: ControlChannel::named("voice"),
            udp: Arc::new(udp),
        }
    }

    pub fn bridge_connected(&self) -> bool {
        self.bridge.is_authenticated()
    }

    pub async fn serve_bridge_with_shutdown(
        self: Arc<Self>,
        listen_addr: &str,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let bind_addr = net::normalize_bind_addr(listen_addr);
        let ln = TcpListener::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("bind tcp {listen_addr}"))?;
        tracing::info!(listen_addr = %listen_addr, "voice: bridge listening");
        self.serve_bridge_on(ln, shutdown).await
    }

    pub async fn serve_bridge_on(
        self: Arc<Self>,
        ln: TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let conn_shutdown = shutdown.clone();
        net::accept_loop("voice_bridge", || ln.accept(), shutdown, |conn, peer| {
            let relay = self.clone();
            let shutdown = conn_shutdown.clone();
            tokio::spawn(async move {
                relay.handle_bridge(conn, peer, shutdown).await;
            });
        })
        .await;
        Ok(())
    }

    /// Public UDP uplink: every datagram is queued for the bridge or dropped.
    pub async fn serve_public(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                res = self.udp.recv_from(&mut buf) => {
                    let (n, src) = match res {
                        Ok(v) => v,
                        Err(err) => {
                            // ICMP errors from earlier sends surface here on some platforms.
                            tracing::debug!(err = %err, "voice: udp recv failed");
                            continue;
                        }
                    };
                    let Some(link) = self.bridge.get() else {
                        continue;
                    };
                    match encode_record(src, &buf[..n]) {
                        Ok(rec) => {
                            if link.send_command(rec) {
                                metrics::counter!("tether_voice_datagrams_total", "dir" => "in").increment(1);
                            } else {
                                tracing::debug!(client = %src, "voice: bridge congested; dropping datagram");
                            }
                        }
                        Err(err) => tracing::debug!(err = %err, "voice: encode failed"),
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_bridge(
        &self,
        conn: TcpStream,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (mut rd, mut wr) = conn.into_split();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(VOICE_QUEUE);
        let (link, mut stop) = self.bridge.set(tx, Some(peer));
        let generation = link.generation();
        drop(link);

        tracing::info!(peer = %peer, generation, "voice: bridge connected");

        let mut reader = RecordReader::new(self.opts.max_record_bytes);
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                res = stop.changed() => {
                    if res.is_err() || *stop.borrow() {
                        break;
                    }
                }
                rec = rx.recv() => {
                    let Some(rec) = rec else { break };
                    if wr.write_all(&rec).await.is_err() {
                        break;
                    }
                }
                res = rd.read(&mut buf) => {
                    let n = match res {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    for line in reader.push(&buf[..n]) {
                        self.deliver(&line).await;
                    }
                }
            }
        }

        let _ = wr.shutdown().await;
        if self.bridge.clear(generation) {
            tracing::warn!(peer = %peer, generation, "voice: bridge disconnected");
        }
    }

    async fn deliver(&self, line: &[u8]) {
        let (dst, payload) = match decode_record(line) {
            Ok(v) => v,
            Err(err) => {
                tracing::debug!(err = %err, "voice: skipping malformed record");
                return;
            }
        };
        match self.udp.send_to(&payload, dst).await {
            Ok(_) => {
                metrics::counter!("tether_voice_datagrams_total", "dir" => "out").increment(1);
            }
            Err(err) => tracing::debug!(client = %dst, err = %err, "voice: udp send failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VoiceClientOptions {
    /// Relay voice bridge endpoint, `host:port`.
    pub relay_addr: String,
    /// Local voice service, `host:port`.
    pub local_addr: String,
    pub reconnect_delay: Duration,
    pub dial_timeout: Duration,
    pub max_sessions: usize,
    pub session_idle_timeout: Duration,
    pub max_record_bytes: usize,
}

type Sessions = Arc<DashMap<SocketAddr, Arc<VoiceSession>>>;

/// Last activity on a session, as monotonic millis since the session opened.
#[derive(Debug)]
struct LastSeen {
    opened: Instant,
    at_ms: AtomicU64,
}

impl LastSeen {
    fn new() -> Self {
        Self {
            opened: Instant::now(),
            at_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let ms = self.opened.elapsed().as_millis() as u64;
        self.at_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let at = Duration::from_millis(self.at_ms.load(Ordering::Relaxed));
        self.opened.elapsed().saturating_sub(at)
    }
}

/// Local UDP socket dedicated to one public endpoint.
struct VoiceSession {
    id: u64,
    socket: Arc<UdpSocket>,
    last_seen: Arc<LastSeen>,
    reader: JoinHandle<()>,
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Origin half of the bridge.
pub struct VoiceBridgeClient {
    opts: VoiceClientOptions,
    sessions: Sessions,
    seq: AtomicU64,
}

impl VoiceBridgeClient {
    pub fn new(mut opts: VoiceClientOptions) -> anyhow::Result<Self> {
        if opts.relay_addr.trim().is_empty() {
            anyhow::bail!("voice: relay address is required");
        }
        if opts.local_addr.trim().is_empty() {
            anyhow::bail!("voice: local voice address is required");
        }
        if opts.dial_timeout <= Duration::from_millis(0) {
            opts.dial_timeout = Duration::from_secs(5);
        }
        opts.max_sessions = opts.max_sessions.max(1);
        Ok(Self {
            opts,
            sessions: Arc::new(DashMap::new()),
            seq: AtomicU64::new(1),
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let res = self.run_once(shutdown.clone()).await;
            self.clear_sessions();
            match res {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        relay = %self.opts.relay_addr,
                        err = %err,
                        retry = %humantime::format_duration(self.opts.reconnect_delay),
                        "voice: bridge disconnected; retrying"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(self.opts.reconnect_delay) => {}
            }
        }
    }

    async fn run_once(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let local = tokio::net::lookup_host(self.opts.local_addr.as_str())
            .await
            .with_context(|| format!("resolve {}", self.opts.local_addr))?
            .next()
            .with_context(|| format!("resolve {}: no address", self.opts.local_addr))?;

        let conn = net::dial_tcp(&self.opts.relay_addr, self.opts.dial_timeout).await?;
        tracing::info!(relay = %self.opts.relay_addr, local = %local, "voice: bridge connected");

        let (mut rd, mut wr) = conn.into_split();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(VOICE_QUEUE);
        let mut writer = tokio::spawn(async move {
            while let Some(rec) = rx.recv().await {
                wr.write_all(&rec).await?;
            }
            Ok::<(), std::io::Error>(())
        });

        let mut reader = RecordReader::new(self.opts.max_record_bytes);
        let mut sweep = tokio::time::interval(Duration::from_secs(1));
        let mut buf = vec![0u8; 16 * 1024];

        let res = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break Ok(());
                    }
                }
                _ = sweep.tick() => self.sweep_idle(),
                _ = &mut writer => {
                    break Err(anyhow::anyhow!("voice: bridge write failed"));
                }
                res = rd.read(&mut buf) => {
                    let n = match res {
                        Ok(0) => break Err(anyhow::anyhow!("voice: relay closed the bridge")),
                        Ok(n) => n,
                        Err(err) => break Err(anyhow::Error::new(err).context("voice: read")),
                    };
                    for line in reader.push(&buf[..n]) {
                        match decode_record(&line) {
                            Ok((endpoint, payload)) => {
                                self.forward(endpoint, &payload, local, &tx).await;
                            }
                            Err(err) => {
                                tracing::debug!(err = %err, "voice: skipping malformed record");
                            }
                        }
                    }
                }
            }
        };

        writer.abort();
        res
    }

    async fn forward(
        &self,
        endpoint: SocketAddr,
        payload: &[u8],
        local: SocketAddr,
        tx: &mpsc::Sender<Vec<u8>>,
    ) {
        let existing = self.sessions.get(&endpoint).map(|s| s.value().clone());
        let sess = match existing {
            Some(s) => s,
            None => {
                if self.sessions.len() >= self.opts.max_sessions {
                    tracing::debug!(client = %endpoint, max = self.opts.max_sessions, "voice: session limit reached; dropping datagram");
                    return;
                }
                match self.open_session(endpoint, local, tx.clone()).await {
                    Ok(s) => s,
                    Err(err) => {
                        tracing::warn!(client = %endpoint, err = %err, "voice: open session failed");
                        return;
                    }
                }
            }
        };

        sess.last_seen.touch();
        if let Err(err) = sess.socket.send(payload).await {
            tracing::debug!(client = %endpoint, err = %err, "voice: local send failed");
        }
    }

    async fn open_session(
        &self,
        endpoint: SocketAddr,
        local: SocketAddr,
        tx: mpsc::Sender<Vec<u8>>,
    ) -> anyhow::Result<Arc<VoiceSession>> {
        let bind = if local.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind).await.context("voice: bind session socket")?;
        socket
            .connect(local)
            .await
            .with_context(|| format!("voice: connect {local}"))?;
        let socket = Arc::new(socket);

        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let last_seen = Arc::new(LastSeen::new());
        let reader = tokio::spawn(session_reader(
            id,
            endpoint,
            socket.clone(),
            last_seen.clone(),
            tx,
            self.sessions.clone(),
        ));

        let sess = Arc::new(VoiceSession {
            id,
            socket,
            last_seen,
            reader,
        });
        self.sessions.insert(endpoint, sess.clone());
        metrics::gauge!("tether_voice_sessions").set(self.sessions.len() as f64);
        tracing::debug!(client = %endpoint, id, "voice: session opened");
        Ok(sess)
    }

    fn sweep_idle(&self) {
        let idle = self.opts.session_idle_timeout;
        if idle <= Duration::from_millis(0) {
            return;
        }

        let mut to_remove = Vec::new();
        for s in self.sessions.iter() {
            if s.value().last_seen.idle_for() > idle {
                to_remove.push(*s.key());
            }
        }

        for k in to_remove {
            if self.sessions.remove(&k).is_some() {
                tracing::debug!(client = %k, "voice: session idle; closed");
            }
        }
        metrics::gauge!("tether_voice_sessions").set(self.sessions.len() as f64);
    }

    fn clear_sessions(&self) {
        let n = self.sessions.len();
        self.sessions.clear();
        metrics::gauge!("tether_voice_sessions").set(0.0);
        if n > 0 {
            tracing::debug!(closed = n, "voice: sessions cleared");
        }
    }
}

/// Local replies, tagged with the endpoint the session belongs to.
async fn session_reader(
    id: u64,
    endpoint: SocketAddr,
    socket: Arc<UdpSocket>,
    last_seen: Arc<LastSeen>,
    tx: mpsc::Sender<Vec<u8>>,
    sessions: Sessions,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
    loop {
        let n = match socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(client = %endpoint, err = %err, "voice: local recv failed; closing session");
                sessions.remove_if(&endpoint, |_, s| s.id == id);
                return;
            }
        };
        last_seen.touch();

        let rec = match encode_record(endpoint, &buf[..n]) {
            Ok(rec) => rec,
            Err(err) => {
                tracing::debug!(err = %err, "voice: encode failed");
                continue;
            }
        };
        if tx.try_send(rec).is_err() {
            tracing::debug!(client = %endpoint, "voice: bridge congested; dropping reply");
        }
    }
}
