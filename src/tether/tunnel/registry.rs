use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::{net::TcpStream, sync::oneshot};

use crate::tether::tunnel::{
    control::ControlChannel,
    wire::{self, new_connection_id},
};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no authenticated control channel")]
    NoControl,
    #[error("too many pending tunnels")]
    Full,
    #[error("control channel did not accept the command")]
    ControlUnavailable,
}

struct PendingTunnel {
    deliver: oneshot::Sender<TcpStream>,
    peer: Option<SocketAddr>,
    created: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingSnapshot {
    pub count: usize,
    pub oldest_age_ms: u64,
}

/// Public connections waiting for the origin to dial back.
pub struct Registry {
    pending: Mutex<HashMap<String, PendingTunnel>>,
    max_pending: usize,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("max_pending", &self.max_pending)
            .finish_non_exhaustive()
    }
}

/// Owned by the task holding the public socket. Dropping it withdraws the
/// request, so every exit path cleans the registry.
pub struct PendingGuard {
    registry: Arc<Registry>,
    id: String,
    rx: oneshot::Receiver<TcpStream>,
}

impl PendingGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Resolves with the origin stream once the tunnel is completed.
    pub async fn matched(&mut self) -> Option<TcpStream> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.registry.withdraw(&self.id);
    }
}

impl Registry {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            max_pending: max_pending.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingTunnel>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a public connection and ask the origin for a tunnel.
    pub fn request(
        self: &Arc<Self>,
        control: &ControlChannel,
        peer: Option<SocketAddr>,
    ) -> Result<PendingGuard, RegistryError> {
        let link = control.get().ok_or(RegistryError::NoControl)?;

        let (tx, rx) = oneshot::channel();
        let id = {
            let mut pending = self.lock();
            if pending.len() >= self.max_pending {
                return Err(RegistryError::Full);
            }
            let mut id = new_connection_id();
            while pending.contains_key(&id) {
                id = new_connection_id();
            }
            pending.insert(
                id.clone(),
                PendingTunnel {
                    deliver: tx,
                    peer,
                    created: Instant::now(),
                },
            );
            id
        };

        let guard = PendingGuard {
            registry: self.clone(),
            id,
            rx,
        };

        if !link.send_command(wire::create_tunnel_command(&guard.id)) {
            return Err(RegistryError::ControlUnavailable);
        }

        tracing::debug!(id = %guard.id, client = ?peer, generation = link.generation(), "tunnel: requested");
        Ok(guard)
    }

    /// Hand the origin-dialed stream to the waiting public connection.
    ///
    /// Unknown or already withdrawn ids close `origin` right away.
    pub fn complete(&self, id: &str, origin: TcpStream) -> bool {
        let entry = self.lock().remove(id);
        let Some(p) = entry else {
            tracing::debug!(id = %id, "tunnel: no pending request; closing origin stream");
            drop(origin);
            return false;
        };

        match p.deliver.send(origin) {
            Ok(()) => {
                tracing::debug!(
                    id = %id,
                    client = ?p.peer,
                    waited_ms = p.created.elapsed().as_millis() as u64,
                    "tunnel: matched"
                );
                true
            }
            Err(origin) => {
                drop(origin);
                false
            }
        }
    }

    fn withdraw(&self, id: &str) {
        self.lock().remove(id);
    }

    pub fn snapshot(&self) -> PendingSnapshot {
        let pending = self.lock();
        let oldest = pending
            .values()
            .map(|p| p.created.elapsed())
            .max()
            .unwrap_or(Duration::ZERO);
        PendingSnapshot {
            count: pending.len(),
            oldest_age_ms: oldest.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::mpsc,
    };

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (c, s) = tokio::join!(TcpStream::connect(addr), ln.accept());
        (c.unwrap(), s.unwrap().0)
    }

    fn authenticated() -> (ControlChannel, mpsc::Receiver<Vec<u8>>) {
        let ch = ControlChannel::new();
        let (tx, rx) = mpsc::channel(8);
        let (_link, _stop) = ch.set(tx, None);
        (ch, rx)
    }

    #[tokio::test]
    async fn request_without_control_fails() {
        let reg = Arc::new(Registry::new(8));
        let err = reg.request(&ControlChannel::new(), None).err().unwrap();
        assert!(matches!(err, RegistryError::NoControl));
        assert_eq!(reg.snapshot().count, 0);
    }

    #[tokio::test]
    async fn request_then_complete_delivers_origin_stream() {
        let reg = Arc::new(Registry::new(8));
        let (ch, mut cmds) = authenticated();

        let mut guard = reg.request(&ch, None).unwrap();
        let cmd = cmds.recv().await.unwrap();
        assert_eq!(cmd, wire::create_tunnel_command(guard.id()));
        assert_eq!(reg.snapshot().count, 1);

        let (mut far, origin) = tcp_pair().await;
        assert!(reg.complete(&guard.id().to_string(), origin));
        assert_eq!(reg.snapshot().count, 0);

        let mut got = guard.matched().await.unwrap();
        far.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        got.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn unknown_id_closes_offered_stream() {
        let reg = Arc::new(Registry::new(8));
        let (ch, _cmds) = authenticated();
        let _guard = reg.request(&ch, None).unwrap();

        let (mut far, origin) = tcp_pair().await;
        assert!(!reg.complete("nope", origin));
        assert_eq!(reg.snapshot().count, 1);

        let mut buf = [0u8; 1];
        assert_eq!(far.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dropped_request_behaves_as_unknown() {
        let reg = Arc::new(Registry::new(8));
        let (ch, _cmds) = authenticated();
        let guard = reg.request(&ch, None).unwrap();
        let id = guard.id().to_string();
        drop(guard);
        assert_eq!(reg.snapshot().count, 0);

        let (mut far, origin) = tcp_pair().await;
        assert!(!reg.complete(&id, origin));
        let mut buf = [0u8; 1];
        assert_eq!(far.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let reg = Arc::new(Registry::new(2));
        let (ch, _cmds) = authenticated();
        let _a = reg.request(&ch, None).unwrap();
        let _b = reg.request(&ch, None).unwrap();
        let err = reg.request(&ch, None).err().unwrap();
        assert!(matches!(err, RegistryError::Full));
        assert_eq!(reg.snapshot().count, 2);
    }

    #[tokio::test]
    async fn dead_control_link_leaves_nothing_pending() {
        let reg = Arc::new(Registry::new(8));
        let (ch, cmds) = authenticated();
        drop(cmds);
        let err = reg.request(&ch, None).err().unwrap();
        assert!(matches!(err, RegistryError::ControlUnavailable));
        assert_eq!(reg.snapshot().count, 0);
    }
}
