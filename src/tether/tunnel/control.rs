use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwapOption;
use tokio::sync::{mpsc, watch};

/// Commands queued per control link before the relay stops asking for tunnels.
pub const COMMAND_QUEUE: usize = 256;

/// The authenticated control connection to the origin.
///
/// The socket itself is owned by the relay task serving it; this handle only
/// queues commands for that task and can ask it to stop.
#[derive(Debug)]
pub struct ControlLink {
    generation: u64,
    peer: Option<SocketAddr>,
    commands: mpsc::Sender<Vec<u8>>,
    stop: watch::Sender<bool>,
}

impl ControlLink {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a raw command for the origin. Fails when the link is gone or
    /// congested.
    pub fn send_command(&self, cmd: Vec<u8>) -> bool {
        self.commands.try_send(cmd).is_ok()
    }

    fn close(&self) {
        let _ = self.stop.send(true);
    }
}

/// Relay-side holder of "the" control channel.
///
/// The voice bridge uses a second instance for its single bridge stream.
#[derive(Debug)]
pub struct ControlChannel {
    name: &'static str,
    current: ArcSwapOption<ControlLink>,
    seq: AtomicU64,
}

impl ControlChannel {
    pub fn new() -> Self {
        Self::named("control")
    }

    pub fn named(name: &'static str) -> Self {
        Self {
            name,
            current: ArcSwapOption::empty(),
            seq: AtomicU64::new(1),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.current.load().is_some()
    }

    pub fn get(&self) -> Option<Arc<ControlLink>> {
        self.current.load_full()
    }

    /// Install a freshly authenticated link.
    ///
    /// A link that was already installed is told to stop; only one origin
    /// controls the relay at a time.
    pub fn set(
        &self,
        commands: mpsc::Sender<Vec<u8>>,
        peer: Option<SocketAddr>,
    ) -> (Arc<ControlLink>, watch::Receiver<bool>) {
        let (stop, stop_rx) = watch::channel(false);
        let link = Arc::new(ControlLink {
            generation: self.seq.fetch_add(1, Ordering::Relaxed),
            peer,
            commands,
            stop,
        });

        if let Some(prev) = self.current.swap(Some(link.clone())) {
            tracing::warn!(
                channel = self.name,
                generation = prev.generation,
                peer = ?prev.peer,
                "control: replaced by a new connection; closing previous"
            );
            prev.close();
        }

        (link, stop_rx)
    }

    /// Drop the current link if it is still the one with `generation`.
    pub fn clear(&self, generation: u64) -> bool {
        let prev = self.current.rcu(|cur| match cur {
            Some(l) if l.generation == generation => None,
            other => other.clone(),
        });
        prev.is_some_and(|l| l.generation == generation)
    }
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new()
    }
}
