use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{io::AsyncReadExt, sync::watch};

use crate::tether::{
    net::dial_tcp,
    tunnel::{pipe, wire},
};

#[derive(Debug, Clone)]
pub struct OriginOptions {
    /// Relay control endpoint, `host:port`.
    pub relay_addr: String,
    /// Local game server, `host:port`.
    pub local_addr: String,
    pub auth_token: String,
    pub reconnect_delay: Duration,
    pub dial_timeout: Duration,
}

/// Origin side of the tunnel: keeps one control connection to the relay and
/// opens a tunnel stream for every `CREATE_TUNNEL` it receives.
pub struct ControlClient {
    opts: Arc<OriginOptions>,
}

impl ControlClient {
    pub fn new(mut opts: OriginOptions) -> anyhow::Result<Self> {
        if opts.relay_addr.trim().is_empty() {
            anyhow::bail!("origin: relay address is required");
        }
        if opts.local_addr.trim().is_empty() {
            anyhow::bail!("origin: local game address is required");
        }
        if opts.dial_timeout <= Duration::from_millis(0) {
            opts.dial_timeout = Duration::from_secs(5);
        }
        Ok(Self {
            opts: Arc::new(opts),
        })
    }

    /// Run until shutdown, reconnecting after a fixed delay whenever the
    /// control connection ends.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.run_once(shutdown.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        relay = %self.opts.relay_addr,
                        err = %err,
                        retry = %humantime::format_duration(self.opts.reconnect_delay),
                        "control: disconnected; retrying"
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
        let mut conn = dial_tcp(&self.opts.relay_addr, self.opts.dial_timeout).await?;
        wire::write_control_hello(&mut conn, &self.opts.auth_token)
            .await
            .context("control: send auth")?;

        tracing::info!(relay = %self.opts.relay_addr, "control: connected");

        let mut decoder = wire::CommandDecoder::new();
        let mut buf = [0u8; 1024];
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                res = conn.read(&mut buf) => {
                    let n = res.context("control: read")?;
                    if n == 0 {
                        anyhow::bail!("control: relay closed the connection");
                    }
                    for id in decoder.push(&buf[..n]) {
                        let opts = self.opts.clone();
                        tokio::spawn(async move {
                            if let Err(err) = open_tunnel(&opts, &id).await {
                                tracing::warn!(id = %id, err = %err, "tunnel: open failed");
                            }
                        });
                    }
                }
            }
        }
    }
}

async fn open_tunnel(opts: &OriginOptions, id: &str) -> anyhow::Result<()> {
    let local = dial_tcp(&opts.local_addr, opts.dial_timeout).await?;
    let mut relay = dial_tcp(&opts.relay_addr, opts.dial_timeout).await?;
    wire::write_tunnel_hello(&mut relay, id)
        .await
        .context("tunnel: send hello")?;

    tracing::debug!(id = %id, "tunnel: open");
    let out = pipe::splice(relay, local).await;
    tracing::debug!(
        id = %id,
        ended = ?out.ended,
        err = ?out.error,
        down = out.a_to_b,
        up = out.b_to_a,
        "tunnel: closed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tether::{
        status::StatusResponder,
        tunnel::{
            registry::Registry,
            relay::{Relay, RelayOptions},
            wire::{CONNECTION_ID_LEN, DEFAULT_AUTH_TOKEN, TUNNEL_FOR_PREFIX},
        },
    };
    use tokio::{
        io::AsyncWriteExt,
        net::{TcpListener, TcpStream},
    };

    fn options(relay_addr: String, local_addr: String) -> OriginOptions {
        OriginOptions {
            relay_addr,
            local_addr,
            auth_token: DEFAULT_AUTH_TOKEN.to_string(),
            reconnect_delay: Duration::from_millis(50),
            dial_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn new_requires_addresses() {
        assert!(ControlClient::new(options(String::new(), "127.0.0.1:1".into())).is_err());
        assert!(ControlClient::new(options("127.0.0.1:1".into(), " ".into())).is_err());
    }

    #[tokio::test]
    async fn create_tunnel_dials_local_and_relay() {
        let relay_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = ControlClient::new(options(
            relay_ln.local_addr().unwrap().to_string(),
            local_ln.local_addr().unwrap().to_string(),
        ))
        .unwrap();

        let (_tx, rx) = watch::channel(false);
        tokio::spawn(async move { client.run(rx).await });

        let (mut ctl, _) = relay_ln.accept().await.unwrap();
        let mut auth = [0u8; 12];
        ctl.read_exact(&mut auth).await.unwrap();
        assert_eq!(&auth, b"AUTH_CONTROL");

        let id = wire::new_connection_id();
        ctl.write_all(&wire::create_tunnel_command(&id)).await.unwrap();

        let (mut server_side, _) = local_ln.accept().await.unwrap();
        let (mut tunnel, _) = relay_ln.accept().await.unwrap();
        let mut hello = vec![0u8; TUNNEL_FOR_PREFIX.len() + CONNECTION_ID_LEN];
        tunnel.read_exact(&mut hello).await.unwrap();
        assert_eq!(&hello[TUNNEL_FOR_PREFIX.len()..], id.as_bytes());

        tunnel.write_all(b"player-bytes").await.unwrap();
        let mut got = [0u8; 12];
        server_side.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"player-bytes");
    }

    #[tokio::test]
    async fn reconnects_after_relay_drops_control() {
        let relay_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = ControlClient::new(options(
            relay_ln.local_addr().unwrap().to_string(),
            "127.0.0.1:1".into(),
        ))
        .unwrap();

        let (_tx, rx) = watch::channel(false);
        tokio::spawn(async move { client.run(rx).await });

        let (first, _) = relay_ln.accept().await.unwrap();
        drop(first);

        let (mut second, _) = tokio::time::timeout(Duration::from_secs(2), relay_ln.accept())
            .await
            .unwrap()
            .unwrap();
        let mut auth = [0u8; 12];
        second.read_exact(&mut auth).await.unwrap();
        assert_eq!(&auth, b"AUTH_CONTROL");
    }

    #[tokio::test]
    async fn shutdown_stops_client() {
        let relay_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = ControlClient::new(options(
            relay_ln.local_addr().unwrap().to_string(),
            "127.0.0.1:1".into(),
        ))
        .unwrap();

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { client.run(rx).await });
        let (_ctl, _) = relay_ln.accept().await.unwrap();

        tx.send(true).unwrap();
        let res = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap();
        assert!(res.unwrap().is_ok());
    }

    #[tokio::test]
    async fn end_to_end_through_relay() {
        let relay = Arc::new(Relay::new(
            RelayOptions {
                auth_token: DEFAULT_AUTH_TOKEN.to_string(),
                hello_timeout: Duration::from_secs(2),
                pending_timeout: Duration::from_secs(5),
            },
            Arc::new(Registry::new(16)),
            Arc::new(StatusResponder::default()),
        ));
        let control_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let public_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control_addr = control_ln.local_addr().unwrap();
        let public_addr = public_ln.local_addr().unwrap();

        let (_tx, rx) = watch::channel(false);
        tokio::spawn(relay.clone().serve_control_on(control_ln, rx.clone()));
        tokio::spawn(relay.clone().serve_public_on(public_ln, rx.clone()));

        let client = ControlClient::new(options(
            control_addr.to_string(),
            local_ln.local_addr().unwrap().to_string(),
        ))
        .unwrap();
        tokio::spawn(async move { client.run(rx).await });

        for _ in 0..200 {
            if relay.control().is_authenticated() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(relay.control().is_authenticated());

        // Echo game server.
        tokio::spawn(async move {
            let (mut s, _) = local_ln.accept().await.unwrap();
            let mut buf = [0u8; 256];
            loop {
                let n = s.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                s.write_all(&buf[..n]).await.unwrap();
            }
        });

        let mut player = TcpStream::connect(public_addr).await.unwrap();
        player.write_all(b"join-request").await.unwrap();
        let mut got = [0u8; 12];
        player.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"join-request");
    }
}
