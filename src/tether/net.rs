use std::{borrow::Cow, future::Future, io, net::SocketAddr, time::Duration};

use anyhow::Context;
use tokio::{net::TcpStream, sync::watch};

/// Pause after a failed accept; EMFILE would otherwise spin the loop.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Normalize a bind/listen address.
///
/// Config files use the shorthand `":PORT"` to mean "bind on all
/// interfaces". Tokio's bind APIs do not accept `":PORT"`, so it becomes
/// `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// `host:port`, bracketing bare IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    let host = host.trim();
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

pub async fn dial_tcp(addr: &str, timeout: Duration) -> anyhow::Result<TcpStream> {
    let conn = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .with_context(|| format!("dial {addr}: timed out"))?
        .with_context(|| format!("dial {addr}"))?;
    let _ = conn.set_nodelay(true);
    Ok(conn)
}

/// Accepts connections until shutdown, handing each one to `handle`.
///
/// Accept errors (fd exhaustion, aborted handshakes) never end the loop;
/// they are logged and retried after [`ACCEPT_ERROR_BACKOFF`].
pub async fn accept_loop<A, F, S, H>(
    listener: &'static str,
    mut accept: A,
    mut shutdown: watch::Receiver<bool>,
    mut handle: H,
) where
    A: FnMut() -> F,
    F: Future<Output = io::Result<(S, SocketAddr)>>,
    H: FnMut(S, SocketAddr),
{
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            res = accept() => match res {
                Ok((conn, peer)) => handle(conn, peer),
                Err(err) => {
                    tracing::warn!(listener, err = %err, "accept failed; retrying");
                    metrics::counter!("tether_accept_errors_total", "listener" => listener)
                        .increment(1);
                    tokio::select! {
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn accept_errors_do_not_stop_the_loop() {
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let mut script: VecDeque<io::Result<(u32, SocketAddr)>> = VecDeque::from([
            Err(io::Error::from_raw_os_error(24)),
            Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
            Ok((1, peer)),
            Err(io::Error::from_raw_os_error(24)),
            Ok((2, peer)),
        ]);
        let accept = move || {
            let next = script.pop_front();
            async move {
                match next {
                    Some(res) => res,
                    None => std::future::pending().await,
                }
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop("test", accept, stop_rx, move |conn, _| {
            let _ = tx.send(conn);
        }));

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!((first, second), (Some(1), Some(2)));
        assert!(!task.is_finished());

        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:8080").as_ref(),
            "127.0.0.1:8080"
        );
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }

    #[test]
    fn join_host_port_brackets_ipv6() {
        assert_eq!(join_host_port("relay.example.com", 5000), "relay.example.com:5000");
        assert_eq!(join_host_port("::1", 5001), "[::1]:5001");
        assert_eq!(join_host_port("[::1]", 5001), "[::1]:5001");
    }

    #[tokio::test]
    async fn dial_tcp_reports_refused() {
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        drop(ln);
        assert!(dial_tcp(&addr, Duration::from_secs(1)).await.is_err());
    }
}
